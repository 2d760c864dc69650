//! Time series definition managers.

use super::cache::CacheStats;
use super::codec::{TimeSeriesCodec, TimeSeriesKey};
use super::{DatabaseManager, TimeSeriesManager};
use crate::btree::{BTree, OnDiskNodeManager};
use crate::error::{Error, Result};
use crate::model::TimeSeriesDefinition;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn key(database: &str, series: &str) -> TimeSeriesKey {
    (database.to_string(), series.to_string())
}

/// Time series definitions stored in `timeseries.b3`.
pub struct DefaultTimeSeriesManager {
    databases: Arc<dyn DatabaseManager>,
    tree: BTree<TimeSeriesKey, TimeSeriesDefinition>,
}

impl DefaultTimeSeriesManager {
    /// Opens the time series tree at `path`. `databases` resolves the owning
    /// databases.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        branching_factor: usize,
        databases: Arc<dyn DatabaseManager>,
    ) -> Result<Self> {
        let manager = OnDiskNodeManager::open(path, block_size, Arc::new(TimeSeriesCodec))?;
        Ok(Self {
            databases,
            tree: BTree::new(Arc::new(manager), branching_factor)?,
        })
    }
}

impl TimeSeriesManager for DefaultTimeSeriesManager {
    fn create_time_series(
        &self,
        definition: TimeSeriesDefinition,
        throw_if_exists: bool,
    ) -> Result<bool> {
        definition.validate()?;
        self.databases.get_database(definition.database())?;

        let key = key(definition.database(), definition.name());
        let created = self.tree.insert_if_absent(key.clone(), definition)?;
        if created {
            info!("Created time series {}.{}", key.0, key.1);
        } else if throw_if_exists {
            return Err(Error::DuplicateTimeSeries {
                database: key.0,
                series: key.1,
            });
        }
        Ok(created)
    }

    fn get_time_series(&self, database: &str, name: &str) -> Result<Arc<TimeSeriesDefinition>> {
        if let Some(definition) = self.tree.get(&key(database, name))? {
            return Ok(Arc::new(definition));
        }
        self.databases.get_database(database)?;
        Err(Error::UnknownTimeSeries {
            database: database.to_string(),
            series: name.to_string(),
        })
    }

    fn list_time_series(&self, database: &str) -> Result<Vec<Arc<TimeSeriesDefinition>>> {
        self.databases.get_database(database)?;
        let start = key(database, "");
        let entries = self.tree.range(Some(&start), None)?;
        Ok(entries
            .into_iter()
            .take_while(|((owner, _), _)| owner == database)
            .map(|(_, definition)| Arc::new(definition))
            .collect())
    }
}

/// Keeps recently used time series definitions in an LRU cache.
pub struct CachingTimeSeriesManager {
    inner: Arc<dyn TimeSeriesManager>,
    cache: Mutex<LruCache<TimeSeriesKey, Arc<TimeSeriesDefinition>>>,
    stats: CacheStats,
}

impl CachingTimeSeriesManager {
    /// Wraps `inner` with a cache of `capacity` definitions.
    pub fn new(inner: Arc<dyn TimeSeriesManager>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            stats: CacheStats::default(),
        }
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl TimeSeriesManager for CachingTimeSeriesManager {
    fn create_time_series(
        &self,
        definition: TimeSeriesDefinition,
        throw_if_exists: bool,
    ) -> Result<bool> {
        self.inner.create_time_series(definition, throw_if_exists)
    }

    fn get_time_series(&self, database: &str, name: &str) -> Result<Arc<TimeSeriesDefinition>> {
        let key = key(database, name);
        if let Some(definition) = self.cache.lock().get(&key) {
            self.stats.record_hit();
            return Ok(Arc::clone(definition));
        }
        self.stats.record_miss();
        let definition = self.inner.get_time_series(database, name)?;
        if self
            .cache
            .lock()
            .push(key.clone(), Arc::clone(&definition))
            .is_some_and(|(evicted, _)| evicted != key)
        {
            self.stats.record_eviction();
        }
        Ok(definition)
    }

    fn list_time_series(&self, database: &str) -> Result<Vec<Arc<TimeSeriesDefinition>>> {
        self.inner.list_time_series(database)
    }
}
