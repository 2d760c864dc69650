//! Database definition managers.

use super::cache::CacheStats;
use super::codec::DatabaseCodec;
use super::DatabaseManager;
use crate::btree::{BTree, OnDiskNodeManager};
use crate::error::{Error, Result};
use crate::model::DatabaseDefinition;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Database definitions stored in `databases.b3`.
pub struct DefaultDatabaseManager {
    tree: BTree<String, DatabaseDefinition>,
}

impl DefaultDatabaseManager {
    /// Opens the database tree at `path`.
    pub fn open(path: impl AsRef<Path>, block_size: usize, branching_factor: usize) -> Result<Self> {
        let manager = OnDiskNodeManager::open(path, block_size, Arc::new(DatabaseCodec))?;
        Ok(Self {
            tree: BTree::new(Arc::new(manager), branching_factor)?,
        })
    }
}

impl DatabaseManager for DefaultDatabaseManager {
    fn create_database(&self, definition: DatabaseDefinition, throw_if_exists: bool) -> Result<bool> {
        definition.validate()?;
        let name = definition.name().to_string();
        let created = self.tree.insert_if_absent(name.clone(), definition)?;
        if created {
            info!("Created database {}", name);
        } else if throw_if_exists {
            return Err(Error::DuplicateDatabase(name));
        }
        Ok(created)
    }

    fn get_database(&self, name: &str) -> Result<Arc<DatabaseDefinition>> {
        self.tree
            .get(&name.to_string())?
            .map(Arc::new)
            .ok_or_else(|| Error::UnknownDatabase(name.to_string()))
    }

    fn list_databases(&self) -> Result<Vec<Arc<DatabaseDefinition>>> {
        Ok(self
            .tree
            .entries()?
            .into_iter()
            .map(|(_, definition)| Arc::new(definition))
            .collect())
    }
}

/// Keeps recently used database definitions in an LRU cache.
pub struct CachingDatabaseManager {
    inner: Arc<dyn DatabaseManager>,
    cache: Mutex<LruCache<String, Arc<DatabaseDefinition>>>,
    stats: CacheStats,
}

impl CachingDatabaseManager {
    /// Wraps `inner` with a cache of `capacity` definitions.
    pub fn new(inner: Arc<dyn DatabaseManager>, capacity: usize) -> Self {
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

impl DatabaseManager for CachingDatabaseManager {
    fn create_database(&self, definition: DatabaseDefinition, throw_if_exists: bool) -> Result<bool> {
        self.inner.create_database(definition, throw_if_exists)
    }

    fn get_database(&self, name: &str) -> Result<Arc<DatabaseDefinition>> {
        if let Some(definition) = self.cache.lock().get(name) {
            self.stats.record_hit();
            return Ok(Arc::clone(definition));
        }
        self.stats.record_miss();
        let definition = self.inner.get_database(name)?;
        if self
            .cache
            .lock()
            .push(name.to_string(), Arc::clone(&definition))
            .is_some_and(|(key, _)| key != name)
        {
            self.stats.record_eviction();
        }
        Ok(definition)
    }

    fn list_databases(&self) -> Result<Vec<Arc<DatabaseDefinition>>> {
        self.inner.list_databases()
    }
}
