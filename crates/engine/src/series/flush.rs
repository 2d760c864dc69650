//! Single-threaded flush executor.
//!
//! Every partition flush of the process runs on one background thread, so
//! appends to partition files are totally ordered and never race.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type FlushTask = Box<dyn FnOnce() -> Result<()> + Send>;

/// Counters of the flush executor.
#[derive(Debug, Default)]
pub struct FlushStats {
    /// Tasks accepted.
    pub submitted: AtomicU64,
    /// Tasks that completed successfully.
    pub completed: AtomicU64,
    /// Tasks that returned an error.
    pub failed: AtomicU64,
}

impl FlushStats {
    /// Gets the number of submitted tasks.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Gets the number of completed tasks.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Gets the number of failed tasks.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Completion of a submitted flush.
#[derive(Debug)]
pub struct FlushTicket {
    receiver: mpsc::Receiver<Result<()>>,
}

impl FlushTicket {
    /// Blocks until the flush ran and returns its outcome.
    pub fn wait(self) -> Result<()> {
        self.receiver
            .recv()
            .map_err(|_| Error::Interrupted("flush executor stopped before running the task".into()))?
    }
}

struct Queue {
    /// Tasks submitted and not finished yet.
    outstanding: Mutex<usize>,
    drained: Condvar,
}

impl Queue {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

/// Runs flush tasks one at a time on a dedicated thread.
pub struct FlushManager {
    sender: Mutex<Option<mpsc::Sender<(FlushTask, mpsc::Sender<Result<()>>)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<Queue>,
    stats: Arc<FlushStats>,
}

impl FlushManager {
    /// Starts the flush thread.
    pub fn start() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<(FlushTask, mpsc::Sender<Result<()>>)>();
        let queue = Arc::new(Queue {
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
        });
        let stats = Arc::new(FlushStats::default());

        let worker_queue = Arc::clone(&queue);
        let worker_stats = Arc::clone(&stats);
        let worker = thread::Builder::new()
            .name("horizondb-flush".to_string())
            .spawn(move || {
                while let Ok((task, done)) = receiver.recv() {
                    let result = task();
                    match &result {
                        Ok(()) => {
                            worker_stats.completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_stats.failed.fetch_add(1, Ordering::Relaxed);
                            error!("Background flush failed: {}", e);
                        }
                    }
                    if done.send(result).is_err() {
                        debug!("Flush completed with no one waiting on its ticket");
                    }
                    worker_queue.finish_one();
                }
                debug!("Flush thread stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            queue,
            stats,
        })
    }

    /// Queues `task` behind the flushes already submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) ran.
    pub fn submit<F>(&self, task: F) -> Result<FlushTicket>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(Error::ShuttingDown)?;
        let (done, receiver) = mpsc::channel();
        *self.queue.outstanding.lock() += 1;
        if sender.send((Box::new(task), done)).is_err() {
            self.queue.finish_one();
            return Err(Error::ShuttingDown);
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(FlushTicket { receiver })
    }

    /// Number of tasks queued or running.
    pub fn outstanding(&self) -> usize {
        *self.queue.outstanding.lock()
    }

    /// Statistics.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Waits up to `timeout` for the queued tasks, still accepting new ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if tasks are still queued when the
    /// timeout expires.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.queue.outstanding.lock();
        while *outstanding > 0 {
            if self.queue.drained.wait_until(&mut outstanding, deadline).timed_out() {
                warn!(
                    "Flush executor still has {} task(s) after {:?}",
                    *outstanding, timeout
                );
                return Err(Error::Interrupted(format!(
                    "{} flush task(s) still queued after {:?}",
                    *outstanding, timeout
                )));
            }
        }
        Ok(())
    }

    /// Stops accepting tasks and waits up to `timeout` for the queued ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if tasks are still queued when the
    /// timeout expires; the thread is left to finish them.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.sender.lock().take();
        self.drain(timeout)?;

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                return Err(Error::Internal("flush thread panicked".into()));
            }
        }
        Ok(())
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Flush thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for FlushManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushManager")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
