use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Serializes work per key: at most one holder of a given key at a time.
#[derive(Clone, Default)]
pub struct KeyedGate {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self, key: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so no map shard lock is held across the await.
        let lock = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn is_busy(&self, key: &str) -> bool {
        self.inner
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

/// Bounds how many category cleanups run at once.
#[derive(Clone)]
pub struct WorkerPermits {
    sem: Arc<Semaphore>,
}

impl WorkerPermits {
    pub fn new(permits: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// `None` only if the semaphore was closed, which this type never does.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().acquire_owned().await.ok()
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
