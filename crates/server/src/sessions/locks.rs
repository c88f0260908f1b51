//! In-process serialization of work on one upload session.
//!
//! The conditional updates in the metadata store are what keep concurrent
//! processes consistent. These locks only stop two tasks of this process
//! from writing the same staged bytes at once.

use dashmap::DashMap;
use porter_core::UploadId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<UploadId, Arc<Mutex<()>>>;

/// Per-session async locks, created on demand and dropped when idle.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<LockMap>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: UploadId) -> SessionGuard {
        let mutex = self
            .inner
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        SessionGuard {
            id,
            map: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of sessions with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held while a task works on one session.
pub struct SessionGuard {
    id: UploadId,
    map: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it.
        self.map
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
