use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// A mutex that can be held across `.await` and taken from plain threads.
///
/// Waiting in [`acquire`](AsyncLock::acquire) parks only the calling task;
/// other tasks on the same runtime keep running. The guard releases on drop,
/// so a task cancelled while holding it still lets go.
///
/// There is no timeout. Taking the same lock twice from one flow deadlocks.
#[derive(Debug)]
pub struct AsyncLock<T> {
    name: &'static str,
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for AsyncLock<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AsyncLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn acquire(&self) -> MutexGuard<'_, T> {
        tracing::trace!(lock = self.name, "acquiring");
        self.inner.lock().await
    }

    /// Blocking acquire for synchronous code running outside any runtime.
    ///
    /// Panics when called from an async context.
    pub fn acquire_blocking(&self) -> MutexGuard<'_, T> {
        self.inner.blocking_lock()
    }

    /// Runs `body` with the lock held and releases it afterwards.
    pub async fn scoped<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire().await;
        body(&mut guard)
    }

    pub fn blocking_scoped<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire_blocking();
        body(&mut guard)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
