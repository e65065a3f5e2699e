//! Semaphore-backed admission limits.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Bounds how many holders may be active at once.
///
/// One limiter is shared by every collection (running collections with
/// units pending or in flight) and each collection owns another (its
/// in-flight units).
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyLimiter {
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a permit that lives as long as its holder.
    #[tracing::instrument(
        name = "concurrency.acquire",
        skip(self),
        fields(max_concurrent = %self.max_concurrent, available_before = self.available())
    )]
    pub async fn acquire_owned(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }

    /// Take a permit only if one is free.
    #[must_use]
    pub fn try_acquire_owned(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
