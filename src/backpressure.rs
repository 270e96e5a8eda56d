//! Backpressure handling for write operations.
//!
//! Tracks frames that were queued for a connection but not yet written, and
//! limits how many may be in flight. The [`WriterHandle`](crate::writer::WriterHandle)
//! reserves a slot per frame; the writer task releases slots after each batch.
//!
//! # Configuration
//!
//! - `max_pending`: Maximum number of pending frames (default: 1024)
//! - Timeout: How long to wait when backpressure is active (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::TransportError;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicUsize,
    released: Notify,
}

/// Lock-free pending-frame counter shared between producers and the writer task.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a new backpressure controller with specified limit.
    pub fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    /// Create a controller with custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            max_pending,
            timeout,
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Try to reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<(), TransportError> {
        let max = self.max_pending;
        self.shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| TransportError::BackpressureTimeout)
    }

    /// Reserve a slot, waiting up to the configured timeout.
    pub async fn reserve(&self) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve().is_ok() {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TransportError::BackpressureTimeout);
            }
        }
    }

    /// Release one slot.
    #[inline]
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Release multiple slots at once (after a batch write).
    pub fn release_many(&self, count: usize) {
        self.shared.pending.fetch_sub(count, Ordering::AcqRel);
        self.shared.released.notify_waiters();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// Guard that releases a reserved slot on drop unless disarmed.
pub struct BackpressureGuard {
    controller: BackpressureController,
    armed: bool,
}

impl BackpressureGuard {
    pub fn new(controller: BackpressureController) -> Self {
        Self {
            controller,
            armed: true,
        }
    }

    /// Keep the slot reserved; someone else will release it.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if self.armed {
            self.controller.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_try_reserve_until_full() {
        let ctrl = BackpressureController::new(5);

        for _ in 0..5 {
            ctrl.try_reserve().unwrap();
        }
        assert_eq!(ctrl.pending_count(), 5);

        let result = ctrl.try_reserve();
        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
    }

    #[test]
    fn test_release_many() {
        let ctrl = BackpressureController::new(100);
        for _ in 0..50 {
            ctrl.try_reserve().unwrap();
        }

        ctrl.release_many(30);
        assert_eq!(ctrl.pending_count(), 20);
    }

    #[test]
    fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::new(10);
        let ctrl2 = ctrl1.clone();

        ctrl1.try_reserve().unwrap();
        assert_eq!(ctrl2.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(10));
        ctrl.try_reserve().unwrap();

        let start = Instant::now();
        let result = ctrl.reserve().await;

        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_release() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(5));
        ctrl.try_reserve().unwrap();

        let releaser = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release();
        });

        ctrl.reserve().await.unwrap();
        assert_eq!(ctrl.pending_count(), 1);
    }

    #[test]
    fn test_guard_releases_unless_disarmed() {
        let ctrl = BackpressureController::new(10);

        ctrl.try_reserve().unwrap();
        drop(BackpressureGuard::new(ctrl.clone()));
        assert_eq!(ctrl.pending_count(), 0);

        ctrl.try_reserve().unwrap();
        let mut guard = BackpressureGuard::new(ctrl.clone());
        guard.disarm();
        drop(guard);
        assert_eq!(ctrl.pending_count(), 1);
    }
}
