//! Counted wake-up signal for the dispatcher.
//!
//! Producers, the timer-exception path and internal dependency resolution
//! all call [`Wakeup::wake`]; the dispatcher calls [`Wakeup::wait`] at the
//! end of each iteration. Wakes arriving while the dispatcher is busy are
//! absorbed into one counter, so any burst of N wakes buys exactly one
//! extra iteration.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Counted wake-up signal with a single consumer.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: Mutex<u32>,
    notify: Notify,
}

impl Wakeup {
    /// Creates a signal with no pending wakes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a wake and notifies the waiter if it was asleep.
    pub fn wake(&self) {
        let mut pending = self.lock_pending();
        *pending += 1;
        if *pending == 1 {
            self.notify.notify_one();
        }
    }

    /// Number of wakes recorded since the last `wait`.
    #[must_use]
    pub fn pending(&self) -> u32 {
        *self.lock_pending()
    }

    /// Consumes all pending wakes, suspending until at least one arrives.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the counter so a wake in
            // between cannot be lost.
            let _ = notified.as_mut().enable();
            {
                let mut pending = self.lock_pending();
                if *pending > 0 {
                    *pending = 0;
                    return;
                }
            }
            notified.await;
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, u32> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_times_out(wakeup: &Wakeup) -> bool {
        tokio::time::timeout(Duration::from_millis(100), wakeup.wait())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_wait_blocks_without_wake() {
        let wakeup = Wakeup::new();
        assert!(wait_times_out(&wakeup).await);
    }

    #[tokio::test]
    async fn test_wake_before_wait_returns_immediately() {
        let wakeup = Wakeup::new();
        wakeup.wake();
        tokio::time::timeout(Duration::from_millis(100), wakeup.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_burst_of_wakes_buys_one_iteration() {
        let wakeup = Wakeup::new();
        for _ in 0..5 {
            wakeup.wake();
        }
        assert_eq!(wakeup.pending(), 5);

        // One immediate wait, then back to sleep.
        tokio::time::timeout(Duration::from_millis(100), wakeup.wait())
            .await
            .unwrap();
        assert_eq!(wakeup.pending(), 0);
        assert!(wait_times_out(&wakeup).await);
    }

    #[tokio::test]
    async fn test_wake_releases_sleeping_waiter() {
        let wakeup = Arc::new(Wakeup::new());
        let waiter = {
            let wakeup = Arc::clone(&wakeup);
            tokio::spawn(async move { wakeup.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        wakeup.wake();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
