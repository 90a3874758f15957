use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts outstanding operations and lets one task wait until all of them
/// report completion.
///
/// `add` must be called before the operations it accounts for are dispatched.
/// A `WaitGroup` covers a single round; build a fresh one for the next round.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one operation complete. Wakes every waiter when the count hits zero.
    pub fn done(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
        match previous {
            Ok(1) => self.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::warn!("WaitGroup::done called with no outstanding operations"),
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns immediately if nothing is outstanding.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `done` cannot be missed.
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_empty_group_returns_immediately() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("wait on an empty group must not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_done() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(3);

        for i in 0..3u64 {
            let wg = wg.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20 * (i + 1))).await;
                wg.done();
            });
        }

        tokio::time::timeout(Duration::from_secs(2), wg.wait())
            .await
            .expect("all tasks should complete");
        assert_eq!(wg.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_does_not_return_early() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(2);
        wg.done();

        let result = tokio::time::timeout(Duration::from_millis(50), wg.wait()).await;
        assert!(result.is_err(), "one operation is still outstanding");
        assert_eq!(wg.pending(), 1);

        wg.done();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .expect("group is drained");
    }

    #[tokio::test]
    async fn test_multiple_waiters_are_released() {
        let wg = Arc::new(WaitGroup::new());
        wg.add(1);

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let wg = wg.clone();
                tokio::spawn(async move { wg.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        wg.done();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_extra_done_does_not_underflow() {
        let wg = WaitGroup::new();
        wg.done();
        assert_eq!(wg.pending(), 0);
        wg.wait().await;
    }
}
