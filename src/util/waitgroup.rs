use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Await-able counter tracking a set of outstanding batches.
///
/// A flush registers each batch it hands to a writer with `add(1)`; the
/// writer calls `done()` once the batch is durable. `wait` resolves when
/// the count reaches zero, which gates offset commits and schema changes.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "WaitGroup::done without matching add");
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_when_all_done() {
        let wg = WaitGroup::new();
        wg.add(2);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        wg.done();
        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_on_empty_group_is_immediate() {
        let wg = WaitGroup::new();
        wg.wait().await;
    }
}
