use std::sync::Mutex;

use tokio::sync::Notify;

/// Process-wide bound on records buffered between the consumers and the
/// ClickHouse writers.
///
/// `inc` suspends the caller while the pipeline already holds `capacity`
/// records; `dec` releases them as batches complete. `reset` clears the
/// count and wakes every waiter, which is required when a consumer restart
/// discards its buffered rows.
pub struct RecordGate {
    capacity: i64,
    count: Mutex<i64>,
    notify: Notify,
}

impl RecordGate {
    pub fn new(capacity: i64) -> Self {
        Self {
            capacity,
            count: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    /// Reserve room for `n` records, waiting until the pipeline drains
    /// below capacity.
    pub async fn inc(&self, n: i64) {
        loop {
            // register before checking so a concurrent dec cannot slip
            // between the check and the wait
            let notified = self.notify.notified();
            {
                let mut count = self.count.lock().unwrap();
                if *count < self.capacity {
                    *count += n;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Release `n` records.
    pub fn dec(&self, n: i64) {
        let mut count = self.count.lock().unwrap();
        *count -= n;
        if *count < 0 {
            *count = 0;
        }
        if *count < self.capacity {
            self.notify.notify_waiters();
        }
    }

    /// Drop all reservations and wake every waiter.
    pub fn reset(&self) {
        let mut count = self.count.lock().unwrap();
        *count = 0;
        self.notify.notify_waiters();
    }

    pub fn in_flight(&self) -> i64 {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn inc_blocks_at_capacity_until_dec() {
        let gate = Arc::new(RecordGate::new(2));
        gate.inc(1).await;
        gate.inc(1).await;

        let blocked = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.inc(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        gate.dec(2);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("waiter should wake after dec")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_unblocks_waiters() {
        let gate = Arc::new(RecordGate::new(1));
        gate.inc(1).await;
        let blocked = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.inc(1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.reset();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("waiter should wake after reset")
            .unwrap();
        assert_eq!(gate.in_flight(), 1);
    }
}
