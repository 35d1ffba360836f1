use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limit for repetitive log lines (e.g. parse failures), allowing
/// one message per interval.
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True if the caller may log now.
    pub fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_allowed_then_suppressed() {
        let throttle = LogThrottle::new(Duration::from_secs(10));
        assert!(throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn zero_interval_always_allows() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.allow());
        assert!(throttle.allow());
    }
}
