use std::time::{Duration, Instant};

use serde_json::Value;

/// What to do with one non-critical sandbox event.
#[derive(Debug, Clone, PartialEq)]
pub enum Admit {
    Pass,
    /// A status update held back; the newest one is flushed at the next window.
    Coalesced,
    Dropped,
}

/// Summary handed out when a window closes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rollover {
    pub suppressed: u64,
    pub status: Option<Value>,
}

/// Fixed-window limiter for log/warn/status/send events coming out of a
/// sandbox. Status updates are coalesced to the latest value instead of being
/// dropped.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    burst: u32,
    window_start: Instant,
    count: u32,
    suppressed: u64,
    pending_status: Option<Value>,
}

impl Throttle {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst: burst.max(1),
            window_start: Instant::now(),
            count: 0,
            suppressed: 0,
            pending_status: None,
        }
    }

    /// Call [`Throttle::roll`] first so the window is current.
    pub fn admit(&mut self, status: Option<&Value>) -> Admit {
        if self.count < self.burst {
            self.count += 1;
            return Admit::Pass;
        }
        match status {
            Some(value) => {
                self.pending_status = Some(value.clone());
                Admit::Coalesced
            }
            None => {
                self.suppressed += 1;
                Admit::Dropped
            }
        }
    }

    /// Opens a new window if the current one has elapsed.
    pub fn roll(&mut self, now: Instant) -> Option<Rollover> {
        if now.duration_since(self.window_start) < self.interval {
            return None;
        }
        self.window_start = now;
        self.count = 0;
        self.take()
    }

    /// Drains whatever is held back regardless of the window.
    pub fn take(&mut self) -> Option<Rollover> {
        if self.suppressed == 0 && self.pending_status.is_none() {
            return None;
        }
        Some(Rollover {
            suppressed: std::mem::take(&mut self.suppressed),
            status: self.pending_status.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_burst_then_drop_then_new_window() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_millis(100), 3);
        for _ in 0..3 {
            assert_eq!(throttle.admit(None), Admit::Pass);
        }
        assert_eq!(throttle.admit(None), Admit::Dropped);
        assert_eq!(throttle.admit(None), Admit::Dropped);
        assert!(throttle.roll(start + Duration::from_millis(50)).is_none());

        let rollover = throttle.roll(start + Duration::from_millis(120)).unwrap();
        assert_eq!(rollover.suppressed, 2);
        assert_eq!(throttle.admit(None), Admit::Pass);
    }

    #[test]
    fn test_status_is_coalesced_to_latest() {
        let mut throttle = Throttle::new(Duration::from_millis(100), 1);
        assert_eq!(throttle.admit(Some(&json!({"text": "1"}))), Admit::Pass);
        assert_eq!(throttle.admit(Some(&json!({"text": "2"}))), Admit::Coalesced);
        assert_eq!(throttle.admit(Some(&json!({"text": "3"}))), Admit::Coalesced);

        let rollover = throttle.take().unwrap();
        assert_eq!(rollover.status, Some(json!({"text": "3"})));
        assert_eq!(rollover.suppressed, 0);
        assert!(throttle.take().is_none());
    }
}
