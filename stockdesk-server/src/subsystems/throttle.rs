//! Time-based update throttle for streamed text.
//!
//! The producer (provider stream) can emit chunks far faster than a view
//! wants to re-render. `UpdateThrottle` answers "may I publish now?" at most
//! once per window; the caller keeps accumulating in between, so nothing is
//! dropped, only coalesced.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stockdesk_core::Clock;

pub struct UpdateThrottle {
    window: Duration,
    clock: Arc<dyn Clock>,
    last: Option<Instant>,
}

impl UpdateThrottle {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            last: None,
        }
    }

    /// True for the first call and then at most once per window.
    pub fn ready(&mut self) -> bool {
        let now = self.clock.now();
        match self.last {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockdesk_core::ManualClock;

    #[test]
    fn test_first_call_is_ready() {
        let clock = ManualClock::new();
        let mut t = UpdateThrottle::new(Duration::from_millis(50), Arc::new(clock));
        assert!(t.ready());
        assert!(!t.ready());
    }

    #[test]
    fn test_ready_once_per_window() {
        let clock = ManualClock::new();
        let mut t = UpdateThrottle::new(Duration::from_millis(50), Arc::new(clock.clone()));
        let mut fired = 0;
        for _ in 0..20 {
            clock.advance(Duration::from_millis(10));
            if t.ready() {
                fired += 1;
            }
        }
        // t=10 (first), 60, 110, 160
        assert_eq!(fired, 4);
    }

    #[test]
    fn test_slow_producer_is_never_throttled() {
        let clock = ManualClock::new();
        let mut t = UpdateThrottle::new(Duration::from_millis(50), Arc::new(clock.clone()));
        for _ in 0..5 {
            assert!(t.ready());
            clock.advance(Duration::from_millis(80));
        }
    }
}
