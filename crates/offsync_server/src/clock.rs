//! Server time.
//!
//! Write stamps and change feed cursors come from one `ServerClock`, which
//! never hands out the same value twice. Every write stamped after a cursor
//! was issued is therefore strictly greater than that cursor.

use offsync_protocol::Timestamp;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> Timestamp;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        offsync_protocol::now_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock, possibly backwards.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_millis(&self) -> Timestamp {
        (**self).now_millis()
    }
}

/// Issues strictly increasing stamps that follow the wall clock.
pub struct ServerClock {
    clock: Box<dyn Clock>,
    last: Mutex<Timestamp>,
}

impl ServerClock {
    /// Wraps a clock.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            last: Mutex::new(0),
        }
    }

    /// Next stamp: the wall clock, or one past the previous stamp if the
    /// wall clock has not moved past it.
    pub fn stamp(&self) -> Timestamp {
        let mut last = self.last.lock();
        let next = self.clock.now_millis().max(*last + 1);
        *last = next;
        next
    }

    /// Most recent stamp issued.
    pub fn last(&self) -> Timestamp {
        *self.last.lock()
    }

    /// Wall-clock reading, for reporting only.
    pub fn wall_time(&self) -> Timestamp {
        self.clock.now_millis()
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_follow_the_clock() {
        let manual = Arc::new(ManualClock::new(1_000));
        let clock = ServerClock::new(Arc::clone(&manual));
        assert_eq!(clock.stamp(), 1_000);
        manual.advance(50);
        assert_eq!(clock.stamp(), 1_050);
        assert_eq!(clock.last(), 1_050);
    }

    #[test]
    fn stamps_are_unique_when_the_clock_stalls() {
        let manual = Arc::new(ManualClock::new(500));
        let clock = ServerClock::new(Arc::clone(&manual));
        let a = clock.stamp();
        let b = clock.stamp();
        manual.set(100);
        let c = clock.stamp();
        assert!(a < b && b < c);
        assert_eq!(clock.wall_time(), 100);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = ServerClock::default();
        let stamps: Vec<_> = (0..100).map(|_| clock.stamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
