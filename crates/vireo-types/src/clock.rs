//! Microsecond epoch timestamps.
//!
//! Every durable timestamp in the system is integer microseconds since the
//! Unix epoch, signed so it slots into SQLite INTEGER columns directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROS_PER_SEC: i64 = 1_000_000;

/// A time source.
///
/// Long-running engines take a `Clock` instead of calling [`now_us`]
/// directly so their retry ladders and expiry sweeps can be driven
/// deterministically in tests.
#[derive(Clone)]
pub enum Clock {
    /// Wall clock.
    System,
    /// Externally driven clock, for tests.
    Manual(Arc<AtomicI64>),
}

impl Clock {
    /// A manual clock starting at the given microsecond timestamp.
    pub fn manual(start_us: i64) -> (Self, Arc<AtomicI64>) {
        let cell = Arc::new(AtomicI64::new(start_us));
        (Clock::Manual(cell.clone()), cell)
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> i64 {
        match self {
            Clock::System => now_us(),
            Clock::Manual(cell) => cell.load(Ordering::SeqCst),
        }
    }

    /// Current time in whole seconds.
    pub fn now_secs(&self) -> i64 {
        self.now_us() / MICROS_PER_SEC
    }
}

/// Current time in microseconds since the epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Current time in whole seconds since the epoch.
pub fn now_secs() -> i64 {
    now_us() / MICROS_PER_SEC
}

/// Convert a microsecond timestamp to whole seconds.
pub fn us_to_secs(us: i64) -> i64 {
    us / MICROS_PER_SEC
}

/// Convert whole seconds to microseconds.
pub fn secs_to_us(secs: i64) -> i64 {
    secs * MICROS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_sane() {
        // After 2020, before 2100.
        let now = now_us();
        assert!(now > 1_577_836_800 * MICROS_PER_SEC);
        assert!(now < 4_102_444_800 * MICROS_PER_SEC);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(us_to_secs(1_702_000_000_123_456), 1_702_000_000);
        assert_eq!(secs_to_us(30), 30_000_000);
    }

    #[test]
    fn test_manual_clock() {
        let (clock, cell) = Clock::manual(1_000_000);
        assert_eq!(clock.now_us(), 1_000_000);
        assert_eq!(clock.now_secs(), 1);
        cell.store(5_000_000, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(clock.now_us(), 5_000_000);
    }
}
