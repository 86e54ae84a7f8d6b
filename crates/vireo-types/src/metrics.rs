//! Injected metrics sink.
//!
//! The engine and workers emit counter/gauge events through this trait; the
//! host process decides where they land. Implementations must be cheap and
//! non-blocking — these calls sit on protocol hot paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receiver for counter and gauge events.
pub trait MetricsSink: Send + Sync {
    /// Increment a named counter.
    fn incr(&self, counter: &'static str, by: u64);

    /// Record a gauge value.
    fn gauge(&self, gauge: &'static str, value: f64);
}

/// Shared handle form used throughout the core.
pub type Metrics = Arc<dyn MetricsSink>;

/// A sink that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: &'static str, _by: u64) {}
    fn gauge(&self, _gauge: &'static str, _value: f64) {}
}

/// Build a no-op metrics handle.
pub fn noop() -> Metrics {
    Arc::new(NoopMetrics)
}

/// A sink that counts events in memory, for tests.
#[derive(Default)]
pub struct CountingMetrics {
    total: AtomicU64,
}

impl CountingMetrics {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetrics {
    fn incr(&self, _counter: &'static str, by: u64) {
        self.total.fetch_add(by, Ordering::Relaxed);
    }

    fn gauge(&self, _gauge: &'static str, _value: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_sink() {
        let sink = CountingMetrics::default();
        sink.incr("frames_rx", 1);
        sink.incr("frames_rx", 2);
        sink.gauge("peers_alive", 3.0);
        assert_eq!(sink.total(), 3);
    }

    #[test]
    fn test_noop_is_object_safe() {
        let m: Metrics = noop();
        m.incr("anything", 1);
    }
}
