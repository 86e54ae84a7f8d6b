//! Tracing-backed metrics sink.
//!
//! Counters accumulate in memory and surface through the log stream; a
//! scrape endpoint can be layered on later without touching the core,
//! which only ever sees the sink trait.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use vireo_types::metrics::MetricsSink;

#[derive(Default)]
pub struct TracingMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all counters.
    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        match self.counters.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for TracingMetrics {
    fn incr(&self, counter: &'static str, by: u64) {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = counters.entry(counter).or_insert(0);
        *value += by;
        debug!(counter, value = *value, "metric");
    }

    fn gauge(&self, gauge: &'static str, value: f64) {
        debug!(gauge, value, "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let sink = TracingMetrics::new();
        sink.incr("mail.composed", 1);
        sink.incr("mail.composed", 2);
        sink.incr("mrp.req_sent", 1);

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.get("mail.composed"), Some(&3));
        assert_eq!(snapshot.get("mrp.req_sent"), Some(&1));
    }
}
