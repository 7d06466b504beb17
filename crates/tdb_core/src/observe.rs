use std::sync::Arc;
use std::time::Duration;

/// Destination for counters and timings. Implementations must be cheap to
/// call from hot paths.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str, delta: u64);
    fn timing(&self, name: &str, elapsed: Duration);
}

pub type SharedSink = Arc<dyn MetricsSink>;

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr(&self, _name: &str, _delta: u64) {}

    fn timing(&self, _name: &str, _elapsed: Duration) {}
}
