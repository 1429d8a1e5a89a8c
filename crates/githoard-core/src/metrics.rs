//! Metrics collection seam between the pool and the application.

use async_trait::async_trait;

use crate::job::Job;

/// Receives lifecycle events for every job the pipeline touches.
///
/// `success`/`fail` are reported by workers, exactly one of them per
/// processed job. `discover` is reported by the scheduler for every job
/// written to the outbound channel. Implementations own their counters and
/// absorb events on their own loop; all three event methods must be cheap
/// for callers.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Start the collector's owning loop.
    async fn start(&self);

    /// Stop the collector. With `immediate` set, pending counts are dropped
    /// without a final flush.
    async fn stop(&self, immediate: bool);

    async fn success(&self, job: Job);

    async fn fail(&self, job: Job);

    async fn discover(&self, job: Job);
}

/// Collector used when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

#[async_trait]
impl MetricsCollector for NoopCollector {
    async fn start(&self) {}

    async fn stop(&self, _immediate: bool) {}

    async fn success(&self, _job: Job) {}

    async fn fail(&self, _job: Job) {}

    async fn discover(&self, _job: Job) {}
}
