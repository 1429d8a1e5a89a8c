//! Helpers for exercising the pipeline in tests.
//!
//! These are plain library types so downstream crates can reuse them in
//! their own test suites.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::{BoxError, Job, JobHandler, JobOutcome};
use crate::metrics::MetricsCollector;

/// Collector that records every event it receives.
#[derive(Default)]
pub struct RecordingCollector {
    success: Mutex<Vec<Job>>,
    fail: Mutex<Vec<Job>>,
    discover: Mutex<Vec<Job>>,
    stops: Mutex<Vec<bool>>,
}

impl RecordingCollector {
    pub fn successes(&self) -> Vec<Job> {
        self.success.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<Job> {
        self.fail.lock().unwrap().clone()
    }

    pub fn discovered(&self) -> Vec<Job> {
        self.discover.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<bool> {
        self.stops.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsCollector for RecordingCollector {
    async fn start(&self) {}

    async fn stop(&self, immediate: bool) {
        self.stops.lock().unwrap().push(immediate);
    }

    async fn success(&self, job: Job) {
        self.success.lock().unwrap().push(job);
    }

    async fn fail(&self, job: Job) {
        self.fail.lock().unwrap().push(job);
    }

    async fn discover(&self, job: Job) {
        self.discover.lock().unwrap().push(job);
    }
}

/// Handler that records the jobs it performs, optionally sleeping first and
/// optionally failing every job.
pub struct RecordingHandler {
    seen: Mutex<Vec<Job>>,
    delay: Duration,
    fail: bool,
}

impl RecordingHandler {
    pub fn new(delay: Duration, fail: bool) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay,
            fail,
        }
    }

    pub fn seen(&self) -> Vec<Job> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn perform(&self, token: &CancellationToken, job: &Job) -> Result<JobOutcome, BoxError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(std::io::Error::other("job cancelled").into());
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        self.seen.lock().unwrap().push(job.clone());

        if self.fail {
            return Err(std::io::Error::other("handler failure requested").into());
        }

        Ok(match job.kind {
            crate::job::JobKind::Download => JobOutcome::Downloaded,
            crate::job::JobKind::Update => JobOutcome::Updated,
        })
    }
}
