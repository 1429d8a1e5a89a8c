//! A single worker of the pool.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::job::{Job, JobError, JobOutcome};
use crate::metrics::MetricsCollector;

/// The outbound jobs channel, shared by every worker of a pool. The lock is
/// held only across a single `recv`.
pub(crate) type SharedJobs = Arc<Mutex<mpsc::Receiver<Job>>>;

pub(crate) struct Worker {
    id: String,
    jobs: SharedJobs,
    stop_rx: mpsc::Receiver<bool>,
    metrics: Arc<dyn MetricsCollector>,
}

impl Worker {
    /// Build a worker and the sender used to stop it. A `true` signal stops
    /// immediately, abandoning any in-flight job; `false` lets the in-flight
    /// job finish and report first.
    pub(crate) fn new(
        id: String,
        jobs: SharedJobs,
        metrics: Arc<dyn MetricsCollector>,
    ) -> (Self, mpsc::Sender<bool>) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        (
            Self {
                id,
                jobs,
                stop_rx,
                metrics,
            },
            stop_tx,
        )
    }

    /// Consume jobs until stopped or the jobs channel closes. A worker is
    /// never restarted after this returns.
    pub(crate) async fn run(mut self) {
        trace!(worker = %self.id, "worker started");
        while self.consume_job().await {}
        trace!(worker = %self.id, "worker stopped");
    }

    async fn consume_job(&mut self) -> bool {
        let job = tokio::select! {
            biased;
            _ = self.stop_rx.recv() => return false,
            job = Self::next_job(&self.jobs) => match job {
                Some(job) => job,
                None => return false,
            },
        };

        let token = CancellationToken::new();
        let processing = {
            let job = job.clone();
            let token = token.clone();
            async move { job.process(&token).await }
        };
        tokio::pin!(processing);

        tokio::select! {
            biased;
            signal = self.stop_rx.recv() => {
                let immediate = signal.unwrap_or(true);
                if immediate {
                    // Abandon the in-flight job; nothing is reported.
                    token.cancel();
                    return false;
                }

                let result = processing.await;
                self.report(job, result).await;
                false
            }
            result = &mut processing => {
                self.report(job, result).await;
                true
            }
        }
    }

    /// Exactly one of success/fail per processed job.
    async fn report(&self, job: Job, result: Result<JobOutcome, JobError>) {
        match result {
            Ok(outcome) => {
                debug!(
                    worker = %self.id,
                    job = %job.id,
                    kind = %job.kind,
                    ?outcome,
                    "job finished"
                );
                self.metrics.success(job).await;
            }
            Err(err) => {
                warn!(worker = %self.id, job = %job.id, kind = %job.kind, error = %err, "job failed");
                self.metrics.fail(job).await;
            }
        }
    }

    async fn next_job(jobs: &SharedJobs) -> Option<Job> {
        jobs.lock().await.recv().await
    }
}
