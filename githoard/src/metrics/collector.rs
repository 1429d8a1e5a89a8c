//! Counter collector: absorbs job events on its own loop and flushes
//! snapshots to a sink on batch or timer boundaries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use githoard_core::{Job, JobKind, MetricsCollector};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_SYNC_TIME: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
#[error("metrics sink error: {reason}")]
pub struct SinkError {
    pub reason: String,
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            reason: err.to_string(),
        }
    }
}

/// Exports a counter snapshot to an external store.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn flush(&self, org: &str, counters: MetricCounts) -> Result<(), SinkError>;
}

/// Monotonic counters owned by a collector loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricCounts {
    pub discovered: u64,
    pub downloaded: u64,
    pub updated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
enum EventKind {
    Success,
    Fail,
    Discover,
}

impl MetricCounts {
    /// Apply one event and return how many endpoint-events it counted for.
    ///
    /// A failed job with no endpoints still counts as one failure so that
    /// malformed jobs stay visible; the same policy holds in every
    /// collector.
    fn record(&mut self, kind: EventKind, job: &Job) -> u64 {
        match kind {
            EventKind::Success => match job.kind {
                JobKind::Download => {
                    self.downloaded += 1;
                    1
                }
                JobKind::Update => {
                    let n = job.endpoints.len() as u64;
                    self.updated += n;
                    n
                }
            },
            EventKind::Fail => {
                let n = (job.endpoints.len() as u64).max(1);
                self.failed += n;
                n
            }
            EventKind::Discover => match job.kind {
                JobKind::Download => {
                    self.discovered += 1;
                    1
                }
                // Update jobs are not discoveries.
                JobKind::Update => 0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Endpoint-events accumulated before a flush.
    pub batch_size: usize,
    /// A non-empty batch is flushed once this much time has passed since
    /// the last flush.
    pub sync_time: Duration,
    /// Idle period after which a debounced heartbeat line is logged.
    pub wait_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sync_time: DEFAULT_SYNC_TIME,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

struct CollectorLoop {
    org: String,
    success_rx: mpsc::Receiver<Job>,
    fail_rx: mpsc::Receiver<Job>,
    discover_rx: mpsc::Receiver<Job>,
    cancel_rx: mpsc::Receiver<bool>,
    sink: Arc<dyn MetricsSink>,
    config: CollectorConfig,
    counters: MetricCounts,
}

impl CollectorLoop {
    async fn run(mut self) {
        let mut batch = 0u64;
        let mut last_sync = Instant::now();
        let mut waiting_logged = false;

        let stop = loop {
            let event = tokio::select! {
                biased;
                signal = self.cancel_rx.recv() => break signal.unwrap_or(true),
                Some(job) = self.success_rx.recv() => Some((EventKind::Success, job)),
                Some(job) = self.fail_rx.recv() => Some((EventKind::Fail, job)),
                Some(job) = self.discover_rx.recv() => Some((EventKind::Discover, job)),
                _ = time::sleep(self.config.wait_timeout) => {
                    if !waiting_logged {
                        debug!(org = %self.org, "waiting for new metrics");
                        waiting_logged = true;
                    }
                    None
                }
            };

            if let Some((kind, job)) = event {
                batch += self.counters.record(kind, &job);
                waiting_logged = false;
            }

            let sync_due = last_sync.elapsed() >= self.config.sync_time;
            if batch >= self.config.batch_size as u64 || (sync_due && batch > 0) {
                if self.flush().await {
                    last_sync = Instant::now();
                    batch = 0;
                }
            } else if sync_due {
                trace!(org = %self.org, "sync timeout: nothing to update");
            }
        };

        if !stop {
            // A graceful stop still counts the events already queued.
            while let Some((kind, job)) = self.next_buffered() {
                batch += self.counters.record(kind, &job);
                if batch >= self.config.batch_size as u64 && self.flush().await {
                    batch = 0;
                }
            }
            if batch > 0 {
                self.flush().await;
            }
        }

        info!(
            org = %self.org,
            discovered = self.counters.discovered,
            downloaded = self.counters.downloaded,
            updated = self.counters.updated,
            failed = self.counters.failed,
            "metrics collector stopped"
        );
    }

    fn next_buffered(&mut self) -> Option<(EventKind, Job)> {
        if let Ok(job) = self.success_rx.try_recv() {
            return Some((EventKind::Success, job));
        }
        if let Ok(job) = self.fail_rx.try_recv() {
            return Some((EventKind::Fail, job));
        }
        if let Ok(job) = self.discover_rx.try_recv() {
            return Some((EventKind::Discover, job));
        }
        None
    }

    async fn flush(&self) -> bool {
        match self.sink.flush(&self.org, self.counters).await {
            Ok(()) => {
                debug!(
                    org = %self.org,
                    discovered = self.counters.discovered,
                    downloaded = self.counters.downloaded,
                    updated = self.counters.updated,
                    failed = self.counters.failed,
                    "metrics synced"
                );
                true
            }
            Err(err) => {
                warn!(org = %self.org, error = %err, "couldn't send metrics");
                false
            }
        }
    }
}

/// Collector for a single organization.
///
/// Events are absorbed by an owning loop spawned on `start`; the loop is
/// the only writer of the counters. Flushes happen when the batch of
/// counted endpoint-events reaches `batch_size`, or on the first event
/// after `sync_time` has elapsed with something pending.
pub struct Collector {
    org: String,
    success_tx: mpsc::Sender<Job>,
    fail_tx: mpsc::Sender<Job>,
    discover_tx: mpsc::Sender<Job>,
    cancel_tx: mpsc::Sender<bool>,
    state: Mutex<Option<CollectorLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(org: impl Into<String>, sink: Arc<dyn MetricsSink>, config: CollectorConfig) -> Self {
        let org = org.into();
        let capacity = config.batch_size.max(1) * 5;
        let (success_tx, success_rx) = mpsc::channel(capacity);
        let (fail_tx, fail_rx) = mpsc::channel(capacity);
        let (discover_tx, discover_rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        let state = CollectorLoop {
            org: org.clone(),
            success_rx,
            fail_rx,
            discover_rx,
            cancel_rx,
            sink,
            config,
            counters: MetricCounts::default(),
        };

        Self {
            org,
            success_tx,
            fail_tx,
            discover_tx,
            cancel_tx,
            state: Mutex::new(Some(state)),
            task: Mutex::new(None),
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }
}

#[async_trait]
impl MetricsCollector for Collector {
    async fn start(&self) {
        if let Some(state) = self.state.lock().await.take() {
            *self.task.lock().await = Some(tokio::spawn(state.run()));
        }
    }

    async fn stop(&self, immediate: bool) {
        let _ = self.cancel_tx.send(immediate).await;
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn success(&self, job: Job) {
        let _ = self.success_tx.send(job).await;
    }

    async fn fail(&self, job: Job) {
        let _ = self.fail_tx.send(job).await;
    }

    async fn discover(&self, job: Job) {
        let _ = self.discover_tx.send(job).await;
    }
}
