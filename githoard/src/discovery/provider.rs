//! Discovery provider: batches iterator records and advertises them
//! downstream under a deadline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use githoard_core::Backoff;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DiscoveryError, RepoIterator, RepoRecord};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BATCH_SIZE: usize = 1;
const ADVERTISE_TIMEOUT_PER_RECORD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum AdvertiseError {
    #[error("advertise repositories timeout")]
    Timeout,

    #[error("job queue closed")]
    QueueClosed,
}

/// Downstream hook receiving batches of discovered repositories. The
/// provider bounds every call with its advertise timeout.
#[async_trait]
pub trait RepoSink: Send + Sync {
    async fn advertise(&self, records: &[RepoRecord]) -> Result<(), AdvertiseError>;
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Records accumulated before an advertise call. Zero means one.
    pub batch_size: usize,
    /// Deadline for a single advertise call. Defaults to 5 s per batched
    /// record.
    pub advertise_timeout: Option<Duration>,
    /// Cap on the retry buffer holding batches that timed out downstream.
    /// Defaults to twice the batch size; overflow is dropped.
    pub max_job_buffer: Option<usize>,
    /// Drop forked repositories instead of advertising them.
    pub skip_forks: bool,
    /// Keep polling after the listing is exhausted instead of stopping.
    pub wait_new_repos: bool,
    /// Sleep through rate-limit windows instead of stopping.
    pub wait_on_rate_limit: bool,
    pub stop_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            advertise_timeout: None,
            max_job_buffer: None,
            skip_forks: false,
            wait_new_repos: false,
            wait_on_rate_limit: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Stops a running [`OrgDiscovery`] from outside.
///
/// Stopping is idempotent; the call resolves once the provider loop has
/// acknowledged the stop or errors after the configured stop timeout.
#[derive(Clone)]
pub struct DiscoveryStopper {
    token: CancellationToken,
    done: watch::Receiver<bool>,
    timeout: Duration,
}

impl DiscoveryStopper {
    pub async fn stop(&mut self) -> Result<(), DiscoveryError> {
        self.token.cancel();
        match time::timeout(self.timeout, self.done.wait_for(|finished| *finished)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DiscoveryError::StopTimeout),
        }
    }
}

/// Pulls records from an iterator, filters and batches them, and advertises
/// each full batch downstream.
///
/// State machine: running while the iterator produces; waiting while an
/// end-of-listing or rate-limit hint is honored; stopped on cancellation, a
/// fatal error, or a terminal hint whose wait flag is off. On stop, a
/// partial batch is flushed once, best-effort.
pub struct OrgDiscovery {
    iter: Box<dyn RepoIterator>,
    sink: Arc<dyn RepoSink>,
    batch: Vec<RepoRecord>,
    retry: VecDeque<RepoRecord>,
    backoff: Backoff,
    token: CancellationToken,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    batch_size: usize,
    advertise_timeout: Duration,
    max_job_buffer: usize,
    skip_forks: bool,
    wait_new_repos: bool,
    wait_on_rate_limit: bool,
    stop_timeout: Duration,
}

impl OrgDiscovery {
    pub fn new(
        iter: Box<dyn RepoIterator>,
        sink: Arc<dyn RepoSink>,
        config: DiscoveryConfig,
    ) -> Self {
        let batch_size = config.batch_size.max(1);
        let advertise_timeout = config
            .advertise_timeout
            .unwrap_or(ADVERTISE_TIMEOUT_PER_RECORD * batch_size as u32);
        let max_job_buffer = config.max_job_buffer.unwrap_or(batch_size * 2);
        let (done_tx, done_rx) = watch::channel(false);

        Self {
            iter,
            sink,
            batch: Vec::with_capacity(batch_size),
            retry: VecDeque::new(),
            backoff: Backoff::default(),
            token: CancellationToken::new(),
            done_tx,
            done_rx,
            batch_size,
            advertise_timeout,
            max_job_buffer,
            skip_forks: config.skip_forks,
            wait_new_repos: config.wait_new_repos,
            wait_on_rate_limit: config.wait_on_rate_limit,
            stop_timeout: config.stop_timeout,
        }
    }

    pub fn stopper(&self) -> DiscoveryStopper {
        DiscoveryStopper {
            token: self.token.clone(),
            done: self.done_rx.clone(),
            timeout: self.stop_timeout,
        }
    }

    /// Drive discovery until a terminal condition. Always returns an error:
    /// [`DiscoveryError::Stopped`] is the clean-termination signal, anything
    /// else is a failure.
    pub async fn run(mut self) -> Result<(), DiscoveryError> {
        info!("discovery started");
        let token = self.token.clone();

        let result = loop {
            if token.is_cancelled() {
                break Err(DiscoveryError::stopped(None));
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break Err(DiscoveryError::stopped(None)),
                step = self.discover_step() => match step {
                    Ok(()) => {}
                    Err(err) => break Err(err),
                },
            }
        };

        // A stopped provider flushes what it already collected.
        if matches!(result, Err(DiscoveryError::Stopped { .. })) && !self.batch.is_empty() {
            if let Err(err) = self.send_batch().await {
                warn!(error = %err, "couldn't flush partial batch on stop");
            }
        }

        match &result {
            Err(DiscoveryError::Stopped { .. }) => info!("discovery stopped"),
            Err(err) => warn!(error = %err, "discovery failed"),
            Ok(()) => {}
        }

        let _ = self.done_tx.send(true);
        result
    }

    /// One provider step: pull a record (retry buffer first), batch it, and
    /// advertise when the batch is full.
    async fn discover_step(&mut self) -> Result<(), DiscoveryError> {
        if let Some(record) = self.retry.pop_front() {
            self.batch.push(record);
        } else {
            match self.next_record().await {
                Ok(Some(record)) => self.batch.push(record),
                Ok(None) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        if self.batch.len() < self.batch_size {
            return Ok(());
        }

        match time::timeout(self.advertise_timeout, self.send_batch()).await {
            Ok(Ok(())) => {
                self.backoff.reset();
                Ok(())
            }
            Ok(Err(AdvertiseError::QueueClosed)) => Err(DiscoveryError::QueueClosed),
            Ok(Err(AdvertiseError::Timeout)) | Err(_) => {
                self.buffer_batch_for_retry();
                let delay = self.backoff.next_delay();
                debug!(?delay, "advertise timed out, backing off");
                self.pause(delay).await;
                Ok(())
            }
        }
    }

    /// Next record from the iterator, honoring wait hints. `Ok(None)` means
    /// the step produced nothing (filtered record or a wait that elapsed).
    async fn next_record(&mut self) -> Result<Option<RepoRecord>, DiscoveryError> {
        match self.iter.next().await {
            Ok(record) => {
                if self.skip_forks && record.fork {
                    trace!(repo = %record.name, "forked repository skipped");
                    return Ok(None);
                }
                Ok(Some(record))
            }
            Err(DiscoveryError::NoNewRepos { retry_after }) => {
                if !self.wait_new_repos {
                    return Err(DiscoveryError::stopped(Some(DiscoveryError::NoNewRepos {
                        retry_after,
                    })));
                }
                debug!(?retry_after, "no new repositories, waiting");
                self.pause(retry_after).await;
                Ok(None)
            }
            Err(DiscoveryError::RateLimited { retry_after }) => {
                if !self.wait_on_rate_limit {
                    return Err(DiscoveryError::stopped(Some(DiscoveryError::RateLimited {
                        retry_after,
                    })));
                }
                warn!(?retry_after, "rate limit exceeded, waiting");
                self.pause(retry_after).await;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn send_batch(&mut self) -> Result<(), AdvertiseError> {
        self.sink.advertise(&self.batch).await?;
        trace!(records = self.batch.len(), "batch advertised");
        self.batch.clear();
        Ok(())
    }

    /// Move the stuck batch into the bounded retry buffer.
    fn buffer_batch_for_retry(&mut self) {
        let mut dropped = 0usize;
        for record in self.batch.drain(..) {
            if self.retry.len() < self.max_job_buffer {
                self.retry.push_back(record);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "retry buffer full, discovered repositories dropped");
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            _ = time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct ScriptedIter {
        script: VecDeque<Result<RepoRecord, DiscoveryError>>,
    }

    impl ScriptedIter {
        fn new(script: Vec<Result<RepoRecord, DiscoveryError>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    #[async_trait]
    impl RepoIterator for ScriptedIter {
        async fn next(&mut self) -> Result<RepoRecord, DiscoveryError> {
            self.script.pop_front().unwrap_or(Err(DiscoveryError::NoNewRepos {
                retry_after: Duration::from_secs(24 * 60 * 60),
            }))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl CollectingSink {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }

        fn names(&self) -> Vec<String> {
            self.batches().into_iter().flatten().collect()
        }
    }

    #[async_trait]
    impl RepoSink for CollectingSink {
        async fn advertise(&self, records: &[RepoRecord]) -> Result<(), AdvertiseError> {
            self.batches
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.name.clone()).collect());
            Ok(())
        }
    }

    /// Sink whose first `stall_first` calls never complete, driving the
    /// provider into its advertise-timeout path.
    struct StallingSink {
        stall_first: AtomicUsize,
        inner: CollectingSink,
    }

    #[async_trait]
    impl RepoSink for StallingSink {
        async fn advertise(&self, records: &[RepoRecord]) -> Result<(), AdvertiseError> {
            let remaining = self.stall_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.stall_first.store(remaining - 1, Ordering::SeqCst);
                time::sleep(Duration::from_secs(600)).await;
            }
            self.inner.advertise(records).await
        }
    }

    fn record(name: &str) -> RepoRecord {
        RepoRecord {
            name: name.to_string(),
            full_name: format!("org/{name}"),
            html_url: Some(format!("https://github.com/org/{name}")),
            ..RepoRecord::default()
        }
    }

    fn rate_limited(ms: u64) -> Result<RepoRecord, DiscoveryError> {
        Err(DiscoveryError::RateLimited {
            retry_after: Duration::from_millis(ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_then_recovers() {
        let sink = Arc::new(CollectingSink::default());
        let iter = ScriptedIter::new(vec![
            rate_limited(200),
            rate_limited(200),
            rate_limited(200),
            Ok(record("a")),
            Ok(record("b")),
        ]);

        let provider = OrgDiscovery::new(
            Box::new(iter),
            sink.clone(),
            DiscoveryConfig {
                wait_on_rate_limit: true,
                ..DiscoveryConfig::default()
            },
        );

        let start = time::Instant::now();
        let result = provider.run().await;

        assert!(matches!(result, Err(DiscoveryError::Stopped { .. })));
        assert_eq!(sink.names(), vec!["a", "b"]);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn rate_limit_without_waiting_stops_with_the_cause() {
        let sink = Arc::new(CollectingSink::default());
        let iter = ScriptedIter::new(vec![rate_limited(200), Ok(record("a"))]);

        let provider =
            OrgDiscovery::new(Box::new(iter), sink.clone(), DiscoveryConfig::default());
        let result = provider.run().await;

        match result {
            Err(DiscoveryError::Stopped { source: Some(source) }) => {
                assert!(matches!(*source, DiscoveryError::RateLimited { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn partial_batch_is_flushed_once_on_stop() {
        let sink = Arc::new(CollectingSink::default());
        let iter = ScriptedIter::new(vec![
            Ok(record("a")),
            Ok(record("b")),
            Ok(record("c")),
        ]);

        let provider = OrgDiscovery::new(
            Box::new(iter),
            sink.clone(),
            DiscoveryConfig {
                batch_size: 10,
                ..DiscoveryConfig::default()
            },
        );

        let result = provider.run().await;
        assert!(matches!(result, Err(DiscoveryError::Stopped { .. })));
        assert_eq!(sink.batches(), vec![vec!["a", "b", "c"]]);
    }

    #[tokio::test]
    async fn forks_are_skipped_when_configured() {
        let sink = Arc::new(CollectingSink::default());
        let mut forked = record("forked");
        forked.fork = true;
        let iter = ScriptedIter::new(vec![Ok(forked), Ok(record("own"))]);

        let provider = OrgDiscovery::new(
            Box::new(iter),
            sink.clone(),
            DiscoveryConfig {
                skip_forks: true,
                ..DiscoveryConfig::default()
            },
        );

        let _ = provider.run().await;
        assert_eq!(sink.names(), vec!["own"]);
    }

    #[tokio::test(start_paused = true)]
    async fn advertise_timeouts_buffer_and_retry() {
        let sink = Arc::new(StallingSink {
            stall_first: AtomicUsize::new(2),
            inner: CollectingSink::default(),
        });
        let iter = ScriptedIter::new(vec![Ok(record("a")), Ok(record("b"))]);

        let provider = OrgDiscovery::new(
            Box::new(iter),
            sink.clone(),
            DiscoveryConfig {
                batch_size: 2,
                advertise_timeout: Some(Duration::from_millis(50)),
                ..DiscoveryConfig::default()
            },
        );

        let result = provider.run().await;
        assert!(matches!(result, Err(DiscoveryError::Stopped { .. })));

        let names = sink.inner.names();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_bounded() {
        let sink = Arc::new(CollectingSink::default());
        let iter = ScriptedIter::new(vec![]);

        let provider = OrgDiscovery::new(
            Box::new(iter),
            sink,
            DiscoveryConfig {
                wait_new_repos: true,
                ..DiscoveryConfig::default()
            },
        );
        let mut stopper = provider.stopper();
        let mut second = provider.stopper();

        let run = tokio::spawn(provider.run());

        // Let the provider park itself in the 24 h end-of-listing wait.
        time::sleep(Duration::from_secs(1)).await;

        stopper.stop().await.unwrap();
        second.stop().await.unwrap();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(DiscoveryError::Stopped { .. })));
    }
}
