//! Multiplexes download and update queues into the outbound jobs channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::job::Job;
use crate::metrics::{MetricsCollector, NoopCollector};

/// Hook run on every job right before it is written to the outbound
/// channel. This is where process-wide context (handler, auth lookup,
/// kind-specific flags) is attached.
pub type EnrichFn = Arc<dyn Fn(&mut Job) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the outbound jobs channel.
    pub capacity: usize,
    /// Poll interval when both sources are empty and `wait_new_jobs` is
    /// off.
    pub retrieve_timeout: Duration,
    /// Whether to block for new jobs when both sources are empty.
    pub wait_new_jobs: bool,
    /// How long a blocking wait for new jobs lasts before giving up for
    /// this round.
    pub wait_new_jobs_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retrieve_timeout: Duration::from_secs(3),
            wait_new_jobs: true,
            wait_new_jobs_timeout: Duration::from_secs(30),
        }
    }
}

enum Schedule {
    Job(Box<Job>),
    /// Both sources are currently empty.
    NoNewJobs,
    /// Both sources are closed; nothing will ever arrive again.
    Exhausted,
}

/// Merges the download and update queues into a single bounded outbound
/// channel.
///
/// Downloads are preferred over updates whenever both are readable. Every
/// forwarded job gets a fresh id, is run through the enrichment hook and is
/// reported to the metrics collector as discovered. The outbound channel is
/// closed by this scheduler and nobody else: when both sources disconnect
/// (or the scheduler is finished), `run` returns and drops the only sender.
pub struct JobScheduler {
    download: mpsc::Receiver<Job>,
    update: mpsc::Receiver<Job>,
    download_open: bool,
    update_open: bool,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: Option<mpsc::Receiver<Job>>,
    enrich: Option<EnrichFn>,
    metrics: Arc<dyn MetricsCollector>,
    token: CancellationToken,
    config: SchedulerConfig,
    next_id: u64,
}

impl JobScheduler {
    pub fn new(
        download: mpsc::Receiver<Job>,
        update: mpsc::Receiver<Job>,
        config: SchedulerConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.capacity.max(1));
        Self {
            download,
            update,
            download_open: true,
            update_open: true,
            jobs_tx,
            jobs_rx: Some(jobs_rx),
            enrich: None,
            metrics: Arc::new(NoopCollector),
            token: CancellationToken::new(),
            config,
            next_id: 0,
        }
    }

    pub fn with_enrich(mut self, enrich: EnrichFn) -> Self {
        self.enrich = Some(enrich);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The consuming end of the outbound channel. The first call hands out
    /// the live receiver; later calls return an already-closed one.
    pub fn take_jobs(&mut self) -> mpsc::Receiver<Job> {
        match self.jobs_rx.take() {
            Some(rx) => rx,
            None => {
                let (_tx, rx) = mpsc::channel(1);
                rx
            }
        }
    }

    /// Token that finishes the scheduling loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Scheduling loop. Returns when both sources are exhausted or the
    /// scheduler is finished; either way the outbound channel closes.
    pub async fn run(mut self) {
        debug!("job scheduler started");
        loop {
            if self.token.is_cancelled() {
                break;
            }

            match self.next().await {
                Schedule::Job(job) => {
                    if !self.forward(*job).await {
                        break;
                    }
                }
                Schedule::Exhausted => {
                    info!("job sources exhausted, closing outbound queue");
                    break;
                }
                Schedule::NoNewJobs => {
                    trace!("couldn't find new jobs to schedule");
                    if !self.config.wait_new_jobs {
                        tokio::select! {
                            biased;
                            _ = self.token.cancelled() => break,
                            _ = time::sleep(self.config.retrieve_timeout) => {}
                        }
                    }
                }
            }
        }
        debug!("job scheduler stopped");
    }

    async fn next(&mut self) -> Schedule {
        // Downloads win whenever both sources are readable.
        if let Some(job) = poll(&mut self.download, &mut self.download_open, "download") {
            return Schedule::Job(Box::new(job));
        }
        if let Some(job) = poll(&mut self.update, &mut self.update_open, "update") {
            return Schedule::Job(Box::new(job));
        }

        if !self.download_open && !self.update_open {
            return Schedule::Exhausted;
        }

        if !self.config.wait_new_jobs {
            return Schedule::NoNewJobs;
        }

        self.wait_for_either().await
    }

    async fn wait_for_either(&mut self) -> Schedule {
        let deadline = time::sleep(self.config.wait_new_jobs_timeout);
        tokio::pin!(deadline);

        loop {
            if !self.download_open && !self.update_open {
                return Schedule::Exhausted;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Schedule::NoNewJobs,
                job = self.download.recv(), if self.download_open => match job {
                    Some(job) => return Schedule::Job(Box::new(job)),
                    None => {
                        self.download_open = false;
                        debug!(source = "download", "job source closed");
                    }
                },
                job = self.update.recv(), if self.update_open => match job {
                    Some(job) => return Schedule::Job(Box::new(job)),
                    None => {
                        self.update_open = false;
                        debug!(source = "update", "job source closed");
                    }
                },
                _ = &mut deadline => return Schedule::NoNewJobs,
            }
        }
    }

    async fn forward(&mut self, mut job: Job) -> bool {
        self.next_id += 1;
        job.id = format!("job-{}", self.next_id);

        if let Some(enrich) = &self.enrich {
            enrich(&mut job);
        }

        let discovered = job.clone();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return false,
            sent = self.jobs_tx.send(job) => {
                if sent.is_err() {
                    warn!("outbound jobs channel closed, stopping scheduler");
                    return false;
                }
            }
        }

        self.metrics.discover(discovered).await;
        true
    }
}

fn poll(rx: &mut mpsc::Receiver<Job>, open: &mut bool, name: &'static str) -> Option<Job> {
    if !*open {
        return None;
    }

    match rx.try_recv() {
        Ok(job) => Some(job),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Disconnected) => {
            *open = false;
            debug!(source = name, "job source closed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use crate::test_support::RecordingCollector;

    fn channels() -> (
        mpsc::Sender<Job>,
        mpsc::Receiver<Job>,
        mpsc::Sender<Job>,
        mpsc::Receiver<Job>,
    ) {
        let (dtx, drx) = mpsc::channel(16);
        let (utx, urx) = mpsc::channel(16);
        (dtx, drx, utx, urx)
    }

    #[tokio::test]
    async fn prefers_downloads_over_updates() {
        let (dtx, drx, utx, urx) = channels();
        utx.send(Job::update("loc-1", vec![])).await.unwrap();
        dtx.send(Job::download("https://github.com/org/a")).await.unwrap();

        let mut scheduler = JobScheduler::new(drx, urx, SchedulerConfig::default());
        let mut jobs = scheduler.take_jobs();
        drop(dtx);
        drop(utx);
        tokio::spawn(scheduler.run());

        let first = jobs.recv().await.unwrap();
        assert_eq!(first.kind, JobKind::Download);
        let second = jobs.recv().await.unwrap();
        assert_eq!(second.kind, JobKind::Update);
        assert!(jobs.recv().await.is_none());
    }

    #[tokio::test]
    async fn assigns_fresh_ids_and_enriches() {
        let (dtx, drx, utx, urx) = channels();
        for i in 0..3 {
            dtx.send(Job::download(format!("https://github.com/org/repo-{i}")))
                .await
                .unwrap();
        }
        drop(dtx);
        drop(utx);

        let mut scheduler = JobScheduler::new(drx, urx, SchedulerConfig::default())
            .with_enrich(Arc::new(|job: &mut Job| {
                job.allow_update = true;
            }));
        let mut jobs = scheduler.take_jobs();
        tokio::spawn(scheduler.run());

        let mut seen = Vec::new();
        while let Some(job) = jobs.recv().await {
            assert!(!job.id.is_empty());
            assert!(job.allow_update);
            assert!(matches!(job.kind, JobKind::Download | JobKind::Update));
            seen.push(job.id);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn closes_outbound_when_both_sources_close() {
        let (dtx, drx, utx, urx) = channels();
        drop(dtx);
        drop(utx);

        let mut scheduler = JobScheduler::new(drx, urx, SchedulerConfig::default());
        let mut jobs = scheduler.take_jobs();
        tokio::spawn(scheduler.run());

        assert!(jobs.recv().await.is_none());
    }

    #[tokio::test]
    async fn reports_discover_for_every_forwarded_job() {
        let (dtx, drx, utx, urx) = channels();
        dtx.send(Job::download("https://github.com/org/a")).await.unwrap();
        utx.send(Job::update("loc-1", vec![])).await.unwrap();
        drop(dtx);
        drop(utx);

        let collector = Arc::new(RecordingCollector::default());
        let mut scheduler = JobScheduler::new(drx, urx, SchedulerConfig::default())
            .with_metrics(collector.clone());
        let mut jobs = scheduler.take_jobs();
        let run = tokio::spawn(scheduler.run());

        while jobs.recv().await.is_some() {}
        run.await.unwrap();

        assert_eq!(collector.discovered().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_again_when_not_waiting_for_jobs() {
        let (dtx, drx, utx, urx) = channels();

        let config = SchedulerConfig {
            wait_new_jobs: false,
            retrieve_timeout: Duration::from_millis(50),
            ..SchedulerConfig::default()
        };
        let mut scheduler = JobScheduler::new(drx, urx, config);
        let mut jobs = scheduler.take_jobs();
        tokio::spawn(scheduler.run());

        // Nothing queued yet; the scheduler should keep polling instead of
        // shutting down.
        time::sleep(Duration::from_millis(200)).await;
        dtx.send(Job::download("https://github.com/org/late")).await.unwrap();
        drop(dtx);
        drop(utx);

        let job = jobs.recv().await.unwrap();
        assert_eq!(job.endpoints, vec!["https://github.com/org/late".to_string()]);
        assert!(jobs.recv().await.is_none());
    }
}
