//! Periodic provider emitting one update job per library location.

use std::sync::Arc;
use std::time::Duration;

use githoard_core::Job;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::library::{Library, LibraryError};

const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(500);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_micros(500);

#[derive(Debug, thiserror::Error)]
pub enum UpdatesError {
    /// Clean-termination signal: the provider was stopped or ran its single
    /// sweep.
    #[error("provider stopped")]
    Stopped,

    #[error("provider failed on stop")]
    StopTimeout,

    #[error("update queue is full")]
    QueueFull,

    #[error("update queue closed")]
    QueueClosed,

    #[error(transparent)]
    Library(#[from] LibraryError),
}

#[derive(Debug, Clone)]
pub struct UpdatesConfig {
    /// Run one sweep and exit.
    pub trigger_once: bool,
    /// Time between sweeps.
    pub trigger_interval: Duration,
    /// Per-job budget for getting an update onto the queue.
    pub enqueue_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            trigger_once: false,
            trigger_interval: DEFAULT_TRIGGER_INTERVAL,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Stops a running [`UpdatesProvider`].
#[derive(Clone)]
pub struct UpdatesStopper {
    token: CancellationToken,
    done: watch::Receiver<bool>,
    timeout: Duration,
}

impl UpdatesStopper {
    pub async fn stop(&mut self) -> Result<(), UpdatesError> {
        self.token.cancel();
        match time::timeout(self.timeout, self.done.wait_for(|finished| *finished)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(UpdatesError::StopTimeout),
        }
    }
}

/// Walks the library on a timer and enqueues one update job per location.
///
/// Two sweeps over an unchanged library yield the same multiset of jobs; no
/// ordering is guaranteed once workers start consuming them.
pub struct UpdatesProvider {
    library: Arc<Library>,
    queue: mpsc::Sender<Job>,
    token: CancellationToken,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    config: UpdatesConfig,
}

impl UpdatesProvider {
    pub fn new(library: Arc<Library>, queue: mpsc::Sender<Job>, config: UpdatesConfig) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            library,
            queue,
            token: CancellationToken::new(),
            done_tx,
            done_rx,
            config,
        }
    }

    pub fn stopper(&self) -> UpdatesStopper {
        UpdatesStopper {
            token: self.token.clone(),
            done: self.done_rx.clone(),
            timeout: self.config.stop_timeout,
        }
    }

    /// Sweep immediately, then every `trigger_interval` until stopped.
    /// Always returns an error; [`UpdatesError::Stopped`] is the clean one.
    pub async fn run(self) -> Result<(), UpdatesError> {
        let result = self.run_inner().await;
        let _ = self.done_tx.send(true);
        result
    }

    async fn run_inner(&self) -> Result<(), UpdatesError> {
        info!("updates provider started");
        self.sweep().await?;

        if self.config.trigger_once {
            return Err(UpdatesError::Stopped);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(UpdatesError::Stopped),
                _ = time::sleep(self.config.trigger_interval) => self.sweep().await?,
            }
        }
    }

    async fn sweep(&self) -> Result<(), UpdatesError> {
        let locations = self.library.locations()?;
        debug!(locations = locations.len(), "update sweep started");

        for location in locations {
            let job = Job::update(location, Vec::new());

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(UpdatesError::Stopped),
                sent = time::timeout(self.config.enqueue_timeout, self.queue.send(job)) => {
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(UpdatesError::QueueClosed),
                        Err(_) => return Err(UpdatesError::QueueFull),
                    }
                }
            }
        }

        debug!("update sweep finished");
        Ok(())
    }
}
