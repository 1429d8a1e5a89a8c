//! A resizable pool of workers driving jobs through their handlers.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsCollector;
use crate::scheduler::JobScheduler;
use crate::worker::{SharedJobs, Worker};

struct WorkerHandle {
    stop: mpsc::Sender<bool>,
    join: JoinHandle<()>,
}

struct PoolInner {
    workers: Vec<WorkerHandle>,
    scheduler: Option<JobScheduler>,
    scheduler_task: Option<JoinHandle<()>>,
    scheduler_token: CancellationToken,
    next_worker: u64,
}

/// Pool of workers consuming the scheduler's outbound channel.
///
/// The pool can be resized at runtime. Shrinking stops the excess workers
/// gracefully (their in-flight jobs finish and report); [`WorkerPool::stop`]
/// stops everything immediately, abandoning in-flight jobs.
pub struct WorkerPool {
    jobs: SharedJobs,
    metrics: Arc<dyn MetricsCollector>,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new(mut scheduler: JobScheduler, metrics: Arc<dyn MetricsCollector>) -> Self {
        let jobs = Arc::new(Mutex::new(scheduler.take_jobs()));
        let scheduler_token = scheduler.cancel_token();
        Self {
            jobs,
            metrics,
            inner: Mutex::new(PoolInner {
                workers: Vec::new(),
                scheduler: Some(scheduler),
                scheduler_task: None,
                scheduler_token,
                next_worker: 0,
            }),
        }
    }

    /// Start the metrics collector and the scheduling loop.
    pub async fn run(&self) {
        self.metrics.start().await;
        let mut inner = self.inner.lock().await;
        if let Some(scheduler) = inner.scheduler.take() {
            inner.scheduler_task = Some(tokio::spawn(scheduler.run()));
        }
    }

    /// Current number of workers.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    /// Resize the pool to `n` workers. Growing spawns new workers; shrinking
    /// signals the excess workers to stop gracefully and waits for them to
    /// quiesce.
    pub async fn set_workers(&self, n: usize) {
        let mut inner = self.inner.lock().await;
        let current = inner.workers.len();

        if n > current {
            for _ in 0..n - current {
                inner.next_worker += 1;
                let id = format!("worker-{}", inner.next_worker);
                let (worker, stop) =
                    Worker::new(id, Arc::clone(&self.jobs), Arc::clone(&self.metrics));
                let join = tokio::spawn(worker.run());
                inner.workers.push(WorkerHandle { stop, join });
            }
        } else if n < current {
            let stopping = inner.workers.split_off(n);
            Self::stop_workers(stopping, false).await;
        }
    }

    /// Block until the outbound channel closes and every worker drains,
    /// then stop the metrics collector gracefully.
    pub async fn wait(&self) {
        let (workers, scheduler_task) = {
            let mut inner = self.inner.lock().await;
            (
                std::mem::take(&mut inner.workers),
                inner.scheduler_task.take(),
            )
        };

        for handle in workers {
            let _ = handle.join.await;
        }
        if let Some(task) = scheduler_task {
            let _ = task.await;
        }

        self.metrics.stop(false).await;
    }

    /// Graceful shutdown: in-flight jobs finish and report, then the
    /// scheduler is finished and metrics are flushed one last time.
    pub async fn close(&self) {
        self.set_workers(0).await;
        self.finish_scheduler().await;
        self.metrics.stop(false).await;
    }

    /// Immediate shutdown: in-flight jobs are abandoned without reporting
    /// and pending metrics are dropped.
    pub async fn stop(&self) {
        let workers = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.workers)
        };
        Self::stop_workers(workers, true).await;
        self.finish_scheduler().await;
        self.metrics.stop(true).await;
    }

    /// Swap in a fresh scheduler after `close`, allowing the pool to be run
    /// again. The caller is responsible for not substituting a scheduler
    /// while workers are still attached to the previous outbound channel.
    pub async fn substitute_scheduler(&self, mut scheduler: JobScheduler) {
        let rx = scheduler.take_jobs();
        let token = scheduler.cancel_token();
        *self.jobs.lock().await = rx;

        let mut inner = self.inner.lock().await;
        inner.scheduler = Some(scheduler);
        inner.scheduler_token = token;
        inner.scheduler_task = None;
    }

    async fn finish_scheduler(&self) {
        let (token, task) = {
            let mut inner = self.inner.lock().await;
            (inner.scheduler_token.clone(), inner.scheduler_task.take())
        };
        token.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn stop_workers(workers: Vec<WorkerHandle>, immediate: bool) {
        for handle in &workers {
            // A worker that already exited on a closed jobs channel has
            // dropped its receiver; the failed send is fine.
            let _ = handle.stop.send(immediate).await;
        }
        for handle in workers {
            let _ = handle.join.await;
        }
    }
}
