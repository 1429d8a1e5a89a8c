//! Subcommand implementations: pipeline wiring and lifecycle.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use githoard_core::{
    AuthLookup, EnrichFn, Job, JobHandler, JobKind, JobScheduler, MetricsCollector, NoopCollector,
    SchedulerConfig, WorkerPool,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::{DownloadArgs, UpdateArgs, resolve_workers};
use crate::discovery::{DiscoveryConfig, DiscoveryError, DiscoveryStopper};
use crate::handler::GitJobHandler;
use crate::library::{Library, org_from_endpoint};
use crate::metrics::{Collector, CollectorByOrg, CollectorConfig, DbSink, FALLBACK_ORG, prepare_db};
use crate::provider::{
    UpdatesConfig, UpdatesError, UpdatesProvider, github_org_discovery,
};

const DOWNLOAD_QUEUE_CAPACITY: usize = 100;
const UPDATE_QUEUE_CAPACITY: usize = 100;

/// Run the download pipeline: one discovery provider per organization
/// feeding the worker pool until every listing is exhausted.
pub async fn download(args: DownloadArgs) -> anyhow::Result<()> {
    let started = Instant::now();

    let orgs: Vec<String> = args
        .orgs
        .iter()
        .map(|org| org.trim().to_lowercase())
        .filter(|org| !org.is_empty())
        .collect();
    anyhow::ensure!(!orgs.is_empty(), "at least one organization must be provided");

    let temp_root = temp_root(args.tmp.as_deref())?;
    let library = Arc::new(
        Library::open(&args.library, args.bucket, &temp_root)
            .context("wrong path to locate the library")?,
    );
    debug!(temp = %temp_root.display(), "temporary directory created");

    let metrics: Arc<dyn MetricsCollector> = match &args.metrics_db {
        Some(uri) => {
            let collector = setup_metrics(
                uri,
                &args.metrics_db_table,
                &orgs,
                Duration::from_secs(args.metrics_sync.max(1)),
            )
            .await
            .context("failed to setup metrics")?;
            debug!(sync = args.metrics_sync, "metrics collection activated");
            Arc::new(collector)
        }
        None => Arc::new(NoopCollector),
    };

    let allow_update = !args.no_updates;
    debug!(allow_update, "updates on already downloaded repositories");

    let (download_tx, download_rx) = mpsc::channel(DOWNLOAD_QUEUE_CAPACITY);
    // This pipeline has no update source; the scheduler sees the channel as
    // closed from the start.
    let (update_tx, update_rx) = mpsc::channel::<Job>(1);
    drop(update_tx);

    let enrich = enrichment(
        Arc::new(GitJobHandler::new(library.clone())),
        auth_lookup(&orgs, args.token.clone()),
        allow_update,
    );
    let scheduler = JobScheduler::new(download_rx, update_rx, SchedulerConfig::default())
        .with_enrich(enrich)
        .with_metrics(metrics.clone());

    let pool = WorkerPool::new(scheduler, metrics);
    pool.set_workers(resolve_workers(args.workers, args.half_cpu))
        .await;
    debug!(workers = pool.size().await, "worker pool sized");
    pool.run().await;

    let mut stoppers: Vec<DiscoveryStopper> = Vec::with_capacity(orgs.len());
    let mut providers = tokio::task::JoinSet::new();
    for org in &orgs {
        let provider = github_org_discovery(
            org,
            &args.excluded_repos,
            args.token.clone(),
            download_tx.clone(),
            DiscoveryConfig {
                skip_forks: args.no_forks,
                ..DiscoveryConfig::default()
            },
        );
        stoppers.push(provider.stopper());

        let org = org.clone();
        let spawned_org = org.clone();
        providers.spawn(async move {
            match provider.run().await {
                Err(DiscoveryError::Stopped { .. }) => {
                    debug!(org = %spawned_org, "organization provider stopped");
                }
                Err(err) => warn!(org = %spawned_org, error = %err, "organization provider failed"),
                Ok(()) => {}
            }
        });
        debug!(org = %org, "organization provider started");
    }
    drop(download_tx);

    let drained = async {
        while providers.join_next().await.is_some() {}
        pool.wait().await;
    };

    tokio::select! {
        _ = drained => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, finishing in-flight jobs");
            for stopper in &mut stoppers {
                if let Err(err) = stopper.stop().await {
                    warn!(error = %err, "provider didn't stop in time");
                }
            }
            pool.close().await;
        }
    }

    cleanup_temp(&temp_root);
    info!(elapsed = ?started.elapsed(), "collection finished");
    Ok(())
}

/// Run the update pipeline: sweep the library into update jobs, once or
/// periodically.
pub async fn update(args: UpdateArgs) -> anyhow::Result<()> {
    let started = Instant::now();

    let temp_root = temp_root(args.tmp.as_deref())?;
    let library = Arc::new(
        Library::open(&args.library, args.bucket, &temp_root)
            .context("wrong path to locate the library")?,
    );

    // This pipeline has no download source.
    let (download_tx, download_rx) = mpsc::channel::<Job>(1);
    drop(download_tx);
    let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);

    let auth = args.token.clone().map(|token| -> AuthLookup {
        Arc::new(move |_endpoint: &str| Some(token.clone()))
    });
    let enrich = enrichment(
        Arc::new(GitJobHandler::new(library.clone())),
        auth,
        false,
    );
    let scheduler = JobScheduler::new(download_rx, update_rx, SchedulerConfig::default())
        .with_enrich(enrich);

    let pool = WorkerPool::new(scheduler, Arc::new(NoopCollector));
    pool.set_workers(resolve_workers(args.workers, args.half_cpu))
        .await;
    pool.run().await;

    let provider = UpdatesProvider::new(
        library,
        update_tx,
        UpdatesConfig {
            trigger_once: args.once,
            trigger_interval: Duration::from_secs(args.trigger_interval.max(1)),
            ..UpdatesConfig::default()
        },
    );
    let mut stopper = provider.stopper();
    let provider_task = tokio::spawn(async move {
        match provider.run().await {
            Err(UpdatesError::Stopped) => debug!("updates provider stopped"),
            Err(err) => warn!(error = %err, "updates provider failed"),
            Ok(()) => {}
        }
    });

    let drained = async {
        let _ = provider_task.await;
        pool.wait().await;
    };

    tokio::select! {
        _ = drained => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, finishing in-flight jobs");
            if let Err(err) = stopper.stop().await {
                warn!(error = %err, "updates provider didn't stop in time");
            }
            pool.close().await;
        }
    }

    cleanup_temp(&temp_root);
    info!(elapsed = ?started.elapsed(), "update run finished");
    Ok(())
}

async fn setup_metrics(
    uri: &str,
    table: &str,
    orgs: &[String],
    sync_time: Duration,
) -> anyhow::Result<CollectorByOrg> {
    // The fallback bucket gets a seeded row like every configured org.
    let mut seeded = orgs.to_vec();
    seeded.push(FALLBACK_ORG.to_string());
    let pool = prepare_db(uri, table, &seeded).await?;
    let sink = Arc::new(DbSink::new(pool, table));

    let config = CollectorConfig {
        sync_time,
        ..CollectorConfig::default()
    };

    let mut collectors = HashMap::with_capacity(orgs.len());
    for org in orgs {
        collectors.insert(
            org.clone(),
            Collector::new(org.clone(), sink.clone(), config.clone()),
        );
    }

    let fallback = Collector::new(FALLBACK_ORG, sink.clone(), config);
    Ok(CollectorByOrg::new(collectors).with_fallback(fallback))
}

/// Enrichment hook attaching the process-wide context to every scheduled
/// job.
fn enrichment(
    handler: Arc<GitJobHandler>,
    auth: Option<AuthLookup>,
    allow_update: bool,
) -> EnrichFn {
    Arc::new(move |job: &mut Job| {
        let handler: Arc<dyn JobHandler> = handler.clone();
        job.handler = Some(handler);
        job.auth = auth.clone();
        if job.kind == JobKind::Download {
            job.allow_update = allow_update;
        }
    })
}

/// Token lookup scoped to the configured organizations.
fn auth_lookup(orgs: &[String], token: Option<String>) -> Option<AuthLookup> {
    let token = token?;
    let orgs: HashSet<String> = orgs.iter().cloned().collect();
    debug!("access token found");

    Some(Arc::new(move |endpoint: &str| {
        org_from_endpoint(endpoint)
            .map(|org| org.to_lowercase())
            .filter(|org| orgs.contains(org))
            .map(|_| token.clone())
    }))
}

fn temp_root(tmp: Option<&Path>) -> anyhow::Result<PathBuf> {
    let base = tmp
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let root = base.join(format!("githoard-downloader-{nanos}"));
    fs::create_dir_all(&root)
        .with_context(|| format!("unable to create temporary directory {}", root.display()))?;
    Ok(root)
}

fn cleanup_temp(temp_root: &Path) {
    if let Err(err) = fs::remove_dir_all(temp_root) {
        warn!(path = %temp_root.display(), error = %err, "couldn't remove temporary directory");
    }
}
