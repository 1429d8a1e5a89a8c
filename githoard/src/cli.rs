//! Command line interface.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "githoard",
    version,
    about = "Collect git repositories from GitHub organizations into a local library"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download the repositories of one or more GitHub organizations.
    Download(DownloadArgs),
    /// Update the repositories already present in the library.
    Update(UpdateArgs),
}

#[derive(Debug, ClapArgs)]
pub struct DownloadArgs {
    /// Path of the library where repositories are stored.
    #[arg(long, env = "GITHOARD_LIBRARY")]
    pub library: PathBuf,

    /// Library bucketization level.
    #[arg(long, env = "GITHOARD_LIBRARY_BUCKET", default_value_t = 2)]
    pub bucket: usize,

    /// Directory where temporary working copies are placed.
    #[arg(long, env = "GITHOARD_TMP")]
    pub tmp: Option<PathBuf>,

    /// Number of workers; defaults to the number of CPUs.
    #[arg(long, env = "GITHOARD_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Halve the worker count.
    #[arg(long, env = "GITHOARD_HALF_CPU")]
    pub half_cpu: bool,

    /// Don't update repositories that are already downloaded.
    #[arg(long = "no-updates", env = "GITHOARD_NO_UPDATES")]
    pub no_updates: bool,

    /// Skip forked repositories.
    #[arg(long = "no-forks", env = "GITHOARD_NO_FORKS")]
    pub no_forks: bool,

    /// GitHub organization names, comma separated.
    #[arg(long, env = "GITHUB_ORGANIZATIONS", value_delimiter = ',', required = true)]
    pub orgs: Vec<String>,

    /// Repository names to skip, comma separated.
    #[arg(long = "excluded-repos", env = "GITHOARD_EXCLUDED_REPOS", value_delimiter = ',')]
    pub excluded_repos: Vec<String>,

    /// GitHub token for the API and clone operations.
    #[arg(long, env = "GITHUB_TOKEN")]
    pub token: Option<String>,

    /// URI of the database where metrics are sent.
    #[arg(long = "metrics-db", env = "GITHOARD_METRICS_DB_URI")]
    pub metrics_db: Option<String>,

    /// Table the metrics are written to.
    #[arg(
        long = "metrics-db-table",
        env = "GITHOARD_METRICS_DB_TABLE",
        default_value = "githoard_metrics"
    )]
    pub metrics_db_table: String,

    /// Seconds between metric syncs.
    #[arg(
        long = "metrics-sync-timeout",
        env = "GITHOARD_METRICS_SYNC",
        default_value_t = 30
    )]
    pub metrics_sync: u64,
}

#[derive(Debug, ClapArgs)]
pub struct UpdateArgs {
    /// Path of the library where repositories are stored.
    #[arg(long, env = "GITHOARD_LIBRARY")]
    pub library: PathBuf,

    /// Library bucketization level.
    #[arg(long, env = "GITHOARD_LIBRARY_BUCKET", default_value_t = 2)]
    pub bucket: usize,

    /// Directory where temporary working copies are placed.
    #[arg(long, env = "GITHOARD_TMP")]
    pub tmp: Option<PathBuf>,

    /// Number of workers; defaults to the number of CPUs.
    #[arg(long, env = "GITHOARD_WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Halve the worker count.
    #[arg(long, env = "GITHOARD_HALF_CPU")]
    pub half_cpu: bool,

    /// Run a single sweep and exit instead of updating periodically.
    #[arg(long)]
    pub once: bool,

    /// Seconds between periodic update sweeps.
    #[arg(long = "trigger-interval", default_value_t = 7 * 24 * 60 * 60)]
    pub trigger_interval: u64,

    /// Token used when fetching private remotes.
    #[arg(long, env = "GITHUB_TOKEN")]
    pub token: Option<String>,
}

/// Resolve the effective worker count: 0 means every CPU; `half_cpu` halves
/// whatever was resolved, keeping at least one worker.
pub fn resolve_workers(requested: usize, half_cpu: bool) -> usize {
    let mut workers = if requested == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    };

    if half_cpu && workers > 1 {
        workers /= 2;
    }

    workers.max(1)
}
