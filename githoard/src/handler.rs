//! The job handler wiring downloads and updates to the git plumbing.

use std::sync::Arc;

use async_trait::async_trait;
use githoard_core::{BoxError, Job, JobHandler, JobKind, JobOutcome};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::downloader;
use crate::git::GitError;
use crate::library::{Library, LibraryError};
use crate::updater;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("malformed {kind} job: {reason}")]
    MalformedJob { kind: JobKind, reason: String },

    #[error("{repo} already downloaded")]
    AlreadyDownloaded { repo: String },

    #[error("repository {repo} has no commits")]
    EmptyRepository { repo: String },

    #[error("location {id} not found")]
    LocationNotFound { id: String },

    #[error("no remote matching the given endpoints in location {location}")]
    RemoteNotFound { location: String },

    #[error("{failed} remote(s) of location {location} couldn't be updated")]
    UpdateIncomplete { location: String, failed: usize },

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Performs jobs against a [`Library`] with the `git` CLI.
pub struct GitJobHandler {
    library: Arc<Library>,
}

impl GitJobHandler {
    pub fn new(library: Arc<Library>) -> Self {
        Self { library }
    }
}

#[async_trait]
impl JobHandler for GitJobHandler {
    async fn perform(&self, token: &CancellationToken, job: &Job) -> Result<JobOutcome, BoxError> {
        let result = match job.kind {
            JobKind::Download => downloader::download(token, &self.library, job).await,
            JobKind::Update => updater::update(token, &self.library, job).await,
        };
        result.map_err(Into::into)
    }
}

/// Inject an access token into an https endpoint for a single fetch. The
/// token is never written to the location's config.
pub(crate) fn with_auth(endpoint: &str, token: Option<String>) -> String {
    match token {
        Some(token) if endpoint.starts_with("https://") => {
            endpoint.replacen("https://", &format!("https://{token}@"), 1)
        }
        _ => endpoint.to_string(),
    }
}
