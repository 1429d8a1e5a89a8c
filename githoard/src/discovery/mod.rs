//! Repository discovery against the GitHub API.
//!
//! [`GhOrgRepoIter`] lazily pages through an organization's repositories,
//! surfacing rate-limit and end-of-listing conditions with retry hints.
//! [`OrgDiscovery`] drives an iterator, batches the records and hands them
//! to an advertise sink under a deadline.

pub mod github;
pub mod provider;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use github::{GhOrgRepoIter, GhRepoIterConfig};
pub use provider::{AdvertiseError, DiscoveryConfig, DiscoveryStopper, OrgDiscovery, RepoSink};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The upstream has no records beyond what was already yielded. The
    /// caller may wait `retry_after` and ask again.
    #[error("couldn't find new repositories")]
    NoNewRepos { retry_after: Duration },

    /// The API rate limit window is exhausted.
    #[error("rate limit requests exceeded")]
    RateLimited { retry_after: Duration },

    /// The discovery was stopped, either on request or because a terminal
    /// condition arrived while the matching wait flag was off.
    #[error("discovery stopped")]
    Stopped {
        #[source]
        source: Option<Box<DiscoveryError>>,
    },

    #[error("discovery failed on stop")]
    StopTimeout,

    #[error("endpoints not found for {repo}")]
    EndpointsNotFound { repo: String },

    #[error("github api request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("github api returned HTTP {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("job queue closed")]
    QueueClosed,
}

impl DiscoveryError {
    pub(crate) fn stopped(source: Option<DiscoveryError>) -> Self {
        Self::Stopped {
            source: source.map(Box::new),
        }
    }
}

/// A repository as listed by the upstream API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoRecord {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub ssh_url: Option<String>,
}

impl RepoRecord {
    /// The endpoint used to clone this repository: the first non-empty of
    /// the html, git and ssh urls.
    pub fn endpoint(&self) -> Result<&str, DiscoveryError> {
        [&self.html_url, &self.git_url, &self.ssh_url]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|url| !url.is_empty())
            .ok_or_else(|| DiscoveryError::EndpointsNotFound {
                repo: self.full_name.clone(),
            })
    }
}

/// A lazy, restartable source of candidate repositories.
#[async_trait]
pub trait RepoIterator: Send + Sync {
    async fn next(&mut self) -> Result<RepoRecord, DiscoveryError>;
}
