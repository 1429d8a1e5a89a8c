//! The unit of work flowing through the pipeline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Opaque identifier of a storage location grouping repositories that share
/// an initial-commit ancestor.
pub type LocationId = String;

/// Shared lookup from an endpoint URL to an authentication token.
pub type AuthLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Opaque error returned by the external job handler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Fetch a repository that is not in the library yet.
    Download,
    /// Refresh remotes of a location already in the library.
    Update,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Download => f.write_str("download"),
            JobKind::Update => f.write_str("update"),
        }
    }
}

/// What the handler did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// A new repository was added to the library.
    Downloaded,
    /// One or more remotes of a location were fetched. Also returned when a
    /// download found the repository already present and was carried out as
    /// an update of its location instead.
    Updated,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("process function not found for job {id}")]
    HandlerMissing { id: String },

    #[error("job {id} failed: {source}")]
    Handler { id: String, source: BoxError },
}

/// The external collaborator performing the actual repository work.
///
/// Implementations must honor the cancellation token; a handler that ignores
/// it cannot be preempted and will delay graceful shutdown.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(
        &self,
        token: &CancellationToken,
        job: &Job,
    ) -> Result<JobOutcome, BoxError>;
}

/// A task carrying the data required to download or update a repository.
///
/// The kind of a job never changes once built. A download that discovers its
/// repository already present is carried out as an update by the handler,
/// which reports that operation's outcome instead of mutating the job.
#[derive(Clone)]
pub struct Job {
    /// Unique identifier, assigned exactly once by the scheduler before the
    /// job enters the outbound channel. Empty until then.
    pub id: String,
    pub kind: JobKind,
    /// Downloads carry exactly one endpoint. Updates carry none (refresh
    /// every remote of the location) or several (refresh those remotes).
    pub endpoints: Vec<String>,
    /// Required for updates; derived from the root commit for downloads.
    pub location_id: Option<LocationId>,
    /// Whether a download may be carried out as an update when the
    /// repository is already present.
    pub allow_update: bool,
    pub auth: Option<AuthLookup>,
    pub handler: Option<Arc<dyn JobHandler>>,
}

impl Job {
    /// Build a download job for a single endpoint.
    pub fn download(endpoint: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: JobKind::Download,
            endpoints: vec![endpoint.into()],
            location_id: None,
            allow_update: false,
            auth: None,
            handler: None,
        }
    }

    /// Build an update job for a location.
    pub fn update(location_id: impl Into<LocationId>, endpoints: Vec<String>) -> Self {
        Self {
            id: String::new(),
            kind: JobKind::Update,
            endpoints,
            location_id: Some(location_id.into()),
            allow_update: false,
            auth: None,
            handler: None,
        }
    }

    /// Token for the given endpoint, if an auth lookup is attached and it
    /// knows one.
    pub fn auth_token(&self, endpoint: &str) -> Option<String> {
        self.auth.as_ref().and_then(|lookup| lookup(endpoint))
    }

    /// Run the job through its handler.
    pub async fn process(&self, token: &CancellationToken) -> Result<JobOutcome, JobError> {
        let handler = self.handler.as_ref().ok_or_else(|| JobError::HandlerMissing {
            id: self.id.clone(),
        })?;

        handler
            .perform(token, self)
            .await
            .map_err(|source| JobError::Handler {
                id: self.id.clone(),
                source,
            })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("endpoints", &self.endpoints)
            .field("location_id", &self.location_id)
            .field("allow_update", &self.allow_update)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_without_handler_fails() {
        let mut job = Job::download("https://github.com/org/repo");
        job.id = "job-1".to_string();

        let err = job.process(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::HandlerMissing { id } if id == "job-1"));
    }

    #[tokio::test]
    async fn process_dispatches_to_handler() {
        struct Done;

        #[async_trait]
        impl JobHandler for Done {
            async fn perform(
                &self,
                _token: &CancellationToken,
                job: &Job,
            ) -> Result<JobOutcome, BoxError> {
                assert_eq!(job.kind, JobKind::Download);
                Ok(JobOutcome::Downloaded)
            }
        }

        let mut job = Job::download("https://github.com/org/repo");
        job.handler = Some(Arc::new(Done));

        let outcome = job.process(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Downloaded);
    }

    #[test]
    fn auth_token_goes_through_lookup() {
        let mut job = Job::download("https://github.com/org/repo");
        assert_eq!(job.auth_token("https://github.com/org/repo"), None);

        job.auth = Some(Arc::new(|endpoint: &str| {
            endpoint.contains("github.com").then(|| "secret".to_string())
        }));
        assert_eq!(
            job.auth_token("https://github.com/org/repo").as_deref(),
            Some("secret")
        );
        assert_eq!(job.auth_token("https://example.com/org/repo"), None);
    }

    #[test]
    fn update_jobs_carry_their_location() {
        let job = Job::update("0f5a1b", vec!["https://github.com/org/repo".into()]);
        assert_eq!(job.kind, JobKind::Update);
        assert_eq!(job.location_id.as_deref(), Some("0f5a1b"));
    }
}
