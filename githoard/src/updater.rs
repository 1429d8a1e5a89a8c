//! Update jobs: fetch the remotes of a location already in the library.

use std::time::Instant;

use githoard_core::{Job, JobKind, JobOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::git::{GitError, run_git};
use crate::handler::{FetchError, with_auth};
use crate::library::Library;
use crate::library::remotes::Remote;

/// Perform an update job.
///
/// With no endpoints, every remote of the location is fetched; with
/// endpoints, only the remotes whose url matches one of them. Remotes that
/// are already up to date are a success, not an error. Per-remote failures
/// are collected and fail the job after the loop.
pub async fn update(
    token: &CancellationToken,
    library: &Library,
    job: &Job,
) -> Result<JobOutcome, FetchError> {
    let Some(location) = job.location_id.as_deref() else {
        return Err(FetchError::MalformedJob {
            kind: JobKind::Update,
            reason: "location id required".to_string(),
        });
    };

    if !library.has_location(location) {
        return Err(FetchError::LocationNotFound {
            id: location.to_string(),
        });
    }

    let all = library.location_remotes(location)?;
    let targets: Vec<&Remote> = if job.endpoints.is_empty() {
        all.iter().collect()
    } else {
        all.iter()
            .filter(|remote| job.endpoints.iter().any(|e| e == &remote.url))
            .collect()
    };

    if targets.is_empty() {
        if !job.endpoints.is_empty() {
            return Err(FetchError::RemoteNotFound {
                location: location.to_string(),
            });
        }
        // A location with nothing registered has nothing to refresh.
        debug!(job = %job.id, location = %location, "no remotes to update");
        return Ok(JobOutcome::Updated);
    }

    info!(job = %job.id, location = %location, remotes = targets.len(), "update started");
    let started = Instant::now();
    let path = library.location_path(location);

    let mut failed = 0usize;
    for remote in targets {
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", remote.name);
        let result = match job.auth_token(&remote.url) {
            Some(auth) if remote.url.starts_with("https://") => {
                let url = with_auth(&remote.url, Some(auth));
                run_git(
                    token,
                    Some(&path),
                    &["fetch", "--quiet", "--no-tags", url.as_str(), refspec.as_str()],
                )
                .await
            }
            _ => {
                run_git(
                    token,
                    Some(&path),
                    &["fetch", "--quiet", "--no-tags", remote.name.as_str()],
                )
                .await
            }
        };

        match result {
            Ok(_) => debug!(job = %job.id, remote = %remote.name, "remote updated"),
            Err(GitError::Cancelled) => return Err(GitError::Cancelled.into()),
            Err(err) => {
                warn!(job = %job.id, remote = %remote.name, error = %err, "couldn't update remote");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(FetchError::UpdateIncomplete {
            location: location.to_string(),
            failed,
        });
    }

    info!(
        job = %job.id,
        location = %location,
        elapsed = ?started.elapsed(),
        "update finished"
    );
    Ok(JobOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use tempfile::TempDir;

    fn library() -> (TempDir, Arc<Library>) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("library");
        fs::create_dir_all(&root).unwrap();
        let lib = Library::open(&root, 2, dir.path().join("tmp")).unwrap();
        (dir, Arc::new(lib))
    }

    #[tokio::test]
    async fn rejects_jobs_without_a_location() {
        let (_guard, lib) = library();
        let mut job = Job::update("x", vec![]);
        job.location_id = None;

        let err = update(&CancellationToken::new(), &lib, &job)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedJob { kind: JobKind::Update, .. }));
    }

    #[tokio::test]
    async fn unknown_locations_fail() {
        let (_guard, lib) = library();
        let job = Job::update("abc4f2", vec![]);

        let err = update(&CancellationToken::new(), &lib, &job)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::LocationNotFound { id } if id == "abc4f2"));
    }

    #[tokio::test]
    async fn location_without_remotes_is_a_noop_success() {
        let (_guard, lib) = library();
        lib.add_location("abc4f2").unwrap();
        let job = Job::update("abc4f2", vec![]);

        let outcome = update(&CancellationToken::new(), &lib, &job).await.unwrap();
        assert_eq!(outcome, JobOutcome::Updated);
    }

    #[tokio::test]
    async fn endpoints_matching_no_remote_fail() {
        let (_guard, lib) = library();
        let path = lib.add_location("abc4f2").unwrap();
        fs::write(
            path.join("config"),
            "[remote \"github.com_org_repo\"]\n\turl = https://github.com/org/repo\n",
        )
        .unwrap();

        let job = Job::update("abc4f2", vec!["https://github.com/org/other".into()]);
        let err = update(&CancellationToken::new(), &lib, &job)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RemoteNotFound { .. }));
    }
}
