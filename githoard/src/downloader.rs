//! Download jobs: mirror-clone a repository and install it into the
//! location grouping everything that shares its root commit.

use std::fs;
use std::path::Path;
use std::time::Instant;

use githoard_core::{Job, JobKind, JobOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::git::run_git;
use crate::handler::{FetchError, with_auth};
use crate::library::{Library, flatten_repo_id, repo_id_from_endpoint};
use crate::updater;

/// Perform a download job.
///
/// When the repository is already present and the job allows it, the work is
/// carried out as an update of the owning location instead; with updates
/// disallowed the job fails as already downloaded.
pub async fn download(
    token: &CancellationToken,
    library: &Library,
    job: &Job,
) -> Result<JobOutcome, FetchError> {
    let [endpoint] = job.endpoints.as_slice() else {
        return Err(FetchError::MalformedJob {
            kind: JobKind::Download,
            reason: format!("expected exactly one endpoint, got {}", job.endpoints.len()),
        });
    };

    let repo_id = repo_id_from_endpoint(endpoint)?;
    let remote = flatten_repo_id(&repo_id);

    if let Some(location) = library.find_repo_location(&remote)? {
        if !job.allow_update {
            return Err(FetchError::AlreadyDownloaded { repo: repo_id });
        }

        debug!(
            job = %job.id,
            location = %location,
            "repository already present, updating its location instead"
        );
        let rewritten = Job {
            kind: JobKind::Update,
            location_id: Some(location),
            ..job.clone()
        };
        return updater::update(token, library, &rewritten).await;
    }

    info!(job = %job.id, url = %endpoint, "download started");
    let started = Instant::now();

    let workspace = library.temp_workspace(&repo_id)?;
    let result = install(token, library, job, endpoint, &repo_id, &remote, &workspace).await;

    if let Err(err) = fs::remove_dir_all(&workspace) {
        warn!(path = %workspace.display(), error = %err, "couldn't remove temp workspace");
    }

    match &result {
        Ok(_) => info!(
            job = %job.id,
            url = %endpoint,
            elapsed = ?started.elapsed(),
            "download finished"
        ),
        Err(err) => error!(job = %job.id, url = %endpoint, error = %err, "download failed"),
    }

    result
}

/// Clone the repository into the workspace, resolve its root commit and
/// fetch it into the matching location under its own remote namespace.
async fn install(
    token: &CancellationToken,
    library: &Library,
    job: &Job,
    endpoint: &str,
    repo_id: &str,
    remote: &str,
    workspace: &Path,
) -> Result<JobOutcome, FetchError> {
    let workspace_str = workspace.to_string_lossy().into_owned();
    let clone_url = with_auth(endpoint, job.auth_token(endpoint));

    run_git(
        token,
        None,
        &[
            "clone",
            "--mirror",
            "--quiet",
            clone_url.as_str(),
            workspace_str.as_str(),
        ],
    )
    .await?;

    let roots = run_git(token, Some(workspace), &["rev-list", "--max-parents=0", "HEAD"]).await?;
    let Some(root_commit) = roots.lines().next().map(str::trim).filter(|l| !l.is_empty()) else {
        return Err(FetchError::EmptyRepository {
            repo: repo_id.to_string(),
        });
    };

    debug!(job = %job.id, root = %root_commit, "repository cloned");

    let created = !library.has_location(root_commit);
    let location_path = if created {
        let path = library.add_location(root_commit)?;
        let path_str = path.to_string_lossy().into_owned();
        if let Err(err) =
            run_git(token, None, &["init", "--bare", "--quiet", path_str.as_str()]).await
        {
            let _ = library.remove_location(root_commit);
            return Err(err.into());
        }
        path
    } else {
        library.location_path(root_commit)
    };

    let result = register_and_fetch(
        token,
        &location_path,
        remote,
        endpoint,
        workspace_str.as_str(),
    )
    .await;

    // A location created by this job is removed again when installing into
    // it fails; a pre-existing location keeps its other repositories.
    if result.is_err() && created {
        let _ = library.remove_location(root_commit);
    }

    result
}

async fn register_and_fetch(
    token: &CancellationToken,
    location: &Path,
    remote: &str,
    endpoint: &str,
    workspace: &str,
) -> Result<JobOutcome, FetchError> {
    let refspec = format!("+refs/heads/*:refs/remotes/{remote}/*");

    // The mirror already sits on local disk; fetch from it rather than
    // hitting the network a second time.
    run_git(
        token,
        Some(location),
        &["fetch", "--quiet", "--no-tags", workspace, refspec.as_str()],
    )
    .await?;

    // Register the public endpoint for future updates; an injected token
    // never lands in the location's config.
    run_git(token, Some(location), &["remote", "add", remote, endpoint]).await?;
    let fetch_key = format!("remote.{remote}.fetch");
    run_git(
        token,
        Some(location),
        &["config", fetch_key.as_str(), refspec.as_str()],
    )
    .await?;

    Ok(JobOutcome::Downloaded)
}

#[cfg(test)]
mod tests {
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
    async fn rejects_jobs_without_a_single_endpoint() {
        let (_guard, lib) = library();
        let token = CancellationToken::new();

        let mut job = Job::download("https://github.com/org/repo");
        job.endpoints.clear();
        let err = download(&token, &lib, &job).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedJob { kind: JobKind::Download, .. }));

        let mut job = Job::download("https://github.com/org/repo");
        job.endpoints.push("https://github.com/org/other".into());
        let err = download(&token, &lib, &job).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedJob { .. }));
    }

    #[tokio::test]
    async fn present_repository_without_allow_update_is_already_downloaded() {
        let (_guard, lib) = library();
        let path = lib.add_location("abc4f2").unwrap();
        fs::write(
            path.join("config"),
            "[remote \"github.com_org_repo\"]\n\turl = https://github.com/org/repo\n",
        )
        .unwrap();

        let mut job = Job::download("https://github.com/org/repo");
        job.id = "job-1".into();
        job.allow_update = false;

        let err = download(&CancellationToken::new(), &lib, &job)
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::AlreadyDownloaded { repo } if repo == "github.com/org/repo")
        );
    }
}
