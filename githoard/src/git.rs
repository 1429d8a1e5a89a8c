//! Thin asynchronous wrapper around the `git` command line tool.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("git {operation} failed ({status}): {stderr}")]
    Command {
        operation: String,
        status: String,
        stderr: String,
    },

    #[error("git operation cancelled")]
    Cancelled,
}

/// Run a git command and capture its stdout.
///
/// Cancellation kills the child process: the token branch drops the child
/// with `kill_on_drop` set, so a hung clone never outlives its job.
pub async fn run_git(
    token: &CancellationToken,
    cwd: Option<&Path>,
    args: &[&str],
) -> Result<String, GitError> {
    trace!(?cwd, ?args, "running git");

    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|source| GitError::Spawn { source })?;

    let output = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(GitError::Cancelled),
        output = child.wait_with_output() => {
            output.map_err(|source| GitError::Spawn { source })?
        }
    };

    if !output.status.success() {
        return Err(GitError::Command {
            operation: args.first().copied().unwrap_or("git").to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn captures_stdout() {
        if !git_available() {
            return;
        }

        let out = run_git(&CancellationToken::new(), None, &["--version"])
            .await
            .unwrap();
        assert!(out.starts_with("git version"));
    }

    #[tokio::test]
    async fn failed_commands_surface_stderr() {
        if !git_available() {
            return;
        }

        let err = run_git(
            &CancellationToken::new(),
            None,
            &["rev-parse", "--definitely-not-a-flag"],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GitError::Command { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_aborts() {
        if !git_available() {
            return;
        }

        let token = CancellationToken::new();
        token.cancel();
        let err = run_git(&token, None, &["--version"]).await.unwrap_err();
        assert!(matches!(err, GitError::Cancelled));
    }
}
