//! Git subprocess plumbing shared by the worktree coordinator and the
//! repository operations. Every invocation is timeout-bounded; mutating
//! commands are never retried.

pub mod ops;
pub mod worktree;

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn run_git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    let operation = format!("git {}", args.first().copied().unwrap_or_default());
    let result = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git").arg("-C").arg(repo).args(args).output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::DependencyMissing("git".to_string()))
        }
        Ok(Err(e)) => Err(Error::Resource(e.to_string())),
        Err(_) => Err(Error::Timeout {
            operation,
            timeout_secs: GIT_TIMEOUT.as_secs(),
        }),
    }
}

/// Run git and return trimmed stdout, failing on a non-zero exit.
pub(crate) async fn git_stdout(repo: &Path, args: &[&str]) -> Result<String> {
    let output = run_git(repo, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Resource(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn is_repo(path: &Path) -> bool {
    run_git(path, &["rev-parse", "--git-dir"])
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub(crate) async fn assert_repo(path: &Path) -> Result<()> {
    if !path.is_dir() || !is_repo(path).await {
        return Err(Error::NotAGitRepo(path.display().to_string()));
    }
    Ok(())
}

pub async fn current_branch(repo: &Path) -> Result<String> {
    git_stdout(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

pub(crate) async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = run_git(
        repo,
        &[
            "rev-parse",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ],
    )
    .await?;
    Ok(output.status.success())
}
