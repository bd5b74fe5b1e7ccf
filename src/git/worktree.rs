//! Isolated working copies bound to a session's lifetime.
//!
//! Worktrees created here always live under `~/.berth/worktrees/<session-id>/`.
//! That path containment is the management tag: removal refuses anything
//! outside the managed root, so a user's own worktrees are never touched.

use std::path::{Path, PathBuf};

use crate::config;
use crate::error::{Error, Result};

use super::{assert_repo, branch_exists, current_branch, git_stdout, run_git};

#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

/// Create a linked working copy of `base_repo` on a new branch.
pub async fn create(
    base_repo: &Path,
    session_id: &str,
    branch: &str,
    base_branch: Option<&str>,
) -> Result<Worktree> {
    assert_repo(base_repo).await?;

    if branch_exists(base_repo, branch).await? {
        return Err(Error::BranchExists(branch.to_string()));
    }

    let base = match base_branch {
        Some(b) => b.to_string(),
        None => current_branch(base_repo).await?,
    };

    let repo_name = base_repo
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let dir = config::session_worktree_dir(session_id)
        .map_err(|e| Error::Resource(e.to_string()))?
        .join(repo_name);
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let dir_str = dir.to_string_lossy().to_string();
    let output = run_git(
        base_repo,
        &["worktree", "add", &dir_str, "-b", branch, &base],
    )
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Err(Error::BranchExists(branch.to_string()));
        }
        return Err(Error::Resource(format!(
            "git worktree add failed: {}",
            stderr.trim()
        )));
    }

    tracing::info!(
        repo = %base_repo.display(),
        worktree = %dir.display(),
        branch = %branch,
        "Created worktree"
    );

    Ok(Worktree {
        path: dir,
        branch: branch.to_string(),
        base_branch: base,
    })
}

/// True when the path lies under the managed-worktree root.
pub fn is_managed(path: &Path) -> bool {
    let Ok(root) = config::worktrees_dir() else {
        return false;
    };
    let root = root.canonicalize().unwrap_or(root);
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    path.starts_with(&root)
}

/// Resolve the repository that owns a worktree from the worktree's own git
/// metadata. Never assumes a fixed directory relationship.
pub async fn owning_repo(worktree_path: &Path) -> Result<PathBuf> {
    let common_dir = git_stdout(worktree_path, &["rev-parse", "--git-common-dir"]).await?;
    let common = PathBuf::from(&common_dir);
    let common = if common.is_absolute() {
        common
    } else {
        worktree_path.join(common)
    };
    // The common dir is <repo>/.git
    common
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| Error::Resource(format!("cannot resolve repo owning '{common_dir}'")))
}

/// Remove a managed worktree. Refuses paths outside the managed root.
pub async fn remove(worktree_path: &Path) -> Result<()> {
    if !is_managed(worktree_path) {
        return Err(Error::Validation(format!(
            "refusing to remove unmanaged worktree '{}'",
            worktree_path.display()
        )));
    }
    if !worktree_path.exists() {
        // Already gone; nothing to release
        return Ok(());
    }

    let repo = owning_repo(worktree_path).await?;
    let path_str = worktree_path.to_string_lossy().to_string();
    let output = run_git(&repo, &["worktree", "remove", "--force", &path_str]).await?;

    if !output.status.success() {
        // Fall back to deleting the directory and pruning the registration
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::warn!(
            worktree = %worktree_path.display(),
            stderr = %stderr,
            "git worktree remove failed, falling back to prune"
        );
        std::fs::remove_dir_all(worktree_path)?;
        let _ = run_git(&repo, &["worktree", "prune"]).await;
    }

    tracing::info!(worktree = %worktree_path.display(), "Removed worktree");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmanaged_paths_are_rejected() {
        assert!(!is_managed(Path::new("/tmp/somewhere/else")));
        assert!(!is_managed(Path::new("/")));
    }

    #[tokio::test]
    async fn remove_refuses_unmanaged_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let err = remove(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn create_requires_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = create(dir.path(), "s1", "berth/test", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_A_GIT_REPO");
    }
}
