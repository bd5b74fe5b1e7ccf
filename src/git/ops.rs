//! Repository status and thin, validated mutation wrappers.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

use super::{assert_repo, current_branch, git_stdout, run_git};

/// Snapshot of a single repository's change state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoStatus {
    pub branch: Option<String>,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub ahead: u32,
    pub behind: u32,
}

/// One repository's entry in an aggregate status: either a snapshot or the
/// error that prevented reading it.
#[derive(Debug, Serialize)]
pub struct RepoStatusEntry {
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RepoStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a commit, including the branch that was auto-created when the
/// repository was sitting on a protected branch.
#[derive(Debug, Serialize)]
pub struct CommitOutcome {
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_branch: Option<String>,
}

/// Parse `git status --porcelain=v2 --branch` output.
fn parse_porcelain_status(text: &str) -> RepoStatus {
    let mut status = RepoStatus::default();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            if rest != "(detached)" {
                status.branch = Some(rest.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for part in rest.split_whitespace() {
                if let Some(n) = part.strip_prefix('+') {
                    status.ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix('-') {
                    status.behind = n.parse().unwrap_or(0);
                }
            }
        } else if let Some(rest) = line.strip_prefix("? ") {
            status.untracked.push(rest.to_string());
        } else if line.starts_with("1 ") || line.starts_with("2 ") {
            // "1 XY ..." ordinary entry (8 fixed fields before the path),
            // "2 XY ..." rename (9 fixed fields, path<TAB>origPath)
            let fixed_fields = if line.starts_with("1 ") { 8 } else { 9 };
            let mut parts = line.splitn(fixed_fields + 1, ' ');
            let xy = parts.nth(1).unwrap_or("..");
            let path = parts.last().unwrap_or_default();
            let path = path.split('\t').next().unwrap_or(path).to_string();
            let mut chars = xy.chars();
            let x = chars.next().unwrap_or('.');
            let y = chars.next().unwrap_or('.');
            if x != '.' {
                status.staged.push(path.clone());
            }
            if y != '.' {
                status.unstaged.push(path);
            }
        }
        // 'u' (unmerged) and other record types are intentionally ignored
    }

    status
}

/// Single-repository status snapshot. Reading is idempotent, so a timeout
/// is retried exactly once.
pub async fn status(repo: &Path) -> Result<RepoStatus> {
    assert_repo(repo).await?;
    let args = ["status", "--porcelain=v2", "--branch"];
    let text = match git_stdout(repo, &args).await {
        Ok(t) => t,
        Err(e) if e.is_transient() => git_stdout(repo, &args).await?,
        Err(e) => return Err(e),
    };
    Ok(parse_porcelain_status(&text))
}

/// Status across many repositories. An unreadable repository becomes an
/// error entry; the aggregation itself never fails.
pub async fn aggregate_status(repos: &[String]) -> Vec<RepoStatusEntry> {
    let futures = repos.iter().map(|repo| async move {
        match status(&PathBuf::from(repo)).await {
            Ok(s) => RepoStatusEntry {
                repo: repo.clone(),
                status: Some(s),
                error: None,
            },
            Err(e) => RepoStatusEntry {
                repo: repo.clone(),
                status: None,
                error: Some(e.to_string()),
            },
        }
    });
    futures_util::future::join_all(futures).await
}

/// Unified diff for the repository, optionally narrowed to one path;
/// `staged` selects the index diff.
pub async fn diff(repo: &Path, path: Option<&str>, staged: bool) -> Result<String> {
    assert_repo(repo).await?;
    let mut args = vec!["diff"];
    if staged {
        args.push("--cached");
    }
    if let Some(p) = path {
        args.push("--");
        args.push(p);
    }
    git_stdout(repo, &args).await
}

pub async fn stage(repo: &Path, paths: &[String]) -> Result<()> {
    assert_repo(repo).await?;
    let mut args = vec!["add".to_string()];
    if paths.is_empty() {
        args.push("-A".to_string());
    } else {
        args.push("--".to_string());
        args.extend(paths.iter().cloned());
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    git_stdout(repo, &arg_refs).await?;
    Ok(())
}

pub async fn unstage(repo: &Path, paths: &[String]) -> Result<()> {
    assert_repo(repo).await?;
    if paths.is_empty() {
        git_stdout(repo, &["reset"]).await?;
    } else {
        let mut args = vec!["restore".to_string(), "--staged".to_string(), "--".to_string()];
        args.extend(paths.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        git_stdout(repo, &arg_refs).await?;
    }
    Ok(())
}

/// Throw away working-tree changes for the given paths. Tracked files are
/// restored from HEAD; untracked files are deleted.
pub async fn discard(repo: &Path, paths: &[String]) -> Result<()> {
    assert_repo(repo).await?;
    if paths.is_empty() {
        return Err(Error::Validation(
            "discard requires at least one path".to_string(),
        ));
    }

    let snapshot = status(repo).await?;
    let mut tracked = Vec::new();
    for path in paths {
        if snapshot.untracked.contains(path) {
            let full = repo.join(path);
            if full.is_dir() {
                std::fs::remove_dir_all(&full)?;
            } else if full.exists() {
                std::fs::remove_file(&full)?;
            }
        } else {
            tracked.push(path.clone());
        }
    }

    if !tracked.is_empty() {
        let mut args = vec!["restore".to_string(), "--".to_string()];
        args.extend(tracked);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        git_stdout(repo, &arg_refs).await?;
    }
    Ok(())
}

/// Commit staged changes. Refuses an empty index; when HEAD sits on a
/// protected branch, a new branch is created and switched to first, and the
/// outcome reports it instead of doing so silently.
pub async fn commit(repo: &Path, message: &str, protected: &[String]) -> Result<CommitOutcome> {
    assert_repo(repo).await?;
    if message.trim().is_empty() {
        return Err(Error::Validation("commit message is required".to_string()));
    }

    let snapshot = status(repo).await?;
    if snapshot.staged.is_empty() {
        return Err(Error::Validation("no staged changes to commit".to_string()));
    }

    let branch = current_branch(repo).await?;
    let mut new_branch = None;
    if protected.iter().any(|p| p == &branch) {
        let name = format!("berth/{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        git_stdout(repo, &["checkout", "-b", &name]).await?;
        new_branch = Some(name);
    }

    // Mutation: no retry. The caller must explicitly re-request
    let output = run_git(repo, &["commit", "-m", message]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Resource(format!(
            "git commit failed: {}",
            stderr.trim()
        )));
    }

    let commit = git_stdout(repo, &["rev-parse", "--short", "HEAD"]).await?;
    Ok(CommitOutcome { commit, new_branch })
}

/// Push the current branch, setting the upstream on first push.
pub async fn push(repo: &Path) -> Result<()> {
    assert_repo(repo).await?;
    let branch = current_branch(repo).await?;
    let output = run_git(repo, &["push", "-u", "origin", &branch]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Resource(format!(
            "git push failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}
