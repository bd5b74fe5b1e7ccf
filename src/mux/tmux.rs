use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::MuxAdapter;

/// Default timeout for tmux subprocess calls.
const CMD_TIMEOUT: Duration = Duration::from_secs(2);

/// Longer timeout for scrollback capture, which can be large.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// tmux-backed implementation of [`MuxAdapter`].
pub struct TmuxAdapter;

impl TmuxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TmuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Exact-match target for a session name (tmux prefix-matches without `=`).
fn target(name: &str) -> String {
    format!("={name}")
}

/// tmux prints these when the target session (or the whole server) is gone.
fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("session not found")
        || stderr.contains("no server running")
        || stderr.contains("no current session")
}

/// Run tmux with a bounded timeout. Distinguishes the three failure shapes:
/// binary absent, command timed out, host refused.
async fn run_tmux(args: &[&str], timeout: Duration) -> Result<std::process::Output> {
    let operation = format!("tmux {}", args.first().copied().unwrap_or_default());
    let result = tokio::time::timeout(timeout, Command::new("tmux").args(args).output()).await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::DependencyMissing("tmux".to_string()))
        }
        Ok(Err(e)) => Err(Error::AdapterUnavailable(e.to_string())),
        Err(_) => Err(Error::Timeout {
            operation,
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Interpret a tmux result for an operation targeting one session.
fn check_session_output(name: &str, output: std::process::Output) -> Result<std::process::Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_session(&stderr) {
        Err(Error::SessionNotRunning(name.to_string()))
    } else {
        Err(Error::AdapterUnavailable(stderr.trim().to_string()))
    }
}

#[async_trait]
impl MuxAdapter for TmuxAdapter {
    async fn create(&self, name: &str, command: &str, cwd: &str) -> Result<()> {
        let output = run_tmux(
            &["new-session", "-d", "-s", name, "-c", cwd, command],
            CMD_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("duplicate session") {
                return Err(Error::Conflict(format!("session '{name}' already exists")));
            }
            return Err(Error::Resource(format!(
                "tmux new-session failed for '{name}': {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let output = run_tmux(&["has-session", "-t", &target(name)], CMD_TIMEOUT).await?;
        Ok(output.status.success())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let output = run_tmux(&["kill-session", "-t", &target(name)], CMD_TIMEOUT).await?;
        check_session_output(name, output)?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let output = run_tmux(&["rename-session", "-t", &target(old), new], CMD_TIMEOUT).await?;
        check_session_output(old, output)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = run_tmux(&["list-sessions", "-F", "#{session_name}"], CMD_TIMEOUT).await?;
        // tmux errors out when no server is running; that just means no sessions
        if !output.status.success() {
            return Ok(vec![]);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn capture(&self, name: &str, lines: u32) -> Result<String> {
        let start = format!("-{lines}");
        let args = [
            "capture-pane",
            "-p",
            "-e",
            "-t",
            &target(name),
            "-S",
            &start,
        ];
        // Capture is an idempotent read; retry a timeout exactly once.
        let output = match run_tmux(&args, CAPTURE_TIMEOUT).await {
            Ok(o) => o,
            Err(e) if e.is_transient() => run_tmux(&args, CAPTURE_TIMEOUT).await?,
            Err(e) => return Err(e),
        };
        let output = check_session_output(name, output)?;
        let raw = String::from_utf8_lossy(&output.stdout);
        // tmux pads the capture to the pane height; drop the trailing blanks
        Ok(raw.trim_end_matches('\n').to_string())
    }

    async fn send_text(&self, name: &str, text: &str) -> Result<()> {
        // Stage the payload in a host-side buffer via stdin: no argv
        // interpolation, no argument-length limit, control bytes intact.
        let buffer = format!("berth-{}", uuid::Uuid::new_v4().simple());
        load_buffer(&buffer, text).await?;

        // Inject atomically; -d drops the buffer after a successful paste.
        let paste = run_tmux(
            &[
                "paste-buffer",
                "-p",
                "-t",
                &target(name),
                "-b",
                &buffer,
                "-d",
            ],
            CMD_TIMEOUT,
        )
        .await;

        match paste {
            Ok(output) if output.status.success() => Ok(()),
            failed => {
                // The staged buffer must not leak when injection fails.
                let _ = run_tmux(&["delete-buffer", "-b", &buffer], CMD_TIMEOUT).await;
                match failed {
                    Ok(output) => {
                        check_session_output(name, output)?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn send_key(&self, name: &str, key: &str) -> Result<()> {
        let output = run_tmux(&["send-keys", "-t", &target(name), key], CMD_TIMEOUT).await?;
        check_session_output(name, output)?;
        Ok(())
    }

    async fn working_directory(&self, name: &str) -> Result<String> {
        let output = run_tmux(
            &[
                "display-message",
                "-p",
                "-t",
                &target(name),
                "#{pane_current_path}",
            ],
            CMD_TIMEOUT,
        )
        .await?;
        let output = check_session_output(name, output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn get_env(&self, name: &str, key: &str) -> Result<Option<String>> {
        let output = run_tmux(
            &["show-environment", "-t", &target(name), key],
            CMD_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_session(&stderr) {
                return Err(Error::SessionNotRunning(name.to_string()));
            }
            // Unknown variable exits non-zero; that's simply "unset"
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        // A leading '-' marks a variable removed from the environment
        if line.starts_with('-') {
            return Ok(None);
        }
        Ok(line
            .strip_prefix(&format!("{key}="))
            .map(|v| v.to_string()))
    }
}

/// `tmux load-buffer -b <name> -` with the payload on stdin.
async fn load_buffer(buffer: &str, text: &str) -> Result<()> {
    let mut child = Command::new("tmux")
        .args(["load-buffer", "-b", buffer, "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DependencyMissing("tmux".to_string())
            } else {
                Error::AdapterUnavailable(e.to_string())
            }
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes()).await?;
        // Close stdin so tmux sees EOF
        drop(stdin);
    }

    let output = match tokio::time::timeout(CMD_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| Error::AdapterUnavailable(e.to_string()))?,
        Err(_) => {
            return Err(Error::Timeout {
                operation: "tmux load-buffer".to_string(),
                timeout_secs: CMD_TIMEOUT.as_secs(),
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::AdapterUnavailable(format!(
            "tmux load-buffer failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_exact_match() {
        assert_eq!(target("berth-shell-a1"), "=berth-shell-a1");
    }

    #[test]
    fn missing_session_stderr_variants() {
        assert!(is_missing_session("can't find session: berth-shell-a1"));
        assert!(is_missing_session(
            "no server running on /tmp/tmux-1000/default"
        ));
        assert!(!is_missing_session("duplicate session: x"));
        assert!(!is_missing_session(""));
    }
}
