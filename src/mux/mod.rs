//! Adapter over the external terminal-multiplexing host.
//!
//! Everything the rest of the system knows about the host goes through the
//! [`MuxAdapter`] trait; the production implementation shells out to tmux.
//! Host output is parsed defensively, since several commands legitimately return
//! nothing (for instance listing sessions when no server is running).

mod tmux;

pub use tmux::TmuxAdapter;

use async_trait::async_trait;

use crate::error::Result;

/// Imperative commands against the multiplexing host. All operations carry
/// bounded timeouts; operations against a session that does not exist on
/// the host return `Error::SessionNotRunning`, an unreachable host returns
/// `Error::AdapterUnavailable`.
#[async_trait]
pub trait MuxAdapter: Send + Sync {
    /// Create a detached named session running `command` in `cwd`.
    async fn create(&self, name: &str, command: &str, cwd: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    async fn kill(&self, name: &str) -> Result<()>;

    async fn rename(&self, old: &str, new: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Capture the last `lines` lines of the session's scrollback.
    async fn capture(&self, name: &str, lines: u32) -> Result<String>;

    /// Deliver literal text into the session's terminal input. The payload
    /// is staged out-of-band on the host and injected atomically, so
    /// control characters and megabyte pastes arrive verbatim rather than
    /// being re-interpreted as individual keystrokes.
    async fn send_text(&self, name: &str, text: &str) -> Result<()>;

    /// Send a single named key (e.g. "Enter", "Escape", "C-c").
    async fn send_key(&self, name: &str, key: &str) -> Result<()>;

    async fn working_directory(&self, name: &str) -> Result<String>;

    /// Read one variable from the session's environment, None when unset.
    async fn get_env(&self, name: &str, key: &str) -> Result<Option<String>>;
}

#[cfg(test)]
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{Error, Result};

    use super::MuxAdapter;

    #[derive(Debug, Default)]
    pub struct MockSession {
        pub command: String,
        pub cwd: String,
        /// Scripted capture outputs, consumed front-first; the last entry
        /// repeats once the queue runs dry.
        pub captures: VecDeque<String>,
        pub env: HashMap<String, String>,
        pub sent_text: Vec<String>,
        pub sent_keys: Vec<String>,
    }

    /// In-memory host standing in for tmux in unit tests.
    #[derive(Default)]
    pub struct MockMux {
        pub sessions: Mutex<HashMap<String, MockSession>>,
    }

    impl MockMux {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_session(&self, name: &str, captures: Vec<&str>) {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                name.to_string(),
                MockSession {
                    captures: captures.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            );
        }

        pub fn set_env(&self, name: &str, key: &str, value: &str) {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(s) = sessions.get_mut(name) {
                s.env.insert(key.to_string(), value.to_string());
            }
        }

        pub fn sent_text(&self, name: &str) -> Vec<String> {
            self.sessions
                .lock()
                .unwrap()
                .get(name)
                .map(|s| s.sent_text.clone())
                .unwrap_or_default()
        }

        pub fn sent_keys(&self, name: &str) -> Vec<String> {
            self.sessions
                .lock()
                .unwrap()
                .get(name)
                .map(|s| s.sent_keys.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl MuxAdapter for MockMux {
        async fn create(&self, name: &str, command: &str, cwd: &str) -> Result<()> {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(name) {
                return Err(Error::Conflict(format!("session '{name}' exists")));
            }
            sessions.insert(
                name.to_string(),
                MockSession {
                    command: command.to_string(),
                    cwd: cwd.to_string(),
                    ..Default::default()
                },
            );
            Ok(())
        }

        async fn exists(&self, name: &str) -> Result<bool> {
            Ok(self.sessions.lock().unwrap().contains_key(name))
        }

        async fn kill(&self, name: &str) -> Result<()> {
            self.sessions
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))
        }

        async fn rename(&self, old: &str, new: &str) -> Result<()> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .remove(old)
                .ok_or_else(|| Error::SessionNotRunning(old.to_string()))?;
            sessions.insert(new.to_string(), session);
            Ok(())
        }

        async fn list_sessions(&self) -> Result<Vec<String>> {
            Ok(self.sessions.lock().unwrap().keys().cloned().collect())
        }

        async fn capture(&self, name: &str, _lines: u32) -> Result<String> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))?;
            if session.captures.len() > 1 {
                Ok(session.captures.pop_front().unwrap())
            } else {
                Ok(session.captures.front().cloned().unwrap_or_default())
            }
        }

        async fn send_text(&self, name: &str, text: &str) -> Result<()> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))?;
            session.sent_text.push(text.to_string());
            Ok(())
        }

        async fn send_key(&self, name: &str, key: &str) -> Result<()> {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))?;
            session.sent_keys.push(key.to_string());
            Ok(())
        }

        async fn working_directory(&self, name: &str) -> Result<String> {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(name)
                .map(|s| s.cwd.clone())
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))
        }

        async fn get_env(&self, name: &str, key: &str) -> Result<Option<String>> {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(name)
                .ok_or_else(|| Error::SessionNotRunning(name.to_string()))?;
            Ok(session.env.get(key).cloned())
        }
    }
}
