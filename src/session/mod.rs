pub mod naming;
pub mod registry;

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved group that always exists and cannot be renamed or deleted.
pub const DEFAULT_GROUP: &str = "sessions";

/// Reserved project id for sessions not assigned to any project.
pub const DEFAULT_PROJECT: &str = "uncategorized";

/// The kind of process a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Codex,
    Opencode,
    Gemini,
    Aider,
    Cursor,
    Shell,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Opencode => "opencode",
            AgentType::Gemini => "gemini",
            AgentType::Aider => "aider",
            AgentType::Cursor => "cursor",
            AgentType::Shell => "shell",
        }
    }

    /// Default launch command; may be overridden per agent in settings.
    pub fn default_command(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Opencode => "opencode",
            AgentType::Gemini => "gemini",
            AgentType::Aider => "aider",
            AgentType::Cursor => "cursor-agent",
            AgentType::Shell => "/bin/bash",
        }
    }

    /// Environment variable on the multiplexed session that may carry the
    /// agent's own conversation id, when the agent exports one.
    pub fn conversation_env_var(&self) -> Option<&'static str> {
        match self {
            AgentType::Claude => Some("CLAUDE_SESSION_ID"),
            AgentType::Codex => Some("CODEX_SESSION_ID"),
            AgentType::Gemini => Some("GEMINI_SESSION_ID"),
            _ => None,
        }
    }

    /// Directory holding the agent's on-disk conversation logs for a given
    /// working directory, used as the discovery fallback. Agents that keep
    /// no per-conversation files return None.
    pub fn conversation_log_dir(&self, home: &PathBuf, working_directory: &str) -> Option<PathBuf> {
        match self {
            AgentType::Claude => {
                // ~/.claude/projects/<cwd with path separators flattened>
                let flattened = working_directory.replace(['/', '.'], "-");
                Some(home.join(".claude").join("projects").join(flattened))
            }
            AgentType::Codex => Some(home.join(".codex").join("sessions")),
            AgentType::Opencode => Some(
                home.join(".local")
                    .join("share")
                    .join("opencode")
                    .join("storage")
                    .join("session"),
            ),
            AgentType::Gemini => Some(home.join(".gemini").join("tmp")),
            AgentType::Aider | AgentType::Cursor | AgentType::Shell => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentType::Claude),
            "codex" => Ok(AgentType::Codex),
            "opencode" => Ok(AgentType::Opencode),
            "gemini" => Ok(AgentType::Gemini),
            "aider" => Ok(AgentType::Aider),
            "cursor" => Ok(AgentType::Cursor),
            "shell" => Ok(AgentType::Shell),
            _ => Err(()),
        }
    }
}

/// Observed activity state, inferred from terminal output by the status
/// detector. Precedence when classifying: dead > waiting > error > running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Waiting,
    Error,
    Dead,
}

impl SessionStatus {
    /// Active states bump the session's `updated_at` for recency sorting.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Waiting)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Error => "error",
            SessionStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A managed agent session. Persisted in the store; `status` and
/// `last_observed_line` are observed fields refreshed by the detector and
/// rebuilt from scratch after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    /// Multiplexed terminal session name, derived from agent type + id.
    /// Immutable after creation; other subsystems derive identity from it.
    pub mux_name: String,
    pub working_directory: String,
    pub group_path: String,
    pub project_id: String,
    /// Session this was forked from. Weak reference: deleting the parent
    /// leaves this dangling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The agent's own conversation identifier, discovered lazily after the
    /// process starts. Never copied on fork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_server_port: Option<u16>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_line: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A hierarchical slash-path label for organizing sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub path: String,
    pub created_at: DateTime<Utc>,
}
