use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::AgentType;

/// Runtime settings, merged from built-in defaults and the optional global
/// config file (~/.config/berth/config.toml). Every section has serde
/// defaults so a partial file is fine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub poll: PollSettings,
    pub ports: PortRangeSettings,
    pub git: GitSettings,
    pub terminal: TerminalSettings,
    /// Per-agent launch command overrides, keyed by agent identifier
    /// (e.g. `claude = "claude --permission-mode plan"`).
    pub agents: HashMap<String, String>,
    pub status: StatusSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Fixed auth token; generated at startup when unset.
    pub token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Status poll cadence in milliseconds.
    pub interval_ms: u64,
    /// Scrollback lines captured per poll for classification.
    pub capture_lines: u32,
    /// How recent a UUID-named conversation log must be to count as this
    /// session's conversation during discovery.
    pub conversation_freshness_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1500,
            capture_lines: 200,
            conversation_freshness_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangeSettings {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRangeSettings {
    fn default() -> Self {
        Self {
            start: 4000,
            end: 4999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Branches the commit operation refuses to commit to directly.
    pub protected_branches: Vec<String>,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            protected_branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Shell spawned for embedded PTY terminals.
    pub shell: String,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            shell: "$SHELL".to_string(),
            default_cols: 120,
            default_rows: 40,
        }
    }
}

/// Pattern lists for the status detector. The four-state machine and its
/// precedence are fixed in code; these match sets are tuning data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    pub waiting_patterns: Vec<String>,
    pub error_patterns: Vec<String>,
    pub thinking_patterns: Vec<String>,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            waiting_patterns: [
                "do you want",
                "would you like",
                "(y/n)",
                "[y/n]",
                "[y/N]",
                "proceed?",
                "continue?",
                "press enter to",
                "waiting for your approval",
                "❯ 1. yes",
            ]
            .map(String::from)
            .to_vec(),
            error_patterns: [
                "error:",
                "fatal:",
                "panicked at",
                "traceback (most recent call last)",
                "command not found",
                "permission denied",
                "api error",
            ]
            .map(String::from)
            .to_vec(),
            thinking_patterns: [
                "esc to interrupt",
                "thinking…",
                "working…",
                "✻",
                "tokens",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl Settings {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load the global config file when present, otherwise defaults.
    pub fn load() -> Result<Self> {
        let path = super::global_config_path()?;
        let mut settings = if path.exists() {
            Self::load_file(&path)?
        } else {
            Self::default()
        };
        settings.expand_env();
        Ok(settings)
    }

    /// Expand $VAR / ~ in values that reference the user's environment.
    pub fn expand_env(&mut self) {
        if let Ok(expanded) = shellexpand::full(&self.terminal.shell) {
            self.terminal.shell = expanded.to_string();
        }
        // A still-unset $SHELL falls back to a POSIX shell.
        if self.terminal.shell.starts_with('$') || self.terminal.shell.is_empty() {
            self.terminal.shell = "/bin/bash".to_string();
        }
        for cmd in self.agents.values_mut() {
            if let Ok(expanded) = shellexpand::full(cmd) {
                *cmd = expanded.to_string();
            }
        }
    }

    /// Launch command for an agent, honoring overrides from the config file.
    pub fn agent_command(&self, agent: AgentType) -> String {
        self.agents
            .get(agent.as_str())
            .cloned()
            .unwrap_or_else(|| agent.default_command().to_string())
    }
}
