use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base berth directory: ~/.berth
pub fn berth_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".berth"))
}

/// Returns the persisted state file path: ~/.berth/state.json
pub fn state_path() -> Result<PathBuf> {
    Ok(berth_dir()?.join("state.json"))
}

/// Returns the root under which all managed worktrees live:
/// ~/.berth/worktrees
pub fn worktrees_dir() -> Result<PathBuf> {
    Ok(berth_dir()?.join("worktrees"))
}

/// Returns the worktree directory for a session: ~/.berth/worktrees/<id>
pub fn session_worktree_dir(session_id: &str) -> Result<PathBuf> {
    Ok(worktrees_dir()?.join(session_id))
}

/// Returns the log directory: ~/.berth/logs
pub fn logs_dir() -> Result<PathBuf> {
    Ok(berth_dir()?.join("logs"))
}

/// Returns the global config path: ~/.config/berth/config.toml
pub fn global_config_path() -> Result<PathBuf> {
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("berth").join("config.toml"))
}

/// Ensures all required directories exist
pub fn ensure_dirs() -> Result<()> {
    let dirs = [berth_dir()?, worktrees_dir()?, logs_dir()?];
    for dir in &dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}
