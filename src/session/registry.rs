//! Session lifecycle orchestration.
//!
//! The registry is the single source of truth for Session records. Start
//! and fork compose the multiplexer adapter, the git workspace coordinator
//! and the port allocator; delete releases every attached resource without
//! short-circuiting, so a session record is always removable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::git::worktree;
use crate::mux::MuxAdapter;
use crate::ports::PortAllocator;
use crate::store::Store;

use super::{naming, AgentType, Session, SessionStatus, DEFAULT_GROUP, DEFAULT_PROJECT};

/// Request to start a new session.
#[derive(Debug, Clone, Deserialize)]
pub struct StartSpec {
    pub agent_type: AgentType,
    pub name: String,
    pub working_directory: String,
    #[serde(default)]
    pub group_path: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Run the session in an isolated git worktree of `working_directory`.
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    /// Present when the project declares a dev-server binding.
    #[serde(default)]
    pub dev_server: Option<DevServerRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevServerRequest {
    #[serde(default)]
    pub preferred_port: Option<u16>,
}

/// Outcome of a delete: the record is always removed; failures releasing
/// attached resources surface as warnings, never as a hard failure.
#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub session_id: String,
    pub warnings: Vec<String>,
}

pub struct SessionRegistry {
    store: Arc<Store>,
    mux: Arc<dyn MuxAdapter>,
    ports: Arc<PortAllocator>,
    settings: Arc<Settings>,
    /// Per-session mutexes serializing terminal-mutating operations.
    send_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<Store>,
        mux: Arc<dyn MuxAdapter>,
        ports: Arc<PortAllocator>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            mux,
            ports,
            settings,
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.store
            .get_session(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))
    }

    pub async fn list(&self) -> Vec<Session> {
        self.store.list_sessions().await
    }

    /// Start a new session: allocate an id, create the multiplexed terminal
    /// running the agent's launch command, optionally prepare an isolated
    /// worktree and reserve a dev-server port, persist the record.
    pub async fn start(&self, spec: StartSpec) -> Result<Session> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("session name is required".to_string()));
        }
        if spec.working_directory.trim().is_empty() {
            return Err(Error::Validation(
                "working directory is required".to_string(),
            ));
        }

        let group_path = spec.group_path.unwrap_or_else(|| DEFAULT_GROUP.to_string());
        if !self.store.group_exists(&group_path).await {
            return Err(Error::NotFound(format!("group '{group_path}' not found")));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mux_name = naming::mux_session_name(spec.agent_type, &id);

        // Id uniqueness makes a collision all but impossible, but the name
        // is the terminal's identity, so verify before acquiring resources.
        if self.mux.exists(&mux_name).await? {
            return Err(Error::Conflict(format!(
                "multiplexed session '{mux_name}' already exists"
            )));
        }

        let base_dir = shellexpand::tilde(&spec.working_directory).to_string();

        // Isolation first: the worktree's path becomes the working directory
        let mut worktree_path = None;
        let mut branch_name = None;
        let mut base_branch = None;
        let working_directory = if spec.isolated {
            let branch = derive_branch_name(&spec.name, &id);
            let wt = worktree::create(
                Path::new(&base_dir),
                &id,
                &branch,
                spec.base_branch.as_deref(),
            )
            .await?;
            let path = wt.path.to_string_lossy().to_string();
            worktree_path = Some(path.clone());
            branch_name = Some(wt.branch);
            base_branch = Some(wt.base_branch);
            path
        } else {
            if !Path::new(&base_dir).is_dir() {
                return Err(Error::Validation(format!(
                    "working directory '{base_dir}' does not exist"
                )));
            }
            base_dir
        };

        let command = self.settings.agent_command(spec.agent_type);
        if let Err(e) = self.mux.create(&mux_name, &command, &working_directory).await {
            self.rollback_worktree(worktree_path.as_deref()).await;
            return Err(e);
        }

        let dev_server_port = match &spec.dev_server {
            Some(request) => {
                match self.ports.allocate(&id, request.preferred_port).await {
                    Ok(port) => Some(port),
                    Err(e) => {
                        // Undo the terminal and worktree; nothing persisted yet
                        let _ = self.mux.kill(&mux_name).await;
                        self.rollback_worktree(worktree_path.as_deref()).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name: spec.name,
            agent_type: spec.agent_type,
            mux_name: mux_name.clone(),
            working_directory,
            group_path,
            project_id: spec.project_id.unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            parent_id: None,
            agent_conversation_id: None,
            model: spec.model,
            worktree_path,
            branch_name,
            base_branch,
            dev_server_port,
            status: SessionStatus::Idle,
            last_observed_line: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(session.clone()).await?;

        tracing::info!(
            session = %id,
            mux = %mux_name,
            agent = %session.agent_type,
            "Started session"
        );

        if let Some(prompt) = spec.initial_prompt.as_deref() {
            if let Err(e) = self.send_text(&id, prompt, true).await {
                tracing::warn!(session = %id, error = %e, "Failed to deliver initial prompt");
            }
        }

        Ok(session)
    }

    /// Fork a session: a fresh terminal with the parent's agent, directory
    /// and placement. The agent conversation id is never copied; the child
    /// starts a new agent-side conversation.
    pub async fn fork(&self, parent_id: &str, name: Option<String>) -> Result<Session> {
        let parent = self.get(parent_id).await?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mux_name = naming::mux_session_name(parent.agent_type, &id);
        let name = name.unwrap_or_else(|| format!("{} (fork)", parent.name));

        if self.mux.exists(&mux_name).await? {
            return Err(Error::Conflict(format!(
                "multiplexed session '{mux_name}' already exists"
            )));
        }

        let command = self.settings.agent_command(parent.agent_type);
        self.mux
            .create(&mux_name, &command, &parent.working_directory)
            .await?;

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name,
            agent_type: parent.agent_type,
            mux_name,
            working_directory: parent.working_directory.clone(),
            group_path: parent.group_path.clone(),
            project_id: parent.project_id.clone(),
            parent_id: Some(parent.id.clone()),
            agent_conversation_id: None,
            model: parent.model.clone(),
            worktree_path: None,
            branch_name: None,
            base_branch: None,
            dev_server_port: None,
            status: SessionStatus::Idle,
            last_observed_line: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(session.clone()).await?;

        tracing::info!(session = %id, parent = %parent.id, "Forked session");
        Ok(session)
    }

    /// Delete a session and release everything bound to it. Every release
    /// is attempted even when an earlier one fails; failures become
    /// warnings. Children keep their (now dangling) parent reference.
    pub async fn delete(&self, id: &str) -> Result<DeleteReport> {
        let session = self.get(id).await?;
        let mut warnings = Vec::new();

        // Port release is idempotent and cannot fail
        self.ports.release(id).await;

        if let Some(path) = session.worktree_path.as_deref() {
            let path = PathBuf::from(path);
            if worktree::is_managed(&path) {
                if let Err(e) = worktree::remove(&path).await {
                    tracing::warn!(session = %id, error = %e, "Worktree cleanup failed");
                    warnings.push(format!("worktree cleanup failed: {e}"));
                }
            } else {
                warnings.push(format!(
                    "worktree '{}' is not managed by berth, left in place",
                    path.display()
                ));
            }
            // Best-effort: drop the session's (now empty) worktree dir
            if let Ok(dir) = crate::config::session_worktree_dir(id) {
                let _ = std::fs::remove_dir(dir);
            }
        }

        match self.mux.kill(&session.mux_name).await {
            Ok(()) | Err(Error::SessionNotRunning(_)) => {}
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Failed to kill multiplexed session");
                warnings.push(format!("terminal kill failed: {e}"));
            }
        }

        self.store.remove_session(id).await?;
        self.send_locks.lock().await.remove(id);

        tracing::info!(session = %id, warnings = warnings.len(), "Deleted session");
        Ok(DeleteReport {
            session_id: id.to_string(),
            warnings,
        })
    }

    /// Deliver literal text into the session's terminal, optionally
    /// followed by Enter. Serialized per session so concurrent sends never
    /// interleave their staged injections.
    pub async fn send_text(&self, id: &str, text: &str, press_enter: bool) -> Result<()> {
        let session = self.get(id).await?;
        let lock = self.send_lock(id).await;
        let _guard = lock.lock().await;

        if !self.mux.exists(&session.mux_name).await? {
            return Err(Error::SessionNotRunning(session.mux_name));
        }

        self.mux.send_text(&session.mux_name, text).await?;
        if press_enter {
            self.mux.send_key(&session.mux_name, "Enter").await?;
        }
        Ok(())
    }

    /// Change the display name. The multiplexed session name is immutable;
    /// other subsystems derive identity from it.
    pub async fn rename(&self, id: &str, new_name: &str) -> Result<Session> {
        if new_name.trim().is_empty() {
            return Err(Error::Validation("session name is required".to_string()));
        }
        self.store
            .update_session(id, |s| s.name = new_name.to_string())
            .await
    }

    pub async fn move_to_group(&self, id: &str, group_path: &str) -> Result<Session> {
        if !self.store.group_exists(group_path).await {
            return Err(Error::NotFound(format!("group '{group_path}' not found")));
        }
        self.store
            .update_session(id, |s| s.group_path = group_path.to_string())
            .await
    }

    /// Capture recent terminal output for display.
    pub async fn scrollback(&self, id: &str, lines: u32) -> Result<String> {
        let session = self.get(id).await?;
        self.mux.capture(&session.mux_name, lines).await
    }

    async fn send_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn rollback_worktree(&self, path: Option<&str>) {
        if let Some(path) = path {
            if let Err(e) = worktree::remove(Path::new(path)).await {
                tracing::warn!(worktree = %path, error = %e, "Rollback of worktree failed");
            }
        }
    }
}

/// Branch name for an isolated workspace, derived from the session name
/// with a short id suffix to keep retries from colliding.
fn derive_branch_name(name: &str, id: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    let slug = if slug.is_empty() {
        "session"
    } else {
        slug.as_str()
    };
    let short = &id[..id.len().min(8)];
    format!("berth/{slug}-{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::mock::MockMux;
    use crate::session::naming::parse_mux_name;

    struct Fixture {
        registry: SessionRegistry,
        mux: Arc<MockMux>,
        ports: Arc<PortAllocator>,
        workdir: tempfile::TempDir,
        _statedir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let statedir = tempfile::tempdir().unwrap();
        let workdir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(statedir.path().join("state.json")).unwrap());
        let mux = Arc::new(MockMux::new());
        let ports = Arc::new(PortAllocator::new(23600, 23620));
        let registry = SessionRegistry::new(
            store,
            mux.clone(),
            ports.clone(),
            Arc::new(Settings::default()),
        );
        Fixture {
            registry,
            mux,
            ports,
            workdir,
            _statedir: statedir,
        }
    }

    fn shell_spec(f: &Fixture, name: &str) -> StartSpec {
        StartSpec {
            agent_type: AgentType::Shell,
            name: name.to_string(),
            working_directory: f.workdir.path().to_string_lossy().to_string(),
            group_path: None,
            project_id: None,
            isolated: false,
            base_branch: None,
            model: None,
            initial_prompt: None,
            dev_server: None,
        }
    }

    #[tokio::test]
    async fn start_shell_session() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "scratch")).await.unwrap();

        assert_eq!(session.agent_type, AgentType::Shell);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.dev_server_port, None);
        assert_eq!(session.worktree_path, None);
        assert_eq!(session.group_path, DEFAULT_GROUP);
        assert_eq!(session.project_id, DEFAULT_PROJECT);

        // The terminal was created with the agent's launch command
        let sessions = f.mux.sessions.lock().unwrap();
        let created = sessions.get(&session.mux_name).unwrap();
        assert_eq!(created.command, "/bin/bash");
    }

    #[tokio::test]
    async fn mux_name_parses_back_to_agent_and_id() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "scratch")).await.unwrap();

        let (agent, id) = parse_mux_name(&session.mux_name).unwrap();
        assert_eq!(agent, session.agent_type);
        assert_eq!(id, session.id);
    }

    #[tokio::test]
    async fn start_validates_inputs() {
        let f = fixture();

        let mut spec = shell_spec(&f, "");
        assert_eq!(
            f.registry.start(spec).await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );

        spec = shell_spec(&f, "ok");
        spec.working_directory = "/no/such/dir/berth".to_string();
        assert_eq!(
            f.registry.start(spec).await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );

        spec = shell_spec(&f, "ok");
        spec.group_path = Some("missing-group".to_string());
        assert_eq!(
            f.registry.start(spec).await.unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn initial_prompt_is_delivered_with_enter() {
        let f = fixture();
        let mut spec = shell_spec(&f, "prompted");
        spec.initial_prompt = Some("make test".to_string());
        let session = f.registry.start(spec).await.unwrap();

        assert_eq!(f.mux.sent_text(&session.mux_name), vec!["make test"]);
        assert_eq!(f.mux.sent_keys(&session.mux_name), vec!["Enter"]);
    }

    #[tokio::test]
    async fn fork_copies_placement_but_never_the_conversation() {
        let f = fixture();
        let parent = f.registry.start(shell_spec(&f, "Build API")).await.unwrap();

        // Simulate a discovered conversation id on the parent
        f.registry
            .store
            .set_conversation_id(&parent.id, "conv-123")
            .await
            .unwrap();

        let child = f.registry.fork(&parent.id, None).await.unwrap();
        assert_eq!(child.name, "Build API (fork)");
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.agent_type, parent.agent_type);
        assert_eq!(child.working_directory, parent.working_directory);
        assert_eq!(child.group_path, parent.group_path);
        assert_eq!(child.agent_conversation_id, None);
        assert_ne!(child.mux_name, parent.mux_name);
    }

    #[tokio::test]
    async fn fork_of_missing_parent_is_not_found() {
        let f = fixture();
        let err = f.registry.fork("nope", None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_releases_the_port_for_reuse() {
        let f = fixture();
        let mut spec = shell_spec(&f, "served");
        spec.dev_server = Some(DevServerRequest {
            preferred_port: Some(23610),
        });
        let session = f.registry.start(spec).await.unwrap();
        assert_eq!(session.dev_server_port, Some(23610));

        f.registry.delete(&session.id).await.unwrap();

        // The port is back in the pool
        let reused = f.ports.allocate("other", Some(23610)).await.unwrap();
        assert_eq!(reused, 23610);
    }

    #[tokio::test]
    async fn delete_tolerates_an_already_dead_terminal() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "doomed")).await.unwrap();

        // Terminal dies out-of-band
        f.mux.sessions.lock().unwrap().remove(&session.mux_name);

        let report = f.registry.delete(&session.id).await.unwrap();
        assert!(report.warnings.is_empty());
        assert!(f.registry.get(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn delete_keeps_children_with_dangling_parent() {
        let f = fixture();
        let parent = f.registry.start(shell_spec(&f, "p")).await.unwrap();
        let child = f.registry.fork(&parent.id, None).await.unwrap();

        f.registry.delete(&parent.id).await.unwrap();

        let child = f.registry.get(&child.id).await.unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
    }

    #[tokio::test]
    async fn send_text_to_dead_session_is_a_typed_error() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "gone")).await.unwrap();
        f.mux.sessions.lock().unwrap().remove(&session.mux_name);

        let err = f
            .registry
            .send_text(&session.id, "echo hi", true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_RUNNING");
    }

    #[tokio::test]
    async fn send_text_without_enter_sends_no_key() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "typed")).await.unwrap();

        f.registry
            .send_text(&session.id, "partial input", false)
            .await
            .unwrap();
        assert_eq!(f.mux.sent_text(&session.mux_name), vec!["partial input"]);
        assert!(f.mux.sent_keys(&session.mux_name).is_empty());
    }

    #[tokio::test]
    async fn rename_keeps_the_mux_name() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "old")).await.unwrap();

        let renamed = f.registry.rename(&session.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(renamed.mux_name, session.mux_name);

        assert!(f.registry.rename(&session.id, "  ").await.is_err());
    }

    #[tokio::test]
    async fn move_to_group_validates_the_target() {
        let f = fixture();
        let session = f.registry.start(shell_spec(&f, "mover")).await.unwrap();

        let err = f
            .registry
            .move_to_group(&session.id, "missing")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        f.registry.store.create_group("work").await.unwrap();
        let moved = f.registry.move_to_group(&session.id, "work").await.unwrap();
        assert_eq!(moved.group_path, "work");
    }

    #[test]
    fn branch_names_are_slugged() {
        let branch = derive_branch_name("Fix: login & auth!", "0123456789abcdef");
        assert_eq!(branch, "berth/fix--login---auth-01234567");
    }
}
