//! JSON-file persistence for sessions and groups.
//!
//! The on-disk file is the durable source of truth; the in-memory copy is a
//! cache guarded by an RwLock. Writes go through a temp file + rename so a
//! crash mid-write never corrupts state. Observed fields (status, last
//! observed line) are reset on open and rebuilt by the first poll.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::session::{Group, Session, SessionStatus, DEFAULT_GROUP};

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    sessions: HashMap<String, Session>,
    groups: Vec<Group>,
}

pub struct Store {
    path: PathBuf,
    state: RwLock<State>,
}

impl Store {
    /// Open (or create) the store at `path`. Seeds the default group and
    /// resets per-session observed status, which is never authoritative
    /// across a restart.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| Error::Store(e.to_string()))?
        } else {
            State::default()
        };

        if !state.groups.iter().any(|g| g.path == DEFAULT_GROUP) {
            state.groups.insert(
                0,
                Group {
                    path: DEFAULT_GROUP.to_string(),
                    created_at: Utc::now(),
                },
            );
        }
        for session in state.sessions.values_mut() {
            session.status = SessionStatus::Idle;
            session.last_observed_line = None;
        }

        let store = Self {
            path,
            state: RwLock::new(state),
        };
        Ok(store)
    }

    fn flush(&self, state: &State) -> Result<()> {
        let json = serde_json::to_string_pretty(state).map_err(|e| Error::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────

    pub async fn insert_session(&self, session: Session) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(Error::Conflict(format!(
                "session id '{}' already exists",
                session.id
            )));
        }
        state.sessions.insert(session.id.clone(), session);
        self.flush(&state)
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.state.read().await.sessions.get(id).cloned()
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
        // Most recently active first
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Apply a field update to one session. Returns the updated record, or
    /// NotFound when the session is gone.
    pub async fn update_session<F>(&self, id: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
        f(session);
        let updated = session.clone();
        self.flush(&state)?;
        Ok(updated)
    }

    pub async fn remove_session(&self, id: &str) -> Result<Session> {
        let mut state = self.state.write().await;
        let removed = state
            .sessions
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
        self.flush(&state)?;
        Ok(removed)
    }

    /// Record a discovered agent conversation id, exactly once per session.
    /// Re-discovery is a no-op; returns whether the id was written.
    pub async fn set_conversation_id(&self, id: &str, conversation_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("session '{id}' not found")))?;
        if session.agent_conversation_id.is_some() {
            return Ok(false);
        }
        session.agent_conversation_id = Some(conversation_id.to_string());
        self.flush(&state)?;
        Ok(true)
    }

    // ── Groups ───────────────────────────────────────────────

    pub async fn list_groups(&self) -> Vec<Group> {
        self.state.read().await.groups.clone()
    }

    pub async fn group_exists(&self, path: &str) -> bool {
        self.state.read().await.groups.iter().any(|g| g.path == path)
    }

    pub async fn create_group(&self, path: &str) -> Result<Group> {
        if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
            return Err(Error::Validation(format!("invalid group path '{path}'")));
        }
        let mut state = self.state.write().await;
        if state.groups.iter().any(|g| g.path == path) {
            return Err(Error::Conflict(format!("group '{path}' already exists")));
        }
        let group = Group {
            path: path.to_string(),
            created_at: Utc::now(),
        };
        state.groups.push(group.clone());
        self.flush(&state)?;
        Ok(group)
    }

    /// Delete a group; its sessions move to the default group so the
    /// group-reference invariant holds. The default group is untouchable.
    pub async fn delete_group(&self, path: &str) -> Result<()> {
        if path == DEFAULT_GROUP {
            return Err(Error::Validation(
                "the default group cannot be deleted".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        let before = state.groups.len();
        state.groups.retain(|g| g.path != path);
        if state.groups.len() == before {
            return Err(Error::NotFound(format!("group '{path}' not found")));
        }
        for session in state.sessions.values_mut() {
            if session.group_path == path {
                session.group_path = DEFAULT_GROUP.to_string();
            }
        }
        self.flush(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AgentType;

    fn test_session(id: &str, name: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            name: name.to_string(),
            agent_type: AgentType::Shell,
            mux_name: format!("berth-shell-{id}"),
            working_directory: "/tmp".to_string(),
            group_path: DEFAULT_GROUP.to_string(),
            project_id: "uncategorized".to_string(),
            parent_id: None,
            agent_conversation_id: None,
            model: None,
            worktree_path: None,
            branch_name: None,
            base_branch: None,
            dev_server_port: None,
            status: SessionStatus::Idle,
            last_observed_line: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn open_temp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.json")).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn default_group_is_seeded() {
        let (store, _dir) = open_temp();
        assert!(store.group_exists(DEFAULT_GROUP).await);
    }

    #[tokio::test]
    async fn session_crud_roundtrip() {
        let (store, _dir) = open_temp();
        store.insert_session(test_session("a1", "one")).await.unwrap();

        let got = store.get_session("a1").await.unwrap();
        assert_eq!(got.name, "one");

        store
            .update_session("a1", |s| s.name = "renamed".to_string())
            .await
            .unwrap();
        assert_eq!(store.get_session("a1").await.unwrap().name, "renamed");

        store.remove_session("a1").await.unwrap();
        assert!(store.get_session("a1").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict() {
        let (store, _dir) = open_temp();
        store.insert_session(test_session("a1", "one")).await.unwrap();
        let err = store
            .insert_session(test_session("a1", "two"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn conversation_id_is_written_once() {
        let (store, _dir) = open_temp();
        store.insert_session(test_session("a1", "one")).await.unwrap();

        assert!(store.set_conversation_id("a1", "uuid-1").await.unwrap());
        // Second discovery is a no-op, even with a different id
        assert!(!store.set_conversation_id("a1", "uuid-2").await.unwrap());
        assert_eq!(
            store.get_session("a1").await.unwrap().agent_conversation_id,
            Some("uuid-1".to_string())
        );
    }

    #[tokio::test]
    async fn status_resets_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = Store::open(path.clone()).unwrap();
            let mut s = test_session("a1", "one");
            s.status = SessionStatus::Running;
            s.last_observed_line = Some("compiling".to_string());
            store.insert_session(s).await.unwrap();
        }
        let store = Store::open(path).unwrap();
        let got = store.get_session("a1").await.unwrap();
        assert_eq!(got.status, SessionStatus::Idle);
        assert!(got.last_observed_line.is_none());
    }

    #[tokio::test]
    async fn deleting_group_moves_sessions_to_default() {
        let (store, _dir) = open_temp();
        store.create_group("work/api").await.unwrap();
        let mut s = test_session("a1", "one");
        s.group_path = "work/api".to_string();
        store.insert_session(s).await.unwrap();

        store.delete_group("work/api").await.unwrap();
        assert_eq!(
            store.get_session("a1").await.unwrap().group_path,
            DEFAULT_GROUP
        );
    }

    #[tokio::test]
    async fn default_group_is_protected() {
        let (store, _dir) = open_temp();
        assert!(store.delete_group(DEFAULT_GROUP).await.is_err());
    }
}
