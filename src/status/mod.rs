//! Polling status detection for managed sessions.
//!
//! The agent process is an opaque black box; activity is inferred entirely
//! from its terminal. Each poll captures recent scrollback per session,
//! compares it against a per-session tracker, and classifies into the
//! five-state machine with fixed precedence: dead > waiting > error >
//! running > idle. Anything unrecognized degrades to idle; classification
//! never fails outward.

mod patterns;

pub use patterns::PatternSet;

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::config::Settings;
use crate::error::Error;
use crate::mux::MuxAdapter;
use crate::session::{AgentType, Session, SessionStatus};
use crate::store::Store;

/// One session's observed state, republished on every poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_conversation_id: Option<String>,
}

/// Per-session scrollback tracker: distinguishes "frozen on a prompt" from
/// "actively streaming".
struct Tracker {
    last_hash: u64,
    last_change: Instant,
}

pub struct StatusDetector {
    mux: Arc<dyn MuxAdapter>,
    store: Arc<Store>,
    patterns: PatternSet,
    trackers: Mutex<HashMap<String, Tracker>>,
    tx: watch::Sender<Arc<Vec<StatusRecord>>>,
    capture_lines: u32,
    conversation_freshness: Duration,
}

impl StatusDetector {
    pub fn new(mux: Arc<dyn MuxAdapter>, store: Arc<Store>, settings: &Settings) -> Arc<Self> {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Arc::new(Self {
            mux,
            store,
            patterns: PatternSet::from_settings(&settings.status),
            trackers: Mutex::new(HashMap::new()),
            tx,
            capture_lines: settings.poll.capture_lines,
            conversation_freshness: Duration::from_secs(settings.poll.conversation_freshness_secs),
        })
    }

    /// Subscribe to published status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<StatusRecord>>> {
        self.tx.subscribe()
    }

    /// Run the detector at a fixed cadence until the task is aborted.
    pub fn spawn_poll_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                detector.poll_once().await;
            }
        })
    }

    /// One full poll cycle: classify every managed session concurrently,
    /// sweep stale trackers, publish the snapshot.
    pub async fn poll_once(&self) -> Vec<StatusRecord> {
        let sessions = self.store.list_sessions().await;

        let live: HashSet<String> = match self.mux.list_sessions().await {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list multiplexer sessions, skipping poll");
                return Vec::new();
            }
        };

        let futures = sessions.iter().map(|s| self.observe(s, &live));
        let records: Vec<StatusRecord> = futures_util::future::join_all(futures).await;

        let managed: HashSet<String> = sessions.iter().map(|s| s.mux_name.clone()).collect();
        self.sweep(&managed).await;

        let _ = self.tx.send(Arc::new(records.clone()));
        records
    }

    /// Drop trackers for sessions no longer in the managed set. Callers
    /// outside the poll loop may invoke this directly after bulk deletes.
    pub async fn sweep(&self, managed: &HashSet<String>) {
        let mut trackers = self.trackers.lock().await;
        trackers.retain(|name, _| managed.contains(name));
    }

    async fn observe(&self, session: &Session, live: &HashSet<String>) -> StatusRecord {
        let (status, last_line) = if !live.contains(&session.mux_name) {
            (SessionStatus::Dead, None)
        } else {
            match self.mux.capture(&session.mux_name, self.capture_lines).await {
                Ok(text) => self.classify_capture(&session.mux_name, &text).await,
                Err(Error::SessionNotRunning(_)) => (SessionStatus::Dead, None),
                Err(e) => {
                    // Never propagate a classification failure
                    tracing::warn!(
                        session = %session.mux_name,
                        error = %e,
                        "Capture failed, degrading to idle"
                    );
                    (SessionStatus::Idle, None)
                }
            }
        };

        let mut conversation_id = session.agent_conversation_id.clone();
        if conversation_id.is_none() && status != SessionStatus::Dead {
            if let Some(found) = self.discover_conversation_id(session).await {
                match self.store.set_conversation_id(&session.id, &found).await {
                    Ok(true) => {
                        tracing::info!(
                            session = %session.id,
                            conversation = %found,
                            "Discovered agent conversation id"
                        );
                        conversation_id = Some(found);
                    }
                    Ok(false) => {
                        // Another cycle won the race; keep what was stored
                        conversation_id = self
                            .store
                            .get_session(&session.id)
                            .await
                            .and_then(|s| s.agent_conversation_id);
                    }
                    Err(e) => {
                        tracing::warn!(session = %session.id, error = %e, "Failed to persist conversation id");
                    }
                }
            }
        }

        if status != session.status || last_line != session.last_observed_line {
            let bump_recency = status.is_active() && status != session.status;
            let update = self
                .store
                .update_session(&session.id, |s| {
                    s.status = status;
                    if last_line.is_some() {
                        s.last_observed_line = last_line.clone();
                    }
                    if bump_recency {
                        s.updated_at = Utc::now();
                    }
                })
                .await;
            if let Err(e) = update {
                // The session may have been deleted mid-poll
                tracing::debug!(session = %session.id, error = %e, "Status update skipped");
            }
        }

        StatusRecord {
            session_id: session.id.clone(),
            status,
            last_observed_line: last_line.or_else(|| session.last_observed_line.clone()),
            agent_conversation_id: conversation_id,
        }
    }

    /// Classify a live session's capture against its tracker.
    async fn classify_capture(&self, mux_name: &str, text: &str) -> (SessionStatus, Option<String>) {
        let hash = hash_text(text);
        let changed;
        {
            let mut trackers = self.trackers.lock().await;
            let tracker = trackers.entry(mux_name.to_string()).or_insert(Tracker {
                last_hash: hash,
                last_change: Instant::now(),
            });
            changed = tracker.last_hash != hash;
            if changed {
                tracker.last_hash = hash;
                tracker.last_change = Instant::now();
            }
        }

        let last_line = text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim_end().to_string());

        (classify_live(&self.patterns, text, changed), last_line)
    }

    /// Find the agent's own conversation id: session environment first, then
    /// the freshest UUID-named file in the agent's conversation-log
    /// directory.
    async fn discover_conversation_id(&self, session: &Session) -> Option<String> {
        if session.agent_type == AgentType::Shell {
            return None;
        }

        if let Some(var) = session.agent_type.conversation_env_var() {
            if let Ok(Some(value)) = self.mux.get_env(&session.mux_name, var).await {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }

        let home = dirs::home_dir()?;
        let dir = session
            .agent_type
            .conversation_log_dir(&home, &session.working_directory)?;
        freshest_uuid_file(&dir, self.conversation_freshness)
    }
}

/// Classification for a session that still exists on the host. Waiting has
/// the highest precedence among live states; error beats running; content
/// change (or a thinking indicator) means running; everything else is idle.
fn classify_live(patterns: &PatternSet, text: &str, changed: bool) -> SessionStatus {
    if patterns.is_waiting(text) {
        SessionStatus::Waiting
    } else if patterns.has_error(text) {
        SessionStatus::Error
    } else if changed || patterns.is_thinking(text) {
        SessionStatus::Running
    } else {
        SessionStatus::Idle
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Most recently modified UUID-named file in `dir` whose mtime is within
/// the freshness window. Returns the file stem.
fn freshest_uuid_file(dir: &Path, freshness: Duration) -> Option<String> {
    let now = SystemTime::now();
    let mut best: Option<(SystemTime, String)> = None;

    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if uuid::Uuid::parse_str(stem).is_err() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let age = now
            .duration_since(modified)
            .unwrap_or(Duration::from_secs(0));
        if age > freshness {
            continue;
        }
        if best.as_ref().map_or(true, |(t, _)| modified > *t) {
            best = Some((modified, stem.to_string()));
        }
    }

    best.map(|(_, stem)| stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::mock::MockMux;
    use crate::session::DEFAULT_GROUP;

    fn test_session(id: &str, agent: AgentType) -> Session {
        let now = Utc::now();
        let mux_name = crate::session::naming::mux_session_name(agent, id);
        Session {
            id: id.to_string(),
            name: id.to_string(),
            agent_type: agent,
            mux_name,
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

    async fn detector_with(
        mux: Arc<MockMux>,
        sessions: Vec<Session>,
    ) -> (Arc<StatusDetector>, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("state.json")).unwrap());
        for s in sessions {
            store.insert_session(s).await.unwrap();
        }
        let detector = StatusDetector::new(mux, store.clone(), &Settings::default());
        (detector, store, dir)
    }

    #[test]
    fn waiting_takes_precedence_over_error() {
        let patterns = PatternSet::default();
        let text = "error: tool call failed\nDo you want to retry? (y/n)";
        assert_eq!(
            classify_live(&patterns, text, true),
            SessionStatus::Waiting
        );
    }

    #[test]
    fn error_beats_running() {
        let patterns = PatternSet::default();
        assert_eq!(
            classify_live(&patterns, "error: no such file", true),
            SessionStatus::Error
        );
    }

    #[test]
    fn change_without_patterns_is_running() {
        let patterns = PatternSet::default();
        assert_eq!(
            classify_live(&patterns, "compiling berth v0.1.0", true),
            SessionStatus::Running
        );
    }

    #[test]
    fn stable_unmatched_content_is_idle() {
        let patterns = PatternSet::default();
        assert_eq!(classify_live(&patterns, "$ ", false), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn killed_session_is_dead_on_next_poll() {
        let mux = Arc::new(MockMux::new());
        let session = test_session("a1", AgentType::Claude);
        let mux_name = session.mux_name.clone();
        mux.add_session(&mux_name, vec!["$ "]);
        let (detector, store, _dir) = detector_with(mux.clone(), vec![session]).await;

        detector.poll_once().await;
        assert_ne!(
            store.get_session("a1").await.unwrap().status,
            SessionStatus::Dead
        );

        // Kill the terminal out from under the detector
        mux.sessions.lock().unwrap().remove(&mux_name);
        let records = detector.poll_once().await;
        assert_eq!(records[0].status, SessionStatus::Dead);
        assert_eq!(
            store.get_session("a1").await.unwrap().status,
            SessionStatus::Dead
        );
    }

    #[tokio::test]
    async fn streaming_output_is_running_then_idle() {
        let mux = Arc::new(MockMux::new());
        let session = test_session("a1", AgentType::Shell);
        mux.add_session(&session.mux_name, vec!["one", "two", "two"]);
        let (detector, _store, _dir) = detector_with(mux, vec![session]).await;

        // First poll seeds the tracker
        detector.poll_once().await;
        // Content changed since last poll, so running
        let records = detector.poll_once().await;
        assert_eq!(records[0].status, SessionStatus::Running);
        // Content stable, so idle
        let records = detector.poll_once().await;
        assert_eq!(records[0].status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn last_observed_line_skips_blanks() {
        let mux = Arc::new(MockMux::new());
        let session = test_session("a1", AgentType::Shell);
        mux.add_session(&session.mux_name, vec!["$ make test\nok 12 tests\n\n\n"]);
        let (detector, _store, _dir) = detector_with(mux, vec![session]).await;

        let records = detector.poll_once().await;
        assert_eq!(records[0].last_observed_line.as_deref(), Some("ok 12 tests"));
    }

    #[tokio::test]
    async fn conversation_id_discovered_from_env_once() {
        let mux = Arc::new(MockMux::new());
        let session = test_session("a1", AgentType::Claude);
        let mux_name = session.mux_name.clone();
        mux.add_session(&mux_name, vec!["$ "]);
        mux.set_env(&mux_name, "CLAUDE_SESSION_ID", "3e0c5f1a-aaaa-bbbb-cccc-000000000001");
        let (detector, store, _dir) = detector_with(mux.clone(), vec![session]).await;

        detector.poll_once().await;
        let first = store.get_session("a1").await.unwrap().agent_conversation_id;
        assert_eq!(
            first.as_deref(),
            Some("3e0c5f1a-aaaa-bbbb-cccc-000000000001")
        );

        // A later env value never overwrites the recorded id
        mux.set_env(&mux_name, "CLAUDE_SESSION_ID", "different");
        detector.poll_once().await;
        assert_eq!(
            store.get_session("a1").await.unwrap().agent_conversation_id,
            first
        );
    }

    #[tokio::test]
    async fn sweep_drops_stale_trackers() {
        let mux = Arc::new(MockMux::new());
        let session = test_session("a1", AgentType::Shell);
        mux.add_session(&session.mux_name, vec!["$ "]);
        let (detector, store, _dir) = detector_with(mux, vec![session]).await;

        detector.poll_once().await;
        assert_eq!(detector.trackers.lock().await.len(), 1);

        store.remove_session("a1").await.unwrap();
        detector.poll_once().await;
        assert!(detector.trackers.lock().await.is_empty());
    }

    #[test]
    fn freshest_uuid_file_ignores_non_uuid_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("9b2f0c4e-1111-2222-3333-444455556666.jsonl"),
            "{}",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.jsonl"), "{}").unwrap();

        let found = freshest_uuid_file(dir.path(), Duration::from_secs(60)).unwrap();
        assert_eq!(found, "9b2f0c4e-1111-2222-3333-444455556666");
    }

    #[test]
    fn freshest_uuid_file_handles_missing_dir() {
        assert!(freshest_uuid_file(Path::new("/no/such/dir"), Duration::from_secs(60)).is_none());
    }
}
