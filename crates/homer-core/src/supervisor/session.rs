//! Session persistence - snapshot on shutdown, resume on start.
//!
//! Snapshots older than 24 hours are treated as absent.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::write_atomic;
use crate::types::{AgentStatus, WorkUnit};

/// Maximum age before a saved session is ignored.
pub const SESSION_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Tail lines of output kept per agent in the snapshot.
pub const SNAPSHOT_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAgent {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<WorkUnit>,
    pub tool: String,
    pub status: AgentStatus,
    pub started_at: i64,
    /// ANSI-stripped last lines of output at shutdown.
    #[serde(default)]
    pub output_tail: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOpts {
    pub max_agents: usize,
    pub auto: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub repo: String,
    pub cwd: PathBuf,
    pub saved_at: i64,
    pub active_tool: String,
    pub agents: Vec<SessionAgent>,
    pub agent_counter: u64,
    pub opts: SessionOpts,
}

impl SessionSnapshot {
    pub fn is_stale(&self) -> bool {
        Utc::now().timestamp_millis() - self.saved_at > SESSION_MAX_AGE_MS
    }

    /// Agents worth resuming: everything that had not finished its task.
    pub fn resumable_agents(&self) -> Vec<&SessionAgent> {
        self.agents
            .iter()
            .filter(|a| a.status != AgentStatus::Done)
            .collect()
    }
}

/// Write the snapshot atomically.
pub fn save_session(path: &Path, snapshot: &SessionSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    write_atomic(path, &json)?;
    debug!(path = %path.display(), agents = snapshot.agents.len(), "session saved");
    Ok(())
}

/// Load a snapshot; missing, malformed or stale files are absent.
pub fn load_session(path: &Path) -> Option<SessionSnapshot> {
    let raw = std::fs::read_to_string(path).ok()?;
    let snapshot: SessionSnapshot = match serde_json::from_str(&raw) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed session ignored");
            return None;
        }
    };
    if snapshot.is_stale() {
        debug!(path = %path.display(), "stale session ignored");
        return None;
    }
    Some(snapshot)
}

/// Remove a saved session (the `--fresh` path).
pub fn clear_session(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(saved_at: i64) -> SessionSnapshot {
        SessionSnapshot {
            session_id: "sess-1".into(),
            repo: "acme/shop".into(),
            cwd: PathBuf::from("/work/shop"),
            saved_at,
            active_tool: "claude".into(),
            agents: vec![
                SessionAgent {
                    id: "homer-1".into(),
                    task: Some(WorkUnit::Story {
                        id: "US-001".into(),
                        title: "Add auth".into(),
                        description: String::new(),
                        criteria: vec![],
                        priority: Some(1),
                        passed: false,
                        notes: None,
                    }),
                    tool: "claude".into(),
                    status: AgentStatus::Working,
                    started_at: saved_at - 1000,
                    output_tail: vec!["editing src/auth.ts".into()],
                },
                SessionAgent {
                    id: "homer-2".into(),
                    task: None,
                    tool: "claude".into(),
                    status: AgentStatus::Done,
                    started_at: saved_at - 2000,
                    output_tail: vec![],
                },
            ],
            agent_counter: 2,
            opts: SessionOpts {
                max_agents: 2,
                auto: true,
                label: Some("homer".into()),
                model: None,
                permission_mode: None,
            },
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme-shop.json");
        let snap = snapshot(Utc::now().timestamp_millis());
        save_session(&path, &snap).unwrap();

        let loaded = load_session(&path).unwrap();
        assert_eq!(loaded.session_id, snap.session_id);
        assert_eq!(loaded.agents.len(), 2);
        assert_eq!(loaded.agent_counter, 2);

        // camelCase field naming on disk
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"savedAt\""));
        assert!(raw.contains("\"activeTool\""));
        assert!(raw.contains("\"outputTail\""));
    }

    #[test]
    fn test_stale_session_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let old = Utc::now().timestamp_millis() - SESSION_MAX_AGE_MS - 1000;
        save_session(&path, &snapshot(old)).unwrap();
        assert!(load_session(&path).is_none());
    }

    #[test]
    fn test_resumable_excludes_done() {
        let snap = snapshot(Utc::now().timestamp_millis());
        let resumable = snap.resumable_agents();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, "homer-1");
    }

    #[test]
    fn test_clear_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        save_session(&path, &snapshot(Utc::now().timestamp_millis())).unwrap();
        clear_session(&path);
        assert!(load_session(&path).is_none());
    }
}
