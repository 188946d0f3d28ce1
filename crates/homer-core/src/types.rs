//! Core types for homerd
//!
//! Shared across the supervisor, scheduler, memory store and control surface.

use serde::{Deserialize, Serialize};

// ============ Agent Status ============

/// Agent state machine status.
///
/// Transitions are driven exclusively by the supervisor; once a terminal
/// status is reached the record is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Child is running and working on its task
    Working,
    /// A done signal was seen; verification is in flight
    Verifying,
    /// Verification passed
    Done,
    /// Agent reported HOMER_BLOCKED
    Blocked,
    /// Verify/reroute budget exhausted
    Failed,
    /// Terminated to hand the task to a fresh agent
    Rerouted,
    /// Child process exited on its own
    Exited,
    /// Killed by user or shutdown
    Killed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Working => "working",
            AgentStatus::Verifying => "verifying",
            AgentStatus::Done => "done",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Failed => "failed",
            AgentStatus::Rerouted => "rerouted",
            AgentStatus::Exited => "exited",
            AgentStatus::Killed => "killed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "working" => Some(AgentStatus::Working),
            "verifying" => Some(AgentStatus::Verifying),
            "done" => Some(AgentStatus::Done),
            "blocked" => Some(AgentStatus::Blocked),
            "failed" => Some(AgentStatus::Failed),
            "rerouted" => Some(AgentStatus::Rerouted),
            "exited" => Some(AgentStatus::Exited),
            "killed" => Some(AgentStatus::Killed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Done
                | AgentStatus::Blocked
                | AgentStatus::Failed
                | AgentStatus::Rerouted
                | AgentStatus::Exited
                | AgentStatus::Killed
        )
    }

    /// An active agent holds a claim on its work unit.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Working | AgentStatus::Verifying)
    }
}

// ============ Work Units ============

/// A unit of work drawn from the layered task source.
///
/// Equality is by (kind, key): two `Story` values with the same id are the
/// same unit regardless of title edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkUnit {
    Story {
        id: String,
        title: String,
        description: String,
        criteria: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        priority: Option<u32>,
        passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
    Subtask {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: String,
        criterion: String,
        title: String,
    },
    Issue {
        number: u64,
        title: String,
        body: String,
        #[serde(default)]
        labels: Vec<String>,
    },
}

impl WorkUnit {
    /// Stable key used by the scheduler, retry counters and the memory store.
    pub fn task_key(&self) -> String {
        match self {
            WorkUnit::Story { id, .. } => format!("story:{}", id),
            WorkUnit::Subtask { id, .. } => format!("story:{}", id),
            WorkUnit::Issue { number, .. } => format!("issue:{}", number),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            WorkUnit::Story { title, .. } => title,
            WorkUnit::Subtask { title, .. } => title,
            WorkUnit::Issue { title, .. } => title,
        }
    }

    /// Acceptance criteria carried by the unit, if any.
    pub fn criteria(&self) -> Vec<String> {
        match self {
            WorkUnit::Story { criteria, .. } => criteria.clone(),
            WorkUnit::Subtask { criterion, .. } => vec![criterion.clone()],
            WorkUnit::Issue { .. } => Vec::new(),
        }
    }

    /// Parent story id for subtasks.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            WorkUnit::Subtask { parent_id, .. } => Some(parent_id),
            _ => None,
        }
    }
}

impl PartialEq for WorkUnit {
    fn eq(&self, other: &Self) -> bool {
        self.task_key() == other.task_key()
            && std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for WorkUnit {}

// ============ Task Run Outcomes ============

/// Outcome of a task run as recorded in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Running,
    Passed,
    Failed,
    Blocked,
    Crashed,
    Timeout,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Passed => "passed",
            RunOutcome::Failed => "failed",
            RunOutcome::Blocked => "blocked",
            RunOutcome::Crashed => "crashed",
            RunOutcome::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunOutcome::Running),
            "passed" => Some(RunOutcome::Passed),
            "failed" => Some(RunOutcome::Failed),
            "blocked" => Some(RunOutcome::Blocked),
            "crashed" => Some(RunOutcome::Crashed),
            "timeout" => Some(RunOutcome::Timeout),
            _ => None,
        }
    }
}

// ============ Verify History ============

/// One entry of an agent's verification history, kept for feedback blocks
/// and the reroute hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyHistoryEntry {
    pub attempt: u32,
    pub failed_checks: Vec<String>,
    /// First lines of the failing output, capped by the output processor.
    pub output_head: String,
}

// ============ State Snapshot ============

/// Per-agent view included in the `state` event and `GET /api/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    pub tool: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    pub verify_attempts: u32,
    pub started_at: i64,
}

/// Full orchestrator state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub repo: String,
    pub tool: String,
    pub auto: bool,
    pub max_agents: usize,
    pub agents: Vec<AgentSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prd: Option<PrdSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
}

/// PRD progress view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdSummary {
    pub project: String,
    pub total_stories: usize,
    pub passed_stories: usize,
}

/// Row counts of the memory database, for the state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub solutions: i64,
    pub task_runs: i64,
    pub rules: i64,
    pub episodes: i64,
    pub files: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_roundtrip() {
        let statuses = [
            AgentStatus::Working,
            AgentStatus::Verifying,
            AgentStatus::Done,
            AgentStatus::Blocked,
            AgentStatus::Failed,
            AgentStatus::Rerouted,
            AgentStatus::Exited,
            AgentStatus::Killed,
        ];
        for status in statuses {
            assert_eq!(AgentStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!AgentStatus::Working.is_terminal());
        assert!(!AgentStatus::Verifying.is_terminal());
        assert!(AgentStatus::Done.is_terminal());
        assert!(AgentStatus::Rerouted.is_terminal());
        assert!(AgentStatus::Working.is_active());
        assert!(AgentStatus::Verifying.is_active());
        assert!(!AgentStatus::Done.is_active());
    }

    #[test]
    fn test_work_unit_keys() {
        let story = WorkUnit::Story {
            id: "US-001".into(),
            title: "Add auth".into(),
            description: String::new(),
            criteria: vec!["a".into(), "b".into()],
            priority: Some(1),
            passed: false,
            notes: None,
        };
        assert_eq!(story.task_key(), "story:US-001");

        let sub = WorkUnit::Subtask {
            id: "US-001-2".into(),
            parent_id: "US-001".into(),
            criterion: "b".into(),
            title: "Add auth (2/2)".into(),
        };
        assert_eq!(sub.task_key(), "story:US-001-2");
        assert_eq!(sub.parent_id(), Some("US-001"));

        let issue = WorkUnit::Issue {
            number: 42,
            title: "Fix flaky test".into(),
            body: String::new(),
            labels: vec![],
        };
        assert_eq!(issue.task_key(), "issue:42");
    }

    #[test]
    fn test_work_unit_equality_by_kind_and_key() {
        let a = WorkUnit::Story {
            id: "US-001".into(),
            title: "one title".into(),
            description: String::new(),
            criteria: vec![],
            priority: None,
            passed: false,
            notes: None,
        };
        let b = WorkUnit::Story {
            id: "US-001".into(),
            title: "another title".into(),
            description: "changed".into(),
            criteria: vec!["x".into()],
            priority: Some(3),
            passed: true,
            notes: Some("n".into()),
        };
        assert_eq!(a, b);

        let sub = WorkUnit::Subtask {
            id: "US-001".into(),
            parent_id: "US-000".into(),
            criterion: String::new(),
            title: String::new(),
        };
        // Same key, different kind
        assert_ne!(a, sub);
    }

    #[test]
    fn test_run_outcome_roundtrip() {
        for outcome in [
            RunOutcome::Running,
            RunOutcome::Passed,
            RunOutcome::Failed,
            RunOutcome::Blocked,
            RunOutcome::Crashed,
            RunOutcome::Timeout,
        ] {
            assert_eq!(RunOutcome::from_str(outcome.as_str()), Some(outcome));
        }
    }
}
