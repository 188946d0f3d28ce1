//! Scheduler - selects the next work unit and enforces budgets.
//!
//! Selection order: pending sub-task of an already-decomposed story, then
//! the next PRD story (decomposing it when it carries more than two
//! acceptance criteria), then the next ready issue. The scheduler also
//! owns the claim set: a (kind, key) held by an active agent is never
//! handed out twice.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::tasks::{decompose_story, ready_issues, Issue, Prd};
use crate::types::WorkUnit;

/// Verification retries allowed per agent before it is rerouted.
pub const MAX_VERIFY: u32 = 5;
/// Reroutes allowed per task (inclusive); the third attempt at a task is
/// the last one.
pub const MAX_REROUTES: u32 = 2;

/// A selected work unit plus the completed-sibling criteria carried along
/// for prompt construction.
#[derive(Debug, Clone)]
pub struct NextWork {
    pub unit: WorkUnit,
    pub completed_siblings: Vec<String>,
}

#[derive(Debug, Default)]
struct SubtaskLedger {
    subtasks: Vec<WorkUnit>,
    completed: HashSet<String>,
}

impl SubtaskLedger {
    fn completed_criteria(&self) -> Vec<String> {
        self.subtasks
            .iter()
            .filter_map(|s| match s {
                WorkUnit::Subtask { id, criterion, .. } if self.completed.contains(id) => {
                    Some(criterion.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.subtasks.iter().all(|s| match s {
            WorkUnit::Subtask { id, .. } => self.completed.contains(id),
            _ => true,
        })
    }
}

/// Work selection and budget bookkeeping. Stateless apart from the subtask
/// ledger, the claim set and the per-task reroute counters.
#[derive(Debug, Default)]
pub struct Scheduler {
    /// Decomposed stories, in decomposition order.
    ledgers: Vec<(String, SubtaskLedger)>,
    reroute_counts: HashMap<String, u32>,
    failed: HashSet<String>,
    claimed: HashSet<String>,
    completed_issues: HashSet<u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next unit of work, claiming it. Returns `None` when every
    /// source is exhausted.
    pub fn next_work(&mut self, prd: Option<&Prd>, issues: &[Issue]) -> Option<NextWork> {
        // 1. Pending sub-task of an already-decomposed story.
        for idx in 0..self.ledgers.len() {
            let (parent, ledger) = &self.ledgers[idx];
            if ledger.is_complete() || self.failed.contains(&format!("story:{}", parent)) {
                continue;
            }
            let candidate = ledger.subtasks.iter().find(|s| {
                let key = s.task_key();
                match s {
                    WorkUnit::Subtask { id, .. } => {
                        !ledger.completed.contains(id)
                            && !self.claimed.contains(&key)
                            && !self.failed.contains(&key)
                    }
                    _ => false,
                }
            });
            if let Some(unit) = candidate.cloned() {
                let siblings = self.ledgers[idx].1.completed_criteria();
                self.claim(&unit.task_key());
                return Some(NextWork {
                    unit,
                    completed_siblings: siblings,
                });
            }
        }

        // 2. Next PRD story, decomposing when warranted. Stories win over
        // issues whenever both are ready.
        if let Some(prd) = prd {
            let mut stories: Vec<_> = prd.user_stories.iter().filter(|s| !s.passes).collect();
            stories.sort_by_key(|s| s.priority.unwrap_or(99));
            for story in stories {
                let key = format!("story:{}", story.id);
                if self.claimed.contains(&key)
                    || self.failed.contains(&key)
                    || self.ledgers.iter().any(|(p, _)| p == &story.id)
                {
                    continue;
                }
                if let Some(subtasks) = decompose_story(story) {
                    info!(story = %story.id, count = subtasks.len(), "story decomposed");
                    let first = subtasks[0].clone();
                    self.ledgers.push((
                        story.id.clone(),
                        SubtaskLedger {
                            subtasks,
                            completed: HashSet::new(),
                        },
                    ));
                    self.claim(&first.task_key());
                    return Some(NextWork {
                        unit: first,
                        completed_siblings: Vec::new(),
                    });
                }
                self.claim(&key);
                return Some(NextWork {
                    unit: story.to_work_unit(),
                    completed_siblings: Vec::new(),
                });
            }
        }

        // 3. Next ready issue.
        for issue in ready_issues(issues, &self.completed_issues) {
            let key = format!("issue:{}", issue.number);
            if self.claimed.contains(&key) || self.failed.contains(&key) {
                continue;
            }
            self.claim(&key);
            return Some(NextWork {
                unit: WorkUnit::Issue {
                    number: issue.number,
                    title: issue.title.clone(),
                    body: issue.body.clone(),
                    labels: issue.labels.clone(),
                },
                completed_siblings: Vec::new(),
            });
        }

        None
    }

    pub fn claim(&mut self, key: &str) {
        debug!(task = key, "claimed");
        self.claimed.insert(key.to_string());
    }

    pub fn release(&mut self, key: &str) {
        self.claimed.remove(key);
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.claimed.contains(key)
    }

    /// Mark a subtask completed and release its claim. Returns `true` when
    /// every sibling is complete and the parent story can be marked passed.
    pub fn complete_subtask(&mut self, parent_id: &str, subtask_id: &str) -> bool {
        self.release(&format!("story:{}", subtask_id));
        let Some((_, ledger)) = self.ledgers.iter_mut().find(|(p, _)| p == parent_id) else {
            return false;
        };
        ledger.completed.insert(subtask_id.to_string());
        ledger.is_complete()
    }

    pub fn complete_issue(&mut self, number: u64) {
        self.release(&format!("issue:{}", number));
        self.completed_issues.insert(number);
    }

    // ============ Budgets ============

    pub fn reroute_count(&self, key: &str) -> u32 {
        self.reroute_counts.get(key).copied().unwrap_or(0)
    }

    /// Whether the task may still be handed to a replacement agent.
    pub fn can_reroute(&self, key: &str) -> bool {
        !self.failed.contains(key) && self.reroute_count(key) < MAX_REROUTES
    }

    /// Count a reroute; returns the new count.
    pub fn note_reroute(&mut self, key: &str) -> u32 {
        let count = self.reroute_counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Permanently fail a task: it is never selected again.
    pub fn mark_failed(&mut self, key: &str) {
        self.release(key);
        self.failed.insert(key.to_string());
    }

    pub fn is_failed(&self, key: &str) -> bool {
        self.failed.contains(key)
    }

    /// How many replacement agents auto-spawn should start.
    pub fn replacements_needed(&self, active: usize, max_agents: usize) -> usize {
        max_agents.saturating_sub(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::UserStory;

    fn prd_with(stories: Vec<UserStory>) -> Prd {
        Prd {
            project: "p".into(),
            branch_name: None,
            description: None,
            user_stories: stories,
        }
    }

    fn story(id: &str, criteria: usize, priority: u32) -> UserStory {
        UserStory {
            id: id.into(),
            title: format!("story {}", id),
            description: String::new(),
            acceptance_criteria: (0..criteria).map(|i| format!("criterion {}", i)).collect(),
            priority: Some(priority),
            passes: false,
            notes: None,
        }
    }

    #[test]
    fn test_simple_story_claim_exclusivity() {
        let prd = prd_with(vec![story("US-001", 2, 1)]);
        let mut sched = Scheduler::new();

        let first = sched.next_work(Some(&prd), &[]).unwrap();
        assert_eq!(first.unit.task_key(), "story:US-001");
        // Claimed: a second selection must not hand out the same unit.
        assert!(sched.next_work(Some(&prd), &[]).is_none());

        sched.release("story:US-001");
        assert!(sched.next_work(Some(&prd), &[]).is_some());
    }

    #[test]
    fn test_decomposition_and_aggregation() {
        let prd = prd_with(vec![story("US-003", 3, 1)]);
        let mut sched = Scheduler::new();

        let first = sched.next_work(Some(&prd), &[]).unwrap();
        assert_eq!(first.unit.task_key(), "story:US-003-1");
        assert!(first.completed_siblings.is_empty());

        let second = sched.next_work(Some(&prd), &[]).unwrap();
        assert_eq!(second.unit.task_key(), "story:US-003-2");

        assert!(!sched.complete_subtask("US-003", "US-003-1"));
        let third = sched.next_work(Some(&prd), &[]).unwrap();
        assert_eq!(third.unit.task_key(), "story:US-003-3");
        assert_eq!(third.completed_siblings, vec!["criterion 0".to_string()]);

        assert!(!sched.complete_subtask("US-003", "US-003-2"));
        // Parent is complete only after the third subtask.
        assert!(sched.complete_subtask("US-003", "US-003-3"));
    }

    #[test]
    fn test_story_preferred_over_issue() {
        let prd = prd_with(vec![story("US-001", 1, 5)]);
        let issues = vec![Issue {
            number: 9,
            title: "urgent".into(),
            body: String::new(),
            labels: vec!["priority:1".into()],
        }];
        let mut sched = Scheduler::new();
        let next = sched.next_work(Some(&prd), &issues).unwrap();
        assert_eq!(next.unit.task_key(), "story:US-001");

        // With the story claimed, the issue is next.
        let next = sched.next_work(Some(&prd), &issues).unwrap();
        assert_eq!(next.unit.task_key(), "issue:9");
    }

    #[test]
    fn test_issue_completion_releases_and_excludes() {
        let issues = vec![
            Issue {
                number: 1,
                title: "a".into(),
                body: String::new(),
                labels: vec![],
            },
            Issue {
                number: 2,
                title: "b".into(),
                body: "depends on #1".into(),
                labels: vec![],
            },
        ];
        let mut sched = Scheduler::new();
        let first = sched.next_work(None, &issues).unwrap();
        assert_eq!(first.unit.task_key(), "issue:1");
        // Issue 2 is blocked until 1 completes.
        assert!(sched.next_work(None, &issues).is_none());

        sched.complete_issue(1);
        let second = sched.next_work(None, &issues).unwrap();
        assert_eq!(second.unit.task_key(), "issue:2");
    }

    #[test]
    fn test_reroute_budget_is_inclusive() {
        let mut sched = Scheduler::new();
        let key = "story:US-001";
        assert!(sched.can_reroute(key));
        assert_eq!(sched.note_reroute(key), 1);
        assert!(sched.can_reroute(key));
        assert_eq!(sched.note_reroute(key), 2);
        // Two reroutes spent: the third attempt is running, no fourth.
        assert!(!sched.can_reroute(key));
    }

    #[test]
    fn test_failed_task_never_selected_again() {
        let prd = prd_with(vec![story("US-001", 1, 1), story("US-002", 1, 2)]);
        let mut sched = Scheduler::new();
        sched.mark_failed("story:US-001");
        let next = sched.next_work(Some(&prd), &[]).unwrap();
        assert_eq!(next.unit.task_key(), "story:US-002");
        assert!(sched.is_failed("story:US-001"));
    }

    #[test]
    fn test_replacements_needed() {
        let sched = Scheduler::new();
        assert_eq!(sched.replacements_needed(1, 3), 2);
        assert_eq!(sched.replacements_needed(3, 3), 0);
        assert_eq!(sched.replacements_needed(5, 3), 0);
    }
}
