//! Task source - PRD loading, story selection and decomposition.
//!
//! The PRD file format is part of the external contract: field names are
//! bit-exact (`userStories`, `acceptanceCriteria`, `passes`) and writes are
//! atomic from the reader's perspective.

mod issues;

pub use issues::{
    build_graph, extract_criteria, issues_to_prd, ready_issues, topo_layers, Issue, IssueGraph,
};

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::write_atomic;
use crate::types::WorkUnit;

/// Priority assigned to stories that do not declare one.
const DEFAULT_PRIORITY: u32 = 99;

/// A user story in the PRD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default)]
    pub passes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The product requirements document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub user_stories: Vec<UserStory>,
}

impl Prd {
    /// Next story to work on: the first not-passed story with the lowest
    /// priority value (missing priority sorts last). Stable: document order
    /// breaks ties.
    pub fn next_story(&self) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .filter(|s| !s.passes)
            .min_by_key(|s| s.priority.unwrap_or(DEFAULT_PRIORITY))
    }

    pub fn passed_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.passes).count()
    }

    pub fn is_complete(&self) -> bool {
        self.user_stories.iter().all(|s| s.passes)
    }

    fn mark_story(&mut self, id: &str, passed: bool, note: Option<&str>) -> bool {
        let Some(story) = self.user_stories.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        story.passes = passed;
        if let Some(note) = note {
            story.notes = Some(note.to_string());
        }
        true
    }
}

impl UserStory {
    pub fn to_work_unit(&self) -> WorkUnit {
        WorkUnit::Story {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            criteria: self.acceptance_criteria.clone(),
            priority: self.priority,
            passed: self.passes,
            notes: self.notes.clone(),
        }
    }
}

/// Find the PRD file: first existing of `./prd.json`, `./ralph/prd.json`,
/// `./.homer/prd.json`.
pub fn discover_prd(cwd: &Path) -> Option<PathBuf> {
    for candidate in ["prd.json", "ralph/prd.json", ".homer/prd.json"] {
        let path = cwd.join(candidate);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

/// Load a PRD, treating a missing or malformed file as absent.
pub fn load_prd(path: &Path) -> Option<Prd> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(prd) => Some(prd),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed PRD ignored");
            None
        }
    }
}

/// Persist the PRD atomically (temp-write then rename).
pub fn save_prd(path: &Path, prd: &Prd) -> Result<()> {
    let json = serde_json::to_string_pretty(prd)?;
    write_atomic(path, &json)
}

/// Decompose a story into subtasks, one per acceptance criterion.
/// Stories with two or fewer criteria are not decomposed.
pub fn decompose_story(story: &UserStory) -> Option<Vec<WorkUnit>> {
    if story.acceptance_criteria.len() <= 2 {
        return None;
    }
    let total = story.acceptance_criteria.len();
    Some(
        story
            .acceptance_criteria
            .iter()
            .enumerate()
            .map(|(i, criterion)| WorkUnit::Subtask {
                id: format!("{}-{}", story.id, i + 1),
                parent_id: story.id.clone(),
                criterion: criterion.clone(),
                title: format!("{} ({}/{})", story.title, i + 1, total),
            })
            .collect(),
    )
}

/// Mark a story passed on disk.
pub fn mark_story_passed(path: &Path, story_id: &str) -> Result<()> {
    update_story(path, story_id, true, None)
}

/// Mark a story failed on disk, recording the reason in its notes.
pub fn mark_story_failed(path: &Path, story_id: &str, note: &str) -> Result<()> {
    update_story(path, story_id, false, Some(note))
}

fn update_story(path: &Path, story_id: &str, passed: bool, note: Option<&str>) -> Result<()> {
    let Some(mut prd) = load_prd(path) else {
        return Ok(());
    };
    if prd.mark_story(story_id, passed, note) {
        save_prd(path, &prd)?;
        debug!(story = story_id, passed = passed, "story state persisted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_prd() -> Prd {
        Prd {
            project: "shop".into(),
            branch_name: Some("feature/auth".into()),
            description: None,
            user_stories: vec![
                UserStory {
                    id: "US-001".into(),
                    title: "Add auth".into(),
                    description: "Login flow".into(),
                    acceptance_criteria: vec!["a".into(), "b".into()],
                    priority: Some(1),
                    passes: false,
                    notes: None,
                },
                UserStory {
                    id: "US-002".into(),
                    title: "Add cart".into(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: None,
                    passes: false,
                    notes: None,
                },
            ],
        }
    }

    #[test]
    fn test_prd_roundtrip_preserves_fields_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        let prd = sample_prd();
        save_prd(&path, &prd).unwrap();
        let loaded = load_prd(&path).unwrap();

        let a = serde_json::to_value(&prd).unwrap();
        let b = serde_json::to_value(&loaded).unwrap();
        assert_eq!(a, b);

        // Field naming on disk is bit-exact.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"userStories\""));
        assert!(raw.contains("\"acceptanceCriteria\""));
        assert!(raw.contains("\"passes\""));
        assert!(raw.contains("\"branchName\""));
    }

    #[test]
    fn test_malformed_prd_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_prd(&path).is_none());
    }

    #[test]
    fn test_discover_prd_precedence() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ralph")).unwrap();
        fs::write(dir.path().join("ralph/prd.json"), "{}").unwrap();
        assert_eq!(
            discover_prd(dir.path()).unwrap(),
            dir.path().join("ralph/prd.json")
        );
        fs::write(dir.path().join("prd.json"), "{}").unwrap();
        assert_eq!(discover_prd(dir.path()).unwrap(), dir.path().join("prd.json"));
    }

    #[test]
    fn test_next_story_priority_order() {
        let mut prd = sample_prd();
        assert_eq!(prd.next_story().unwrap().id, "US-001");
        prd.user_stories[0].passes = true;
        assert_eq!(prd.next_story().unwrap().id, "US-002");
        prd.user_stories[1].passes = true;
        assert!(prd.next_story().is_none());
        assert!(prd.is_complete());
    }

    #[test]
    fn test_next_story_is_stable_on_ties() {
        let prd = Prd {
            project: "p".into(),
            branch_name: None,
            description: None,
            user_stories: vec![
                UserStory {
                    id: "A".into(),
                    title: "a".into(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: Some(2),
                    passes: false,
                    notes: None,
                },
                UserStory {
                    id: "B".into(),
                    title: "b".into(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: Some(2),
                    passes: false,
                    notes: None,
                },
            ],
        };
        assert_eq!(prd.next_story().unwrap().id, "A");
    }

    #[test]
    fn test_decompose_only_above_two_criteria() {
        let mut story = sample_prd().user_stories[0].clone();
        assert!(decompose_story(&story).is_none());

        story.acceptance_criteria = vec!["a".into(), "b".into(), "c".into()];
        let subtasks = decompose_story(&story).unwrap();
        assert_eq!(subtasks.len(), 3);
        match &subtasks[1] {
            WorkUnit::Subtask {
                id,
                parent_id,
                criterion,
                ..
            } => {
                assert_eq!(id, "US-001-2");
                assert_eq!(parent_id, "US-001");
                assert_eq!(criterion, "b");
            }
            other => panic!("expected subtask, got {:?}", other),
        }
    }

    #[test]
    fn test_mark_story_passed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        save_prd(&path, &sample_prd()).unwrap();

        mark_story_passed(&path, "US-001").unwrap();
        let prd = load_prd(&path).unwrap();
        assert!(prd.user_stories[0].passes);
        assert!(!prd.user_stories[1].passes);

        mark_story_failed(&path, "US-001", "reroute budget exhausted").unwrap();
        let prd = load_prd(&path).unwrap();
        assert!(!prd.user_stories[0].passes);
        assert_eq!(
            prd.user_stories[0].notes.as_deref(),
            Some("reroute budget exhausted")
        );
    }
}
