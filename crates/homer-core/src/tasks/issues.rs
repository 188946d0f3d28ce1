//! Issue-tracker import: mapping issues to PRD stories and layering their
//! dependency graph.
//!
//! The tracker client itself is external; this module only consumes the
//! issue list it produces.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Prd, UserStory};

/// An imported tracker issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

static CHECKBOX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*-\s*\[\s?\]\s*(.+?)\s*$").unwrap());
static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^#{1,6}\s*(?:acceptance criteria|requirements|tasks)\s*$").unwrap()
});
static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*]\s+(.+?)\s*$").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s").unwrap());
static DEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:depends[\s-]on|blocked\s+by)\s*:?\s*#(\d+)").unwrap());
static PRIORITY_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:priority:\s*|p)(\d+)$").unwrap());

/// Acceptance criteria for an issue, in this order of preference:
/// unchecked markdown checkboxes, bullets under an "Acceptance Criteria" /
/// "Requirements" / "Tasks" heading, or the issue title plus an implicit
/// typecheck criterion.
pub fn extract_criteria(issue: &Issue) -> Vec<String> {
    let boxes: Vec<String> = CHECKBOX_RE
        .captures_iter(&issue.body)
        .map(|c| c[1].to_string())
        .collect();
    if !boxes.is_empty() {
        return boxes;
    }

    if let Some(m) = SECTION_RE.find(&issue.body) {
        let rest = &issue.body[m.end()..];
        let section = match HEADING_RE.find(rest) {
            Some(next) => &rest[..next.start()],
            None => rest,
        };
        let bullets: Vec<String> = BULLET_RE
            .captures_iter(section)
            .map(|c| c[1].to_string())
            .collect();
        if !bullets.is_empty() {
            return bullets;
        }
    }

    vec![issue.title.clone(), "typecheck passes".to_string()]
}

/// Numeric priority from labels like `priority:2` or `P1`; missing sorts
/// last.
pub fn issue_priority(issue: &Issue) -> u32 {
    issue
        .labels
        .iter()
        .find_map(|label| {
            PRIORITY_LABEL_RE
                .captures(label.trim())
                .and_then(|c| c[1].parse().ok())
        })
        .unwrap_or(99)
}

/// Map an issue list into an equivalent PRD.
pub fn issues_to_prd(issues: &[Issue], repo: &str) -> Prd {
    let stories = issues
        .iter()
        .map(|issue| UserStory {
            id: format!("GH-{}", issue.number),
            title: issue.title.clone(),
            description: issue.body.clone(),
            acceptance_criteria: extract_criteria(issue),
            priority: Some(issue_priority(issue)),
            passes: false,
            notes: None,
        })
        .collect();
    Prd {
        project: if repo.is_empty() {
            "imported-issues".to_string()
        } else {
            repo.to_string()
        },
        branch_name: None,
        description: None,
        user_stories: stories,
    }
}

/// Dependency graph over issue numbers. Edges point from a dependency to
/// its dependents.
#[derive(Debug, Clone, Default)]
pub struct IssueGraph {
    /// issue -> issues it depends on
    pub deps: HashMap<u64, Vec<u64>>,
    pub nodes: Vec<u64>,
}

/// Parse `Depends-on: #N` / `blocked by #N` references out of issue bodies.
/// References to unknown issues are dropped.
pub fn build_graph(issues: &[Issue]) -> IssueGraph {
    let known: HashSet<u64> = issues.iter().map(|i| i.number).collect();
    let mut deps: HashMap<u64, Vec<u64>> = HashMap::new();
    for issue in issues {
        let mut list: Vec<u64> = DEP_RE
            .captures_iter(&issue.body)
            .filter_map(|c| c[1].parse().ok())
            .filter(|n| known.contains(n) && *n != issue.number)
            .collect();
        list.dedup();
        deps.insert(issue.number, list);
    }
    IssueGraph {
        deps,
        nodes: issues.iter().map(|i| i.number).collect(),
    }
}

/// Layer the graph: every node lands in the first layer where all its
/// dependencies are already placed, so edges always point strictly
/// forward. Nodes stuck in a cycle end up together in a final layer.
pub fn topo_layers(graph: &IssueGraph) -> Vec<Vec<u64>> {
    let mut placed: HashSet<u64> = HashSet::new();
    let mut remaining: Vec<u64> = graph.nodes.clone();
    let mut layers: Vec<Vec<u64>> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<u64> = remaining
            .iter()
            .copied()
            .filter(|n| {
                graph
                    .deps
                    .get(n)
                    .map(|d| d.iter().all(|dep| placed.contains(dep)))
                    .unwrap_or(true)
            })
            .collect();
        if ready.is_empty() {
            // Cycle: emit the rest as one layer so the union is preserved.
            layers.push(remaining.clone());
            break;
        }
        for n in &ready {
            placed.insert(*n);
        }
        remaining.retain(|n| !placed.contains(n));
        layers.push(ready);
    }
    layers
}

/// Issues whose dependencies are all completed, not yet completed
/// themselves, sorted by (priority, number).
pub fn ready_issues<'a>(issues: &'a [Issue], completed: &HashSet<u64>) -> Vec<&'a Issue> {
    let graph = build_graph(issues);
    let mut ready: Vec<&Issue> = issues
        .iter()
        .filter(|i| !completed.contains(&i.number))
        .filter(|i| {
            graph
                .deps
                .get(&i.number)
                .map(|d| d.iter().all(|dep| completed.contains(dep)))
                .unwrap_or(true)
        })
        .collect();
    ready.sort_by_key(|i| (issue_priority(i), i.number));
    ready
}
