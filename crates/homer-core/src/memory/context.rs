//! Context assembly - deterministic reads that turn memory rows into the
//! strings injected into agent prompts.
//!
//! Every function here is a pure view over SQL queries; ordering ties are
//! broken by the composite score `0.5 * resolved + 0.5 * confidence`.

use rusqlite::{params, Connection, Result as SqliteResult};

use super::store::MemoryStore;

/// Cap on rules injected by `build_task_memory`.
const MAX_INJECTED_RULES: usize = 8;
/// Solutions shown per file lookup.
const SOLUTIONS_PER_FILE: usize = 3;
/// Solutions shown after merge and rerank.
const SOLUTIONS_SHOWN: usize = 6;
/// Rules in a targeted retry-hint block.
const MAX_HINT_RULES: usize = 5;

#[derive(Debug, Clone)]
struct SolutionView {
    id: i64,
    error_key: String,
    error_text: Option<String>,
    fix_summary: Option<String>,
    confidence: f64,
    resolved: bool,
}

impl SolutionView {
    fn score(&self) -> f64 {
        0.5 * (self.resolved as i64 as f64) + 0.5 * self.confidence
    }

    fn render(&self) -> String {
        let what = self
            .fix_summary
            .as_deref()
            .or(self.error_text.as_deref())
            .unwrap_or("no detail recorded");
        format!(
            "- {} [{}, confidence {:.2}]: {}",
            self.error_key,
            if self.resolved { "fixed before" } else { "unresolved" },
            self.confidence,
            what
        )
    }
}

#[derive(Debug, Clone)]
struct RuleView {
    id: i64,
    scope: String,
    rule: String,
    confidence: f64,
}

impl MemoryStore {
    /// Task-scoped memory injected into a fresh agent's prompt.
    ///
    /// Sections, in order: previous attempts on this task, known errors on
    /// the given files, file dependencies (co-changes), and applicable
    /// rules. As a side effect the ids of the surfaced rules are stored in
    /// the last-injected register, readable via
    /// [`last_injected_rule_ids`](Self::last_injected_rule_ids).
    pub fn build_task_memory(&self, task_key: &str, file_paths: &[String]) -> String {
        let mut sections: Vec<String> = Vec::new();

        let runs = self.runs_for_task(task_key, 5);
        if !runs.is_empty() {
            let mut lines = vec!["PREVIOUS ATTEMPTS ON THIS TASK:".to_string()];
            for run in &runs {
                let detail = run
                    .notes
                    .clone()
                    .or_else(|| {
                        run.errors.first().map(|e| {
                            format!(
                                "{} failed: {}",
                                e.check,
                                e.error_key.as_deref().unwrap_or("unknown")
                            )
                        })
                    })
                    .unwrap_or_else(|| "no notes".to_string());
                lines.push(format!(
                    "- [{}] agent {} after {} attempt(s): {}",
                    run.outcome.as_str(),
                    run.agent_id,
                    run.attempts,
                    detail
                ));
            }
            sections.push(lines.join("\n"));
        }

        let solutions = self.solutions_for(task_key, file_paths);
        if !solutions.is_empty() {
            let mut lines = vec!["KNOWN ERRORS ON THESE FILES:".to_string()];
            for s in solutions.iter().take(SOLUTIONS_SHOWN) {
                lines.push(s.render());
            }
            sections.push(lines.join("\n"));
        }

        let deps = self.cochange_lines(file_paths);
        if !deps.is_empty() {
            let mut lines = vec!["FILE DEPENDENCIES:".to_string()];
            lines.extend(deps);
            sections.push(lines.join("\n"));
        }

        let rules = self.applicable_rules(file_paths, MAX_INJECTED_RULES);
        self.set_last_injected(rules.iter().map(|r| r.id).collect());
        if !rules.is_empty() {
            let mut lines = vec!["PATTERNS FROM MEMORY:".to_string()];
            for rule in &rules {
                lines.push(format!(
                    "- [{} {:.2}] {}",
                    rule.scope, rule.confidence, rule.rule
                ));
            }
            sections.push(lines.join("\n"));
        }

        sections.join("\n\n")
    }

    /// Focused context for a single error key, preferring an exact resolved
    /// match and broadening to the key prefix otherwise.
    pub fn build_error_context(&self, error_key: &str, file_path: Option<&str>) -> String {
        let exact = self
            .with_conn("build_error_context", |conn| {
                query_solutions(
                    conn,
                    "SELECT id, error_key, error_text, fix_summary, confidence, resolved
                     FROM solutions WHERE error_key = ?1
                     ORDER BY resolved DESC, confidence DESC LIMIT 1",
                    params![error_key],
                )
            })
            .unwrap_or_default()
            .into_iter()
            .next();

        if let Some(ref s) = exact {
            if s.resolved {
                if let Some(ref summary) = s.fix_summary {
                    return format!(
                        "This error was fixed before (confidence {:.2}): {}",
                        s.confidence, summary
                    );
                }
            }
        }

        // Broaden to the first two key segments.
        let prefix: String = error_key.splitn(3, ':').take(2).collect::<Vec<_>>().join(":");
        let mut related = self
            .with_conn("build_error_context", |conn| {
                query_solutions(
                    conn,
                    "SELECT id, error_key, error_text, fix_summary, confidence, resolved
                     FROM solutions WHERE error_key LIKE ?1 || '%' AND resolved = 1 AND error_key != ?2
                     ORDER BY confidence DESC LIMIT 2",
                    params![prefix, error_key],
                )
            })
            .unwrap_or_default();
        if let Some(file) = file_path {
            let extra = self
                .with_conn("build_error_context", |conn| {
                    query_solutions(
                        conn,
                        "SELECT id, error_key, error_text, fix_summary, confidence, resolved
                         FROM solutions WHERE error_key LIKE '%' || ?1 || '%' AND resolved = 1
                         ORDER BY confidence DESC LIMIT 2",
                        params![file],
                    )
                })
                .unwrap_or_default();
            for s in extra {
                if !related.iter().any(|r| r.id == s.id) && related.len() < 2 {
                    related.push(s);
                }
            }
        }

        let mut out = String::new();
        if let Some(s) = exact {
            out.push_str(&format!(
                "Seen before (confidence {:.2}, {}): {}\n",
                s.confidence,
                if s.resolved { "resolved" } else { "unresolved" },
                s.error_text.as_deref().unwrap_or("no detail")
            ));
        }
        if !related.is_empty() {
            out.push_str("Related fixes:\n");
            for s in related {
                out.push_str(&s.render());
                out.push('\n');
            }
        }
        out.trim_end().to_string()
    }

    /// Hand-off context for a reroute, voiced as what previous agents tried.
    pub fn build_reroute_context(&self, task_key: &str, file_paths: &[String]) -> String {
        let mut sections: Vec<String> = Vec::new();

        let runs = self.runs_for_task(task_key, 5);
        if !runs.is_empty() {
            let mut lines = vec!["WHAT PREVIOUS AGENTS TRIED:".to_string()];
            for run in &runs {
                let errors: Vec<String> = run
                    .errors
                    .iter()
                    .filter_map(|e| e.error_key.clone())
                    .collect();
                lines.push(format!(
                    "- agent {} made {} attempt(s), ended {}{}{}",
                    run.agent_id,
                    run.attempts,
                    run.outcome.as_str(),
                    if errors.is_empty() {
                        String::new()
                    } else {
                        format!("; hit {}", errors.join(", "))
                    },
                    run.notes
                        .as_deref()
                        .map(|n| format!("; {}", n))
                        .unwrap_or_default()
                ));
            }
            sections.push(lines.join("\n"));
        }

        let solutions = self.solutions_for(task_key, file_paths);
        if !solutions.is_empty() {
            let mut lines = vec!["ERRORS ALREADY ENCOUNTERED HERE:".to_string()];
            for s in solutions.iter().take(SOLUTIONS_SHOWN) {
                lines.push(s.render());
            }
            sections.push(lines.join("\n"));
        }

        let rules = self.applicable_rules(file_paths, MAX_INJECTED_RULES);
        if !rules.is_empty() {
            let mut lines = vec!["PATTERNS FROM MEMORY:".to_string()];
            for rule in &rules {
                lines.push(format!("- {}", rule.rule));
            }
            sections.push(lines.join("\n"));
        }

        sections.join("\n\n")
    }

    /// Targeted hint block for a retry: rules scoped to the files and the
    /// checks behind the given error keys, de-duplicated across scopes.
    pub fn build_rule_hints(&self, file_paths: &[String], error_keys: &[String]) -> String {
        let mut rules: Vec<RuleView> = Vec::new();
        let push_unique = |mut batch: Vec<RuleView>, rules: &mut Vec<RuleView>| {
            batch.retain(|r| !rules.iter().any(|have| have.id == r.id));
            rules.extend(batch);
        };

        for file in file_paths {
            let batch = self.rules_by_scope(&format!("file:{}", file));
            push_unique(batch, &mut rules);
        }
        for key in error_keys {
            let check = key.split(':').next().unwrap_or_default();
            if check.is_empty() {
                continue;
            }
            let batch = self.rules_by_scope(&format!("check:{}", check));
            push_unique(batch, &mut rules);
        }
        push_unique(self.rules_by_scope("repo"), &mut rules);

        if rules.is_empty() {
            return String::new();
        }
        let mut lines = vec!["RULES FROM MEMORY:".to_string()];
        for rule in rules.iter().take(MAX_HINT_RULES) {
            lines.push(format!("- {}", rule.rule));
        }
        lines.join("\n")
    }

    // ============ Internals ============

    /// Per-file top solutions plus task-keyed top solutions, merged,
    /// deduped and reranked by composite score.
    fn solutions_for(&self, task_key: &str, file_paths: &[String]) -> Vec<SolutionView> {
        let mut merged: Vec<SolutionView> = Vec::new();
        for file in file_paths {
            let batch = self
                .with_conn("solutions_for", |conn| {
                    query_solutions(
                        conn,
                        "SELECT id, error_key, error_text, fix_summary, confidence, resolved
                         FROM solutions WHERE error_key LIKE '%' || ?1 || '%'
                         ORDER BY (0.5 * resolved + 0.5 * confidence) DESC, id ASC LIMIT ?2",
                        params![file, SOLUTIONS_PER_FILE as i64],
                    )
                })
                .unwrap_or_default();
            for s in batch {
                if !merged.iter().any(|m| m.id == s.id) {
                    merged.push(s);
                }
            }
        }
        let task_batch = self
            .with_conn("solutions_for", |conn| {
                query_solutions(
                    conn,
                    "SELECT id, error_key, error_text, fix_summary, confidence, resolved
                     FROM solutions WHERE task_key = ?1
                     ORDER BY (0.5 * resolved + 0.5 * confidence) DESC, id ASC LIMIT ?2",
                    params![task_key, SOLUTIONS_PER_FILE as i64],
                )
            })
            .unwrap_or_default();
        for s in task_batch {
            if !merged.iter().any(|m| m.id == s.id) {
                merged.push(s);
            }
        }
        merged.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        merged
    }

    fn cochange_lines(&self, file_paths: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for file in file_paths {
            let cochanges: Option<String> = self
                .with_conn("cochange_lines", |conn| {
                    conn.query_row(
                        "SELECT cochanges FROM file_knowledge WHERE path = ?1",
                        params![file],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })
                })
                .flatten();
            let Some(json) = cochanges else { continue };
            let list: Vec<String> = serde_json::from_str(&json).unwrap_or_default();
            if !list.is_empty() {
                out.push(format!("- {} co-changes with {}", file, list.join(", ")));
            }
        }
        out
    }

    /// File-scoped first, then check-scoped, then repo-wide; each group
    /// ordered by confidence, deduped across groups.
    fn applicable_rules(&self, file_paths: &[String], cap: usize) -> Vec<RuleView> {
        let mut rules: Vec<RuleView> = Vec::new();
        for file in file_paths {
            for rule in self.rules_by_scope(&format!("file:{}", file)) {
                if !rules.iter().any(|r| r.id == rule.id) {
                    rules.push(rule);
                }
            }
        }
        for rule in self.rules_by_scope_prefix("check:") {
            if !rules.iter().any(|r| r.id == rule.id) {
                rules.push(rule);
            }
        }
        for rule in self.rules_by_scope("repo") {
            if !rules.iter().any(|r| r.id == rule.id) {
                rules.push(rule);
            }
        }
        rules.truncate(cap);
        rules
    }

    fn rules_by_scope(&self, scope: &str) -> Vec<RuleView> {
        self.with_conn("rules_by_scope", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scope, rule, confidence FROM repo_rules
                 WHERE scope = ?1 ORDER BY confidence DESC, id ASC",
            )?;
            let rows = stmt.query_map(params![scope], row_to_rule)?;
            rows.collect::<SqliteResult<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    fn rules_by_scope_prefix(&self, prefix: &str) -> Vec<RuleView> {
        self.with_conn("rules_by_scope_prefix", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, scope, rule, confidence FROM repo_rules
                 WHERE scope LIKE ?1 || '%' ORDER BY confidence DESC, id ASC",
            )?;
            let rows = stmt.query_map(params![prefix], row_to_rule)?;
            rows.collect::<SqliteResult<Vec<_>>>()
        })
        .unwrap_or_default()
    }
}

fn query_solutions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> SqliteResult<Vec<SolutionView>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(SolutionView {
            id: row.get(0)?,
            error_key: row.get(1)?,
            error_text: row.get(2)?,
            fix_summary: row.get(3)?,
            confidence: row.get(4)?,
            resolved: row.get::<_, i64>(5)? != 0,
        })
    })?;
    rows.collect()
}

fn row_to_rule(row: &rusqlite::Row) -> SqliteResult<RuleView> {
    Ok(RuleView {
        id: row.get(0)?,
        scope: row.get(1)?,
        rule: row.get(2)?,
        confidence: row.get(3)?,
    })
}
