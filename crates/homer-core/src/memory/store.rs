//! Persistent per-repository memory store.
//!
//! Single SQLite database (WAL journal, foreign keys on) holding file
//! knowledge, error->fix solutions, task-run history, verification
//! episodes, error->file relations and procedural rules.
//!
//! Every public write is a no-op when the store is closed, and write
//! errors are swallowed locally: persistence failures must never reach
//! the supervisor's control flow.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::scoring;
use crate::output::CompactionExtract;
use crate::types::{MemoryStats, RunOutcome};
use crate::verify::{CheckOutcome, VerifyResult};

/// Unordered file pairs must co-occur in at least this many runs before
/// they are linked as co-changes.
pub const COCHANGE_MIN_RUNS: i64 = 2;
/// Cap on co-change links kept per file.
const COCHANGE_CAP: usize = 10;
/// Stored error/output text cap.
const ERROR_TEXT_CAP: usize = 500;
/// task_runs rows kept by consolidation.
const TASK_RUNS_KEEP: i64 = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_knowledge (
  path TEXT PRIMARY KEY,
  imports TEXT,
  exports TEXT,
  cochanges TEXT NOT NULL DEFAULT '[]',
  last_error TEXT,
  last_fix TEXT,
  touch_count INTEGER NOT NULL DEFAULT 0,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS solutions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  error_key TEXT NOT NULL,
  error_text TEXT,
  fix_summary TEXT,
  fix_files TEXT NOT NULL DEFAULT '[]',
  confidence REAL NOT NULL DEFAULT 0.5,
  attempts INTEGER NOT NULL DEFAULT 0,
  resolved INTEGER NOT NULL DEFAULT 0,
  task_key TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_solutions_error ON solutions(error_key);
CREATE INDEX IF NOT EXISTS idx_solutions_conf ON solutions(confidence);

CREATE TABLE IF NOT EXISTS task_runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_key TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  tool_id TEXT,
  outcome TEXT NOT NULL DEFAULT 'running',
  attempts INTEGER NOT NULL DEFAULT 0,
  files_touched TEXT NOT NULL DEFAULT '[]',
  errors TEXT NOT NULL DEFAULT '[]',
  duration_ms INTEGER,
  notes TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_task ON task_runs(task_key);
CREATE INDEX IF NOT EXISTS idx_runs_agent ON task_runs(agent_id);

CREATE TABLE IF NOT EXISTS repo_rules (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  scope TEXT NOT NULL,
  rule TEXT NOT NULL,
  confidence REAL NOT NULL DEFAULT 0.5,
  source TEXT,
  hits INTEGER NOT NULL DEFAULT 0,
  misses INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(scope, rule)
);
CREATE INDEX IF NOT EXISTS idx_rules_scope ON repo_rules(scope);

CREATE TABLE IF NOT EXISTS verification_episodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_key TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  attempt INTEGER NOT NULL,
  passed INTEGER NOT NULL,
  checks TEXT NOT NULL DEFAULT '[]',
  files TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_task ON verification_episodes(task_key);
CREATE INDEX IF NOT EXISTS idx_episodes_agent ON verification_episodes(agent_id);

CREATE TABLE IF NOT EXISTS error_file_relations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  error_key TEXT NOT NULL,
  file_path TEXT NOT NULL,
  relation TEXT NOT NULL DEFAULT 'caused_by',
  occurrences INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  UNIQUE(error_key, file_path, relation)
);
CREATE INDEX IF NOT EXISTS idx_relations_error ON error_file_relations(error_key);
CREATE INDEX IF NOT EXISTS idx_relations_file ON error_file_relations(file_path);
"#;

/// One structured error entry of a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub check: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_key: Option<String>,
    pub output: String,
}

/// A row of `task_runs`.
#[derive(Debug, Clone)]
pub struct TaskRunRow {
    pub id: i64,
    pub task_key: String,
    pub agent_id: String,
    pub tool_id: Option<String>,
    pub outcome: RunOutcome,
    pub attempts: i64,
    pub files_touched: Vec<String>,
    pub errors: Vec<RunError>,
    pub notes: Option<String>,
    pub created_at: String,
}

/// The per-repository memory database.
pub struct MemoryStore {
    inner: Mutex<Option<Connection>>,
    /// Rule ids surfaced by the last `build_task_memory` call.
    last_injected: Mutex<Vec<i64>>,
}

impl MemoryStore {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            inner: Mutex::new(Some(conn)),
            last_injected: Mutex::new(Vec::new()),
        })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            inner: Mutex::new(Some(conn)),
            last_injected: Mutex::new(Vec::new()),
        })
    }

    /// A store that is already closed; every call is a no-op. Used when the
    /// database cannot be opened.
    pub fn disabled() -> Self {
        Self {
            inner: Mutex::new(None),
            last_injected: Mutex::new(Vec::new()),
        }
    }

    fn init(conn: &Connection) -> SqliteResult<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)
    }

    /// Close the store; subsequent calls become no-ops.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Run `f` under the store's serialization point. Returns `None` when
    /// the store is closed or the operation failed (the error is logged,
    /// never propagated).
    pub(crate) fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> SqliteResult<T>,
    ) -> Option<T> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let conn = guard.as_ref()?;
        match f(conn) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(op = op, error = %e, "memory operation failed");
                None
            }
        }
    }

    pub(crate) fn set_last_injected(&self, ids: Vec<i64>) {
        *self
            .last_injected
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = ids;
    }

    /// Rule ids surfaced by the most recent `build_task_memory` call.
    /// Stable across repeated reads until the next build.
    pub fn last_injected_rule_ids(&self) -> Vec<i64> {
        self.last_injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ============ Writes ============

    /// Record one verification attempt: episode, error->file relations,
    /// the task-run upsert, solution attempts and file touches.
    pub fn record_verification(
        &self,
        agent_id: &str,
        task_key: &str,
        result: &VerifyResult,
        files_touched: &[String],
        tool_id: &str,
        attempt: u32,
    ) {
        let now = now();
        self.with_conn("record_verification", |conn| {
            let tx = conn.unchecked_transaction()?;

            let checks_json = serde_json::to_string(&result.results).unwrap_or_else(|_| "[]".into());
            let files_json = json_list(files_touched);
            tx.execute(
                "INSERT INTO verification_episodes (task_key, agent_id, attempt, passed, checks, files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![task_key, agent_id, attempt, result.passed as i64, checks_json, files_json, now],
            )?;

            let failed = result.failed_checks();
            for check in &failed {
                let Some(ref error_key) = check.error_key else { continue };
                for file in files_touched {
                    tx.execute(
                        "INSERT INTO error_file_relations (error_key, file_path, relation, occurrences, created_at)
                         VALUES (?1, ?2, 'caused_by', 1, ?3)
                         ON CONFLICT(error_key, file_path, relation)
                         DO UPDATE SET occurrences = occurrences + 1",
                        params![error_key, file, now],
                    )?;
                }
            }

            let errors: Vec<RunError> = failed
                .iter()
                .map(|c| RunError {
                    check: c.name.clone(),
                    error_key: c.error_key.clone(),
                    output: truncate(&c.output, ERROR_TEXT_CAP),
                })
                .collect();
            let errors_json = serde_json::to_string(&errors).unwrap_or_else(|_| "[]".into());
            let outcome = if result.passed { "passed" } else { "running" };

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM task_runs WHERE agent_id = ?1 AND task_key = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![agent_id, task_key],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                // A passing attempt must not clobber the errors persisted
                // by earlier failing attempts.
                Some(id) if errors.is_empty() => {
                    tx.execute(
                        "UPDATE task_runs SET attempts = attempts + 1, outcome = ?1,
                         files_touched = ?2 WHERE id = ?3",
                        params![outcome, files_json, id],
                    )?;
                }
                Some(id) => {
                    tx.execute(
                        "UPDATE task_runs SET attempts = attempts + 1, outcome = ?1,
                         errors = ?2, files_touched = ?3 WHERE id = ?4",
                        params![outcome, errors_json, files_json, id],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO task_runs (task_key, agent_id, tool_id, outcome, attempts, files_touched, errors, created_at)
                         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)",
                        params![task_key, agent_id, tool_id, outcome, files_json, errors_json, now],
                    )?;
                }
            }

            for error in &errors {
                let Some(ref error_key) = error.error_key else { continue };
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM solutions WHERE error_key = ?1 LIMIT 1",
                        params![error_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE solutions SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
                            params![now, id],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO solutions (error_key, error_text, confidence, attempts, resolved, task_key, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 1, 0, ?4, ?5, ?5)",
                            params![
                                error_key,
                                truncate(&error.output, ERROR_TEXT_CAP),
                                scoring::INITIAL_CONFIDENCE,
                                task_key,
                                now
                            ],
                        )?;
                    }
                }
            }

            let first_failure = failed.first().map(|c| truncate(&c.output, ERROR_TEXT_CAP));
            for file in files_touched {
                tx.execute(
                    "INSERT INTO file_knowledge (path, touch_count, updated_at) VALUES (?1, 1, ?2)
                     ON CONFLICT(path) DO UPDATE SET touch_count = touch_count + 1, updated_at = excluded.updated_at",
                    params![file, now],
                )?;
                if let Some(ref failure) = first_failure {
                    tx.execute(
                        "UPDATE file_knowledge SET last_error = ?1 WHERE path = ?2",
                        params![failure, file],
                    )?;
                }
            }

            tx.commit()
        });
    }

    /// Commit a successful task: resolve solutions, reinforce injected
    /// rules, link co-changes and record a multi-attempt rule when earned.
    pub fn record_success(
        &self,
        agent_id: &str,
        task_key: &str,
        files_touched: &[String],
        verify_attempts: u32,
        injected_rule_ids: &[i64],
    ) {
        let now = now();
        self.with_conn("record_success", |conn| {
            let tx = conn.unchecked_transaction()?;

            let run_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM task_runs WHERE agent_id = ?1 AND task_key = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![agent_id, task_key],
                    |row| row.get(0),
                )
                .optional()?;

            let files_json = json_list(files_touched);
            if let Some(run_id) = run_id {
                tx.execute(
                    "UPDATE task_runs SET outcome = 'passed', attempts = ?1 WHERE id = ?2",
                    params![verify_attempts, run_id],
                )?;
            }

            // Error keys come from the append-only episodes: the run's
            // errors column reflects only the latest attempt, which on this
            // path is the passing one.
            let mut error_keys: Vec<String> = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT checks FROM verification_episodes
                     WHERE agent_id = ?1 AND task_key = ?2 ORDER BY id ASC",
                )?;
                let rows =
                    stmt.query_map(params![agent_id, task_key], |row| row.get::<_, String>(0))?;
                for checks_json in rows {
                    let checks: Vec<CheckOutcome> =
                        serde_json::from_str(&checks_json?).unwrap_or_default();
                    for check in checks {
                        if check.passed {
                            continue;
                        }
                        let Some(key) = check.error_key else { continue };
                        if !error_keys.contains(&key) {
                            error_keys.push(key);
                        }
                    }
                }
            }

            for error_key in &error_keys {
                let summary = format!(
                    "Resolved {} after {} verification attempt(s); fix touched {}",
                    error_key,
                    verify_attempts,
                    if files_touched.is_empty() {
                        "no tracked files".to_string()
                    } else {
                        files_touched.join(", ")
                    }
                );
                tx.execute(
                    "UPDATE solutions SET resolved = 1, fix_files = ?1,
                     confidence = min(confidence + 0.3 * (1.0 - confidence), 1.0),
                     fix_summary = COALESCE(fix_summary, ?2), updated_at = ?3
                     WHERE error_key = ?4",
                    params![files_json, summary, now, error_key],
                )?;
            }
            if !error_keys.is_empty() {
                let fix = format!("fixed {}", error_keys.join(", "));
                for file in files_touched {
                    tx.execute(
                        "UPDATE file_knowledge SET last_fix = ?1, updated_at = ?2 WHERE path = ?3",
                        params![fix, now, file],
                    )?;
                }
            }

            // Laplace update with pre-increment values read in one statement.
            for rule_id in injected_rule_ids {
                tx.execute(
                    "UPDATE repo_rules SET hits = hits + 1,
                     confidence = CAST(hits + 2 AS REAL) / CAST(hits + misses + 3 AS REAL),
                     updated_at = ?1 WHERE id = ?2",
                    params![now, rule_id],
                )?;
            }

            Self::link_cochanges(&tx, files_touched, &now)?;

            if verify_attempts > 1 {
                if let Some(first) = files_touched.first() {
                    let rule = format!(
                        "Changes under {} usually take multiple verification passes ({} attempts here); run the project checks before signaling done",
                        first, verify_attempts
                    );
                    tx.execute(
                        "INSERT INTO repo_rules (scope, rule, confidence, source, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 'verification', ?4, ?4)
                         ON CONFLICT(scope, rule) DO UPDATE SET updated_at = excluded.updated_at",
                        params![
                            format!("file:{}", first),
                            rule,
                            scoring::INITIAL_CONFIDENCE,
                            now
                        ],
                    )?;
                }
            }

            tx.commit()
        });
    }

    /// Commit a failed/blocked/crashed/timed-out task.
    pub fn record_failure(
        &self,
        agent_id: &str,
        task_key: &str,
        reason: &str,
        outcome: RunOutcome,
        files_touched: &[String],
        injected_rule_ids: &[i64],
    ) {
        let now = now();
        self.with_conn("record_failure", |conn| {
            let tx = conn.unchecked_transaction()?;

            let reflection = format!(
                "Task {} ended {}: {}{}",
                task_key,
                outcome.as_str(),
                truncate(reason, ERROR_TEXT_CAP),
                if files_touched.is_empty() {
                    String::new()
                } else {
                    format!(" (files: {})", files_touched.join(", "))
                }
            );

            let run: Option<(i64, String, String)> = tx
                .query_row(
                    "SELECT id, errors, files_touched FROM task_runs
                     WHERE agent_id = ?1 AND task_key = ?2
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![agent_id, task_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (errors_json, run_files_json) = match run {
                Some((id, errors, files)) => {
                    tx.execute(
                        "UPDATE task_runs SET outcome = ?1, notes = ?2 WHERE id = ?3",
                        params![outcome.as_str(), reflection, id],
                    )?;
                    (errors, files)
                }
                None => {
                    tx.execute(
                        "INSERT INTO task_runs (task_key, agent_id, outcome, attempts, files_touched, notes, created_at)
                         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
                        params![task_key, agent_id, outcome.as_str(), json_list(files_touched), reflection, now],
                    )?;
                    ("[]".to_string(), json_list(files_touched))
                }
            };

            // EMA with reward -1 for every unresolved solution touching
            // these files.
            for file in files_touched {
                tx.execute(
                    "UPDATE solutions SET
                     confidence = max(confidence + 0.3 * (-1.0 - confidence), 0.0),
                     updated_at = ?1
                     WHERE resolved = 0 AND error_key LIKE '%' || ?2 || '%'",
                    params![now, file],
                )?;
            }

            for rule_id in injected_rule_ids {
                tx.execute(
                    "UPDATE repo_rules SET misses = misses + 1,
                     confidence = CAST(hits + 1 AS REAL) / CAST(hits + misses + 3 AS REAL),
                     updated_at = ?1 WHERE id = ?2",
                    params![now, rule_id],
                )?;
            }

            tx.execute(
                "DELETE FROM repo_rules WHERE confidence <= 0.05 AND misses > 3",
                [],
            )?;

            if outcome == RunOutcome::Failed {
                let errors: Vec<RunError> =
                    serde_json::from_str(&errors_json).unwrap_or_default();
                let run_files: Vec<String> =
                    serde_json::from_str(&run_files_json).unwrap_or_default();
                let first_file = files_touched.first().or(run_files.first());
                for error in errors.iter().take(2) {
                    let key = error.error_key.as_deref().unwrap_or("unknown");
                    if let Some(file) = first_file {
                        tx.execute(
                            "INSERT INTO repo_rules (scope, rule, confidence, source, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 'failure', ?4, ?4)
                             ON CONFLICT(scope, rule) DO UPDATE SET updated_at = excluded.updated_at",
                            params![
                                format!("file:{}", file),
                                format!("Errors like {} have involved {}; inspect it before larger edits", key, file),
                                scoring::INITIAL_CONFIDENCE,
                                now
                            ],
                        )?;
                    }
                    tx.execute(
                        "INSERT INTO repo_rules (scope, rule, confidence, source, created_at, updated_at)
                         VALUES (?1, ?2, ?3, 'failure', ?4, ?4)
                         ON CONFLICT(scope, rule) DO UPDATE SET updated_at = excluded.updated_at",
                        params![
                            format!("check:{}", error.check),
                            format!("The {} check has failed on this task before; run it locally before signaling done", error.check),
                            scoring::INITIAL_CONFIDENCE,
                            now
                        ],
                    )?;
                }
            }

            tx.commit()
        });
    }

    /// Record what the output processor salvaged before a buffer trim.
    pub fn record_context_compaction(
        &self,
        agent_id: &str,
        task_key: &str,
        extract: &CompactionExtract,
    ) {
        if extract.is_empty() {
            return;
        }
        let now = now();
        self.with_conn("record_context_compaction", |conn| {
            let tx = conn.unchecked_transaction()?;
            for file in &extract.file_paths {
                tx.execute(
                    "INSERT INTO file_knowledge (path, touch_count, updated_at) VALUES (?1, 1, ?2)
                     ON CONFLICT(path) DO UPDATE SET touch_count = touch_count + 1, updated_at = excluded.updated_at",
                    params![file, now],
                )?;
            }
            if let Some(first_error) = extract.errors.first() {
                if let Some(first_file) = extract.file_paths.first() {
                    tx.execute(
                        "UPDATE file_knowledge SET last_error = ?1 WHERE path = ?2",
                        params![truncate(first_error, ERROR_TEXT_CAP), first_file],
                    )?;
                }
            }

            let mut note = String::from("context compaction");
            if let Some(ref approach) = extract.approach_note {
                note.push_str(": ");
                note.push_str(&truncate(approach, ERROR_TEXT_CAP));
            }
            let updated = tx.execute(
                "UPDATE task_runs SET notes = COALESCE(notes || char(10), '') || ?1
                 WHERE id = (SELECT id FROM task_runs WHERE agent_id = ?2 AND task_key = ?3
                             ORDER BY created_at DESC, id DESC LIMIT 1)",
                params![note, agent_id, task_key],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO task_runs (task_key, agent_id, outcome, attempts, notes, created_at)
                     VALUES (?1, ?2, 'running', 0, ?3, ?4)",
                    params![task_key, agent_id, note, now],
                )?;
            }
            tx.commit()
        });
        debug!(agent_id = %agent_id, files = extract.file_paths.len(), "compaction recorded");
    }

    /// Prune low-value rows: weak unresolved solutions, dead rules, and
    /// task-run history beyond the retention window.
    pub fn consolidate(&self) {
        self.with_conn("consolidate", |conn| {
            conn.execute(
                "DELETE FROM solutions WHERE confidence < 0.1 AND resolved = 0",
                [],
            )?;
            conn.execute("DELETE FROM repo_rules WHERE confidence <= 0.05", [])?;
            conn.execute(
                "DELETE FROM task_runs WHERE id NOT IN
                 (SELECT id FROM task_runs ORDER BY created_at DESC, id DESC LIMIT ?1)",
                params![TASK_RUNS_KEEP],
            )?;
            Ok(())
        });
    }

    // ============ Queries ============

    pub fn stats(&self) -> MemoryStats {
        self.with_conn("stats", |conn| {
            let count = |sql: &str| -> SqliteResult<i64> { conn.query_row(sql, [], |r| r.get(0)) };
            Ok(MemoryStats {
                solutions: count("SELECT COUNT(*) FROM solutions")?,
                task_runs: count("SELECT COUNT(*) FROM task_runs")?,
                rules: count("SELECT COUNT(*) FROM repo_rules")?,
                episodes: count("SELECT COUNT(*) FROM verification_episodes")?,
                files: count("SELECT COUNT(*) FROM file_knowledge")?,
            })
        })
        .unwrap_or_default()
    }

    /// Most recent runs for a task, newest first.
    pub fn runs_for_task(&self, task_key: &str, limit: usize) -> Vec<TaskRunRow> {
        self.with_conn("runs_for_task", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_key, agent_id, tool_id, outcome, attempts, files_touched, errors, notes, created_at
                 FROM task_runs WHERE task_key = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![task_key, limit as i64], row_to_run)?;
            rows.collect::<SqliteResult<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    /// Latest run for a task regardless of agent.
    pub fn latest_run(&self, task_key: &str) -> Option<TaskRunRow> {
        self.runs_for_task(task_key, 1).into_iter().next()
    }

    fn link_cochanges(
        tx: &rusqlite::Transaction<'_>,
        files: &[String],
        now: &str,
    ) -> SqliteResult<()> {
        for i in 0..files.len() {
            for j in (i + 1)..files.len() {
                let (a, b) = (&files[i], &files[j]);
                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM task_runs
                     WHERE files_touched LIKE '%' || ?1 || '%' AND files_touched LIKE '%' || ?2 || '%'",
                    params![format!("\"{}\"", a), format!("\"{}\"", b)],
                    |row| row.get(0),
                )?;
                if count < COCHANGE_MIN_RUNS {
                    continue;
                }
                Self::add_cochange(tx, a, b, now)?;
                Self::add_cochange(tx, b, a, now)?;
            }
        }
        Ok(())
    }

    fn add_cochange(
        tx: &rusqlite::Transaction<'_>,
        file: &str,
        other: &str,
        now: &str,
    ) -> SqliteResult<()> {
        let existing: Option<String> = tx
            .query_row(
                "SELECT cochanges FROM file_knowledge WHERE path = ?1",
                params![file],
                |row| row.get(0),
            )
            .optional()?;
        let mut list: Vec<String> = existing
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        if list.iter().any(|c| c == other) || list.len() >= COCHANGE_CAP {
            return Ok(());
        }
        list.push(other.to_string());
        let json = serde_json::to_string(&list).unwrap_or_else(|_| "[]".into());
        tx.execute(
            "INSERT INTO file_knowledge (path, cochanges, touch_count, updated_at) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(path) DO UPDATE SET cochanges = excluded.cochanges, updated_at = excluded.updated_at",
            params![file, json, now],
        )?;
        Ok(())
    }
}

fn row_to_run(row: &rusqlite::Row) -> SqliteResult<TaskRunRow> {
    let outcome_str: String = row.get("outcome")?;
    let files_json: String = row.get("files_touched")?;
    let errors_json: String = row.get("errors")?;
    Ok(TaskRunRow {
        id: row.get("id")?,
        task_key: row.get("task_key")?,
        agent_id: row.get("agent_id")?,
        tool_id: row.get("tool_id")?,
        outcome: RunOutcome::from_str(&outcome_str).unwrap_or(RunOutcome::Running),
        attempts: row.get("attempts")?,
        files_touched: serde_json::from_str(&files_json).unwrap_or_default(),
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        notes: row.get("notes")?,
        created_at: row.get("created_at")?,
    })
}

fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{CheckOutcome, VerifyResult};

    fn failing_result(error_key: &str, output: &str) -> VerifyResult {
        VerifyResult {
            passed: false,
            skipped: false,
            results: vec![CheckOutcome {
                name: "typecheck".into(),
                command: "npm run typecheck".into(),
                passed: false,
                output: output.into(),
                error_key: Some(error_key.into()),
            }],
        }
    }

    fn passing_result() -> VerifyResult {
        VerifyResult {
            passed: true,
            skipped: false,
            results: vec![CheckOutcome {
                name: "typecheck".into(),
                command: "npm run typecheck".into(),
                passed: true,
                output: String::new(),
                error_key: None,
            }],
        }
    }

    #[test]
    fn test_record_verification_creates_run_and_episode() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["lib/auth.js".to_string()];
        store.record_verification(
            "agent-1",
            "story:US-001",
            &failing_result("typecheck:TS2322:lib/auth.js", "TS2322 lib/auth.js"),
            &files,
            "claude",
            1,
        );

        let run = store.latest_run("story:US-001").unwrap();
        assert_eq!(run.attempts, 1);
        assert_eq!(run.outcome, RunOutcome::Running);
        assert_eq!(run.errors.len(), 1);

        let stats = store.stats();
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.solutions, 1);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn test_attempts_track_episodes() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["lib/auth.js".to_string()];
        for attempt in 1..=3u32 {
            store.record_verification(
                "agent-1",
                "story:US-001",
                &failing_result("typecheck:TS2322:lib/auth.js", "TS2322"),
                &files,
                "claude",
                attempt,
            );
        }
        let run = store.latest_run("story:US-001").unwrap();
        assert_eq!(run.attempts, 3);
        assert_eq!(store.stats().episodes, 3);
    }

    #[test]
    fn test_success_resolves_solution_with_single_ema_step() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["lib/auth.js".to_string()];
        store.record_verification(
            "agent-1",
            "story:US-001",
            &failing_result("typecheck:TS2322:lib/auth.js", "TS2322 lib/auth.js"),
            &files,
            "claude",
            1,
        );
        store.record_verification(
            "agent-1",
            "story:US-001",
            &passing_result(),
            &files,
            "claude",
            2,
        );
        store.record_success("agent-1", "story:US-001", &files, 2, &[]);

        let (resolved, confidence, fix_summary): (i64, f64, Option<String>) = store
            .with_conn("test", |conn| {
                conn.query_row(
                    "SELECT resolved, confidence, fix_summary FROM solutions WHERE error_key = ?1",
                    params!["typecheck:TS2322:lib/auth.js"],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
            })
            .unwrap();
        assert_eq!(resolved, 1);
        // Single EMA step from 0.5: 0.5 + 0.3 * (1 - 0.5) = 0.65
        assert!((confidence - 0.65).abs() < 1e-9, "confidence = {}", confidence);
        assert!(fix_summary.unwrap().contains("lib/auth.js"));

        let run = store.latest_run("story:US-001").unwrap();
        assert_eq!(run.outcome, RunOutcome::Passed);
        assert_eq!(run.attempts, 2);
    }

    #[test]
    fn test_success_does_not_overwrite_existing_summary() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["lib/auth.js".to_string()];
        store.record_verification(
            "agent-1",
            "story:A",
            &failing_result("typecheck:TS1:lib/auth.js", "x"),
            &files,
            "claude",
            1,
        );
        store
            .with_conn("seed", |conn| {
                conn.execute(
                    "UPDATE solutions SET fix_summary = 'original summary'",
                    [],
                )
            })
            .unwrap();
        store.record_success("agent-1", "story:A", &files, 1, &[]);
        let summary: String = store
            .with_conn("test", |conn| {
                conn.query_row("SELECT fix_summary FROM solutions", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(summary, "original summary");
    }

    #[test]
    fn test_failure_decays_unresolved_solutions() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["lib/auth.js".to_string()];
        store.record_verification(
            "agent-1",
            "story:US-001",
            &failing_result("typecheck:TS2322:lib/auth.js", "TS2322"),
            &files,
            "claude",
            1,
        );
        store.record_failure(
            "agent-1",
            "story:US-001",
            "exhausted verify budget",
            RunOutcome::Failed,
            &files,
            &[],
        );

        let confidence: f64 = store
            .with_conn("test", |conn| {
                conn.query_row("SELECT confidence FROM solutions", [], |r| r.get(0))
            })
            .unwrap();
        // 0.5 + 0.3 * (-1 - 0.5) = 0.05
        assert!((confidence - 0.05).abs() < 1e-9);

        let run = store.latest_run("story:US-001").unwrap();
        assert_eq!(run.outcome, RunOutcome::Failed);
        assert!(run.notes.unwrap().contains("exhausted verify budget"));
    }

    #[test]
    fn test_failure_derives_rules() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["src/api/users.ts".to_string()];
        store.record_verification(
            "agent-1",
            "story:US-002",
            &failing_result("typecheck:TS2551:src/api/users.ts", "TS2551"),
            &files,
            "claude",
            1,
        );
        store.record_failure(
            "agent-1",
            "story:US-002",
            "max verify attempts",
            RunOutcome::Failed,
            &files,
            &[],
        );

        let scopes: Vec<String> = store
            .with_conn("test", |conn| {
                let mut stmt = conn.prepare("SELECT scope FROM repo_rules ORDER BY scope")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect::<SqliteResult<Vec<_>>>()
            })
            .unwrap();
        assert!(scopes.contains(&"check:typecheck".to_string()));
        assert!(scopes.contains(&"file:src/api/users.ts".to_string()));
    }

    #[test]
    fn test_rule_laplace_updates() {
        let store = MemoryStore::in_memory().unwrap();
        let rule_id = store
            .with_conn("seed", |conn| {
                conn.execute(
                    "INSERT INTO repo_rules (scope, rule, confidence, created_at, updated_at)
                     VALUES ('repo', 'always run checks', 0.5, '2026-01-01', '2026-01-01')",
                    [],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .unwrap();

        store.record_success("a", "story:X", &[], 1, &[rule_id]);
        let (hits, conf): (i64, f64) = store
            .with_conn("test", |conn| {
                conn.query_row(
                    "SELECT hits, confidence FROM repo_rules WHERE id = ?1",
                    params![rule_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(hits, 1);
        // (1+1)/(1+0+2) = 2/3
        assert!((conf - 2.0 / 3.0).abs() < 1e-9);

        store.record_failure("a", "story:X", "r", RunOutcome::Blocked, &[], &[rule_id]);
        let (misses, conf): (i64, f64) = store
            .with_conn("test", |conn| {
                conn.query_row(
                    "SELECT misses, confidence FROM repo_rules WHERE id = ?1",
                    params![rule_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(misses, 1);
        // (1+1)/(1+1+2) = 0.5
        assert!((conf - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_dead_rules_pruned_on_failure_commit() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .with_conn("seed", |conn| {
                conn.execute(
                    "INSERT INTO repo_rules (scope, rule, confidence, hits, misses, created_at, updated_at)
                     VALUES ('repo', 'dead rule', 0.02, 0, 5, '2026-01-01', '2026-01-01')",
                    [],
                )
            })
            .unwrap();
        store.record_failure("a", "story:X", "r", RunOutcome::Failed, &[], &[]);
        assert_eq!(store.stats().rules, 0);
    }

    #[test]
    fn test_relations_unique_and_monotonic() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["src/a.ts".to_string()];
        for attempt in 1..=2u32 {
            store.record_verification(
                "agent-1",
                "story:X",
                &failing_result("typecheck:TS1:src/a.ts", "x"),
                &files,
                "claude",
                attempt,
            );
        }
        let (count, occurrences): (i64, i64) = store
            .with_conn("test", |conn| {
                conn.query_row(
                    "SELECT COUNT(*), MAX(occurrences) FROM error_file_relations",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(occurrences, 2);
    }

    #[test]
    fn test_cochanges_linked_after_min_runs() {
        let store = MemoryStore::in_memory().unwrap();
        let files = vec!["src/a.ts".to_string(), "src/b.ts".to_string()];
        // Two distinct runs touching the same pair.
        for agent in ["agent-1", "agent-2"] {
            store.record_verification(
                agent,
                &format!("story:{}", agent),
                &passing_result(),
                &files,
                "claude",
                1,
            );
        }
        store.record_success("agent-2", "story:agent-2", &files, 1, &[]);

        let cochanges: String = store
            .with_conn("test", |conn| {
                conn.query_row(
                    "SELECT cochanges FROM file_knowledge WHERE path = 'src/a.ts'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert!(cochanges.contains("src/b.ts"));
    }

    #[test]
    fn test_consolidate_prunes() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .with_conn("seed", |conn| {
                conn.execute(
                    "INSERT INTO solutions (error_key, confidence, resolved, created_at, updated_at)
                     VALUES ('x:y', 0.05, 0, '2026-01-01', '2026-01-01')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO solutions (error_key, confidence, resolved, created_at, updated_at)
                     VALUES ('kept:key', 0.05, 1, '2026-01-01', '2026-01-01')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO repo_rules (scope, rule, confidence, created_at, updated_at)
                     VALUES ('repo', 'weak', 0.01, '2026-01-01', '2026-01-01')",
                    [],
                )
            })
            .unwrap();
        store.consolidate();
        let stats = store.stats();
        assert_eq!(stats.solutions, 1);
        assert_eq!(stats.rules, 0);
    }

    #[test]
    fn test_closed_store_is_noop() {
        let store = MemoryStore::in_memory().unwrap();
        store.close();
        assert!(!store.is_open());
        store.record_success("a", "story:X", &[], 1, &[]);
        store.consolidate();
        assert_eq!(store.stats(), MemoryStats::default());
    }
}
