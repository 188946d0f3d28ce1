//! Agent supervisor - the coordinator.
//!
//! Owns the agent registry and drives the verify/reroute state machine:
//! PTY lifecycle, signal handling, the verification loop with its retry
//! budget, reroutes with their per-task budget, memory commits and
//! session persistence. All registry mutations happen through methods on
//! this type; PTY callbacks are funneled here by per-agent pump tasks.

pub mod feedback;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Mutex as TokioMutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{now_ms, Event, EventBus};
use crate::memory::MemoryStore;
use crate::output::{OutputBuffer, Signal};
use crate::paths::{append_line, write_atomic, HomerPaths};
use crate::pty::{self, PtyEvent, PtyHandle, SpawnSpec};
use crate::sched::{NextWork, Scheduler, MAX_REROUTES, MAX_VERIFY};
use crate::tasks::{self, Issue};
use crate::tools::{ToolDescriptor, ToolSpawnOptions};
use crate::types::{
    AgentSnapshot, AgentStatus, PrdSummary, StateSnapshot, VerifyHistoryEntry, WorkUnit,
};
use crate::verify::{self, VerifyResult};

use self::session::{SessionAgent, SessionOpts, SessionSnapshot, SNAPSHOT_TAIL_LINES};

/// Delay between entering `verifying` and running the checks; keeps UI
/// events ordered.
const VERIFY_DELAY: Duration = Duration::from_millis(100);
/// Delay before a crashed agent's replacement is rerouted.
const CRASH_REROUTE_DELAY: Duration = Duration::from_secs(1);
/// Consolidate memory every this many done agents.
const CONSOLIDATE_EVERY: u64 = 10;
/// Files extracted from an agent's buffer for memory commits.
const MAX_FILES_TRACKED: usize = 20;

const READY_GRACE: Duration = Duration::from_millis(1500);
const READY_POLL: Duration = Duration::from_millis(200);
const READY_CAP: Duration = Duration::from_secs(8);
const READY_PROMPT_CHARS: [char; 5] = ['>', '$', '?', '❯', '›'];

/// Options fixed for the run.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub repo: String,
    pub cwd: PathBuf,
    pub max_agents: usize,
    pub auto: bool,
    pub label: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// One supervised agent.
pub struct AgentRecord {
    pub id: String,
    pub tool_id: String,
    pub status: AgentStatus,
    pub verify_attempts: u32,
    pub task: Option<WorkUnit>,
    pub completed_siblings: Vec<String>,
    pub buffer: OutputBuffer,
    pub verify_history: Vec<VerifyHistoryEntry>,
    pub injected_rule_ids: Vec<i64>,
    pub started_at: i64,
    handle: Option<Arc<PtyHandle>>,
}

impl AgentRecord {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            tool: self.tool_id.clone(),
            status: self.status,
            task: self.task.as_ref().map(|t| t.task_key()),
            task_title: self.task.as_ref().map(|t| t.title().to_string()),
            verify_attempts: self.verify_attempts,
            started_at: self.started_at,
        }
    }
}

struct RerouteHandoff {
    prior_attempts: u32,
    last_failure: String,
    digests: Vec<String>,
    context: String,
}

/// The coordinator. Construct with [`Supervisor::new`] and share via `Arc`.
pub struct Supervisor {
    opts: SupervisorOptions,
    paths: HomerPaths,
    agents: RwLock<HashMap<String, AgentRecord>>,
    scheduler: TokioMutex<Scheduler>,
    memory: Arc<MemoryStore>,
    bus: EventBus,
    tool: StdMutex<ToolDescriptor>,
    prd_path: StdMutex<Option<PathBuf>>,
    issues: StdMutex<Vec<Issue>>,
    session_id: String,
    agent_counter: AtomicU64,
    done_count: AtomicU64,
}

impl Supervisor {
    pub fn new(
        opts: SupervisorOptions,
        tool: ToolDescriptor,
        memory: Arc<MemoryStore>,
        bus: EventBus,
        paths: HomerPaths,
    ) -> Arc<Self> {
        let prd_path = tasks::discover_prd(&opts.cwd);
        if let Some(ref p) = prd_path {
            info!(path = %p.display(), "PRD found");
        }
        Arc::new(Self {
            opts,
            paths,
            agents: RwLock::new(HashMap::new()),
            scheduler: TokioMutex::new(Scheduler::new()),
            memory,
            bus,
            tool: StdMutex::new(tool),
            prd_path: StdMutex::new(prd_path),
            issues: StdMutex::new(Vec::new()),
            session_id: format!(
                "sess-{}-{}",
                Utc::now().timestamp_millis(),
                &Uuid::new_v4().to_string()[..8]
            ),
            agent_counter: AtomicU64::new(0),
            done_count: AtomicU64::new(0),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Replace the issue backlog (imported by the external tracker client).
    pub fn set_issues(&self, issues: Vec<Issue>) {
        *self.issues.lock().unwrap_or_else(|e| e.into_inner()) = issues;
    }

    /// Switch the active tool for future spawns.
    pub fn set_tool(&self, tool: ToolDescriptor) {
        info!(tool = %tool.id, "active tool changed");
        *self.tool.lock().unwrap_or_else(|e| e.into_inner()) = tool;
    }

    pub fn active_tool(&self) -> ToolDescriptor {
        self.tool.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ============ Startup / shutdown ============

    /// In auto mode, fill up to the concurrency target.
    pub async fn start(self: &Arc<Self>) {
        if self.opts.auto {
            self.fill_capacity().await;
        }
    }

    /// Spawn replacements until the concurrency target is met or the task
    /// sources run dry.
    pub async fn fill_capacity(self: &Arc<Self>) {
        loop {
            let active = self.active_count().await;
            if self.opts.max_agents <= active {
                return;
            }
            match self.spawn_next().await {
                Some(id) => debug!(agent = %id, "replacement spawned"),
                None => return,
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status.is_active())
            .count()
    }

    /// Kill every child, flush memory and persist the session snapshot.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        if let Err(e) = self.save_session().await {
            warn!(error = %e, "session save failed");
        }
        let agents = self.agents.read().await;
        for agent in agents.values() {
            if let Some(ref handle) = agent.handle {
                handle.kill();
            }
        }
        drop(agents);
        self.memory.close();
    }

    // ============ Spawning ============

    /// Draw the next work unit and spawn an agent for it.
    pub async fn spawn_next(self: &Arc<Self>) -> Option<String> {
        let work = {
            let prd = self.load_prd();
            let issues = self.issues.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let mut sched = self.scheduler.lock().await;
            sched.next_work(prd.as_ref(), &issues)
        };
        let work = work?;
        let key = work.unit.task_key();
        match self.spawn_agent(Some(work), None, None, None).await {
            Ok(id) => Some(id),
            Err(e) => {
                self.scheduler.lock().await.release(&key);
                self.bus.error(format!("spawn failed: {}", e));
                None
            }
        }
    }

    /// Spawn for a specific issue number, or the next scheduled unit.
    pub async fn spawn_on_demand(self: &Arc<Self>, issue: Option<u64>) -> Option<String> {
        let Some(number) = issue else {
            return self.spawn_next().await;
        };
        let unit = {
            let issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
            issues.iter().find(|i| i.number == number).map(|i| WorkUnit::Issue {
                number: i.number,
                title: i.title.clone(),
                body: i.body.clone(),
                labels: i.labels.clone(),
            })
        };
        let Some(unit) = unit else {
            self.bus.error(format!("unknown issue #{}", number));
            return None;
        };
        let key = unit.task_key();
        {
            let mut sched = self.scheduler.lock().await;
            if sched.is_claimed(&key) || sched.is_failed(&key) {
                return None;
            }
            sched.claim(&key);
        }
        match self
            .spawn_agent(
                Some(NextWork {
                    unit,
                    completed_siblings: Vec::new(),
                }),
                None,
                None,
                None,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                self.scheduler.lock().await.release(&key);
                self.bus.error(format!("spawn failed: {}", e));
                None
            }
        }
    }

    async fn spawn_agent(
        self: &Arc<Self>,
        work: Option<NextWork>,
        handoff: Option<RerouteHandoff>,
        preamble: Option<String>,
        fixed_id: Option<String>,
    ) -> Result<String> {
        let tool = self.active_tool();
        let id = fixed_id.unwrap_or_else(|| {
            let n = self.agent_counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("{}-{}", self.opts.label, n)
        });

        let (unit, siblings) = match work {
            Some(w) => (Some(w.unit), w.completed_siblings),
            None => (None, Vec::new()),
        };

        // Memory context is seeded with the files touched by prior runs.
        let (memory_context, injected) = match unit.as_ref() {
            Some(u) => {
                let key = u.task_key();
                let prior_files = self
                    .memory
                    .latest_run(&key)
                    .map(|r| r.files_touched)
                    .unwrap_or_default();
                let context = self.memory.build_task_memory(&key, &prior_files);
                (context, self.memory.last_injected_rule_ids())
            }
            None => (String::new(), Vec::new()),
        };

        let sys = feedback::system_prompt(&id);
        let mut prompt = match unit.as_ref() {
            Some(u) => feedback::task_prompt(u, &siblings, &memory_context),
            None => String::new(),
        };
        if let Some(handoff) = handoff {
            prompt = format!(
                "{}\n{}",
                feedback::reroute_prompt(
                    unit.as_ref().ok_or_else(|| anyhow!("reroute without task"))?,
                    handoff.prior_attempts,
                    &handoff.last_failure,
                    &handoff.digests,
                    &handoff.context,
                ),
                prompt
            );
        }
        if let Some(preamble) = preamble {
            prompt = format!("{}\n{}", preamble, prompt);
        }

        let spawn_opts = ToolSpawnOptions {
            model: self.opts.model.clone(),
            permission_mode: self.opts.permission_mode.clone(),
            system_prompt: tool
                .capabilities
                .supports_system_prompt
                .then(|| sys.clone()),
        };
        let mut args = tool.build_args(&spawn_opts);
        let deliver_by_arg = if !prompt.is_empty() {
            match tool.initial_prompt_args(&prompt) {
                Some(extra) => {
                    args.extend(extra);
                    true
                }
                None => false,
            }
        } else {
            true
        };

        let handle = match pty::spawn(SpawnSpec {
            command: tool.command.clone(),
            args,
            cwd: self.opts.cwd.clone(),
            env: HashMap::new(),
            cols: self.opts.cols,
            rows: self.opts.rows,
        }) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                // No partial agent record on spawn failure.
                self.bus.publish(Event::ToolSpawnFailed {
                    tool_id: tool.id.clone(),
                    cause: e.to_string(),
                    ts: now_ms(),
                });
                return Err(e);
            }
        };

        let record = AgentRecord {
            id: id.clone(),
            tool_id: tool.id.clone(),
            status: AgentStatus::Working,
            verify_attempts: 0,
            task: unit.clone(),
            completed_siblings: siblings,
            buffer: OutputBuffer::new(),
            verify_history: Vec::new(),
            injected_rule_ids: injected,
            started_at: now_ms(),
            handle: Some(Arc::clone(&handle)),
        };
        self.agents.write().await.insert(id.clone(), record);

        self.bus.publish(Event::AgentSpawned {
            id: id.clone(),
            tool: tool.id.clone(),
            task: unit.as_ref().map(|u| u.task_key()),
            ts: now_ms(),
        });
        info!(agent = %id, tool = %tool.id, task = ?unit.as_ref().map(|u| u.task_key()), "agent spawned");

        self.start_pump(&id, &handle);

        if !deliver_by_arg {
            // The tool cannot take the prompt on the command line: wait for
            // its prompt to appear, then type it.
            let full = if tool.capabilities.supports_system_prompt {
                prompt
            } else {
                format!("{}\n\n{}", sys, prompt)
            };
            self.wait_child_ready(&id).await;
            self.write_to_agent(&id, &format!("{}\r", full)).await.ok();
        }

        self.publish_state().await;
        Ok(id)
    }

    fn start_pump(self: &Arc<Self>, id: &str, handle: &Arc<PtyHandle>) {
        let sup = Arc::clone(self);
        let id = id.to_string();
        let mut rx = handle.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PtyEvent::Data(bytes)) => sup.on_data(&id, &bytes).await,
                    Ok(PtyEvent::Exit { code, .. }) => {
                        sup.on_exit(&id, code).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(agent = %id, skipped = n, "pty pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Poll the ANSI-stripped last line until it looks like an input prompt.
    async fn wait_child_ready(&self, id: &str) {
        tokio::time::sleep(READY_GRACE).await;
        let deadline = tokio::time::Instant::now() + (READY_CAP - READY_GRACE);
        loop {
            let line = {
                let agents = self.agents.read().await;
                match agents.get(id) {
                    Some(a) => a.buffer.last_line_stripped(),
                    None => return,
                }
            };
            let trimmed = line.trim_end();
            let lower = trimmed.to_lowercase();
            if trimmed.ends_with(READY_PROMPT_CHARS)
                || lower.contains("claude")
                || lower.contains("aider")
            {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(agent = %id, "ready wait capped; sending anyway");
                return;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    // ============ Event handlers ============

    pub(crate) async fn on_data(self: &Arc<Self>, id: &str, bytes: &[u8]) {
        let (extract, signal, task_key) = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else { return };
            let extract = agent.buffer.append(bytes);
            let signal = if agent.status == AgentStatus::Working {
                agent.buffer.scan_signal()
            } else {
                None
            };
            (extract, signal, agent.task.as_ref().map(|t| t.task_key()))
        };

        self.bus.publish(Event::AgentOutput {
            id: id.to_string(),
            data: String::from_utf8_lossy(bytes).into_owned(),
            ts: now_ms(),
        });

        if let Some(extract) = extract {
            let key = task_key.clone().unwrap_or_else(|| format!("agent:{}", id));
            self.memory.record_context_compaction(id, &key, &extract);
        }

        match signal {
            Some(Signal::Done) => self.begin_verify(id).await,
            Some(Signal::Blocked { reason }) => self.on_blocked(id, &reason).await,
            None => {}
        }
    }

    /// DoneSignal: enter `verifying`, bump the attempt counter and run the
    /// project checks shortly after.
    pub(crate) async fn begin_verify(self: &Arc<Self>, id: &str) {
        let attempt = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else { return };
            if agent.status != AgentStatus::Working {
                return;
            }
            agent.status = AgentStatus::Verifying;
            agent.verify_attempts += 1;
            let attempt = agent.verify_attempts;
            self.bus.publish(Event::AgentStatus {
                id: id.to_string(),
                status: AgentStatus::Verifying,
                prev: Some(AgentStatus::Working),
                ts: now_ms(),
            });
            attempt
        };
        self.bus.publish(Event::VerifyStart {
            id: id.to_string(),
            attempt,
            ts: now_ms(),
        });
        self.publish_state().await;

        let sup = Arc::clone(self);
        let id = id.to_string();
        let cwd = self.opts.cwd.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VERIFY_DELAY).await;
            let commands = verify::detect_commands(&cwd);
            let result = verify::run_checks(&cwd, &commands).await;
            sup.on_verify_result(&id, attempt, result).await;
        });
    }

    pub(crate) async fn on_verify_result(
        self: &Arc<Self>,
        id: &str,
        attempt: u32,
        result: VerifyResult,
    ) {
        // Gather under the lock, act outside it.
        let (task, files, injected, tool_id) = {
            let agents = self.agents.read().await;
            let Some(agent) = agents.get(id) else { return };
            if agent.status != AgentStatus::Verifying || agent.verify_attempts != attempt {
                // Killed or superseded; the result is abandoned.
                debug!(agent = %id, attempt = attempt, "verify result abandoned");
                return;
            }
            let mut files = agent.buffer.mentioned_files();
            files.truncate(MAX_FILES_TRACKED);
            (
                agent.task.clone(),
                files,
                agent.injected_rule_ids.clone(),
                agent.tool_id.clone(),
            )
        };

        let task_key = task.as_ref().map(|t| t.task_key());
        if let Some(ref key) = task_key {
            self.memory
                .record_verification(id, key, &result, &files, &tool_id, attempt);
        }

        if result.passed {
            self.finish_success(id, attempt, &result, task, files, injected)
                .await;
        } else if attempt < MAX_VERIFY {
            self.feed_back_failure(id, attempt, &result, task, files).await;
        } else {
            self.exhaust_and_reroute(id, attempt, &result, task, files, injected)
                .await;
        }
    }

    async fn finish_success(
        self: &Arc<Self>,
        id: &str,
        attempt: u32,
        result: &VerifyResult,
        task: Option<WorkUnit>,
        files: Vec<String>,
        injected: Vec<i64>,
    ) {
        if let Some(ref unit) = task {
            self.mark_unit_passed(unit).await;
        }

        self.bus.publish(Event::VerifyResult {
            id: id.to_string(),
            passed: true,
            attempt,
            max: MAX_VERIFY,
            results: Some(result.results.clone()),
            ts: now_ms(),
        });
        self.set_status(id, AgentStatus::Done).await;
        self.bus.publish(Event::AgentDone {
            id: id.to_string(),
            task: task.as_ref().map(|t| t.task_key()),
            ts: now_ms(),
        });

        if let Some(ref unit) = task {
            let key = unit.task_key();
            self.memory
                .record_success(id, &key, &files, attempt, &injected);
            self.persist_agent_artifacts(id, &key, "passed", attempt, &files);
        }

        let done = self.done_count.fetch_add(1, Ordering::SeqCst) + 1;
        if done % CONSOLIDATE_EVERY == 0 {
            info!(done = done, "consolidating memory");
            self.memory.consolidate();
        }

        self.publish_state().await;
        if self.opts.auto {
            self.fill_capacity().await;
        }
    }

    /// Failed verification with budget left: write the feedback block to
    /// the child, then return it to `working`.
    async fn feed_back_failure(
        self: &Arc<Self>,
        id: &str,
        attempt: u32,
        result: &VerifyResult,
        task: Option<WorkUnit>,
        files: Vec<String>,
    ) {
        let failed = result.failed_checks();
        let error_keys: Vec<String> = failed
            .iter()
            .filter_map(|c| c.error_key.clone())
            .collect();
        let rule_hints = self.memory.build_rule_hints(&files, &error_keys);
        let criteria = task.as_ref().map(|t| t.criteria()).unwrap_or_default();

        let feedback_block = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else { return };
            if agent.status != AgentStatus::Verifying {
                return;
            }
            agent.verify_history.push(VerifyHistoryEntry {
                attempt,
                failed_checks: failed.iter().map(|c| c.name.clone()).collect(),
                output_head: failed
                    .first()
                    .map(|c| c.output.lines().take(3).collect::<Vec<_>>().join(" "))
                    .unwrap_or_default(),
            });
            agent
                .buffer
                .set_verify_digest(feedback::verify_digest(&agent.verify_history));
            feedback::verification_feedback(&failed, &criteria, &agent.verify_history, &rule_hints)
        };

        // The feedback must reach the child before status returns to
        // working.
        if let Err(e) = self.write_to_agent(id, &format!("{}\r", feedback_block)).await {
            debug!(agent = %id, error = %e, "feedback write failed");
        }
        self.set_status(id, AgentStatus::Working).await;

        self.bus.publish(Event::VerifyResult {
            id: id.to_string(),
            passed: false,
            attempt,
            max: MAX_VERIFY,
            results: Some(result.results.clone()),
            ts: now_ms(),
        });
        self.publish_state().await;
    }

    async fn exhaust_and_reroute(
        self: &Arc<Self>,
        id: &str,
        attempt: u32,
        result: &VerifyResult,
        task: Option<WorkUnit>,
        files: Vec<String>,
        injected: Vec<i64>,
    ) {
        self.bus.publish(Event::VerifyResult {
            id: id.to_string(),
            passed: false,
            attempt,
            max: MAX_VERIFY,
            results: Some(result.results.clone()),
            ts: now_ms(),
        });

        if let Some(ref unit) = task {
            let key = unit.task_key();
            let reason = format!("verification failed after {} attempts", attempt);
            self.memory
                .record_failure(id, &key, &reason, crate::types::RunOutcome::Failed, &files, &injected);
            self.persist_agent_artifacts(id, &key, "failed", attempt, &files);
        }

        self.reroute(id, "verify budget exhausted").await;
        if self.opts.auto {
            self.fill_capacity().await;
        }
    }

    /// BlockedSignal: terminal for this agent; may hand the task to a
    /// replacement.
    pub(crate) async fn on_blocked(self: &Arc<Self>, id: &str, reason: &str) {
        if !self.set_status(id, AgentStatus::Blocked).await {
            return;
        }
        info!(agent = %id, reason = %reason, "agent blocked");

        let (task, files, injected, handle) = self.gather_failure_facts(id).await;
        if let Some(ref unit) = task {
            let key = unit.task_key();
            self.memory.record_failure(
                id,
                &key,
                reason,
                crate::types::RunOutcome::Blocked,
                &files,
                &injected,
            );
            self.persist_agent_artifacts(id, &key, "blocked", 0, &files);
        }
        if let Some(handle) = handle {
            handle.kill();
        }

        if self.opts.auto && task.is_some() {
            self.reroute(id, &format!("blocked: {}", reason)).await;
        } else if let Some(unit) = task {
            self.scheduler.lock().await.release(&unit.task_key());
        }
        if self.opts.auto {
            self.fill_capacity().await;
        }
        self.publish_state().await;
    }

    /// PTY exit. A crash while working records a crashed run and, in auto
    /// mode, reroutes after a short delay.
    pub(crate) async fn on_exit(self: &Arc<Self>, id: &str, code: i32) {
        {
            let agents = self.agents.read().await;
            match agents.get(id) {
                Some(agent) if !agent.status.is_terminal() => {}
                _ => return, // already accounted for (done, killed, rerouted...)
            }
        }
        self.set_status(id, AgentStatus::Exited).await;

        let (task, files, injected, _) = self.gather_failure_facts(id).await;
        if let Some(ref unit) = task {
            let key = unit.task_key();
            self.memory.record_failure(
                id,
                &key,
                &format!("process exited with code {}", code),
                crate::types::RunOutcome::Crashed,
                &files,
                &injected,
            );
            self.persist_agent_artifacts(id, &key, "crashed", 0, &files);
        }

        if self.opts.auto && task.is_some() {
            let sup = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(CRASH_REROUTE_DELAY).await;
                sup.reroute(&id, "agent crashed").await;
                sup.fill_capacity().await;
            });
        } else if let Some(unit) = task {
            self.scheduler.lock().await.release(&unit.task_key());
        }
        self.publish_state().await;
    }

    /// Terminate the dying agent and start a replacement on the same work
    /// unit with a hand-off header. Refuses once the task's reroute budget
    /// is spent and fails the task permanently instead.
    pub(crate) async fn reroute(self: &Arc<Self>, old_id: &str, reason: &str) -> Option<String> {
        let (task, siblings, attempts, history, handle) = {
            let agents = self.agents.read().await;
            let agent = agents.get(old_id)?;
            (
                agent.task.clone()?,
                agent.completed_siblings.clone(),
                agent.verify_attempts,
                agent.verify_history.clone(),
                agent.handle.clone(),
            )
        };
        let key = task.task_key();

        let allowed = {
            let mut sched = self.scheduler.lock().await;
            if sched.can_reroute(&key) {
                sched.note_reroute(&key);
                true
            } else {
                sched.mark_failed(&key);
                false
            }
        };

        if !allowed {
            warn!(task = %key, max = MAX_REROUTES, "reroute budget exhausted; task failed");
            self.set_status(old_id, AgentStatus::Failed).await;
            if let Some(handle) = handle {
                handle.kill();
            }
            self.mark_unit_failed(&task, "reroute budget exhausted");
            self.bus
                .error(format!("task {} failed permanently after {} reroutes", key, MAX_REROUTES));
            self.publish_state().await;
            return None;
        }

        self.set_status(old_id, AgentStatus::Rerouted).await;
        if let Some(handle) = handle {
            handle.kill();
        }

        let last_failure = history
            .last()
            .map(|h| h.output_head.clone())
            .unwrap_or_else(|| reason.to_string());
        let digests: Vec<String> = history
            .iter()
            .map(|h| format!("attempt {}: {} | {}", h.attempt, h.failed_checks.join(", "), h.output_head))
            .collect();
        let prior_files = self
            .memory
            .latest_run(&key)
            .map(|r| r.files_touched)
            .unwrap_or_default();
        let context = self.memory.build_reroute_context(&key, &prior_files);

        let new_id = match self
            .spawn_agent(
                Some(NextWork {
                    unit: task,
                    completed_siblings: siblings,
                }),
                Some(RerouteHandoff {
                    prior_attempts: attempts,
                    last_failure,
                    digests,
                    context,
                }),
                None,
                None,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.scheduler.lock().await.release(&key);
                self.bus.error(format!("reroute spawn failed: {}", e));
                return None;
            }
        };

        self.bus.publish(Event::AgentRerouted {
            old_id: old_id.to_string(),
            new_id: new_id.clone(),
            task: key.clone(),
            reason: reason.to_string(),
            ts: now_ms(),
        });
        info!(old = %old_id, new = %new_id, task = %key, reason = %reason, "agent rerouted");
        Some(new_id)
    }

    // ============ Control surface ============

    pub async fn write_to_agent(&self, id: &str, data: &str) -> Result<()> {
        let handle = {
            let agents = self.agents.read().await;
            agents
                .get(id)
                .and_then(|a| a.handle.clone())
                .ok_or_else(|| anyhow!("no PTY for agent {}", id))?
        };
        handle.write(data.as_bytes())
    }

    pub async fn resize_agent(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let handle = {
            let agents = self.agents.read().await;
            agents
                .get(id)
                .and_then(|a| a.handle.clone())
                .ok_or_else(|| anyhow!("no PTY for agent {}", id))?
        };
        handle.resize(cols, rows)
    }

    /// Kill an agent. Any in-flight verification is abandoned by the
    /// status guard in `on_verify_result`.
    pub async fn kill_agent(self: &Arc<Self>, id: &str) -> bool {
        let (existed, task, handle) = {
            let agents = self.agents.read().await;
            match agents.get(id) {
                Some(a) if !a.status.is_terminal() => {
                    (true, a.task.clone(), a.handle.clone())
                }
                Some(_) => (false, None, None),
                None => return false,
            }
        };
        if !existed {
            return true;
        }
        self.set_status(id, AgentStatus::Killed).await;
        if let Some(handle) = handle {
            handle.kill();
        }
        if let Some(unit) = task {
            self.scheduler.lock().await.release(&unit.task_key());
        }
        if self.opts.auto {
            self.fill_capacity().await;
        }
        self.publish_state().await;
        true
    }

    /// Full output buffer for a late subscriber's replay.
    pub async fn agent_output(&self, id: &str) -> Option<String> {
        let agents = self.agents.read().await;
        agents.get(id).map(|a| a.buffer.contents().to_string())
    }

    pub async fn state_snapshot(&self) -> StateSnapshot {
        let agents = self.agents.read().await;
        let mut list: Vec<AgentSnapshot> = agents.values().map(|a| a.snapshot()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let prd = self.load_prd().map(|p| PrdSummary {
            project: p.project.clone(),
            total_stories: p.user_stories.len(),
            passed_stories: p.passed_count(),
        });
        StateSnapshot {
            repo: self.opts.repo.clone(),
            tool: self.active_tool().id,
            auto: self.opts.auto,
            max_agents: self.opts.max_agents,
            agents: list,
            prd,
            memory: Some(self.memory.stats()),
        }
    }

    async fn publish_state(&self) {
        let snapshot = self.state_snapshot().await;
        self.bus.publish_state(snapshot);
    }

    // ============ Session ============

    pub async fn save_session(&self) -> Result<()> {
        let agents = self.agents.read().await;
        let snapshot = SessionSnapshot {
            session_id: self.session_id.clone(),
            repo: self.opts.repo.clone(),
            cwd: self.opts.cwd.clone(),
            saved_at: now_ms(),
            active_tool: self.active_tool().id,
            agents: agents
                .values()
                .map(|a| SessionAgent {
                    id: a.id.clone(),
                    task: a.task.clone(),
                    tool: a.tool_id.clone(),
                    status: a.status,
                    started_at: a.started_at,
                    output_tail: a.buffer.tail_lines_stripped(SNAPSHOT_TAIL_LINES),
                })
                .collect(),
            agent_counter: self.agent_counter.load(Ordering::SeqCst),
            opts: SessionOpts {
                max_agents: self.opts.max_agents,
                auto: self.opts.auto,
                label: Some(self.opts.label.clone()),
                model: self.opts.model.clone(),
                permission_mode: self.opts.permission_mode.clone(),
            },
        };
        drop(agents);
        session::save_session(&self.paths.session_file(), &snapshot)
    }

    /// Recreate every non-done agent from a saved session with a resume
    /// preamble.
    pub async fn resume_from(self: &Arc<Self>, snapshot: &SessionSnapshot) {
        self.agent_counter
            .store(snapshot.agent_counter, Ordering::SeqCst);
        for saved in snapshot.resumable_agents() {
            if let Some(ref unit) = saved.task {
                self.scheduler.lock().await.claim(&unit.task_key());
            }
            let preamble = feedback::resume_preamble(
                &saved.id,
                &saved.output_tail[saved.output_tail.len().saturating_sub(15)..],
            );
            let work = saved.task.clone().map(|unit| NextWork {
                unit,
                completed_siblings: Vec::new(),
            });
            match self
                .spawn_agent(work, None, Some(preamble), Some(saved.id.clone()))
                .await
            {
                Ok(id) => info!(agent = %id, "agent resumed"),
                Err(e) => {
                    if let Some(ref unit) = saved.task {
                        self.scheduler.lock().await.release(&unit.task_key());
                    }
                    warn!(agent = %saved.id, error = %e, "resume failed");
                }
            }
        }
    }

    /// Saved session for this repo, if present and fresh.
    pub fn saved_session(&self) -> Option<SessionSnapshot> {
        session::load_session(&self.paths.session_file())
    }

    pub fn clear_saved_session(&self) {
        session::clear_session(&self.paths.session_file());
    }

    /// Emit `session:found` if a resumable session exists.
    pub fn announce_saved_session(&self) {
        if let Some(snap) = self.saved_session() {
            self.bus.publish(Event::SessionFound {
                saved_at: snap.saved_at,
                agents: snap.agents.len(),
                ts: now_ms(),
            });
        }
    }

    /// Resume the saved session, if any. Returns whether one was resumed.
    pub async fn resume_saved_session(self: &Arc<Self>) -> bool {
        let Some(snapshot) = self.saved_session() else {
            return false;
        };
        info!(agents = snapshot.agents.len(), "resuming saved session");
        self.resume_from(&snapshot).await;
        true
    }

    // ============ Internals ============

    /// Apply a status transition. Terminal states never regress; setting
    /// the current status again emits an idempotent event with `prev`
    /// null.
    async fn set_status(&self, id: &str, new: AgentStatus) -> bool {
        let prev = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(id) else {
                return false;
            };
            if agent.status == new {
                None
            } else {
                if agent.status.is_terminal() {
                    debug!(agent = %id, from = agent.status.as_str(), to = new.as_str(), "status regression ignored");
                    return false;
                }
                let prev = agent.status;
                agent.status = new;
                if new == AgentStatus::Working {
                    agent.buffer.rearm();
                }
                Some(prev)
            }
        };
        self.bus.publish(Event::AgentStatus {
            id: id.to_string(),
            status: new,
            prev,
            ts: now_ms(),
        });
        true
    }

    async fn gather_failure_facts(
        &self,
        id: &str,
    ) -> (Option<WorkUnit>, Vec<String>, Vec<i64>, Option<Arc<PtyHandle>>) {
        let agents = self.agents.read().await;
        match agents.get(id) {
            Some(agent) => {
                let mut files = agent.buffer.mentioned_files();
                files.truncate(MAX_FILES_TRACKED);
                (
                    agent.task.clone(),
                    files,
                    agent.injected_rule_ids.clone(),
                    agent.handle.clone(),
                )
            }
            None => (None, Vec::new(), Vec::new(), None),
        }
    }

    async fn mark_unit_passed(self: &Arc<Self>, unit: &WorkUnit) {
        let prd_path = self.prd_path.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match unit {
            WorkUnit::Story { id: story_id, .. } => {
                self.scheduler.lock().await.release(&unit.task_key());
                if let Some(ref path) = prd_path {
                    if let Err(e) = tasks::mark_story_passed(path, story_id) {
                        warn!(error = %e, "PRD update failed");
                    }
                }
            }
            WorkUnit::Subtask {
                id: subtask_id,
                parent_id,
                ..
            } => {
                let parent_complete = self
                    .scheduler
                    .lock()
                    .await
                    .complete_subtask(parent_id, subtask_id);
                if parent_complete {
                    info!(story = %parent_id, "all subtasks complete; story passed");
                    if let Some(ref path) = prd_path {
                        if let Err(e) = tasks::mark_story_passed(path, parent_id) {
                            warn!(error = %e, "PRD update failed");
                        }
                    }
                    self.append_progress(&format!("story {} completed", parent_id));
                }
            }
            WorkUnit::Issue { number, .. } => {
                self.scheduler.lock().await.complete_issue(*number);
            }
        }
    }

    fn mark_unit_failed(&self, unit: &WorkUnit, note: &str) {
        let prd_path = self.prd_path.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(path) = prd_path else { return };
        let story_id = match unit {
            WorkUnit::Story { id, .. } => Some(id.clone()),
            WorkUnit::Subtask { parent_id, .. } => Some(parent_id.clone()),
            WorkUnit::Issue { .. } => None,
        };
        if let Some(story_id) = story_id {
            if let Err(e) = tasks::mark_story_failed(&path, &story_id, note) {
                warn!(error = %e, "PRD failure update failed");
            }
        }
    }

    fn load_prd(&self) -> Option<tasks::Prd> {
        let path = self.prd_path.lock().unwrap_or_else(|e| e.into_inner()).clone()?;
        tasks::load_prd(&path)
    }

    fn append_progress(&self, line: &str) {
        let stamped = format!("{} {}", Utc::now().to_rfc3339(), line);
        if let Err(e) = append_line(&self.paths.progress_log(), &stamped) {
            debug!(error = %e, "progress append failed");
        }
    }

    /// Best-effort persistence after a terminal outcome: agent note,
    /// workflow line and the repo context file. Never propagates errors.
    fn persist_agent_artifacts(
        &self,
        id: &str,
        task_key: &str,
        outcome: &str,
        attempts: u32,
        files: &[String],
    ) {
        let note = {
            let mut out = format!(
                "# {}\n\n- task: {}\n- outcome: {}\n- verify attempts: {}\n",
                id, task_key, outcome, attempts
            );
            if !files.is_empty() {
                out.push_str("- files:\n");
                for file in files.iter().take(10) {
                    out.push_str(&format!("  - {}\n", file));
                }
            }
            out
        };
        if let Err(e) = write_atomic(&self.paths.agent_note(id), &note) {
            debug!(error = %e, "agent note write failed");
        }

        let workflow = format!(
            "{} agent={} task={} outcome={} attempts={}",
            Utc::now().to_rfc3339(),
            id,
            task_key,
            outcome,
            attempts
        );
        if let Err(e) = append_line(&self.paths.workflows_log(), &workflow) {
            debug!(error = %e, "workflow append failed");
        }

        self.rewrite_repo_context();
    }

    fn rewrite_repo_context(&self) {
        let stats = self.memory.stats();
        let contents = format!(
            "# Project context\n\nGenerated by homerd; do not edit.\n\n\
             - repo: {}\n- updated: {}\n- memory: {} solutions, {} rules, {} task runs\n",
            self.opts.repo,
            Utc::now().to_rfc3339(),
            stats.solutions,
            stats.rules,
            stats.task_runs
        );
        if let Err(e) = write_atomic(&self.paths.repo_context_file(), &contents) {
            debug!(error = %e, "context rewrite failed");
        }
    }

    // ============ Test support ============

    /// Insert an agent record without a PTY, claiming its task. Tests use
    /// this to drive the state machine directly.
    #[cfg(test)]
    pub(crate) async fn insert_test_agent(&self, id: &str, task: Option<WorkUnit>) {
        if let Some(ref unit) = task {
            self.scheduler.lock().await.claim(&unit.task_key());
        }
        let record = AgentRecord {
            id: id.to_string(),
            tool_id: "claude".into(),
            status: AgentStatus::Working,
            verify_attempts: 0,
            task,
            completed_siblings: Vec::new(),
            buffer: OutputBuffer::new(),
            verify_history: Vec::new(),
            injected_rule_ids: Vec::new(),
            started_at: now_ms(),
            handle: None,
        };
        self.agents.write().await.insert(id.to_string(), record);
    }

    #[cfg(test)]
    pub(crate) async fn force_verifying(&self, id: &str, attempts: u32) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(id) {
            agent.status = AgentStatus::Verifying;
            agent.verify_attempts = attempts;
        }
    }

    #[cfg(test)]
    pub(crate) async fn agent_status(&self, id: &str) -> Option<AgentStatus> {
        self.agents.read().await.get(id).map(|a| a.status)
    }

    #[cfg(test)]
    pub(crate) async fn agent_history_len(&self, id: &str) -> usize {
        self.agents
            .read()
            .await
            .get(id)
            .map(|a| a.verify_history.len())
            .unwrap_or(0)
    }
}
