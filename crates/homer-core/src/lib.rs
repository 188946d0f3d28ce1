//! homer-core - multi-agent orchestrator for interactive AI coding CLIs.
//!
//! Each agent is a long-lived child process on a PTY. The supervisor feeds
//! agents tasks drawn from a PRD or imported issues, detects completion
//! signals in their output, re-runs the project's own verification
//! commands, and commits what it learned to a persistent per-repository
//! memory store that seeds future prompts.
//!
//! # Components
//! - [`pty`]: PTY host (spawn, resize, kill, byte streams)
//! - [`output`]: per-agent buffer, signal detection, trim-with-extraction
//! - [`verify`]: check detection, execution, error-key normalization
//! - [`memory`]: the learning store (solutions, rules, episodes)
//! - [`tasks`]: PRD and issue import
//! - [`sched`]: work selection and budgets
//! - [`supervisor`]: the coordinator state machine
//! - [`events`] / [`server`]: typed event stream and the HTTP+WS surface

pub mod events;
pub mod memory;
pub mod output;
pub mod paths;
pub mod pty;
pub mod sched;
pub mod server;
pub mod supervisor;
pub mod tasks;
pub mod tools;
pub mod types;
pub mod verify;

pub use events::{Event, EventBus};
pub use memory::MemoryStore;
pub use output::{OutputBuffer, Signal};
pub use paths::HomerPaths;
pub use sched::{Scheduler, MAX_REROUTES, MAX_VERIFY};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use tasks::{Issue, Prd, UserStory};
pub use tools::{ToolDescriptor, ToolKind};
pub use types::{AgentStatus, StateSnapshot, WorkUnit};
pub use verify::{CheckCommand, CheckOutcome, VerifyResult};
