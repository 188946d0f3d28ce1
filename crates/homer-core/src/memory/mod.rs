//! Learning memory store - persistent per-repository knowledge.
//!
//! # Components
//! - `MemoryStore`: SQLite-backed facts, solutions, episodes and rules
//! - context assembly: task/error/reroute context strings for prompts
//! - scoring: EMA and Laplace confidence arithmetic

mod context;
pub mod scoring;
mod store;

pub use store::{MemoryStore, RunError, TaskRunRow, COCHANGE_MIN_RUNS};
