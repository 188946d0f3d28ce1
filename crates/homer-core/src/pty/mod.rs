//! PTY module - child process management for the supervised CLIs.
//!
//! `portable-pty` handles the low-level PTY; bytes are forwarded verbatim
//! to subscribers. Screen interpretation (signal detection, readiness
//! polling) happens downstream in the output processor.

mod host;

pub use host::{spawn, PtyEvent, PtyHandle, SpawnSpec, MIN_COLS, MIN_ROWS};
