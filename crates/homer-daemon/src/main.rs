//! homerd - multi-agent orchestrator daemon.
//!
//! Responsibilities:
//! - Resolve the tool and per-repository paths
//! - Own the memory store, event bus and supervisor
//! - Serve the HTTP+WebSocket control surface
//! - Shut down cleanly: kill PTYs, flush memory, save the session

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use homer_core::supervisor::SupervisorOptions;
use homer_core::{server, tasks, tools, EventBus, HomerPaths, MemoryStore, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "homerd", about = "Multi-agent orchestrator for AI coding CLIs")]
struct Args {
    /// Tool id (claude, aider) or any executable on PATH
    #[arg(long)]
    tool: Option<String>,

    /// Model passed through to the tool
    #[arg(long)]
    model: Option<String>,

    /// Repository in owner/name form; derived from cwd when omitted
    #[arg(long, default_value = "")]
    repo: String,

    /// Auto mode: keep the agent pool filled from the task sources
    #[arg(long)]
    auto: bool,

    /// Concurrency target
    #[arg(long, default_value_t = 3)]
    agents: usize,

    /// Agent id prefix
    #[arg(long, default_value = "homer")]
    label: String,

    /// Permission mode passed through to tools that support one
    #[arg(long)]
    permission_mode: Option<String>,

    /// Resume the saved session for this repo
    #[arg(long)]
    resume: bool,

    /// Discard any saved session
    #[arg(long)]
    fresh: bool,

    /// Control surface port
    #[arg(long, default_value_t = 7177)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("homer_core=info,homer_daemon=info")),
        )
        .init();

    let args = Args::parse();
    let cwd = std::env::current_dir()?;

    // A tool the user named explicitly must exist; that failure is fatal.
    let tool = match args.tool.as_deref() {
        Some(name) => tools::resolve(name)
            .ok_or_else(|| anyhow!("tool '{}' not found or not executable", name))?,
        None => tools::default_tool()
            .ok_or_else(|| anyhow!("no supported tool found on PATH (tried claude, aider)"))?,
    };
    if let Some(ref var) = tool.required_env {
        if std::env::var(var).is_err() {
            warn!(tool = %tool.id, var = %var, "required environment variable is not set");
        }
    }
    info!(tool = %tool.id, command = %tool.command, "tool resolved");

    let paths = HomerPaths::new(&args.repo, &cwd)?;
    paths.ensure_dirs()?;
    info!(slug = %paths.repo_slug, "repository context ready");

    let memory = match MemoryStore::open(paths.memory_db()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            // The orchestrator runs without memory rather than not at all.
            warn!(error = %e, "memory store unavailable; continuing without it");
            Arc::new(MemoryStore::disabled())
        }
    };

    let bus = EventBus::new();
    let supervisor = Supervisor::new(
        SupervisorOptions {
            repo: args.repo.clone(),
            cwd: cwd.clone(),
            max_agents: args.agents,
            auto: args.auto,
            label: args.label.clone(),
            model: args.model.clone(),
            permission_mode: args.permission_mode.clone(),
            cols: 120,
            rows: 30,
        },
        tool,
        memory,
        bus,
        paths,
    );

    load_issue_backlog(&supervisor, &cwd);

    if args.fresh {
        supervisor.clear_saved_session();
    } else {
        supervisor.announce_saved_session();
        if args.resume {
            supervisor.resume_saved_session().await;
        }
    }

    let server_supervisor = Arc::clone(&supervisor);
    let port = args.port;
    tokio::spawn(async move {
        if let Err(e) = server::serve(server_supervisor, port).await {
            warn!(error = %e, "control surface stopped");
        }
    });

    supervisor.start().await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}

/// Issue backlog produced by the external tracker client, if present.
fn load_issue_backlog(supervisor: &Arc<Supervisor>, cwd: &PathBuf) {
    let path = cwd.join(".homer").join("issues.json");
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return;
    };
    match serde_json::from_str::<Vec<tasks::Issue>>(&raw) {
        Ok(issues) => {
            info!(count = issues.len(), "issue backlog loaded");
            supervisor.set_issues(issues);
        }
        Err(e) => warn!(path = %path.display(), error = %e, "malformed issue backlog ignored"),
    }
}
