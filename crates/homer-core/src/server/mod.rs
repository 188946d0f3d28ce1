//! Control surface - HTTP API plus the WebSocket event stream.
//!
//! Thin by design: every route delegates to the supervisor. The WebSocket
//! handler pushes a full `state` event before any delta so late joiners
//! can replay-then-stream; a subscriber that falls behind its bounded
//! queue is disconnected rather than silently skipped ahead.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::events::{now_ms, Event};
use crate::supervisor::Supervisor;
use crate::tools;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/agent/spawn", post(spawn_agent))
        .route("/api/agent/:id/input", post(agent_input))
        .route("/api/agent/:id/resize", post(agent_resize))
        .route("/api/agent/:id/kill", post(agent_kill))
        .route("/api/agent/:id/output", get(agent_output))
        .route("/api/tool", post(set_tool))
        .route("/api/session/resume", post(session_resume))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process shuts down.
pub async fn serve(supervisor: Arc<Supervisor>, port: u16) -> Result<()> {
    let app = router(AppState { supervisor });
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port = port, "control surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Handlers ============

async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.state_snapshot().await)
}

#[derive(Debug, Default, Deserialize)]
struct SpawnRequest {
    #[serde(default)]
    issue: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SpawnResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

async fn spawn_agent(
    State(state): State<AppState>,
    Json(req): Json<SpawnRequest>,
) -> impl IntoResponse {
    let id = state.supervisor.spawn_on_demand(req.issue).await;
    Json(SpawnResponse { ok: id.is_some(), id })
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    data: String,
}

async fn agent_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> impl IntoResponse {
    match state.supervisor.write_to_agent(&id, &req.data).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn agent_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> impl IntoResponse {
    match state.supervisor.resize_agent(&id, req.cols, req.rows).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

async fn agent_kill(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.supervisor.kill_agent(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Full buffer contents; late subscribers replay this, then stream `/ws`.
async fn agent_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.agent_output(&id).await {
        Some(output) => (StatusCode::OK, output),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequest {
    id: String,
}

async fn set_tool(
    State(state): State<AppState>,
    Json(req): Json<ToolRequest>,
) -> impl IntoResponse {
    match tools::resolve(&req.id) {
        Some(tool) => {
            state.supervisor.set_tool(tool);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::BAD_REQUEST,
    }
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    resume: bool,
}

async fn session_resume(
    State(state): State<AppState>,
    Json(req): Json<ResumeRequest>,
) -> impl IntoResponse {
    if req.resume {
        let resumed = state.supervisor.resume_saved_session().await;
        if resumed {
            return StatusCode::NO_CONTENT;
        }
        StatusCode::NOT_FOUND
    } else {
        state.supervisor.clear_saved_session();
        StatusCode::NO_CONTENT
    }
}

// ============ WebSocket ============

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe before the initial snapshot so no delta can slip between.
    let mut events = state.supervisor.bus().subscribe();
    let snapshot = state.supervisor.state_snapshot().await;
    let initial = Event::State {
        state: snapshot,
        ts: now_ms(),
    };
    if send_event(&mut sink, &initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Disconnect rather than deliver a stream with holes.
                    warn!(skipped = skipped, "ws subscriber lagged; disconnecting");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // input goes through the HTTP API
                Some(Err(_)) => break,
            },
        }
    }
}

async fn send_event(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<()> {
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
