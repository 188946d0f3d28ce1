//! Typed event stream published by the orchestrator.
//!
//! A single broadcaster fans out every transition. Publishing never
//! blocks: a slow subscriber lags on its own bounded receiver and is
//! disconnected by the fan-out task when it falls behind - the canonical
//! stream itself drops nothing silently.
//!
//! `state` snapshots are debounced to at most one per 50 ms with
//! leading-edge suppression and trailing-edge delivery: the snapshot that
//! goes out is always the latest one seen in the window.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::types::{AgentStatus, StateSnapshot};
use crate::verify::CheckOutcome;

/// Minimum spacing between `state` events.
pub const STATE_DEBOUNCE: Duration = Duration::from_millis(50);

const BUS_CAPACITY: usize = 1024;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Every event the orchestrator publishes. The serde tag matches the wire
/// protocol consumed by clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "agent:spawned")]
    AgentSpawned {
        id: String,
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        ts: i64,
    },
    #[serde(rename = "agent:output")]
    AgentOutput { id: String, data: String, ts: i64 },
    #[serde(rename = "agent:status")]
    AgentStatus {
        id: String,
        status: AgentStatus,
        prev: Option<AgentStatus>,
        ts: i64,
    },
    #[serde(rename = "agent:done")]
    AgentDone {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        ts: i64,
    },
    #[serde(rename = "agent:rerouted")]
    AgentRerouted {
        #[serde(rename = "oldId")]
        old_id: String,
        #[serde(rename = "newId")]
        new_id: String,
        task: String,
        reason: String,
        ts: i64,
    },
    #[serde(rename = "tool:spawn_failed")]
    ToolSpawnFailed {
        #[serde(rename = "toolId")]
        tool_id: String,
        cause: String,
        ts: i64,
    },
    #[serde(rename = "verify:start")]
    VerifyStart { id: String, attempt: u32, ts: i64 },
    #[serde(rename = "verify:result")]
    VerifyResult {
        id: String,
        passed: bool,
        attempt: u32,
        max: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        results: Option<Vec<CheckOutcome>>,
        ts: i64,
    },
    #[serde(rename = "state")]
    State { state: StateSnapshot, ts: i64 },
    #[serde(rename = "session:found")]
    SessionFound {
        #[serde(rename = "savedAt")]
        saved_at: i64,
        agents: usize,
        ts: i64,
    },
    #[serde(rename = "error")]
    Error { message: String, ts: i64 },
}

/// Non-blocking publisher with a debounced state channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    state_tx: mpsc::UnboundedSender<StateSnapshot>,
}

impl EventBus {
    /// Create the bus and its debouncer task. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_state(tx.clone(), state_rx));
        Self { tx, state_tx }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(Event::Error {
            message: message.into(),
            ts: now_ms(),
        });
    }

    /// Enqueue a state snapshot; delivery is debounced.
    pub fn publish_state(&self, snapshot: StateSnapshot) {
        let _ = self.state_tx.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn debounce_state(
    tx: broadcast::Sender<Event>,
    mut rx: mpsc::UnboundedReceiver<StateSnapshot>,
) {
    while let Some(first) = rx.recv().await {
        let mut latest = first;
        let deadline = Instant::now() + STATE_DEBOUNCE;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(snapshot)) => latest = snapshot,
                Ok(None) => {
                    let _ = tx.send(Event::State {
                        state: latest,
                        ts: now_ms(),
                    });
                    return;
                }
                Err(_) => break,
            }
        }
        let _ = tx.send(Event::State {
            state: latest,
            ts: now_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(max_agents: usize) -> StateSnapshot {
        StateSnapshot {
            repo: "acme/shop".into(),
            tool: "claude".into(),
            auto: true,
            max_agents,
            agents: vec![],
            prd: None,
            memory: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_events_are_debounced_to_latest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_state(snapshot(1));
        bus.publish_state(snapshot(2));
        bus.publish_state(snapshot(3));

        match rx.recv().await.unwrap() {
            Event::State { state, .. } => assert_eq!(state.max_agents, 3),
            other => panic!("expected state event, got {:?}", other),
        }
        // Exactly one event for the burst.
        tokio::time::advance(STATE_DEBOUNCE * 2).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_each_deliver() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish_state(snapshot(1));
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::State { .. }));

        tokio::time::advance(STATE_DEBOUNCE * 2).await;
        bus.publish_state(snapshot(2));
        match rx.recv().await.unwrap() {
            Event::State { state, .. } => assert_eq!(state.max_agents, 2),
            other => panic!("expected state event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_events_pass_through() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::AgentDone {
            id: "homer-1".into(),
            task: Some("story:US-001".into()),
            ts: now_ms(),
        });
        match rx.recv().await.unwrap() {
            Event::AgentDone { id, task, .. } => {
                assert_eq!(id, "homer-1");
                assert_eq!(task.as_deref(), Some("story:US-001"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event::VerifyStart {
            id: "homer-1".into(),
            attempt: 2,
            ts: 1234,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "verify:start");
        assert_eq!(json["attempt"], 2);

        let event = Event::AgentStatus {
            id: "homer-1".into(),
            status: AgentStatus::Working,
            prev: None,
            ts: 1234,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "agent:status");
        assert_eq!(json["status"], "working");
        assert!(json["prev"].is_null());
    }
}
