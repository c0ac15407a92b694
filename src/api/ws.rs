//! WebSocket event planes.
//!
//! `/ws` pushes per-session browser events (navigation, pages, crashes).
//! `/bus` is the aggregated observer bus: lossy fan-out with a replay
//! buffer of the most recent frames for late joiners (the floating UI,
//! log tails). The workflow runtime does NOT ride this bus; it holds its
//! own bounded subscriptions.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Per-client buffer; lagging observers drop oldest frames.
const CHANNEL_CAPACITY: usize = 256;
/// Frames replayed to a newly connected `/bus` observer.
const REPLAY_CAPACITY: usize = 256;

/// Text JSON frame `{type, data, ts}` shared by both planes.
#[derive(Debug, Clone, Serialize)]
pub struct BusFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: serde_json::Value,
    pub ts: u64,
}

impl BusFrame {
    pub fn new(frame_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
            ts: chrono::Utc::now().timestamp_millis() as u64,
        }
    }
}

/// Lossy fan-out with replay, for observers only.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<BusFrame>,
    replay: Arc<Mutex<VecDeque<BusFrame>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY))),
        }
    }

    pub fn broadcast(&self, frame: BusFrame) {
        {
            let mut replay = self.replay.lock();
            if replay.len() >= REPLAY_CAPACITY {
                replay.pop_front();
            }
            replay.push_back(frame.clone());
        }
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.tx.subscribe()
    }

    pub fn replay_frames(&self) -> Vec<BusFrame> {
        self.replay.lock().iter().cloned().collect()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Upgrade handler for the observer bus (`/bus`).
pub async fn bus_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_bus_socket(socket, state))
}

async fn handle_bus_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Late joiners first get the replay window.
    for frame in state.bus.replay_frames() {
        if let Ok(json) = serde_json::to_string(&frame) {
            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
    }

    let mut rx = state.bus.subscribe();
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if let Ok(json) = serde_json::to_string(&frame) {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                // Observer fell behind: drop-oldest, keep going.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Bus observer lagged, dropped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

/// Upgrade handler for per-session browser events (`/ws`).
pub async fn session_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state))
}

async fn handle_session_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.session_manager.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_value(&event) else {
                        continue;
                    };
                    // SessionEvent serializes as {type, data}; reframe with ts.
                    let frame = BusFrame {
                        frame_type: data
                            .get("type")
                            .and_then(|t| t.as_str())
                            .unwrap_or("session:event")
                            .to_string(),
                        data: data.get("data").cloned().unwrap_or(serde_json::Value::Null),
                        ts: chrono::Utc::now().timestamp_millis() as u64,
                    };
                    if let Ok(json) = serde_json::to_string(&frame) {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Session event client lagged, dropped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape() {
        let frame = BusFrame::new("session:created", serde_json::json!({"profile_id": "xhs_fresh"}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "session:created");
        assert_eq!(json["data"]["profile_id"], "xhs_fresh");
        assert!(json["ts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_replay_buffer_caps_at_256() {
        let bus = Broadcaster::new();
        for i in 0..300 {
            bus.broadcast(BusFrame::new("tick", serde_json::json!(i)));
        }
        let frames = bus.replay_frames();
        assert_eq!(frames.len(), 256);
        assert_eq!(frames[0].data, serde_json::json!(44));
        assert_eq!(frames[255].data, serde_json::json!(299));
    }
}
