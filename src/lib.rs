pub mod api;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod cookies;
pub mod error;
pub mod ops;
pub mod persist;
pub mod profile;
pub mod session;
pub mod state;
pub mod workflow;

use state::AppState;
use std::sync::Arc;

/// Bring the full service plane up: reconnect persisted sessions, bridge
/// session events onto the observer bus, start the dead-session reaper,
/// and serve the HTTP/WebSocket planes until exit.
pub async fn run_service(config: config::AppConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(config));

    // Session lifecycle events are mirrored onto the observer bus.
    {
        let bridge_state = Arc::clone(&state);
        let mut rx = state.session_manager.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(value) = serde_json::to_value(&event) {
                            let frame_type = value
                                .get("type")
                                .and_then(|t| t.as_str())
                                .unwrap_or("session:event")
                                .to_string();
                            let data =
                                value.get("data").cloned().unwrap_or(serde_json::Value::Null);
                            bridge_state.broadcast(&frame_type, data);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Probe previously-running browsers and re-attach where possible.
    state.session_manager.reconnect_persisted().await;

    // Reap dead browser processes every 30s; with auto-exit enabled the
    // service leaves once the last session is gone.
    {
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ever_had_sessions = false;
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let reaped = reaper_state.session_manager.reap_dead().await;
                if !reaped.is_empty() {
                    tracing::info!("Reaped dead sessions: {:?}", reaped);
                }
                let count = reaper_state.session_manager.count().await;
                ever_had_sessions |= count > 0;
                let auto_exit = reaper_state.config.read().service.auto_exit;
                if auto_exit && ever_had_sessions && count == 0 {
                    tracing::info!("No sessions remain, exiting (auto-exit)");
                    std::process::exit(0);
                }
            }
        });
    }

    api::run_server(state).await
}
