//! `/ws/events` upgrade handler (spec §4.G/§4.H): forwards Event Hub
//! broadcasts to the client as JSON frames shaped `{type, name, data, ts}`.
//! `Origin` is checked against an allow-list (default loopback only) before
//! the upgrade completes; a send that can't clear its deadline closes the
//! connection rather than letting a slow client back-pressure the hub.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use fleetctl_core::Event;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SEND_DEADLINE: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct EventFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    data: Event,
    ts: i64,
}

fn event_frame(event: Event) -> EventFrame {
    let (kind, name) = match &event {
        Event::MinerStarted { instance_name } => ("miner_started", instance_name.clone()),
        Event::MinerStopped { instance_name } => ("miner_stopped", instance_name.clone()),
        Event::MinerError { instance_name, .. } => ("miner_error", instance_name.clone()),
        Event::MinerStats { instance_name, .. } => ("miner_stats", instance_name.clone()),
        Event::ProfileChanged { profile_id } => ("profile_changed", profile_id.clone()),
    };
    EventFrame { kind, name, data: event, ts: now_unix() }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // No Origin header at all (non-browser client): allow, matching the
        // teacher's treatment of same-process/native callers.
        return true;
    };
    allowed.iter().any(|a| a == origin)
}

pub async fn upgrade(State(state): State<Arc<AppState>>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if !origin_allowed(&headers, &state.allowed_ws_origins) {
        warn!(?headers, "rejecting websocket upgrade from disallowed origin");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (id, mut rx) = state.event_hub.subscribe().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let frame = event_frame(event);
                let Ok(text) = serde_json::to_string(&frame) else { continue };

                match tokio::time::timeout(SEND_DEADLINE, socket.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(subscriber_id = id, "ws send deadline exceeded, closing connection");
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.event_hub.unsubscribe(id).await;
}
