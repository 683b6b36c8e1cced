//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::hub::{EventPayload, WebConn};
use crate::AppState;

use super::events::{
    ClientMessage, EventName, GatewayMessage, HeartbeatPayload, IdentifyPayload, OP_HEARTBEAT,
    OP_IDENTIFY,
};

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Heartbeat interval sent to clients in the READY payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within the timeout.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => return Err("invalid json"),
            };

            if client_msg.op != OP_IDENTIFY {
                return Err("expected identify");
            }
            let payload: IdentifyPayload =
                serde_json::from_value(client_msg.d).map_err(|_| "invalid identify payload")?;
            return Ok(payload);
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "identify handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Resolve the ticket into a session snapshot.
    let snapshot = match state.sessions.resolve_ticket(&payload.ticket).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Invalid or expired ticket").await;
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "ticket resolution failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Ticket lookup failed").await;
            return;
        }
    };

    // Step 3: Build the connection and register it with the pool.
    let (conn, outbound_rx) = WebConn::channel(
        snapshot,
        state.sessions.clone(),
        state.config.conn_queue_capacity,
    );
    state.hub.register(conn.clone()).await;

    tracing::info!(
        conn_id = %conn.id(),
        user_id = %conn.user_id(),
        session_id = %conn.session_id(),
        "gateway connection established"
    );

    // Send READY.
    let ready = GatewayMessage::dispatch(
        EventName::READY,
        conn.next_seq(),
        serde_json::json!({
            "connection_id": conn.id(),
            "user_id": conn.user_id(),
            "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
        }),
    );
    let ready_json = match serde_json::to_string(&ready) {
        Ok(json) => json,
        Err(_) => return,
    };
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        state.hub.unregister(conn.user_id(), conn.id()).await;
        return;
    }

    let clean_close = run_connection(&state, conn.clone(), ws_tx, ws_rx, outbound_rx).await;

    if clean_close {
        state.hub.unregister(conn.user_id(), conn.id()).await;
    } else {
        // Abrupt transport loss: leave the connection registered but
        // inactive so a quick reconnect of the same session reaps it; the
        // sweep catches it otherwise.
        conn.mark_inactive();
    }

    tracing::info!(
        conn_id = %conn.id(),
        user_id = %conn.user_id(),
        clean = clean_close,
        "gateway connection ended"
    );
}

/// Per-connection loop: pump outbound events to the socket, handle client
/// heartbeats, enforce the heartbeat deadline, and exit when the hub closes
/// the connection. Returns whether the close was clean.
async fn run_connection(
    state: &AppState,
    conn: Arc<WebConn>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<Arc<EventPayload>>,
) -> bool {
    // Client must heartbeat within 1.5× the advertised interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                return true;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                state
                                    .hub
                                    .update_activity(conn.user_id(), conn.session_id(), Utc::now())
                                    .await;

                                let payload: HeartbeatPayload = serde_json::from_value(client_msg.d)
                                    .unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                let Ok(json) = serde_json::to_string(&ack) else { return true };
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    return false;
                                }
                            }
                            OP_IDENTIFY => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                return true;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                return true;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => return true,
                    None => return true,
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn_id = %conn.id(), "ws read error");
                        return false;
                    }
                    _ => continue,
                }
            }

            // Event delivered by the hub.
            event = outbound_rx.recv() => {
                let Some(event) = event else {
                    // Hub side dropped the queue; treat as closed.
                    return true;
                };
                let msg = GatewayMessage::dispatch(&event.name, conn.next_seq(), event.data.clone());
                let Ok(json) = serde_json::to_string(&msg) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return false;
                }
            }

            // The hub closed us (teardown, shutdown, or reap).
            _ = conn.closed() => {
                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Connection closed").await;
                return true;
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(conn_id = %conn.id(), "heartbeat timeout, closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    return true;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
