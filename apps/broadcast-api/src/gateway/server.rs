//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use onair_common::id::{prefix, prefixed_ulid};
use tokio::sync::broadcast;
use tokio::time;

use crate::AppState;

use super::events::{ClientMessage, GatewayMessage, HeartbeatPayload, OP_DISPATCH, OP_HEARTBEAT};
use super::fanout::BroadcastPayload;
use super::handler::{error_reply, handle_event, DirectReply};
use super::session::GatewaySession;

/// Application close codes.
const CLOSE_INVALID_JSON: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_LAGGED: u16 = 4008;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

type WsSink = SplitSink<WebSocket, Message>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = prefixed_ulid(prefix::CONNECTION);
    state.connections.open(&connection_id);
    let session = Arc::new(GatewaySession::new(connection_id.clone()));

    // Subscribe before the first event is handled so replies to our own
    // join are never missed.
    let broadcast_rx = state.broadcast.subscribe();
    let audio_rx = state.broadcast.subscribe_audio();

    tracing::debug!(%connection_id, "gateway connection opened");
    run_session(&state, session, socket, broadcast_rx, audio_rx).await;

    if let Some(conn) = state.connections.close(&connection_id) {
        state.registry.disconnect(&conn);
        tracing::debug!(
            %connection_id,
            role = %conn.role,
            broadcast_id = conn.broadcast_id.as_deref().unwrap_or("-"),
            "gateway connection closed"
        );
    }
}

/// Main event loop: read client messages, forward fanout events, enforce heartbeat.
async fn run_session(
    state: &AppState,
    session: Arc<GatewaySession>,
    socket: WebSocket,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
    mut audio_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Client must heartbeat within 1.5x the advertised interval.
    let heartbeat_deadline = Duration::from_millis(state.config.heartbeat_interval_ms * 3 / 2);
    let mut heartbeat_check = time::interval_at(time::Instant::now() + heartbeat_deadline, heartbeat_deadline);
    let mut heartbeat_seen = true;

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let flow = match frame {
                    Some(Ok(Message::Text(text))) => {
                        on_text(state, &session, &mut ws_tx, &text, &mut heartbeat_seen).await
                    }
                    Some(Ok(Message::Close(_))) | None => Flow::Stop,
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, connection_id = %session.connection_id, "gateway read failed");
                        Flow::Stop
                    }
                    Some(Ok(_)) => Flow::Continue,
                };
                if let Flow::Stop = flow {
                    break;
                }
            }

            fanned = broadcast_rx.recv() => match fanned {
                Ok(payload) if payload.recipients.includes(&session.connection_id, session.role()) => {
                    let msg = GatewayMessage::dispatch(&payload.event_name, session.next_seq(), payload.data.clone());
                    if !send_json(&mut ws_tx, &msg).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed control events cannot be replayed; the client rejoins.
                    tracing::warn!(connection_id = %session.connection_id, skipped, "gateway connection lagged behind control fanout");
                    let _ = send_close(&mut ws_tx, CLOSE_LAGGED, "Fell behind").await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            chunk = audio_rx.recv() => match chunk {
                Ok(payload) if payload.recipients.includes(&session.connection_id, session.role()) => {
                    let msg = GatewayMessage::dispatch(&payload.event_name, session.next_seq(), payload.data.clone());
                    if !send_json(&mut ws_tx, &msg).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(connection_id = %session.connection_id, skipped, "audio chunks skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = heartbeat_check.tick() => {
                if !heartbeat_seen {
                    tracing::debug!(connection_id = %session.connection_id, "heartbeat timeout");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                heartbeat_seen = false;
            }
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Handle one text frame: a heartbeat or a named control event.
async fn on_text(
    state: &AppState,
    session: &GatewaySession,
    ws_tx: &mut WsSink,
    text: &str,
    heartbeat_seen: &mut bool,
) -> Flow {
    let Ok(client_msg) = serde_json::from_str::<ClientMessage>(text) else {
        let _ = send_close(ws_tx, CLOSE_INVALID_JSON, "Invalid JSON").await;
        return Flow::Stop;
    };

    let reply = match client_msg.op {
        OP_HEARTBEAT => {
            *heartbeat_seen = true;
            let seq = serde_json::from_value::<HeartbeatPayload>(client_msg.d)
                .map(|p| p.seq)
                .unwrap_or_default();
            GatewayMessage::heartbeat_ack(seq)
        }
        OP_DISPATCH => {
            let event = client_msg.t.unwrap_or_default();
            let direct = handle_event(state, session, &event, client_msg.d).unwrap_or_else(|err| {
                tracing::debug!(
                    connection_id = %session.connection_id,
                    %event,
                    code = err.code(),
                    "control event rejected"
                );
                Some(error_reply(&event, &err))
            });
            match direct {
                Some(DirectReply { event_name, data }) => {
                    GatewayMessage::dispatch(event_name, session.next_seq(), data)
                }
                None => return Flow::Continue,
            }
        }
        _ => {
            let _ = send_close(ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
            return Flow::Stop;
        }
    };

    if send_json(ws_tx, &reply).await {
        Flow::Continue
    } else {
        Flow::Stop
    }
}

/// Serialize and send a gateway message. Returns `false` once the socket is gone.
async fn send_json(ws_tx: &mut WsSink, msg: &GatewayMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(?e, "failed to serialize gateway message");
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
