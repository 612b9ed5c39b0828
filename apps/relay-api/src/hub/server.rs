//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use cove_common::id::prefixed_ulid;

use crate::error::Error;
use crate::fanout;
use crate::store::keys;
use crate::AppState;

use super::frames::{ClientFrame, ServerFrame};
use super::presence;
use super::registry::ConnHandle;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving the auth frame after connection (seconds).
const AUTH_TIMEOUT_SECS: u64 = 10;

/// Cadence the client is told to heartbeat at.
pub const HEARTBEAT_INTERVAL_MS: u64 = 45_000;

/// Per-connection outbound queue depth. Deliveries beyond this are dropped
/// (and recovered through history) rather than backpressuring the hub.
const OUTBOUND_QUEUE: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/realtime", get(ws_upgrade))
        .route("/healthz", get(|| async { "ok" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: the first frame must be auth, within the timeout.
    let auth_result = time::timeout(
        Duration::from_secs(AUTH_TIMEOUT_SECS),
        read_auth_frame(&mut ws_tx, &mut ws_rx),
    )
    .await;

    let user_id = match auth_result {
        Ok(Ok(token)) => match crate::auth::verify_token(&state.config.auth_secret, &token) {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::debug!(error = %err, "handshake credential rejected");
                let (code, reason) = handshake_close(&err);
                let _ = send_close(&mut ws_tx, code, reason).await;
                return;
            }
        },
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "handshake failed");
            return;
        }
        Err(_elapsed) => {
            let err = Error::AuthTimeout;
            tracing::debug!(error = %err, "handshake abandoned");
            let (code, reason) = handshake_close(&err);
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
    };

    let conn_id = prefixed_ulid(cove_common::id::prefix::CONNECTION);

    // Attach before announcing presence so no delivery window is missed:
    // registration subscribes the group channels, presence then tells the
    // fleet this user no longer needs push.
    let groups = match state.store.smembers(&keys::user_groups(&user_id)).await {
        Ok(groups) => groups,
        Err(err) => {
            tracing::error!(error = %err, "membership lookup failed during handshake");
            let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Internal error").await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let registered = state
        .hub
        .register(
            ConnHandle {
                conn_id: conn_id.clone(),
                user_id: user_id.clone(),
                outbound: outbound_tx,
            },
            groups,
        )
        .await;
    if let Err(err) = registered {
        tracing::error!(error = %err, "hub registration failed");
        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Internal error").await;
        return;
    }

    if let Err(err) = presence::mark_online(&*state.store, &state.config.instance_id, &user_id).await
    {
        tracing::warn!(error = %err, %user_id, "presence announce failed");
    }

    tracing::info!(%conn_id, %user_id, "realtime connection established");

    let ready = ServerFrame::Ready {
        user_id: user_id.clone(),
        heartbeat_interval: HEARTBEAT_INTERVAL_MS,
    };
    if send_frame(&mut ws_tx, &ready).await.is_err() {
        teardown(&state, &conn_id).await;
        return;
    }

    run_connection(&state, &conn_id, &user_id, ws_tx, ws_rx, outbound_rx).await;

    teardown(&state, &conn_id).await;
    tracing::info!(%conn_id, %user_id, "realtime connection closed");
}

/// Wait for the first text frame and require it to be auth.
async fn read_auth_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<String, &'static str> {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(?e, "ws read error during handshake");
                return Err("read error");
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err("client closed"),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => {
                let _ = send_close(ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                return Err("invalid json");
            }
        };

        match frame {
            ClientFrame::Auth { token } => return Ok(token),
            _ => {
                let _ = send_close(ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected auth").await;
                return Err("expected auth frame");
            }
        }
    }
    Err("connection closed before auth")
}

/// Main event loop: read client frames, drain hub deliveries, enforce the
/// heartbeat deadline.
async fn run_connection(
    state: &AppState,
    conn_id: &str,
    user_id: &str,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
) {
    // Client must heartbeat within 1.5× the advertised interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match frame {
                            ClientFrame::Heartbeat => {
                                got_heartbeat = true;
                                if let Err(err) = state.store
                                    .set_ex(
                                        &keys::presence(user_id),
                                        &state.config.instance_id,
                                        keys::PRESENCE_TTL_SECS,
                                    )
                                    .await
                                {
                                    tracing::warn!(error = %err, "presence refresh failed");
                                }
                                state.hub.touch(conn_id).await;
                                if send_frame(&mut ws_tx, &ServerFrame::HeartbeatAck).await.is_err() {
                                    break;
                                }
                            }
                            ClientFrame::Message { envelope } => {
                                if let Err(err) =
                                    fanout::dispatch_message(state, user_id, envelope).await
                                {
                                    let frame = error_frame(&err);
                                    tracing::debug!(%conn_id, error = %err, "message rejected");
                                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            ClientFrame::Auth { .. } => {
                                // Already authenticated.
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already authenticated").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, %conn_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // A frame from the hub (delivery or lifecycle).
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Heartbeat deadline check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(%conn_id, "heartbeat timeout; closing connection");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Remove the connection from the registry and, when it was the user's last
/// local connection, retract presence.
async fn teardown(state: &AppState, conn_id: &str) {
    let outcome = match state.hub.unregister(conn_id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, %conn_id, "hub unregister failed");
            return;
        }
    };

    if let (Some(user_id), true) = (&outcome.user_id, outcome.last_for_user) {
        if let Err(err) =
            presence::mark_offline(&*state.store, &state.config.instance_id, user_id).await
        {
            tracing::warn!(error = %err, %user_id, "presence retraction failed");
        }
    }
}

/// Close code and reason for a failed handshake.
fn handshake_close(err: &Error) -> (u16, &'static str) {
    match err {
        Error::AuthTimeout => (CLOSE_SESSION_TIMEOUT, "Handshake timeout"),
        Error::AuthInvalid(_) => (CLOSE_AUTH_FAILED, "Invalid credential"),
        _ => (CLOSE_UNKNOWN_ERROR, "Internal error"),
    }
}

fn error_frame(err: &Error) -> ServerFrame {
    let code = match err {
        Error::NotAMember => "forbidden",
        Error::Persist(_) | Error::Pool(_) => "persist_failed",
        _ => "bad_request",
    };
    ServerFrame::Error {
        code,
        message: err.to_string(),
    }
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).expect("server frames serialize");
    ws_tx.send(Message::Text(json.into())).await
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
