//! WebSocket handler — connection driver and message router.
//!
//! DESIGN
//! ======
//! Each socket is driven by one task through four phases: admit (origin,
//! IP bucket, room code), handshake (authenticate within 5s), join
//! (snapshot sync before any live frame), serve (read loop with size and
//! rate gates plus ping/pong keep-alive). Broadcasts from peers arrive
//! on this connection's bounded channel; because only this task writes
//! to the socket, frames to a client are strictly ordered.
//!
//! ERROR HANDLING
//! ==============
//! Admission and handshake failures are terminal. Per-message failures
//! (oversize, rate limit, malformed, validation, caps) drop the frame
//! and keep the connection. Write failures tear the connection down;
//! the session survives for reconnection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::protocol::{self, AuthRequest, ObjectAddedPayload, ObjectUpdatedPayload};
use crate::services::room::{DrawingObject, Room, CLIENT_CHANNEL_CAPACITY};
use crate::state::AppState;
use crate::validate::ValidationError;

/// Handshake must arrive within this window.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(5);
/// A pong must arrive within this window or the socket is dead.
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping cadence: 9/10 of the pong window.
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Deadline for any single outbound write.
const WRITE_WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Per-message failures. Every variant drops the frame; none of them
/// terminates the connection.
#[derive(Debug, thiserror::Error)]
enum MessageError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("room at maximum object capacity")]
    RoomAtObjectCapacity,
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// UPGRADE / ADMISSION
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.config.origin_allowed(origin) {
        warn!(origin, "origin rejected");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let client_ip = client_ip(&headers, addr);
    if !state.ip_limiter.allow(&client_ip) {
        warn!(%client_ip, "connection rate limit exceeded");
        return (StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    }

    let Some(room_code) = params.get("room").filter(|code| !code.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "room code required").into_response();
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, room_code))
}

/// Extract the real client IP: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address without its port.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    addr.ip().to_string()
}

// =============================================================================
// CONNECTION DRIVER
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, room_code: String) {
    // PHASE: handshake
    let auth = match read_handshake(&mut socket).await {
        Ok(auth) => auth,
        Err(reason) => {
            warn!(%room_code, reason, "handshake failed");
            return;
        }
    };

    let identity = state.sessions.authenticate(auth.token.as_deref());
    let user_id = identity.user_id.clone();
    if identity.is_new {
        info!(%user_id, "new user created");
    } else {
        info!(%user_id, "returning user authenticated");
    }
    state.sessions.set_last_room(&user_id, &room_code);

    let authenticated = match protocol::authenticated_frame(&user_id, &identity.token) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "failed to encode authenticated frame");
            return;
        }
    };
    if send_text(&mut socket, authenticated.into()).await.is_err() {
        return;
    }

    // PHASE: join — the object snapshot is taken in the same critical
    // section that registers this connection, so the sync frame below is
    // complete and no broadcast can be duplicated or lost around it.
    // This task keeps `tx` as proof of ownership for teardown: a
    // reconnect under the same user id installs a new channel, and only
    // the channel's own task may remove it.
    let (tx, mut rx) = mpsc::channel::<Utf8Bytes>(CLIENT_CHANNEL_CAPACITY);
    let (room, snapshot) = match state
        .rooms
        .get_or_join(&room_code, &user_id, tx.clone(), &state.config)
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            warn!(%user_id, %room_code, error = %e, "join rejected");
            return;
        }
    };

    let synced = async {
        let sync = protocol::sync_frame(&snapshot.objects).map_err(|e| {
            error!(error = %e, "failed to encode sync frame");
        })?;
        send_text(&mut socket, sync.into()).await?;

        let joined = protocol::room_joined_frame(&snapshot.color, &room_code).map_err(|e| {
            error!(error = %e, "failed to encode room_joined frame");
        })?;
        send_text(&mut socket, joined.into()).await
    }
    .await;

    if synced.is_err() {
        room.leave(&user_id, &tx).await;
        return;
    }

    let connections = room.connection_count().await;
    info!(%user_id, %room_code, connections, "user joined room");

    // PHASE: serve
    serve(&mut socket, &state, &room, &user_id, &mut rx).await;

    // PHASE: teardown — the session stays alive so the user can
    // reconnect under the same identity. If a reconnect has already
    // superseded this connection, `leave` recognizes the foreign
    // channel and leaves the successor in place.
    room.leave(&user_id, &tx).await;
    info!(%user_id, %room_code, "user disconnected");
}

/// Read and parse the authenticate frame, enforcing the handshake
/// deadline.
async fn read_handshake(socket: &mut WebSocket) -> Result<AuthRequest, &'static str> {
    let frame = timeout(HANDSHAKE_WAIT, socket.recv())
        .await
        .map_err(|_| "handshake timeout")?;

    let Some(Ok(Message::Text(text))) = frame else {
        return Err("socket closed before handshake");
    };

    let auth: AuthRequest =
        serde_json::from_str(text.as_str()).map_err(|_| "malformed handshake")?;
    if auth.msg_type != "authenticate" {
        return Err("expected authenticate message");
    }
    Ok(auth)
}

/// Pump the socket: inbound frames are gated and routed, peer broadcasts
/// are forwarded, pings keep the read deadline honest.
async fn serve(
    socket: &mut WebSocket,
    state: &AppState,
    room: &Room,
    user_id: &str,
    rx: &mut mpsc::Receiver<Utf8Bytes>,
) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await; // consume the immediate first tick
    let mut read_deadline = Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > state.config.max_message_size {
                            warn!(%user_id, bytes = text.len(), "oversized message dropped");
                            continue;
                        }
                        let replies = process_frame(state, room, user_id, text.as_str()).await;
                        let mut write_failed = false;
                        for reply in replies {
                            if send_text(socket, reply.into()).await.is_err() {
                                write_failed = true;
                                break;
                            }
                        }
                        if write_failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        read_deadline = Instant::now() + PONG_WAIT;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%user_id, error = %e, "socket read failed");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                let Some(payload) = outbound else { break };
                if send_text(socket, payload).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                let write = timeout(WRITE_WAIT, socket.send(Message::Ping(Bytes::new()))).await;
                if !matches!(write, Ok(Ok(()))) {
                    warn!(%user_id, "ping write failed");
                    break;
                }
            }
            () = sleep_until(read_deadline) => {
                warn!(%user_id, "pong deadline missed; closing connection");
                break;
            }
        }
    }
}

/// Write one text frame with the write deadline applied.
async fn send_text(socket: &mut WebSocket, payload: Utf8Bytes) -> Result<(), ()> {
    match timeout(WRITE_WAIT, socket.send(Message::Text(payload))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "socket write failed");
            Err(())
        }
        Err(_) => {
            warn!("socket write timed out");
            Err(())
        }
    }
}

// =============================================================================
// MESSAGE ROUTER
// =============================================================================

/// Gate and route one inbound text frame. Returns frames to send back to
/// the sender; broadcasts to peers go out through their channels. Kept
/// free of socket I/O so dispatch is testable end-to-end.
async fn process_frame(state: &AppState, room: &Room, user_id: &str, raw: &str) -> Vec<String> {
    let mut envelope: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(%user_id, error = %e, "malformed envelope dropped");
            return Vec::new();
        }
    };
    let Some(msg_type) = envelope.get("type").and_then(Value::as_str).map(str::to_owned) else {
        warn!(%user_id, "envelope missing type; dropped");
        return Vec::new();
    };

    // Cursor traffic charges its own, more generous bucket.
    let allowed = if msg_type == "cursor" {
        state.sessions.allow_cursor(user_id)
    } else {
        state.sessions.allow_message(user_id)
    };
    if !allowed {
        warn!(%user_id, %msg_type, "rate limit exceeded; message dropped");
        return Vec::new();
    }

    let result = match msg_type.as_str() {
        "getUserId" => handle_get_user_id(user_id),
        "objectAdded" => handle_object_added(state, room, user_id, &mut envelope).await,
        "objectUpdated" => handle_object_updated(state, room, user_id, &mut envelope).await,
        "objectDeleted" => handle_object_deleted(room, user_id, &mut envelope).await,
        "cursor" => handle_cursor(state, room, user_id, &mut envelope).await,
        other => {
            info!(%user_id, msg_type = other, "unknown message type ignored");
            Ok(Vec::new())
        }
    };

    match result {
        Ok(replies) => replies,
        Err(e) => {
            warn!(%user_id, %msg_type, error = %e, "message dropped");
            Vec::new()
        }
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

fn handle_get_user_id(user_id: &str) -> Result<Vec<String>, MessageError> {
    Ok(vec![protocol::user_id_frame(user_id)?])
}

async fn handle_object_added(
    state: &AppState,
    room: &Room,
    user_id: &str,
    envelope: &mut Value,
) -> Result<Vec<String>, MessageError> {
    if room.object_count().await >= state.config.max_objects {
        return Err(MessageError::RoomAtObjectCapacity);
    }

    let payload = envelope
        .get("object")
        .cloned()
        .ok_or(MessageError::MissingField("object"))?;
    let payload: ObjectAddedPayload = serde_json::from_value(payload)?;
    let sanitized = state
        .validator
        .validate_and_sanitize(&payload.kind, &payload.data)?;

    // The peer snapshot comes out of the insert's critical section, so
    // a concurrent joiner is either in the snapshot or will see the
    // object in its sync, never both.
    let peers = room
        .add_object(DrawingObject {
            id: payload.id,
            kind: payload.kind,
            data: sanitized.clone(),
            user_id: user_id.to_string(),
            z_index: payload.z_index,
        })
        .await;

    // Relay the envelope with sanitized data and the author stamped.
    if let Some(object) = envelope.get_mut("object") {
        object["data"] = Value::Object(sanitized);
    }
    envelope["userId"] = Value::String(user_id.to_string());
    let frame = serde_json::to_string(envelope)?;
    room.deliver(peers, &Utf8Bytes::from(frame), Some(user_id)).await;

    Ok(Vec::new())
}

async fn handle_object_updated(
    state: &AppState,
    room: &Room,
    user_id: &str,
    envelope: &mut Value,
) -> Result<Vec<String>, MessageError> {
    let payload = envelope
        .get("object")
        .cloned()
        .ok_or(MessageError::MissingField("object"))?;
    let payload: ObjectUpdatedPayload = serde_json::from_value(payload)?;

    // The schema comes from the stored object, never from the client, so
    // an update cannot re-type an object.
    let existing = room
        .get_object(&payload.id)
        .await
        .ok_or_else(|| MessageError::ObjectNotFound(payload.id.clone()))?;
    let sanitized = state
        .validator
        .validate_and_sanitize(&existing.kind, &payload.data)?;

    let (existed, peers) = room.update_object(&payload.id, sanitized.clone()).await;
    if !existed {
        // Deleted between the lookup above and the write lock.
        return Err(MessageError::ObjectNotFound(payload.id));
    }

    if let Some(object) = envelope.get_mut("object") {
        object["data"] = Value::Object(sanitized);
    }
    envelope["userId"] = Value::String(user_id.to_string());
    let frame = serde_json::to_string(envelope)?;
    room.deliver(peers, &Utf8Bytes::from(frame), Some(user_id)).await;

    Ok(Vec::new())
}

async fn handle_object_deleted(
    room: &Room,
    user_id: &str,
    envelope: &mut Value,
) -> Result<Vec<String>, MessageError> {
    let object_id = envelope
        .get("objectId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(MessageError::MissingField("objectId"))?;

    // Idempotent: deleting a missing id still broadcasts.
    let peers = room.delete_object(&object_id).await;

    envelope["userId"] = Value::String(user_id.to_string());
    let frame = serde_json::to_string(envelope)?;
    room.deliver(peers, &Utf8Bytes::from(frame), Some(user_id)).await;

    Ok(Vec::new())
}

async fn handle_cursor(
    state: &AppState,
    room: &Room,
    user_id: &str,
    envelope: &mut Value,
) -> Result<Vec<String>, MessageError> {
    // ~30fps server-side throttle; dropped updates are routine, not
    // worth logging.
    if !state.sessions.throttle_cursor(user_id) {
        return Ok(Vec::new());
    }

    let color = room.user_color(user_id).await.unwrap_or_default();
    envelope["color"] = Value::String(color);
    envelope["userId"] = Value::String(user_id.to_string());
    let frame = serde_json::to_string(envelope)?;
    room.broadcast(&Utf8Bytes::from(frame), Some(user_id)).await;

    Ok(Vec::new())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
