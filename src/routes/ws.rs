//! WebSocket handler: presence channel relay.
//!
//! DESIGN
//! ======
//! Each connection joins one topic's `PresenceRoom` under its user key and
//! enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - Queued frames from the room → forward to client
//!
//! The room holds the only sender for a connection's queue. When a newer
//! connection with the same key joins, the old sender is handed back, used
//! once to deliver `session:superseded`, and dropped; the old loop then sees
//! its queue close and exits.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → join room → send `session:connected` → sync room
//! 2. `presence:track` / `presence:untrack` → mutate room → sync room
//! 3. Close → leave room (if still the member's connection) → sync room

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, FRAME_PLAYER, Frame, Status};
use crate::model::{Player, clamp_percent};
use crate::services::ws_channel::{SYSCALL_CONNECTED, SYSCALL_TRACK, SYSCALL_UNTRACK};
use crate::state::{AppState, broadcast_sync};

pub const SYSCALL_SUPERSEDED: &str = "session:superseded";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("player payload required: {0}")]
    InvalidPlayer(String),
    #[error("connection superseded by a newer one")]
    Superseded,
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFrame(_) => "E_INVALID_FRAME",
            Self::InvalidPlayer(_) => "E_INVALID_PLAYER",
            Self::Superseded => "E_SUPERSEDED",
            Self::UnknownSyscall(_) => "E_UNKNOWN_SYSCALL",
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

/// Resolve `topic` (default when absent) and `user_id` from the query.
pub(crate) fn presence_params(
    params: &HashMap<String, String>,
    default_topic: &str,
) -> Result<(String, Uuid), (StatusCode, &'static str)> {
    let Some(raw_user) = params.get("user_id") else {
        return Err((StatusCode::UNAUTHORIZED, "user_id required"));
    };
    let user_id = raw_user
        .parse::<Uuid>()
        .map_err(|_| (StatusCode::BAD_REQUEST, "user_id must be a uuid"))?;
    let topic = params
        .get("topic")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .unwrap_or(default_topic)
        .to_owned();
    Ok((topic, user_id))
}

pub async fn handle_presence(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (topic, user_id) = match presence_params(&params, &state.default_topic) {
        Ok(resolved) => resolved,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| run_presence(socket, state, topic, user_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_presence(mut socket: WebSocket, state: AppState, topic: String, user_id: Uuid) {
    let conn_id = state.next_conn_id();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.queue_capacity);

    let welcome = Frame::request(SYSCALL_CONNECTED, Data::new())
        .with_topic(topic.as_str())
        .with_data("client_id", conn_id)
        .with_data("user_id", user_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    join_room(&state, &topic, user_id, conn_id, client_tx).await;
    info!(%user_id, conn_id, topic = %topic, "presence: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for reply in process_inbound_text(&state, &topic, user_id, conn_id, text.as_str()).await {
                            let _ = send_frame(&mut socket, &reply).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            queued = client_rx.recv() => {
                let Some(frame) = queued else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    leave_room(&state, &topic, user_id, conn_id).await;
    info!(%user_id, conn_id, topic = %topic, "presence: client disconnected");
}

pub(crate) async fn join_room(
    state: &AppState,
    topic: &str,
    user_id: Uuid,
    conn_id: u64,
    client_tx: mpsc::Sender<Frame>,
) {
    let mut rooms = state.rooms.write().await;
    let room = rooms.entry(topic.to_owned()).or_default();
    if let Some(old) = room.join(user_id, conn_id, client_tx) {
        info!(%user_id, topic, "presence: superseding older connection");
        let notice = Frame::request(SYSCALL_SUPERSEDED, Data::new()).with_topic(topic);
        let _ = old.try_send(notice);
    }
    broadcast_sync(topic, room);
}

pub(crate) async fn leave_room(state: &AppState, topic: &str, user_id: Uuid, conn_id: u64) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(topic) else {
        return;
    };
    if room.leave(user_id, conn_id).is_some() {
        broadcast_sync(topic, room);
    }
    if room.is_empty() {
        rooms.remove(topic);
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Room-wide syncs go out through member queues.
pub(crate) async fn process_inbound_text(
    state: &AppState,
    topic: &str,
    user_id: Uuid,
    conn_id: u64,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%user_id, error = %e, "presence: invalid inbound frame");
            let err = RelayError::InvalidFrame(e.to_string());
            return vec![Frame::request("gateway:error", Data::new()).error_from(&err)];
        }
    };
    req.from = Some(user_id.to_string());

    let result = match req.syscall.as_str() {
        SYSCALL_TRACK => handle_track(state, topic, user_id, conn_id, &req).await,
        SYSCALL_UNTRACK => handle_untrack(state, topic, user_id, conn_id).await,
        other => Err(RelayError::UnknownSyscall(other.to_owned())),
    };
    match result {
        Ok(()) => vec![req.done()],
        Err(e) => vec![req.error_from(&e)],
    }
}

async fn handle_track(
    state: &AppState,
    topic: &str,
    user_id: Uuid,
    conn_id: u64,
    req: &Frame,
) -> Result<(), RelayError> {
    let raw = req
        .data
        .get(FRAME_PLAYER)
        .cloned()
        .ok_or_else(|| RelayError::InvalidPlayer("missing".into()))?;
    let mut player: Player = serde_json::from_value(raw).map_err(|e| RelayError::InvalidPlayer(e.to_string()))?;
    player.x = clamp_percent(player.x);
    player.y = clamp_percent(player.y);

    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(topic).ok_or(RelayError::Superseded)?;
    if !room.track(user_id, conn_id, player) {
        return Err(RelayError::Superseded);
    }
    broadcast_sync(topic, room);
    Ok(())
}

async fn handle_untrack(state: &AppState, topic: &str, user_id: Uuid, conn_id: u64) -> Result<(), RelayError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(topic).ok_or(RelayError::Superseded)?;
    if room.untrack(user_id, conn_id) {
        broadcast_sync(topic, room);
    }
    Ok(())
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "presence: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, "presence: send frame status=Error");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
