//! Relay application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds one `PresenceRoom` per topic; each member's sink is the bounded
//! outbound queue of its websocket task. Rooms are created on first join and
//! dropped when their last member leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::config::RelayConfig;
use crate::frame::{Data, FRAME_PLAYERS, Frame};
use crate::services::hub::PresenceRoom;
use crate::services::ws_channel::SYSCALL_SYNC;

pub type RelayRoom = PresenceRoom<mpsc::Sender<Frame>>;

/// Shared relay state. Clone is required by Axum; all inner fields are
/// Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<String, RelayRoom>>>,
    /// Topic used when a client does not name one.
    pub default_topic: String,
    /// Per-connection outbound queue depth.
    pub queue_capacity: usize,
    /// Present when `DATABASE_URL` is configured; only used for health checks.
    pub pool: Option<PgPool>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(config: &RelayConfig, pool: Option<PgPool>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_topic: config.default_topic.clone(),
            queue_capacity: config.queue_capacity.max(1),
            pool,
            next_conn: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocate a connection id, unique for the life of the process.
    #[must_use]
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// `presence:sync` frame carrying the room's snapshot.
#[must_use]
pub fn sync_frame(topic: &str, room: &RelayRoom) -> Frame {
    let players = serde_json::to_value(room.snapshot()).unwrap_or_default();
    Frame::request(SYSCALL_SYNC, Data::new())
        .with_topic(topic)
        .with_data(FRAME_PLAYERS, players)
}

/// Send the current snapshot to every member of the room. Members whose
/// queue is full miss this sync and catch up on the next one.
pub fn broadcast_sync(topic: &str, room: &RelayRoom) {
    let frame = sync_frame(topic, room);
    for sink in room.sinks() {
        if sink.try_send(frame.clone()).is_err() {
            debug!(topic, "relay member queue full or closed; sync skipped");
        }
    }
}
