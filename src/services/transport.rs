//! Presence transport: one tracked payload per client on a shared channel.
//!
//! ARCHITECTURE
//! ============
//! `PresenceService` is an explicit per-session object holding the shared
//! channel link, the subscriber registry, and the local player. Many local
//! subscribers share one link; the link is torn down when the last
//! `PresenceSubscription` drops, or when a different user subscribes (which
//! resets everything first).
//!
//! The channel itself sits behind `ChannelFactory` / `PresenceSink` so the
//! same service runs over the in-process `LocalHub` or the websocket relay.
//!
//! DESIGN
//! ======
//! Local mutations are optimistic: the in-memory player changes, a snapshot is
//! emitted to subscribers immediately, and only then is the new payload
//! tracked on the channel. Snapshots are deduplicated on a canonical key list
//! (id, floor, position, walking, status), so sync events that change nothing
//! never reach subscribers.
//!
//! ERROR HANDLING
//! ==============
//! Channel and profile failures become `PresenceEvent::Error` notices; the
//! service keeps its last known local player and never throws into callers'
//! event handlers. Local storage writes are best-effort and only logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ProfileStore};
use crate::frame::ErrorCode;
use crate::model::{Player, PlayerPatch, Point, Profile, UNRESOLVED_DISPLAY_NAME, normalize_status_message};
use crate::storage::{
    KeyValueStore, LAST_LOCATION_KEY, LAST_STATUS_KEY, StorageError, StoredLocation, get_typed, set_typed,
};

/// Spawn positions land inside this band so new avatars never start on an
/// edge of the map.
const SPAWN_MIN: f64 = 10.0;
const SPAWN_MAX: f64 = 90.0;

// =============================================================================
// ERRORS + EVENTS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("presence channel connect failed: {0}")]
    Connect(String),
    #[error("presence channel error: {0}")]
    Channel(String),
    #[error("presence channel closed")]
    Closed,
    #[error("local player is not ready")]
    NotReady,
    #[error("profile lookup failed: {0}")]
    Profile(#[from] BackendError),
    #[error("local storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "E_CHANNEL_CONNECT",
            Self::Channel(_) => "E_CHANNEL",
            Self::Closed => "E_CHANNEL_CLOSED",
            Self::NotReady => "E_NOT_READY",
            Self::Profile(_) => "E_PROFILE",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed)
    }
}

/// What subscribers receive.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Full membership, sorted by player id.
    Players(Arc<Vec<Player>>),
    Error { code: &'static str, message: String },
}

impl PresenceEvent {
    fn from_error(err: &TransportError) -> Self {
        Self::Error { code: err.error_code(), message: err.to_string() }
    }
}

// =============================================================================
// CHANNEL SEAM
// =============================================================================

/// Inbound traffic on one channel link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Full membership snapshot.
    Sync(Vec<Player>),
    Error(String),
    /// The link is gone (dropped, superseded, or closed remotely).
    Closed,
}

/// Outbound half of a channel link.
pub trait PresenceSink: Send + Sync {
    /// Replace this connection's tracked payload.
    fn track(&self, player: &Player) -> Result<(), TransportError>;
    /// Withdraw the tracked payload but stay connected.
    fn untrack(&self) -> Result<(), TransportError>;
    fn close(&self);
}

pub struct ChannelLink {
    pub sink: Arc<dyn PresenceSink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Join `topic` as `user_key`. A newer connection with the same key
    /// supersedes an older one.
    async fn connect(&self, topic: &str, user_key: Uuid) -> Result<ChannelLink, TransportError>;
}

// =============================================================================
// SERVICE STATE
// =============================================================================

type SnapshotKey = (Uuid, Option<Uuid>, u64, u64, bool, Option<String>);

fn snapshot_keys(players: &[Player]) -> Vec<SnapshotKey> {
    players
        .iter()
        .map(|p| (p.id, p.floor_id, p.x.to_bits(), p.y.to_bits(), p.is_walking, p.status_message.clone()))
        .collect()
}

/// Intent recorded before the local player exists.
#[derive(Debug, Default)]
struct PendingSpawn {
    location: Option<(Point, Option<Uuid>)>,
    status: Option<Option<String>>,
}

#[derive(Default)]
struct Inner {
    user_id: Option<Uuid>,
    /// Bumped on every teardown so stale pumps and subscriptions go inert.
    generation: u64,
    next_subscriber: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<PresenceEvent>>,
    link: Option<Arc<dyn PresenceSink>>,
    pump: Option<JoinHandle<()>>,
    connecting: bool,
    local: Option<Player>,
    pending: PendingSpawn,
    remote: Vec<Player>,
    last_emitted: Option<Vec<SnapshotKey>>,
    last_players: Option<Arc<Vec<Player>>>,
}

impl Inner {
    /// Close the link, keeping the local player for the next connection.
    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.untrack();
            link.close();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connecting = false;
        self.remote.clear();
        self.generation += 1;
    }

    /// Forget everything, including subscribers and the local player.
    fn reset(&mut self) {
        self.teardown_link();
        self.subscribers.clear();
        self.user_id = None;
        self.local = None;
        self.pending = PendingSpawn::default();
        self.last_emitted = None;
        self.last_players = None;
    }

    /// Remote membership with the local entry overriding its own row.
    fn compose(&self) -> Vec<Player> {
        let local_id = self.local.as_ref().map(|p| p.id);
        let mut players: Vec<Player> = self
            .remote
            .iter()
            .filter(|p| Some(p.id) != local_id)
            .cloned()
            .collect();
        if let Some(local) = &self.local {
            players.push(local.clone());
        }
        players.sort_by_key(|p| p.id);
        players
    }

    /// Push a snapshot if it differs from the last one. Returns whether it
    /// was sent.
    fn emit_snapshot(&mut self) -> bool {
        let players = self.compose();
        let keys = snapshot_keys(&players);
        if self.last_emitted.as_ref() == Some(&keys) {
            return false;
        }
        self.last_emitted = Some(keys);
        let players = Arc::new(players);
        self.last_players = Some(players.clone());
        self.subscribers
            .retain(|_, tx| tx.send(PresenceEvent::Players(players.clone())).is_ok());
        true
    }

    fn notify_error(&mut self, err: &TransportError) {
        let event = PresenceEvent::from_error(err);
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

struct Shared {
    topic: String,
    factory: Arc<dyn ChannelFactory>,
    profiles: Arc<dyn ProfileStore>,
    storage: Arc<dyn KeyValueStore>,
    state: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// SUBSCRIPTION HANDLE
// =============================================================================

/// Live membership feed. Dropping it unsubscribes; the last drop closes the
/// channel link.
pub struct PresenceSubscription {
    shared: Weak<Shared>,
    id: u64,
    generation: u64,
    rx: mpsc::UnboundedReceiver<PresenceEvent>,
}

impl PresenceSubscription {
    /// Next event, or `None` once the service has reset.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PresenceEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner.generation != self.generation {
            return;
        }
        inner.subscribers.remove(&self.id);
        if inner.subscribers.is_empty() {
            debug!(topic = %shared.topic, "last presence subscriber left; closing channel");
            inner.teardown_link();
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct PresenceService {
    shared: Arc<Shared>,
}

impl PresenceService {
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        factory: Arc<dyn ChannelFactory>,
        profiles: Arc<dyn ProfileStore>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                factory,
                profiles,
                storage,
                state: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Subscribe as `user_id`. The first subscriber opens the channel; a
    /// subscriber for a different user resets the service first.
    pub async fn subscribe(&self, user_id: Uuid) -> PresenceSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, generation, needs_connect) = {
            let mut inner = self.shared.lock();
            if inner.user_id.is_some_and(|current| current != user_id) {
                info!(%user_id, "presence user changed; resetting channel");
                inner.reset();
            }
            inner.user_id = Some(user_id);
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            if let Some(players) = &inner.last_players {
                let _ = tx.send(PresenceEvent::Players(players.clone()));
            }
            inner.subscribers.insert(id, tx);
            let needs_connect = inner.link.is_none() && !inner.connecting;
            if needs_connect {
                inner.connecting = true;
            }
            (id, inner.generation, needs_connect)
        };

        if needs_connect {
            self.connect(user_id, generation).await;
        }

        PresenceSubscription { shared: Arc::downgrade(&self.shared), id, generation, rx }
    }

    /// Re-open a dropped link for the current subscribers. No-op when
    /// connected, connecting, or nobody is listening.
    pub async fn reconnect(&self) {
        let (user_id, generation) = {
            let mut inner = self.shared.lock();
            let Some(user_id) = inner.user_id else {
                return;
            };
            if inner.link.is_some() || inner.connecting || inner.subscribers.is_empty() {
                return;
            }
            inner.connecting = true;
            (user_id, inner.generation)
        };
        self.connect(user_id, generation).await;
    }

    async fn connect(&self, user_id: Uuid, generation: u64) {
        let shared = &self.shared;
        let link = match shared.factory.connect(&shared.topic, user_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!(%user_id, topic = %shared.topic, error = %e, "presence channel connect failed");
                let mut inner = shared.lock();
                if inner.generation == generation {
                    inner.connecting = false;
                    inner.notify_error(&e);
                }
                return;
            }
        };

        let ChannelLink { sink, events } = link;
        let needs_seed = {
            let mut inner = shared.lock();
            if inner.generation != generation || inner.subscribers.is_empty() {
                sink.close();
                return;
            }
            inner.connecting = false;
            inner.link = Some(sink);
            inner.pump = Some(tokio::spawn(pump_link_events(Arc::downgrade(shared), generation, events)));
            inner.local.is_none()
        };
        info!(%user_id, topic = %shared.topic, "presence channel connected");

        if needs_seed {
            let profile = match shared.profiles.get_by_id(user_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(%user_id, error = %e, "presence profile lookup failed; seeding placeholder");
                    shared.lock().notify_error(&TransportError::Profile(e));
                    None
                }
            };
            let mut inner = shared.lock();
            if inner.generation != generation {
                return;
            }
            if inner.local.is_none() {
                let player = self.seed_player(&mut inner, user_id, profile.as_ref());
                inner.local = Some(player);
            }
        }

        self.emit_local();
        if let Err(e) = self.broadcast_local() {
            warn!(%user_id, error = %e, "initial presence track failed");
            shared.lock().notify_error(&e);
        }
    }

    fn seed_player(&self, inner: &mut Inner, user_id: Uuid, profile: Option<&Profile>) -> Player {
        let storage = self.shared.storage.as_ref();
        let (position, floor_id) = inner.pending.location.take().unwrap_or_else(|| {
            match get_typed::<StoredLocation>(storage, LAST_LOCATION_KEY) {
                Ok(Some(stored)) => (Point::clamped(stored.x, stored.y), stored.floor_id),
                Ok(None) => (random_spawn(), None),
                Err(e) => {
                    warn!(error = %e, "stored location unreadable");
                    (random_spawn(), None)
                }
            }
        });
        let status = match inner.pending.status.take() {
            Some(status) => status,
            None => get_typed::<String>(storage, LAST_STATUS_KEY).unwrap_or_else(|e| {
                warn!(error = %e, "stored status unreadable");
                None
            }),
        };

        Player {
            id: user_id,
            display_name: profile.map_or_else(|| UNRESOLVED_DISPLAY_NAME.to_owned(), Profile::label),
            avatar_url: profile.and_then(|p| p.avatar_url.clone()),
            role: profile.and_then(|p| p.role.clone()),
            floor_id,
            x: position.x,
            y: position.y,
            is_walking: false,
            target_x: None,
            target_y: None,
            status_message: normalize_status_message(status.as_deref()),
        }
    }

    // -------------------------------------------------------------------------
    // local player mutations
    // -------------------------------------------------------------------------

    /// Mutate the local player in memory only. Returns the updated player, or
    /// `None` before it exists.
    pub fn apply_local(&self, patch: &PlayerPatch) -> Option<Player> {
        let mut inner = self.shared.lock();
        let local = inner.local.as_mut()?;
        patch.apply(local);
        Some(local.clone())
    }

    /// Emit the current membership to local subscribers if it changed.
    pub fn emit_local(&self) -> bool {
        self.shared.lock().emit_snapshot()
    }

    /// Track the local player on the channel. Without a link this is a
    /// no-op; the next connection re-tracks.
    pub fn broadcast_local(&self) -> Result<(), TransportError> {
        let (player, link) = {
            let inner = self.shared.lock();
            (inner.local.clone(), inner.link.clone())
        };
        match (player, link) {
            (Some(player), Some(link)) => link.track(&player),
            _ => Ok(()),
        }
    }

    /// Apply `patch`, emit, then track.
    pub fn update_local_player(&self, patch: &PlayerPatch) -> Result<Player, TransportError> {
        let player = self.apply_local(patch).ok_or(TransportError::NotReady)?;
        self.emit_local();
        if patch.x.is_some() || patch.y.is_some() || patch.floor_id.is_some() {
            self.persist_location();
        }
        if patch.status_message.is_some() {
            self.persist_status(player.status_message.as_deref());
        }
        self.broadcast_local()?;
        Ok(player)
    }

    /// Place the local player exactly, stopping any walk. Before the player
    /// exists the location is buffered and used at spawn.
    pub fn set_exact_location(&self, x: f64, y: f64, floor_id: Option<Uuid>) -> Result<(), TransportError> {
        let point = Point::clamped(x, y);
        {
            let mut inner = self.shared.lock();
            if inner.local.is_none() {
                inner.pending.location = Some((point, floor_id));
                drop(inner);
                self.store_location(StoredLocation { floor_id, x: point.x, y: point.y });
                return Ok(());
            }
        }
        let patch = PlayerPatch {
            floor_id: Some(floor_id),
            is_walking: Some(false),
            target: Some(None),
            ..PlayerPatch::position(point)
        };
        self.update_local_player(&patch).map(|_| ())
    }

    /// Set or clear the status message. Buffered before spawn.
    pub fn set_status_message(&self, message: Option<&str>) -> Result<(), TransportError> {
        let normalized = normalize_status_message(message);
        {
            let mut inner = self.shared.lock();
            if inner.local.is_none() {
                inner.pending.status = Some(normalized.clone());
                drop(inner);
                self.persist_status(normalized.as_deref());
                return Ok(());
            }
        }
        let patch = PlayerPatch { status_message: Some(normalized), ..PlayerPatch::default() };
        self.update_local_player(&patch).map(|_| ())
    }

    /// Write the local player's position to durable storage.
    pub fn persist_location(&self) {
        let Some(player) = self.local_player() else {
            return;
        };
        self.store_location(StoredLocation { floor_id: player.floor_id, x: player.x, y: player.y });
    }

    fn store_location(&self, location: StoredLocation) {
        if let Err(e) = set_typed(self.shared.storage.as_ref(), LAST_LOCATION_KEY, &location) {
            warn!(error = %e, "failed to persist last location");
        }
    }

    fn persist_status(&self, status: Option<&str>) {
        let storage = self.shared.storage.as_ref();
        let result = match status {
            Some(status) => set_typed(storage, LAST_STATUS_KEY, &status),
            None => storage.remove(LAST_STATUS_KEY),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist status message");
        }
    }

    // -------------------------------------------------------------------------
    // accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn local_player(&self) -> Option<Player> {
        self.shared.lock().local.clone()
    }

    /// Last emitted membership snapshot.
    #[must_use]
    pub fn players(&self) -> Option<Arc<Vec<Player>>> {
        self.shared.lock().last_players.clone()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.shared.lock().user_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().link.is_some()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }
}

fn random_spawn() -> Point {
    let mut rng = rand::rng();
    Point::new(rng.random_range(SPAWN_MIN..SPAWN_MAX), rng.random_range(SPAWN_MIN..SPAWN_MAX))
}

/// Forward link events into the service until the link closes or the
/// generation moves on.
async fn pump_link_events(shared: Weak<Shared>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    loop {
        let event = events.recv().await.unwrap_or(LinkEvent::Closed);
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner.generation != generation {
            return;
        }
        match event {
            LinkEvent::Sync(players) => {
                inner.remote = players;
                inner.emit_snapshot();
            }
            LinkEvent::Error(message) => {
                warn!(topic = %shared.topic, %message, "presence channel error");
                inner.notify_error(&TransportError::Channel(message));
            }
            LinkEvent::Closed => {
                warn!(topic = %shared.topic, "presence channel closed");
                inner.link = None;
                inner.pump = None;
                inner.remote.clear();
                inner.notify_error(&TransportError::Closed);
                inner.emit_snapshot();
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
