//! Presence rooms and the in-process channel hub.
//!
//! `PresenceRoom` is the membership table both the relay server and
//! `LocalHub` keep per topic: one member per user key, newest connection
//! wins, snapshots sorted by player id. `LocalHub` wires rooms straight to
//! `PresenceService` links without a network hop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::transport::{ChannelFactory, ChannelLink, LinkEvent, PresenceSink, TransportError};
use crate::model::Player;

// =============================================================================
// ROOM
// =============================================================================

pub struct RoomMember<S> {
    pub conn_id: u64,
    pub sink: S,
    pub player: Option<Player>,
}

/// Membership for one topic, keyed by user.
pub struct PresenceRoom<S> {
    members: HashMap<Uuid, RoomMember<S>>,
}

impl<S> Default for PresenceRoom<S> {
    fn default() -> Self {
        Self { members: HashMap::new() }
    }
}

impl<S> PresenceRoom<S> {
    /// Add a connection for `key`. Returns the sink of the connection it
    /// superseded, if any.
    pub fn join(&mut self, key: Uuid, conn_id: u64, sink: S) -> Option<S> {
        self.members
            .insert(key, RoomMember { conn_id, sink, player: None })
            .map(|old| old.sink)
    }

    /// Set the tracked payload. The id is forced to the member key. Returns
    /// false when `conn_id` is no longer the member's current connection.
    pub fn track(&mut self, key: Uuid, conn_id: u64, mut player: Player) -> bool {
        let Some(member) = self.members.get_mut(&key).filter(|m| m.conn_id == conn_id) else {
            return false;
        };
        player.id = key;
        member.player = Some(player);
        true
    }

    pub fn untrack(&mut self, key: Uuid, conn_id: u64) -> bool {
        let Some(member) = self.members.get_mut(&key).filter(|m| m.conn_id == conn_id) else {
            return false;
        };
        member.player.take().is_some()
    }

    /// Remove the member if `conn_id` is still its connection.
    pub fn leave(&mut self, key: Uuid, conn_id: u64) -> Option<RoomMember<S>> {
        if self.members.get(&key).is_some_and(|m| m.conn_id == conn_id) {
            return self.members.remove(&key);
        }
        None
    }

    /// Remove the member whatever its connection.
    pub fn evict(&mut self, key: Uuid) -> Option<RoomMember<S>> {
        self.members.remove(&key)
    }

    /// Tracked payloads sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.members.values().filter_map(|m| m.player.clone()).collect();
        players.sort_by_key(|p| p.id);
        players
    }

    pub fn sinks(&self) -> impl Iterator<Item = &S> {
        self.members.values().map(|m| &m.sink)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }
}

// =============================================================================
// LOCAL HUB
// =============================================================================

type HubSink = mpsc::UnboundedSender<LinkEvent>;

#[derive(Default)]
struct HubInner {
    rooms: Mutex<HashMap<String, PresenceRoom<HubSink>>>,
    next_conn: AtomicU64,
    offline: AtomicBool,
}

impl HubInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, PresenceRoom<HubSink>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn broadcast(room: &PresenceRoom<HubSink>) {
    let snapshot = room.snapshot();
    for sink in room.sinks() {
        let _ = sink.send(LinkEvent::Sync(snapshot.clone()));
    }
}

/// In-process presence channel shared by every `PresenceService` that holds a
/// clone.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, `connect` fails.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Tracked payloads on `topic`.
    #[must_use]
    pub fn members(&self, topic: &str) -> Vec<Player> {
        self.inner.rooms().get(topic).map(PresenceRoom::snapshot).unwrap_or_default()
    }

    #[must_use]
    pub fn connection_count(&self, topic: &str) -> usize {
        self.inner.rooms().get(topic).map_or(0, PresenceRoom::len)
    }

    /// Simulate a dropped connection for `key`: the member disappears and its
    /// link sees `Closed`.
    pub fn drop_connection(&self, topic: &str, key: Uuid) {
        let mut rooms = self.inner.rooms();
        let Some(room) = rooms.get_mut(topic) else {
            return;
        };
        if let Some(member) = room.evict(key) {
            let _ = member.sink.send(LinkEvent::Closed);
            broadcast(room);
        }
    }

    /// Push an error notice to every connection on `topic`.
    pub fn inject_error(&self, topic: &str, message: &str) {
        if let Some(room) = self.inner.rooms().get(topic) {
            for sink in room.sinks() {
                let _ = sink.send(LinkEvent::Error(message.to_owned()));
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelFactory for LocalHub {
    async fn connect(&self, topic: &str, user_key: Uuid) -> Result<ChannelLink, TransportError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("local hub offline".into()));
        }
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut rooms = self.inner.rooms();
            let room = rooms.entry(topic.to_owned()).or_default();
            if let Some(old) = room.join(user_key, conn_id, tx) {
                debug!(%user_key, topic, "superseding older presence connection");
                let _ = old.send(LinkEvent::Closed);
            }
            broadcast(room);
        }

        let sink = LocalSink { hub: self.inner.clone(), topic: topic.to_owned(), key: user_key, conn_id };
        Ok(ChannelLink { sink: Arc::new(sink), events: rx })
    }
}

struct LocalSink {
    hub: Arc<HubInner>,
    topic: String,
    key: Uuid,
    conn_id: u64,
}

impl PresenceSink for LocalSink {
    fn track(&self, player: &Player) -> Result<(), TransportError> {
        let mut rooms = self.hub.rooms();
        let room = rooms.get_mut(&self.topic).ok_or(TransportError::Closed)?;
        if !room.track(self.key, self.conn_id, player.clone()) {
            return Err(TransportError::Closed);
        }
        broadcast(room);
        Ok(())
    }

    fn untrack(&self) -> Result<(), TransportError> {
        let mut rooms = self.hub.rooms();
        let room = rooms.get_mut(&self.topic).ok_or(TransportError::Closed)?;
        if room.untrack(self.key, self.conn_id) {
            broadcast(room);
        }
        Ok(())
    }

    fn close(&self) {
        let mut rooms = self.hub.rooms();
        let Some(room) = rooms.get_mut(&self.topic) else {
            return;
        };
        if room.leave(self.key, self.conn_id).is_some() {
            broadcast(room);
        }
        if room.is_empty() {
            rooms.remove(&self.topic);
        }
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
