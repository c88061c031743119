//! Short-lived per-id profile cache used by occupant hydration.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::model::Profile;

pub struct ProfileCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, (Profile, Instant)>>,
}

impl ProfileCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Fresh entry for `id`, if any.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Profile> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&id)
            .filter(|(_, fetched_at)| fetched_at.elapsed() < self.ttl)
            .map(|(profile, _)| profile.clone())
    }

    /// Split `ids` into cached profiles and ids that need fetching.
    #[must_use]
    pub fn partition(&self, ids: &[Uuid]) -> (Vec<Profile>, Vec<Uuid>) {
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for id in ids {
            match self.get(*id) {
                Some(profile) => hits.push(profile),
                None => misses.push(*id),
            }
        }
        (hits, misses)
    }

    pub fn insert(&self, profile: Profile) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, (_, fetched_at)| now.duration_since(*fetched_at) < self.ttl);
        entries.insert(profile.id, (profile, now));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
