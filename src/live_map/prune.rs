//! Auto-prune of abandoned persistent presence.
//!
//! DESIGN
//! ======
//! Candidates are persistent-only entries already flagged stale, never the
//! viewer's own. A pass runs once the stale set has been quiet for the
//! debounce window and removes at most `batch` users. Each user id sits in
//! an attempted set while its removal is pending or done; a failed removal
//! takes the id back out so a later pass retries it. Ids that stop being
//! stale leave the attempted set, so a user who comes back and goes stale
//! again is pruned again.
//!
//! Errors are logged and swallowed; pruning never interrupts the session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{MergedPresence, PresenceSource};
use crate::services::area_presence::AreaPresenceStore;

/// Stale persistent-only users from a merged view, excluding `me`.
#[must_use]
pub fn prune_candidates(merged: &[MergedPresence], me: Option<Uuid>) -> Vec<Uuid> {
    merged
        .iter()
        .filter(|p| p.is_stale && p.source == PresenceSource::Persistent && Some(p.user_id) != me)
        .map(|p| p.user_id)
        .collect()
}

#[derive(Default)]
struct PruneState {
    attempted: HashSet<Uuid>,
    last_candidates: Vec<Uuid>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Pruner {
    store: AreaPresenceStore,
    debounce: Duration,
    batch: usize,
    state: Arc<Mutex<PruneState>>,
}

impl Pruner {
    #[must_use]
    pub fn new(store: AreaPresenceStore, debounce: Duration, batch: usize) -> Self {
        Self { store, debounce, batch, state: Arc::default() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PruneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart the debounce timer when the candidate set changed.
    pub fn schedule(&self, candidates: Vec<Uuid>) {
        let mut state = self.lock();
        if state.last_candidates == candidates {
            return;
        }
        let current: HashSet<Uuid> = candidates.iter().copied().collect();
        state.attempted.retain(|id| current.contains(id));
        state.last_candidates.clone_from(&candidates);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if candidates.is_empty() {
            return;
        }
        let pruner = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(pruner.debounce).await;
            pruner.run_pass(&candidates).await;
        }));
    }

    /// Remove up to `batch` not-yet-attempted candidates. Returns the users
    /// whose rows were removed.
    pub async fn run_pass(&self, candidates: &[Uuid]) -> Vec<Uuid> {
        let picked: Vec<Uuid> = {
            let mut state = self.lock();
            let picked: Vec<Uuid> = candidates
                .iter()
                .copied()
                .filter(|id| !state.attempted.contains(id))
                .take(self.batch)
                .collect();
            state.attempted.extend(picked.iter().copied());
            picked
        };

        let mut removed = Vec::new();
        for user_id in picked {
            match self.store.force_remove(user_id).await {
                Ok(_) => removed.push(user_id),
                Err(e) => {
                    debug!(%user_id, error = %e, "auto-prune failed; will retry");
                    self.lock().attempted.remove(&user_id);
                }
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "auto-pruned stale presence");
        }
        removed
    }

    /// Drop any pending pass.
    pub fn cancel(&self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }

    #[must_use]
    pub fn was_attempted(&self, user_id: Uuid) -> bool {
        self.lock().attempted.contains(&user_id)
    }
}

#[cfg(test)]
#[path = "prune_test.rs"]
mod tests;
