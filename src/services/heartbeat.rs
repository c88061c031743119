//! Area-presence heartbeat.
//!
//! The caller supplies the position to keep alive, normally the last one it
//! persisted. That position is re-upserted at the base interval in the
//! foreground and at twice that in the background. A `None` position skips
//! the beat. Returning to the foreground beats immediately. Failures are
//! logged and the loop carries on.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::area_presence::AreaPresenceStore;
use crate::config::MIN_HEARTBEAT_BASE_SECS;
use crate::model::AreaPresenceUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// Interval for `visibility`, never below the minimum base.
#[must_use]
pub fn heartbeat_interval(base: Duration, visibility: Visibility) -> Duration {
    let base = base.max(Duration::from_secs(MIN_HEARTBEAT_BASE_SECS));
    match visibility {
        Visibility::Foreground => base,
        Visibility::Background => base * 2,
    }
}

/// One heartbeat. Returns whether a write was attempted.
pub async fn beat(store: &AreaPresenceStore, position: Option<AreaPresenceUpdate>) -> bool {
    let Some(update) = position else {
        return false;
    };
    let floor_id = update.floor_id;
    match store.upsert_my_area_presence(&update).await {
        Ok(()) => debug!(floor = %floor_id, "area presence heartbeat"),
        Err(e) => warn!(floor = %floor_id, error = %e, "area presence heartbeat failed"),
    }
    true
}

/// Run heartbeats until `visibility`'s sender is dropped.
pub fn spawn_heartbeat<F>(
    store: AreaPresenceStore,
    position: F,
    base: Duration,
    mut visibility: watch::Receiver<Visibility>,
) -> JoinHandle<()>
where
    F: Fn() -> Option<AreaPresenceUpdate> + Send + 'static,
{
    tokio::spawn(async move {
        if !store.is_enabled() {
            return;
        }
        let mut current = *visibility.borrow_and_update();
        info!(interval_secs = heartbeat_interval(base, current).as_secs(), "area presence heartbeat started");
        loop {
            let sleep = tokio::time::sleep(heartbeat_interval(base, current));
            tokio::select! {
                () = sleep => {
                    beat(&store, position()).await;
                }
                changed = visibility.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *visibility.borrow_and_update();
                    if next == Visibility::Foreground && current == Visibility::Background {
                        beat(&store, position()).await;
                    }
                    current = next;
                }
            }
        }
        debug!("area presence heartbeat stopped");
    })
}

#[cfg(test)]
#[path = "heartbeat_test.rs"]
mod tests;
