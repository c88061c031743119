//! Persistent area presence: durable "last seen here" rows.
//!
//! DESIGN
//! ======
//! Each user has at most one active row (`is_present AND cleared_at IS
//! NULL`). Writes look up the active row and update it, inserting only when
//! none exists; nothing in the table enforces uniqueness.
//!
//! When persistent presence is disabled every read returns empty and every
//! write returns immediately, so callers never branch on the flag.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    AreaPresencePatch, AreaPresenceTable, AuthProvider, Backend, BackendError, ChangeKind, NewAreaPresence,
    TableChange,
};
use crate::frame::ErrorCode;
use crate::model::{AreaPresenceRow, AreaPresenceUpdate, clamp_percent, normalize_status_message};

#[derive(Debug, thiserror::Error)]
pub enum AreaPresenceError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ErrorCode for AreaPresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Unauthenticated => false,
            Self::Backend(e) => e.retryable(),
        }
    }
}

#[derive(Clone)]
pub struct AreaPresenceStore {
    auth: Arc<dyn AuthProvider>,
    table: Arc<dyn AreaPresenceTable>,
    enabled: bool,
}

impl AreaPresenceStore {
    #[must_use]
    pub fn new(backend: &Backend, enabled: bool) -> Self {
        Self { auth: backend.auth.clone(), table: backend.area_presence.clone(), enabled }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn actor(&self) -> Result<Uuid, AreaPresenceError> {
        self.auth
            .current_user_id()
            .await?
            .ok_or(AreaPresenceError::Unauthenticated)
    }

    /// All rows that are present and not cleared.
    pub async fn fetch_active_area_presence(&self) -> Result<Vec<AreaPresenceRow>, AreaPresenceError> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        Ok(self.table.list_active().await?)
    }

    /// Update the caller's active row, or insert one. Always stamps the
    /// heartbeat, clears `cleared_at`, and marks the row present.
    pub async fn upsert_my_area_presence(&self, update: &AreaPresenceUpdate) -> Result<(), AreaPresenceError> {
        if !self.enabled {
            return Ok(());
        }
        let user_id = self.actor().await?;
        let now = OffsetDateTime::now_utc();
        let x = clamp_percent(update.x);
        let y = clamp_percent(update.y);
        let status = update
            .status_message
            .as_ref()
            .map(|message| normalize_status_message(message.as_deref()));

        if let Some(row) = self.table.find_active_for_user(user_id).await? {
            let patch = AreaPresencePatch {
                floor_id: Some(update.floor_id),
                x: Some(x),
                y: Some(y),
                status_message: status,
                is_present: Some(true),
                cleared_at: Some(None),
                seen_at: Some(now),
            };
            self.table.update(row.id, &patch).await?;
            debug!(%user_id, floor = %update.floor_id, "area presence updated");
            return Ok(());
        }

        self.table
            .insert(&NewAreaPresence {
                user_id,
                floor_id: update.floor_id,
                x,
                y,
                status_message: status.flatten(),
                seen_at: now,
            })
            .await?;
        info!(%user_id, floor = %update.floor_id, "area presence created");
        Ok(())
    }

    /// Soft-delete the caller's active row.
    pub async fn clear_my_area_presence(&self) -> Result<(), AreaPresenceError> {
        if !self.enabled {
            return Ok(());
        }
        let user_id = self.actor().await?;
        let Some(row) = self.table.find_active_for_user(user_id).await? else {
            return Ok(());
        };
        let patch = AreaPresencePatch {
            is_present: Some(false),
            cleared_at: Some(Some(OffsetDateTime::now_utc())),
            ..AreaPresencePatch::default()
        };
        self.table.update(row.id, &patch).await?;
        info!(%user_id, "area presence cleared");
        Ok(())
    }

    /// Update only the status message and heartbeat. No-op without an
    /// active row.
    pub async fn set_my_area_presence_status(&self, message: Option<&str>) -> Result<(), AreaPresenceError> {
        if !self.enabled {
            return Ok(());
        }
        let user_id = self.actor().await?;
        let Some(row) = self.table.find_active_for_user(user_id).await? else {
            return Ok(());
        };
        let patch = AreaPresencePatch {
            status_message: Some(normalize_status_message(message)),
            seen_at: Some(OffsetDateTime::now_utc()),
            ..AreaPresencePatch::default()
        };
        self.table.update(row.id, &patch).await?;
        Ok(())
    }

    /// Hard-delete every row for `user_id`. Returns rows removed.
    pub async fn force_remove(&self, user_id: Uuid) -> Result<u64, AreaPresenceError> {
        if !self.enabled {
            return Ok(0);
        }
        let removed = self.table.delete_for_user(user_id).await?;
        info!(%user_id, removed, "area presence force-removed");
        Ok(removed)
    }

    /// Call `on_change` for every insert/update/delete. Observers re-fetch;
    /// nothing is diffed here. Dropping the handle unsubscribes.
    pub fn watch_changes<F>(&self, on_change: F) -> ChangeWatch
    where
        F: Fn(TableChange) + Send + Sync + 'static,
    {
        if !self.enabled {
            return ChangeWatch { task: None };
        }
        ChangeWatch::spawn(self.table.subscribe_changes(), on_change)
    }
}

/// Background forwarder for a change feed; aborted on drop.
pub struct ChangeWatch {
    task: Option<JoinHandle<()>>,
}

impl ChangeWatch {
    pub(crate) fn spawn<F>(mut rx: broadcast::Receiver<TableChange>, on_change: F) -> Self
    where
        F: Fn(TableChange) + Send + Sync + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => on_change(change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged; forcing refetch");
                        on_change(TableChange { kind: ChangeKind::Update, row_id: None });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { task: Some(task) }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ChangeWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "area_presence_test.rs"]
mod tests;
