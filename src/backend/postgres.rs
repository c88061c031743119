//! Postgres backend built on SQLx.
//!
//! DESIGN
//! ======
//! Rows are read through `to_jsonb(...)` and decoded with serde. That keeps
//! reads working against older schema revisions: a column the database does
//! not have simply deserializes to its default instead of failing the query.
//! Writes name their columns explicitly, so a missing optional column surfaces
//! as SQLSTATE `42703` and the occupancy service can fall back.
//!
//! Change feeds come from `LISTEN/NOTIFY`: table triggers publish
//! `{"op": "...", "id": "..."}` on `area_presence_changes` and
//! `workstation_changes`, and `spawn_change_listener` forwards them onto
//! broadcast channels.

use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    AreaPresencePatch, AreaPresenceTable, BackendError, ChangeKind, ExpiryFilter, FloorStore, NewAreaPresence,
    NewSession, OccupancyStore, ProfileStore, SessionPayload, TableChange, WorkstationStore,
};
use crate::model::{AreaPresenceRow, Floor, OccupancyMode, OccupancySession, Profile, Workstation};

pub const AREA_PRESENCE_CHANNEL: &str = "area_presence_changes";
pub const WORKSTATION_CHANNEL: &str = "workstation_changes";

const CHANGE_FEED_CAPACITY: usize = 256;

pub struct PgBackend {
    pool: PgPool,
    area_tx: broadcast::Sender<TableChange>,
    workstation_tx: broadcast::Sender<TableChange>,
}

impl PgBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        let (area_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (workstation_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { pool, area_tx, workstation_tx }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start forwarding `NOTIFY` payloads to the change feeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener connection or `LISTEN` fails.
    pub async fn spawn_change_listener(&self) -> Result<JoinHandle<()>, BackendError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([AREA_PRESENCE_CHANNEL, WORKSTATION_CHANNEL])
            .await?;
        info!("listening for area presence and workstation changes");

        let area_tx = self.area_tx.clone();
        let workstation_tx = self.workstation_tx.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(change) = parse_notification(notification.payload()) else {
                            warn!(channel = notification.channel(), "unparseable change notification");
                            continue;
                        };
                        let tx = if notification.channel() == AREA_PRESENCE_CHANNEL {
                            &area_tx
                        } else {
                            &workstation_tx
                        };
                        let _ = tx.send(change);
                    }
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!(error = %e, "change listener recv failed");
                    }
                }
            }
        }))
    }
}

#[derive(Deserialize)]
struct NotifyPayload {
    op: String,
    #[serde(default)]
    id: Option<Uuid>,
}

pub(crate) fn parse_notification(payload: &str) -> Option<TableChange> {
    let parsed: NotifyPayload = serde_json::from_str(payload).ok()?;
    Some(TableChange { kind: ChangeKind::from_op(&parsed.op)?, row_id: parsed.id })
}

// =============================================================================
// SESSION DECODING
// =============================================================================

/// Session row as `to_jsonb` renders it. Assignment columns are optional so
/// legacy rows decode too.
#[derive(Deserialize)]
pub(crate) struct SessionRecord {
    id: Uuid,
    workstation_id: Uuid,
    user_id: Uuid,
    #[serde(default)]
    occupant_user_id: Option<Uuid>,
    #[serde(default)]
    occupant_display_name: Option<String>,
    #[serde(default)]
    occupancy_mode: Option<String>,
    #[serde(default)]
    assigned_by_user_id: Option<Uuid>,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    ended_at: Option<OffsetDateTime>,
}

impl From<SessionRecord> for OccupancySession {
    fn from(r: SessionRecord) -> Self {
        Self {
            id: r.id,
            workstation_id: r.workstation_id,
            user_id: r.user_id,
            occupant_user_id: r.occupant_user_id,
            occupant_display_name: r.occupant_display_name,
            occupancy_mode: r
                .occupancy_mode
                .as_deref()
                .and_then(OccupancyMode::from_db)
                .unwrap_or(OccupancyMode::SelfClaim),
            assigned_by_user_id: r.assigned_by_user_id,
            status_message: r.status_message,
            started_at: r.started_at,
            expires_at: r.expires_at,
            ended_at: r.ended_at,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, BackendError> {
    serde_json::from_value(value).map_err(|e| BackendError::Request(format!("row decode failed: {e}")))
}

fn decode_session(value: serde_json::Value) -> Result<OccupancySession, BackendError> {
    decode::<SessionRecord>(value).map(OccupancySession::from)
}

// =============================================================================
// PROFILES + FLOORS
// =============================================================================

fn profile_from_row(row: &sqlx::postgres::PgRow) -> Profile {
    Profile {
        id: row.get("id"),
        display_name: row.get("display_name"),
        avatar_url: row.get("avatar_url"),
        role: row.get("role"),
        nickname: row.get("nickname"),
    }
}

#[async_trait::async_trait]
impl ProfileStore for PgBackend {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, BackendError> {
        let row = sqlx::query("SELECT id, display_name, avatar_url, role, nickname FROM profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(profile_from_row))
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Profile>, BackendError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id, display_name, avatar_url, role, nickname FROM profiles WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(profile_from_row).collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Profile>, BackendError> {
        let pattern = format!("%{}%", query.trim().replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT id, display_name, avatar_url, role, nickname
             FROM profiles
             WHERE display_name ILIKE $1 OR nickname ILIKE $1
             ORDER BY coalesce(display_name, nickname) ASC
             LIMIT $2",
        )
        .bind(pattern)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(profile_from_row).collect())
    }
}

#[async_trait::async_trait]
impl FloorStore for PgBackend {
    async fn list_floors(&self) -> Result<Vec<Floor>, BackendError> {
        let rows = sqlx::query_as::<_, (Uuid, String, String, f64, f64)>(
            "SELECT id, name, image_url, width, height FROM floors ORDER BY sort_order ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, image_url, width, height)| Floor { id, name, image_url, width, height })
            .collect())
    }
}

// =============================================================================
// WORKSTATIONS
// =============================================================================

#[async_trait::async_trait]
impl WorkstationStore for PgBackend {
    async fn list_by_floor(&self, floor_id: Uuid) -> Result<Vec<Workstation>, BackendError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT to_jsonb(v) FROM current_workstation_status v WHERE v.floor_id = $1 ORDER BY v.label ASC",
        )
        .bind(floor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode).collect()
    }

    async fn get_workstation(&self, id: Uuid) -> Result<Option<Workstation>, BackendError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT to_jsonb(v) FROM current_workstation_status v WHERE v.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.workstation_tx.subscribe()
    }
}

// =============================================================================
// OCCUPANCY SESSIONS
// =============================================================================

#[async_trait::async_trait]
impl OccupancyStore for PgBackend {
    async fn find_open_session(
        &self,
        workstation_id: Uuid,
        expiry: ExpiryFilter,
    ) -> Result<Option<OccupancySession>, BackendError> {
        let row = match expiry {
            ExpiryFilter::UnexpiredAt(now) => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT to_jsonb(s) FROM workstation_occupancy_sessions s
                     WHERE s.workstation_id = $1
                       AND s.ended_at IS NULL
                       AND (s.expires_at IS NULL OR s.expires_at > $2)
                     ORDER BY s.started_at DESC
                     LIMIT 1",
                )
                .bind(workstation_id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            ExpiryFilter::Ignore => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT to_jsonb(s) FROM workstation_occupancy_sessions s
                     WHERE s.workstation_id = $1 AND s.ended_at IS NULL
                     ORDER BY s.started_at DESC
                     LIMIT 1",
                )
                .bind(workstation_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(decode_session).transpose()
    }

    async fn insert_session(
        &self,
        session: &NewSession,
        payload: SessionPayload,
    ) -> Result<OccupancySession, BackendError> {
        let row = match payload {
            SessionPayload::Full => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "INSERT INTO workstation_occupancy_sessions AS s
                         (id, workstation_id, user_id, occupant_user_id, occupant_display_name,
                          occupancy_mode, assigned_by_user_id, status_message, started_at, expires_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                     RETURNING to_jsonb(s)",
                )
                .bind(Uuid::new_v4())
                .bind(session.workstation_id)
                .bind(session.user_id)
                .bind(session.occupant_user_id)
                .bind(&session.occupant_display_name)
                .bind(session.occupancy_mode.as_str())
                .bind(session.assigned_by_user_id)
                .bind(&session.status_message)
                .bind(session.started_at)
                .bind(session.expires_at)
                .fetch_one(&self.pool)
                .await?
            }
            SessionPayload::Legacy => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "INSERT INTO workstation_occupancy_sessions AS s
                         (id, workstation_id, user_id, status_message, started_at)
                     VALUES ($1, $2, $3, $4, $5)
                     RETURNING to_jsonb(s)",
                )
                .bind(Uuid::new_v4())
                .bind(session.workstation_id)
                .bind(session.user_id)
                .bind(&session.status_message)
                .bind(session.started_at)
                .fetch_one(&self.pool)
                .await?
            }
        };
        decode_session(row)
    }

    async fn update_session_status(&self, session_id: Uuid, message: Option<&str>) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE workstation_occupancy_sessions SET status_message = $2 WHERE id = $1")
            .bind(session_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn end_session(&self, session_id: Uuid, ended_at: OffsetDateTime) -> Result<(), BackendError> {
        sqlx::query("UPDATE workstation_occupancy_sessions SET ended_at = $2 WHERE id = $1 AND ended_at IS NULL")
            .bind(session_id)
            .bind(ended_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<OccupancySession>, BackendError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT to_jsonb(s) FROM workstation_occupancy_sessions s
             WHERE s.ended_at IS NULL
               AND (s.user_id = $1 OR to_jsonb(s)->>'occupant_user_id' = $1::text)",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_session).collect()
    }
}

// =============================================================================
// AREA PRESENCE
// =============================================================================

#[async_trait::async_trait]
impl AreaPresenceTable for PgBackend {
    async fn list_active(&self) -> Result<Vec<AreaPresenceRow>, BackendError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>("SELECT to_jsonb(v) FROM active_area_presence v")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(decode).collect()
    }

    async fn find_active_for_user(&self, user_id: Uuid) -> Result<Option<AreaPresenceRow>, BackendError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT to_jsonb(v) FROM active_area_presence v
             WHERE v.user_id = $1
             ORDER BY v.updated_at DESC
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode).transpose()
    }

    async fn insert(&self, new: &NewAreaPresence) -> Result<AreaPresenceRow, BackendError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO area_presence
                 (id, user_id, floor_id, x, y, status_message, is_present, last_seen_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, true, $7, $7, $7)",
        )
        .bind(id)
        .bind(new.user_id)
        .bind(new.floor_id)
        .bind(new.x)
        .bind(new.y)
        .bind(&new.status_message)
        .bind(new.seen_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_scalar::<_, serde_json::Value>("SELECT to_jsonb(v) FROM active_area_presence v WHERE v.id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        decode(row)
    }

    async fn update(&self, id: Uuid, patch: &AreaPresencePatch) -> Result<(), BackendError> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new("UPDATE area_presence SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(floor_id) = patch.floor_id {
                set.push("floor_id = ").push_bind_unseparated(floor_id);
            }
            if let Some(x) = patch.x {
                set.push("x = ").push_bind_unseparated(x);
            }
            if let Some(y) = patch.y {
                set.push("y = ").push_bind_unseparated(y);
            }
            if let Some(status) = &patch.status_message {
                set.push("status_message = ").push_bind_unseparated(status.clone());
            }
            if let Some(present) = patch.is_present {
                set.push("is_present = ").push_bind_unseparated(present);
            }
            if let Some(cleared_at) = patch.cleared_at {
                set.push("cleared_at = ").push_bind_unseparated(cleared_at);
            }
            if let Some(seen_at) = patch.seen_at {
                set.push("last_seen_at = ").push_bind_unseparated(seen_at);
                set.push("updated_at = ").push_bind_unseparated(seen_at);
            }
            set.push("id = id");
        }
        builder.push(" WHERE id = ").push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("area presence {id}")));
        }
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, BackendError> {
        let result = sqlx::query("DELETE FROM area_presence WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.area_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
