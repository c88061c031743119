//! Backend seams: the data services the live map consumes.
//!
//! ARCHITECTURE
//! ============
//! Auth, profiles, floors, workstation read models, occupancy sessions and
//! area-presence rows live in a managed backend. Each concern is a trait so
//! services can run against Postgres (`postgres::PgBackend`) or an in-process
//! table set (`memory::MemoryBackend`) without knowing which.
//!
//! ERROR HANDLING
//! ==============
//! Backends report schema gaps as `BackendError::MissingColumn` when they can
//! tell; `BackendError::is_missing_column` also recognises the textual error
//! signature for backends that only hand back a message.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{AreaPresenceRow, Floor, OccupancyMode, OccupancySession, Profile, Workstation};

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("column does not exist: {0}")]
    MissingColumn(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BackendError {
    /// True when the error means an optional column is absent.
    #[must_use]
    pub fn is_missing_column(&self) -> bool {
        match self {
            Self::MissingColumn(_) => true,
            Self::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("42703") || message_names_missing_column(db.message())
            }
            Self::Request(message) => message_names_missing_column(message),
            _ => false,
        }
    }
}

impl crate::frame::ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::MissingColumn(_) => "E_SCHEMA",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::Request(_) => "E_BACKEND",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Database(_))
    }
}

/// Match the two message shapes backends use for an unknown column:
/// `column "x" does not exist` and `Could not find the 'x' column`.
pub(crate) fn message_names_missing_column(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    (lower.contains("column") && lower.contains("does not exist"))
        || (lower.contains("could not find") && lower.contains("column"))
}

// =============================================================================
// CHANGE FEEDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn from_op(op: &str) -> Option<Self> {
        match op.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A row-level change notification. Carries no row payload; observers
/// re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableChange {
    pub kind: ChangeKind,
    pub row_id: Option<Uuid>,
}

// =============================================================================
// WRITE PAYLOADS
// =============================================================================

/// Fields written when inserting an occupancy session.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub workstation_id: Uuid,
    pub user_id: Uuid,
    pub occupant_user_id: Option<Uuid>,
    pub occupant_display_name: Option<String>,
    pub occupancy_mode: OccupancyMode,
    pub assigned_by_user_id: Option<Uuid>,
    pub status_message: Option<String>,
    pub started_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
}

/// Insert shape. `Legacy` writes only the columns every schema revision
/// has: workstation, actor, status message and start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPayload {
    Full,
    Legacy,
}

/// How `find_open_session` treats `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryFilter {
    /// Filter out sessions whose expiry has passed at this instant.
    UnexpiredAt(OffsetDateTime),
    /// Only filter on `ended_at IS NULL`.
    Ignore,
}

/// Fields written when inserting an area-presence row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAreaPresence {
    pub user_id: Uuid,
    pub floor_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub status_message: Option<String>,
    pub seen_at: OffsetDateTime,
}

/// Partial update of an area-presence row. `None` leaves a column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AreaPresencePatch {
    pub floor_id: Option<Uuid>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub status_message: Option<Option<String>>,
    pub is_present: Option<bool>,
    pub cleared_at: Option<Option<OffsetDateTime>>,
    pub seen_at: Option<OffsetDateTime>,
}

// =============================================================================
// TRAITS
// =============================================================================

#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Identity of the caller, `None` when signed out.
    async fn current_user_id(&self) -> Result<Option<Uuid>, BackendError>;
}

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, BackendError>;
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Profile>, BackendError>;
    /// Case-insensitive name search for the assign flow.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Profile>, BackendError>;
}

#[async_trait::async_trait]
pub trait FloorStore: Send + Sync {
    async fn list_floors(&self) -> Result<Vec<Floor>, BackendError>;
}

#[async_trait::async_trait]
pub trait WorkstationStore: Send + Sync {
    async fn list_by_floor(&self, floor_id: Uuid) -> Result<Vec<Workstation>, BackendError>;
    async fn get_workstation(&self, id: Uuid) -> Result<Option<Workstation>, BackendError>;
    /// Change feed covering workstations and their sessions.
    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange>;
}

#[async_trait::async_trait]
pub trait OccupancyStore: Send + Sync {
    /// Most recent session for the workstation with `ended_at IS NULL`,
    /// narrowed by `expiry`. Fails with a missing-column error when the
    /// filter needs `expires_at` and the schema lacks it.
    async fn find_open_session(
        &self,
        workstation_id: Uuid,
        expiry: ExpiryFilter,
    ) -> Result<Option<OccupancySession>, BackendError>;
    async fn insert_session(&self, session: &NewSession, payload: SessionPayload)
    -> Result<OccupancySession, BackendError>;
    async fn update_session_status(&self, session_id: Uuid, message: Option<&str>) -> Result<(), BackendError>;
    async fn end_session(&self, session_id: Uuid, ended_at: OffsetDateTime) -> Result<(), BackendError>;
    /// Open sessions where the user is the actor or the occupant.
    async fn open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<OccupancySession>, BackendError>;
}

#[async_trait::async_trait]
pub trait AreaPresenceTable: Send + Sync {
    /// Rows with `cleared_at IS NULL AND is_present`.
    async fn list_active(&self) -> Result<Vec<AreaPresenceRow>, BackendError>;
    async fn find_active_for_user(&self, user_id: Uuid) -> Result<Option<AreaPresenceRow>, BackendError>;
    async fn insert(&self, row: &NewAreaPresence) -> Result<AreaPresenceRow, BackendError>;
    async fn update(&self, id: Uuid, patch: &AreaPresencePatch) -> Result<(), BackendError>;
    /// Hard delete every row for the user. Returns rows removed.
    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, BackendError>;
    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange>;
}

// =============================================================================
// BUNDLE
// =============================================================================

/// All backend seams for one client session.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub floors: Arc<dyn FloorStore>,
    pub workstations: Arc<dyn WorkstationStore>,
    pub sessions: Arc<dyn OccupancyStore>,
    pub area_presence: Arc<dyn AreaPresenceTable>,
}

impl Backend {
    /// Wire every seam to one in-process table set, acting as `auth`.
    #[must_use]
    pub fn memory(tables: Arc<memory::MemoryBackend>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            auth,
            profiles: tables.clone(),
            floors: tables.clone(),
            workstations: tables.clone(),
            sessions: tables.clone(),
            area_presence: tables,
        }
    }

    /// Wire every seam to Postgres, acting as `auth`.
    #[must_use]
    pub fn postgres(pg: Arc<postgres::PgBackend>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            auth,
            profiles: pg.clone(),
            floors: pg.clone(),
            workstations: pg.clone(),
            sessions: pg.clone(),
            area_presence: pg,
        }
    }
}

/// Fixed caller identity for one signed-in client.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuth(pub Option<Uuid>);

#[async_trait::async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user_id(&self) -> Result<Option<Uuid>, BackendError> {
        Ok(self.0)
    }
}
