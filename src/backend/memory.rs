//! In-process backend: every seam served from one locked table set.
//!
//! DESIGN
//! ======
//! Mirrors the Postgres schema closely enough that services cannot tell the
//! difference: the workstation read model is derived from the latest active
//! session, active area-presence rows are joined with profiles, and every
//! write publishes a `TableChange` on the matching broadcast feed.
//!
//! `MemorySchema` switches off optional columns so the capability fallbacks
//! in the occupancy service can be exercised without a legacy database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    AreaPresencePatch, AreaPresenceTable, AuthProvider, BackendError, ChangeKind, ExpiryFilter, FloorStore,
    NewAreaPresence, NewSession, OccupancyStore, ProfileStore, SessionPayload, TableChange, WorkstationStore,
};
use crate::model::{AreaPresenceRow, Floor, OccupancyMode, OccupancySession, Profile, Workstation, WorkstationStatus};

const CHANGE_FEED_CAPACITY: usize = 64;

/// Optional columns present on the simulated schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySchema {
    pub sessions_have_expiry: bool,
    pub sessions_have_assignment: bool,
}

impl Default for MemorySchema {
    fn default() -> Self {
        Self { sessions_have_expiry: true, sessions_have_assignment: true }
    }
}

/// Static workstation definition; status is derived from sessions unless
/// the station is offline or out of service.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkstationRecord {
    pub id: Uuid,
    pub floor_id: Uuid,
    pub label: String,
    pub section: Option<String>,
    pub x: f64,
    pub y: f64,
    pub base_status: WorkstationStatus,
}

#[derive(Default)]
struct Tables {
    profiles: HashMap<Uuid, Profile>,
    floors: Vec<Floor>,
    workstations: Vec<WorkstationRecord>,
    sessions: Vec<OccupancySession>,
    area: Vec<AreaPresenceRow>,
    failing_deletes: HashSet<Uuid>,
}

pub struct MemoryBackend {
    tables: Mutex<Tables>,
    schema: Mutex<MemorySchema>,
    area_tx: broadcast::Sender<TableChange>,
    workstation_tx: broadcast::Sender<TableChange>,
    profile_fetches: AtomicUsize,
    session_queries: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (area_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (workstation_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            schema: Mutex::new(MemorySchema::default()),
            area_tx,
            workstation_tx,
            profile_fetches: AtomicUsize::new(0),
            session_queries: AtomicUsize::new(0),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schema(&self) -> MemorySchema {
        *self.schema.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_area(&self, kind: ChangeKind, row_id: Option<Uuid>) {
        // No subscribers is fine.
        let _ = self.area_tx.send(TableChange { kind, row_id });
    }

    fn notify_workstations(&self, kind: ChangeKind, row_id: Option<Uuid>) {
        let _ = self.workstation_tx.send(TableChange { kind, row_id });
    }

    // -------------------------------------------------------------------------
    // Seeding + inspection
    // -------------------------------------------------------------------------

    pub fn set_schema(&self, schema: MemorySchema) {
        *self.schema.lock().unwrap_or_else(PoisonError::into_inner) = schema;
    }

    pub fn add_profile(&self, profile: Profile) {
        self.tables().profiles.insert(profile.id, profile);
    }

    pub fn add_floor(&self, floor: Floor) {
        self.tables().floors.push(floor);
    }

    /// Add an available workstation and return its id.
    pub fn add_workstation(&self, floor_id: Uuid, label: &str, x: f64, y: f64) -> Uuid {
        let id = Uuid::new_v4();
        self.tables().workstations.push(WorkstationRecord {
            id,
            floor_id,
            label: label.to_owned(),
            section: None,
            x,
            y,
            base_status: WorkstationStatus::Available,
        });
        id
    }

    pub fn set_workstation_base_status(&self, id: Uuid, status: WorkstationStatus) {
        let mut tables = self.tables();
        if let Some(record) = tables.workstations.iter_mut().find(|w| w.id == id) {
            record.base_status = status;
        }
        drop(tables);
        self.notify_workstations(ChangeKind::Update, Some(id));
    }

    pub fn seed_session(&self, session: OccupancySession) {
        let id = session.workstation_id;
        self.tables().sessions.push(session);
        self.notify_workstations(ChangeKind::Insert, Some(id));
    }

    pub fn seed_area_row(&self, row: AreaPresenceRow) {
        let id = row.id;
        self.tables().area.push(row);
        self.notify_area(ChangeKind::Insert, Some(id));
    }

    /// Seed an active row for `user_id` last seen at `seen_at`.
    pub fn seed_presence(&self, user_id: Uuid, floor_id: Uuid, x: f64, y: f64, seen_at: OffsetDateTime) -> Uuid {
        let id = Uuid::new_v4();
        self.seed_area_row(AreaPresenceRow {
            id,
            user_id,
            floor_id,
            x,
            y,
            status_message: None,
            is_present: true,
            last_seen_at: Some(seen_at),
            cleared_at: None,
            created_at: seen_at,
            updated_at: seen_at,
            display_name: None,
            avatar_url: None,
            role: None,
        });
        id
    }

    /// Make hard deletes for this user fail, as a permission error would.
    pub fn fail_deletes_for(&self, user_id: Uuid) {
        self.tables().failing_deletes.insert(user_id);
    }

    pub fn allow_deletes_for(&self, user_id: Uuid) {
        self.tables().failing_deletes.remove(&user_id);
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<OccupancySession> {
        self.tables().sessions.clone()
    }

    /// Every area-presence row, cleared or not.
    #[must_use]
    pub fn area_rows(&self) -> Vec<AreaPresenceRow> {
        self.tables().area.clone()
    }

    #[must_use]
    pub fn profile_fetch_count(&self) -> usize {
        self.profile_fetches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn session_query_count(&self) -> usize {
        self.session_queries.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Read model
    // -------------------------------------------------------------------------

    fn project(tables: &Tables, record: &WorkstationRecord, now: OffsetDateTime) -> Workstation {
        let mut workstation = Workstation {
            id: record.id,
            floor_id: record.floor_id,
            label: record.label.clone(),
            section: record.section.clone(),
            x: record.x,
            y: record.y,
            status: record.base_status,
            occupant_id: None,
            occupant_name: None,
            occupant_avatar_url: None,
            occupant_role: None,
            occupant_nickname: None,
            occupancy_mode: None,
            status_message: None,
            expires_at: None,
        };
        if !record.base_status.is_actionable() {
            return workstation;
        }

        let active = tables
            .sessions
            .iter()
            .filter(|s| s.workstation_id == record.id && s.is_active_at(now))
            .max_by_key(|s| s.started_at);
        let Some(session) = active else {
            workstation.status = WorkstationStatus::Available;
            return workstation;
        };

        let occupant = session.occupant();
        workstation.status = WorkstationStatus::InUse;
        workstation.occupant_id = occupant;
        workstation.occupant_name = session
            .occupant_display_name
            .clone()
            .or_else(|| occupant.and_then(|id| tables.profiles.get(&id)).map(Profile::label));
        workstation.occupancy_mode = Some(session.occupancy_mode);
        workstation.status_message.clone_from(&session.status_message);
        workstation.expires_at = session.expires_at;
        workstation
    }

    fn with_profile(tables: &Tables, mut row: AreaPresenceRow) -> AreaPresenceRow {
        if let Some(profile) = tables.profiles.get(&row.user_id) {
            row.display_name = Some(profile.label());
            row.avatar_url.clone_from(&profile.avatar_url);
            row.role.clone_from(&profile.role);
        }
        row
    }
}

// =============================================================================
// TRAIT IMPLS
// =============================================================================

#[async_trait::async_trait]
impl AuthProvider for MemoryBackend {
    /// The in-process backend has no session of its own.
    async fn current_user_id(&self) -> Result<Option<Uuid>, BackendError> {
        Ok(None)
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryBackend {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Profile>, BackendError> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables().profiles.get(&id).cloned())
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Profile>, BackendError> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables();
        Ok(ids
            .iter()
            .filter_map(|id| tables.profiles.get(id).cloned())
            .collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Profile>, BackendError> {
        let needle = query.trim().to_lowercase();
        let tables = self.tables();
        let mut hits = tables
            .profiles
            .values()
            .filter(|p| {
                [p.display_name.as_deref(), p.nickname.as_deref()]
                    .into_iter()
                    .flatten()
                    .any(|name| name.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect::<Vec<_>>();
        hits.sort_by_key(Profile::label);
        hits.truncate(limit);
        Ok(hits)
    }
}

#[async_trait::async_trait]
impl FloorStore for MemoryBackend {
    async fn list_floors(&self) -> Result<Vec<Floor>, BackendError> {
        Ok(self.tables().floors.clone())
    }
}

#[async_trait::async_trait]
impl WorkstationStore for MemoryBackend {
    async fn list_by_floor(&self, floor_id: Uuid) -> Result<Vec<Workstation>, BackendError> {
        let now = OffsetDateTime::now_utc();
        let tables = self.tables();
        Ok(tables
            .workstations
            .iter()
            .filter(|w| w.floor_id == floor_id)
            .map(|w| Self::project(&tables, w, now))
            .collect())
    }

    async fn get_workstation(&self, id: Uuid) -> Result<Option<Workstation>, BackendError> {
        let now = OffsetDateTime::now_utc();
        let tables = self.tables();
        Ok(tables
            .workstations
            .iter()
            .find(|w| w.id == id)
            .map(|w| Self::project(&tables, w, now)))
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.workstation_tx.subscribe()
    }
}

#[async_trait::async_trait]
impl OccupancyStore for MemoryBackend {
    async fn find_open_session(
        &self,
        workstation_id: Uuid,
        expiry: ExpiryFilter,
    ) -> Result<Option<OccupancySession>, BackendError> {
        self.session_queries.fetch_add(1, Ordering::SeqCst);
        if matches!(expiry, ExpiryFilter::UnexpiredAt(_)) && !self.schema().sessions_have_expiry {
            return Err(BackendError::MissingColumn("expires_at".into()));
        }
        let tables = self.tables();
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.workstation_id == workstation_id && s.ended_at.is_none())
            .filter(|s| match expiry {
                ExpiryFilter::UnexpiredAt(now) => s.expires_at.is_none_or(|e| e > now),
                ExpiryFilter::Ignore => true,
            })
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn insert_session(
        &self,
        session: &NewSession,
        payload: SessionPayload,
    ) -> Result<OccupancySession, BackendError> {
        let schema = self.schema();
        let row = match payload {
            SessionPayload::Full => {
                if !schema.sessions_have_assignment {
                    return Err(BackendError::MissingColumn("occupancy_mode".into()));
                }
                if !schema.sessions_have_expiry {
                    return Err(BackendError::MissingColumn("expires_at".into()));
                }
                OccupancySession {
                    id: Uuid::new_v4(),
                    workstation_id: session.workstation_id,
                    user_id: session.user_id,
                    occupant_user_id: session.occupant_user_id,
                    occupant_display_name: session.occupant_display_name.clone(),
                    occupancy_mode: session.occupancy_mode,
                    assigned_by_user_id: session.assigned_by_user_id,
                    status_message: session.status_message.clone(),
                    started_at: session.started_at,
                    expires_at: session.expires_at,
                    ended_at: None,
                }
            }
            SessionPayload::Legacy => OccupancySession {
                id: Uuid::new_v4(),
                workstation_id: session.workstation_id,
                user_id: session.user_id,
                occupant_user_id: None,
                occupant_display_name: None,
                occupancy_mode: OccupancyMode::SelfClaim,
                assigned_by_user_id: None,
                status_message: session.status_message.clone(),
                started_at: session.started_at,
                expires_at: None,
                ended_at: None,
            },
        };
        self.tables().sessions.push(row.clone());
        self.notify_workstations(ChangeKind::Insert, Some(row.workstation_id));
        Ok(row)
    }

    async fn update_session_status(&self, session_id: Uuid, message: Option<&str>) -> Result<(), BackendError> {
        let mut tables = self.tables();
        let session = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| BackendError::NotFound(format!("session {session_id}")))?;
        session.status_message = message.map(str::to_owned);
        let workstation_id = session.workstation_id;
        drop(tables);
        self.notify_workstations(ChangeKind::Update, Some(workstation_id));
        Ok(())
    }

    async fn end_session(&self, session_id: Uuid, ended_at: OffsetDateTime) -> Result<(), BackendError> {
        let mut tables = self.tables();
        let session = tables
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| BackendError::NotFound(format!("session {session_id}")))?;
        session.ended_at = Some(ended_at);
        let workstation_id = session.workstation_id;
        drop(tables);
        self.notify_workstations(ChangeKind::Update, Some(workstation_id));
        Ok(())
    }

    async fn open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<OccupancySession>, BackendError> {
        let tables = self.tables();
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.ended_at.is_none())
            .filter(|s| s.user_id == user_id || s.occupant_user_id == Some(user_id))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl AreaPresenceTable for MemoryBackend {
    async fn list_active(&self) -> Result<Vec<AreaPresenceRow>, BackendError> {
        let tables = self.tables();
        Ok(tables
            .area
            .iter()
            .filter(|row| row.is_active())
            .cloned()
            .map(|row| Self::with_profile(&tables, row))
            .collect())
    }

    async fn find_active_for_user(&self, user_id: Uuid) -> Result<Option<AreaPresenceRow>, BackendError> {
        let tables = self.tables();
        Ok(tables
            .area
            .iter()
            .filter(|row| row.user_id == user_id && row.is_active())
            .max_by_key(|row| row.updated_at)
            .cloned()
            .map(|row| Self::with_profile(&tables, row)))
    }

    async fn insert(&self, new: &NewAreaPresence) -> Result<AreaPresenceRow, BackendError> {
        let row = AreaPresenceRow {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            floor_id: new.floor_id,
            x: new.x,
            y: new.y,
            status_message: new.status_message.clone(),
            is_present: true,
            last_seen_at: Some(new.seen_at),
            cleared_at: None,
            created_at: new.seen_at,
            updated_at: new.seen_at,
            display_name: None,
            avatar_url: None,
            role: None,
        };
        let mut tables = self.tables();
        tables.area.push(row.clone());
        let row = Self::with_profile(&tables, row);
        drop(tables);
        self.notify_area(ChangeKind::Insert, Some(row.id));
        Ok(row)
    }

    async fn update(&self, id: Uuid, patch: &AreaPresencePatch) -> Result<(), BackendError> {
        let mut tables = self.tables();
        let row = tables
            .area
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| BackendError::NotFound(format!("area presence {id}")))?;
        if let Some(floor_id) = patch.floor_id {
            row.floor_id = floor_id;
        }
        if let Some(x) = patch.x {
            row.x = x;
        }
        if let Some(y) = patch.y {
            row.y = y;
        }
        if let Some(status) = &patch.status_message {
            row.status_message.clone_from(status);
        }
        if let Some(present) = patch.is_present {
            row.is_present = present;
        }
        if let Some(cleared_at) = patch.cleared_at {
            row.cleared_at = cleared_at;
        }
        if let Some(seen_at) = patch.seen_at {
            row.last_seen_at = Some(seen_at);
            row.updated_at = seen_at;
        }
        drop(tables);
        self.notify_area(ChangeKind::Update, Some(id));
        Ok(())
    }

    async fn delete_for_user(&self, user_id: Uuid) -> Result<u64, BackendError> {
        let mut tables = self.tables();
        if tables.failing_deletes.contains(&user_id) {
            return Err(BackendError::Request("permission denied for table area_presence".into()));
        }
        let before = tables.area.len();
        tables.area.retain(|row| row.user_id != user_id);
        let removed = (before - tables.area.len()) as u64;
        drop(tables);
        if removed > 0 {
            self.notify_area(ChangeKind::Delete, None);
        }
        Ok(removed)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.area_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
