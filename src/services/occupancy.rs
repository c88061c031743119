//! Workstation occupancy: claim, assign, release, status, ownership checks.
//!
//! DESIGN
//! ======
//! A workstation's state is derived from its most recent open session:
//! `AVAILABLE -> IN_USE` on claim/assign, back on release or expiry.
//! `OFFLINE` and `OUT_OF_SERVICE` are set elsewhere and reject every action.
//!
//! Claim and assign check for an active session and then insert. The two
//! steps are not atomic; two near-simultaneous claims can both succeed. Seats
//! are claimed at walking pace, so the race is accepted rather than closed.
//!
//! SCHEMA CAPABILITIES
//! ===================
//! Older databases lack `expires_at` and the assignment columns. The first
//! missing-column error flips a process-lifetime flag and the call is retried
//! in the reduced form; later calls go straight to the reduced form.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::profile_cache::ProfileCache;
use crate::backend::{
    AuthProvider, Backend, BackendError, ExpiryFilter, NewSession, OccupancyStore, ProfileStore, SessionPayload,
    WorkstationStore,
};
use crate::config::LiveMapConfig;
use crate::frame::ErrorCode;
use crate::model::{OccupancyMode, OccupancySession, Profile, Workstation, normalize_status_message};

/// Result cap for assignable-occupant search.
pub const SEARCH_LIMIT: usize = 20;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OccupancyError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("workstation not found: {0}")]
    NotFound(Uuid),
    #[error("workstation is already occupied")]
    AlreadyOccupied,
    #[error("workstation has no active session")]
    NoActiveSession,
    #[error("workstation is {0}")]
    NotActionable(&'static str),
    #[error("{0}")]
    Validation(&'static str),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ErrorCode for OccupancyError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::AlreadyOccupied => "E_ALREADY_OCCUPIED",
            Self::NoActiveSession => "E_NO_ACTIVE_SESSION",
            Self::NotActionable(_) => "E_NOT_ACTIONABLE",
            Self::Validation(_) => "E_VALIDATION",
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// ASSIGN PAYLOAD
// =============================================================================

/// Raw assign form input. Validated into an [`AssignTarget`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssignRequest {
    pub mode: OccupancyMode,
    pub occupant_user_id: Option<Uuid>,
    pub occupant_name: Option<String>,
    pub status_message: Option<String>,
}

impl AssignRequest {
    #[must_use]
    pub fn colleague(user_id: Uuid) -> Self {
        Self {
            mode: OccupancyMode::AssignedUser,
            occupant_user_id: Some(user_id),
            occupant_name: None,
            status_message: None,
        }
    }

    #[must_use]
    pub fn external(name: &str) -> Self {
        Self {
            mode: OccupancyMode::AssignedExternal,
            occupant_user_id: None,
            occupant_name: Some(name.to_owned()),
            status_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignTarget {
    Myself,
    User(Uuid),
    External(String),
}

impl AssignTarget {
    /// Check that the identifying field for the mode is present.
    pub fn from_request(request: &AssignRequest) -> Result<Self, OccupancyError> {
        match request.mode {
            OccupancyMode::SelfClaim => Ok(Self::Myself),
            OccupancyMode::AssignedUser => request
                .occupant_user_id
                .map(Self::User)
                .ok_or(OccupancyError::Validation("choose a colleague to assign")),
            OccupancyMode::AssignedExternal => request
                .occupant_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| Self::External(name.to_owned()))
                .ok_or(OccupancyError::Validation("enter the visitor's name")),
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

struct OwnershipEntry {
    actor: Uuid,
    occupying: bool,
    checked_at: Instant,
}

pub struct OccupancyService {
    auth: Arc<dyn AuthProvider>,
    profiles: Arc<dyn ProfileStore>,
    workstations: Arc<dyn WorkstationStore>,
    sessions: Arc<dyn OccupancyStore>,
    assign_ttl: Duration,
    ownership_max_age: Duration,
    expiry_missing: AtomicBool,
    legacy_insert: AtomicBool,
    ownership: Mutex<HashMap<Uuid, OwnershipEntry>>,
    profile_cache: ProfileCache,
}

impl OccupancyService {
    #[must_use]
    pub fn new(backend: &Backend, config: &LiveMapConfig) -> Self {
        Self {
            auth: backend.auth.clone(),
            profiles: backend.profiles.clone(),
            workstations: backend.workstations.clone(),
            sessions: backend.sessions.clone(),
            assign_ttl: config.assign_ttl,
            ownership_max_age: config.ownership_cache_max_age,
            expiry_missing: AtomicBool::new(false),
            legacy_insert: AtomicBool::new(false),
            ownership: Mutex::new(HashMap::new()),
            profile_cache: ProfileCache::new(config.profile_cache_ttl),
        }
    }

    /// Whether `expires_at` was found missing on this backend.
    #[must_use]
    pub fn expiry_column_missing(&self) -> bool {
        self.expiry_missing.load(Ordering::Relaxed)
    }

    /// Whether session inserts have degraded to the legacy payload.
    #[must_use]
    pub fn uses_legacy_insert(&self) -> bool {
        self.legacy_insert.load(Ordering::Relaxed)
    }

    async fn actor(&self) -> Result<Uuid, OccupancyError> {
        self.auth.current_user_id().await?.ok_or(OccupancyError::Unauthenticated)
    }

    async fn actionable_workstation(&self, workstation_id: Uuid) -> Result<Workstation, OccupancyError> {
        let workstation = self
            .workstations
            .get_workstation(workstation_id)
            .await?
            .ok_or(OccupancyError::NotFound(workstation_id))?;
        if !workstation.status.is_actionable() {
            return Err(OccupancyError::NotActionable(workstation.status.as_str()));
        }
        Ok(workstation)
    }

    fn forget_ownership(&self, workstation_id: Uuid) {
        self.ownership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&workstation_id);
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Most recent open, unexpired session for the workstation.
    pub async fn get_active_session(&self, workstation_id: Uuid) -> Result<Option<OccupancySession>, OccupancyError> {
        let now = OffsetDateTime::now_utc();
        if !self.expiry_missing.load(Ordering::Relaxed) {
            match self
                .sessions
                .find_open_session(workstation_id, ExpiryFilter::UnexpiredAt(now))
                .await
            {
                Ok(session) => return Ok(session),
                Err(e) if e.is_missing_column() => {
                    warn!(error = %e, "sessions have no expiry column; filtering in process");
                    self.expiry_missing.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let session = self
            .sessions
            .find_open_session(workstation_id, ExpiryFilter::Ignore)
            .await?;
        Ok(session.filter(|s| s.is_active_at(now)))
    }

    async fn insert_session(&self, session: &NewSession) -> Result<OccupancySession, OccupancyError> {
        if !self.legacy_insert.load(Ordering::Relaxed) {
            match self.sessions.insert_session(session, SessionPayload::Full).await {
                Ok(row) => return Ok(row),
                Err(e) if e.is_missing_column() => {
                    warn!(error = %e, "session insert degraded to legacy payload");
                    self.legacy_insert.store(true, Ordering::Relaxed);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.sessions.insert_session(session, SessionPayload::Legacy).await?)
    }

    /// Take self-occupancy of an available workstation.
    pub async fn claim(&self, workstation_id: Uuid) -> Result<OccupancySession, OccupancyError> {
        let actor = self.actor().await?;
        self.occupy(actor, workstation_id, AssignTarget::Myself, None).await
    }

    /// Place the caller, a colleague or an external visitor at a workstation.
    /// Assigned occupancy expires after the configured TTL.
    pub async fn assign(
        &self,
        workstation_id: Uuid,
        request: &AssignRequest,
    ) -> Result<OccupancySession, OccupancyError> {
        let target = AssignTarget::from_request(request)?;
        let actor = self.actor().await?;
        self.occupy(actor, workstation_id, target, request.status_message.as_deref())
            .await
    }

    async fn occupy(
        &self,
        actor: Uuid,
        workstation_id: Uuid,
        target: AssignTarget,
        status_message: Option<&str>,
    ) -> Result<OccupancySession, OccupancyError> {
        self.actionable_workstation(workstation_id).await?;
        if self.get_active_session(workstation_id).await?.is_some() {
            return Err(OccupancyError::AlreadyOccupied);
        }

        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.assign_ttl;
        let mut session = NewSession {
            workstation_id,
            user_id: actor,
            occupant_user_id: Some(actor),
            occupant_display_name: None,
            occupancy_mode: OccupancyMode::SelfClaim,
            assigned_by_user_id: None,
            status_message: normalize_status_message(status_message),
            started_at: now,
            expires_at: None,
        };
        match target {
            AssignTarget::Myself => {}
            AssignTarget::User(occupant) => {
                let profile = self
                    .profiles
                    .get_by_id(occupant)
                    .await?
                    .ok_or(OccupancyError::Validation("colleague profile not found"))?;
                session.occupant_user_id = Some(occupant);
                session.occupant_display_name = Some(profile.label());
                session.occupancy_mode = OccupancyMode::AssignedUser;
                session.assigned_by_user_id = Some(actor);
                session.expires_at = Some(expires_at);
            }
            AssignTarget::External(name) => {
                session.occupant_user_id = None;
                session.occupant_display_name = Some(name);
                session.occupancy_mode = OccupancyMode::AssignedExternal;
                session.assigned_by_user_id = Some(actor);
                session.expires_at = Some(expires_at);
            }
        }

        let row = self.insert_session(&session).await?;
        self.forget_ownership(workstation_id);
        info!(
            workstation = %workstation_id,
            %actor,
            mode = row.occupancy_mode.as_str(),
            "workstation occupied"
        );
        Ok(row)
    }

    /// Patch the active session's status message.
    pub async fn update_status_message(
        &self,
        workstation_id: Uuid,
        message: Option<&str>,
    ) -> Result<(), OccupancyError> {
        self.actor().await?;
        let session = self
            .get_active_session(workstation_id)
            .await?
            .ok_or(OccupancyError::NoActiveSession)?;
        let message = normalize_status_message(message);
        self.sessions
            .update_session_status(session.id, message.as_deref())
            .await?;
        debug!(workstation = %workstation_id, "workstation status message updated");
        Ok(())
    }

    /// End the active session. Succeeds with `false` when there is none.
    pub async fn release(&self, workstation_id: Uuid) -> Result<bool, OccupancyError> {
        self.actor().await?;
        self.actionable_workstation(workstation_id).await?;
        let Some(session) = self.get_active_session(workstation_id).await? else {
            debug!(workstation = %workstation_id, "release with no active session");
            return Ok(false);
        };
        self.sessions
            .end_session(session.id, OffsetDateTime::now_utc())
            .await?;
        self.forget_ownership(workstation_id);
        info!(workstation = %workstation_id, session = %session.id, "workstation released");
        Ok(true)
    }

    /// Whether the caller holds the workstation's active session, either as
    /// the actor who created it or as its occupant. Answers are cached per
    /// workstation for `max_age` (default from config).
    pub async fn is_current_user_occupying_workstation(
        &self,
        workstation_id: Uuid,
        max_age: Option<Duration>,
    ) -> Result<bool, OccupancyError> {
        let Some(actor) = self.auth.current_user_id().await? else {
            return Ok(false);
        };
        let max_age = max_age.unwrap_or(self.ownership_max_age);
        {
            let cache = self.ownership.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&workstation_id)
                && entry.actor == actor
                && entry.checked_at.elapsed() < max_age
            {
                return Ok(entry.occupying);
            }
        }

        let occupying = self
            .get_active_session(workstation_id)
            .await?
            .is_some_and(|s| s.user_id == actor || s.occupant() == Some(actor));
        self.ownership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workstation_id, OwnershipEntry { actor, occupying, checked_at: Instant::now() });
        Ok(occupying)
    }

    // -------------------------------------------------------------------------
    // Read model
    // -------------------------------------------------------------------------

    /// Fill occupant avatar, role and nickname from profiles, fetching only
    /// ids missing from the short-lived cache.
    pub async fn hydrate_workstation_occupants(&self, workstations: &mut [Workstation]) -> Result<(), OccupancyError> {
        let ids: Vec<Uuid> = workstations
            .iter()
            .filter_map(|w| w.occupant_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        let (mut profiles, misses) = self.profile_cache.partition(&ids);
        if !misses.is_empty() {
            let fetched = self.profiles.get_by_ids(&misses).await?;
            for profile in &fetched {
                self.profile_cache.insert(profile.clone());
            }
            profiles.extend(fetched);
        }

        let by_id: HashMap<Uuid, Profile> = profiles.into_iter().map(|p| (p.id, p)).collect();
        for workstation in workstations.iter_mut() {
            let Some(profile) = workstation.occupant_id.and_then(|id| by_id.get(&id)) else {
                continue;
            };
            workstation.occupant_avatar_url.clone_from(&profile.avatar_url);
            workstation.occupant_role.clone_from(&profile.role);
            workstation.occupant_nickname.clone_from(&profile.nickname);
            if workstation.occupant_name.is_none() {
                workstation.occupant_name = Some(profile.label());
            }
        }
        Ok(())
    }

    /// Workstations on a floor with occupants hydrated. Hydration failures
    /// are logged and the bare read model returned.
    pub async fn list_workstations(&self, floor_id: Uuid) -> Result<Vec<Workstation>, OccupancyError> {
        let mut workstations = self.workstations.list_by_floor(floor_id).await?;
        if let Err(e) = self.hydrate_workstation_occupants(&mut workstations).await {
            warn!(floor = %floor_id, error = %e, "occupant hydration failed");
        }
        Ok(workstations)
    }

    /// Name search for the assign flow. Blank queries return nothing.
    pub async fn search_assignable_occupants(&self, query: &str) -> Result<Vec<Profile>, OccupancyError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.profiles.search(query, SEARCH_LIMIT).await?)
    }

    /// End every open session the user created or occupies. Returns the
    /// number of sessions ended.
    pub async fn force_release_for_user(&self, user_id: Uuid) -> Result<usize, OccupancyError> {
        self.actor().await?;
        let open = self.sessions.open_sessions_for_user(user_id).await?;
        let now = OffsetDateTime::now_utc();
        for session in &open {
            self.sessions.end_session(session.id, now).await?;
            self.forget_ownership(session.workstation_id);
        }
        if !open.is_empty() {
            info!(%user_id, ended = open.len(), "force-released workstation sessions");
        }
        Ok(open.len())
    }
}

#[cfg(test)]
#[path = "occupancy_test.rs"]
mod tests;
