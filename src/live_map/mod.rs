//! Live map controller.
//!
//! ARCHITECTURE
//! ============
//! `LiveMap` is the headless state behind the floor map screen. It owns the
//! selected floor, its hydrated workstations, the latest area-presence rows
//! and realtime players, and the memoized merge of the two. UI code drives it
//! with taps and clicks and listens on the `MapEvent` channel.
//!
//! LIFECYCLE
//! =========
//! `mount` resolves the caller, loads floors and the first floor's
//! workstations, subscribes to realtime presence and both change feeds, and
//! starts the heartbeat and a reconcile tick. Everything it starts lives in
//! the returned `MountHandle`; dropping the handle tears it all down.
//!
//! TAP TO MOVE
//! ===========
//! A tap moves the local avatar at once and persists the new position in
//! the background. When the caller holds a seat on this floor and the tap
//! lands outside the interaction radius, nothing is persisted: a
//! release-and-move intent is raised instead and cancels itself after the
//! confirm timeout. The heartbeat only keeps the last persisted position
//! alive, so a declined move never reaches the row.
//!
//! ERROR HANDLING
//! ==============
//! User actions return `LiveMapError`. Background work (tap persistence,
//! change-driven reloads, pruning) logs and carries on.

pub mod perf;
pub mod prune;
pub mod refresh;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::config::LiveMapConfig;
use crate::frame::ErrorCode;
use crate::model::{
    AreaPresenceRow, AreaPresenceUpdate, Floor, MergedPresence, OccupancySession, Player, PlayerPatch, Point,
    UNRESOLVED_DISPLAY_NAME, Workstation, WorkstationStatus,
};
use crate::render::{Scene, build_scene, pin_at};
use crate::services::area_presence::{AreaPresenceError, AreaPresenceStore, ChangeWatch};
use crate::services::heartbeat::{Visibility, spawn_heartbeat};
use crate::services::merge::{MergeCache, merge_workspace_presence_stable};
use crate::services::movement::MovementEngine;
use crate::services::occupancy::{AssignRequest, OccupancyError, OccupancyService};
use crate::services::transport::{PresenceEvent, PresenceService, TransportError};
use perf::{OP_MERGE, OP_SCENE_BUILD, OP_WORKSTATION_RELOAD, PerfStats};
use prune::{Pruner, prune_candidates};
use refresh::RefreshQueue;

/// Staleness only changes with the clock, so the view is re-merged on a tick.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LiveMapError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("no floor selected")]
    NoFloor,
    #[error("unknown floor: {0}")]
    UnknownFloor(Uuid),
    #[error("workstation not on this floor: {0}")]
    UnknownWorkstation(Uuid),
    #[error("{0} already in progress")]
    Busy(&'static str),
    #[error("no release-and-move prompt is open")]
    NoPendingRelease,
    #[error(transparent)]
    Occupancy(#[from] OccupancyError),
    #[error(transparent)]
    AreaPresence(#[from] AreaPresenceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ErrorCode for LiveMapError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "E_UNAUTHENTICATED",
            Self::NoFloor => "E_NO_FLOOR",
            Self::UnknownFloor(_) => "E_UNKNOWN_FLOOR",
            Self::UnknownWorkstation(_) => "E_UNKNOWN_WORKSTATION",
            Self::Busy(_) => "E_BUSY",
            Self::NoPendingRelease => "E_NO_PENDING_RELEASE",
            Self::Occupancy(e) => e.error_code(),
            Self::AreaPresence(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
            Self::Backend(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Occupancy(e) => e.retryable(),
            Self::AreaPresence(e) => e.retryable(),
            Self::Transport(e) => e.retryable(),
            Self::Backend(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// In-flight user action. A second identical action fails with `Busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Claim(Uuid),
    Assign(Uuid),
    Release(Uuid),
    WorkstationStatus(Uuid),
    ConfirmMove,
    LeaveArea,
    MyStatus,
    Kick(Uuid),
}

impl Action {
    fn label(self) -> &'static str {
        match self {
            Self::Claim(_) => "claim",
            Self::Assign(_) => "assign",
            Self::Release(_) => "release",
            Self::WorkstationStatus(_) => "status update",
            Self::ConfirmMove => "release and move",
            Self::LeaveArea => "leave",
            Self::MyStatus => "status update",
            Self::Kick(_) => "remove",
        }
    }
}

/// "Release your seat and move here?" prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseAndMoveIntent {
    pub id: u64,
    pub workstation_id: Uuid,
    pub workstation_label: String,
    pub floor_id: Uuid,
    pub target: Point,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TapOutcome {
    /// Moved and persisted.
    Moved,
    /// Moved locally; persistence waits on the prompt.
    ConfirmRelease(ReleaseAndMoveIntent),
}

/// Panel opened by clicking a workstation pin.
#[derive(Debug, Clone, PartialEq)]
pub enum Panel {
    /// Claim, assign, set status or release.
    Actions { workstation_id: Uuid, status: WorkstationStatus, mine: bool },
    /// Read-only view of someone else's seat.
    OccupantProfile { workstation_id: Uuid, occupant_id: Option<Uuid>, occupant_name: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickPrompt {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_realtime: bool,
}

impl KickPrompt {
    /// Shown when the target is live; removal will not keep them away.
    #[must_use]
    pub fn warning(&self) -> Option<&'static str> {
        self.is_realtime
            .then_some("This person is active right now and may reappear.")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickOutcome {
    pub rows_removed: u64,
    pub sessions_ended: usize,
}

#[derive(Debug, Clone)]
pub enum MapEvent {
    FloorSelected(Uuid),
    WorkstationsChanged { floor_id: Uuid },
    PresenceChanged(Arc<Vec<MergedPresence>>),
    ReleaseAndMove(ReleaseAndMoveIntent),
    /// Prompt closed without confirmation. `expired` when the timeout fired.
    ReleaseIntentClosed { id: u64, expired: bool },
    OpenPanel(Panel),
    Error { code: &'static str, message: String },
}

// =============================================================================
// STATE
// =============================================================================

struct PendingRelease {
    intent: ReleaseAndMoveIntent,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct MapState {
    user_id: Option<Uuid>,
    floors: Vec<Floor>,
    floor_id: Option<Uuid>,
    workstations: Vec<Workstation>,
    area_rows: Vec<AreaPresenceRow>,
    players: Arc<Vec<Player>>,
    merged: Option<Arc<MergeCache>>,
    pending: Option<PendingRelease>,
    next_intent: u64,
    /// Last position written to the caller's area-presence row.
    persisted: Option<AreaPresenceUpdate>,
}

struct Shared {
    config: LiveMapConfig,
    backend: Backend,
    presence: PresenceService,
    movement: MovementEngine,
    occupancy: OccupancyService,
    area: AreaPresenceStore,
    pruner: Pruner,
    perf: PerfStats,
    events: mpsc::UnboundedSender<MapEvent>,
    state: Mutex<MapState>,
    busy: Mutex<HashSet<Action>>,
}

/// Held for the duration of one user action.
pub(crate) struct BusyGuard {
    shared: Arc<Shared>,
    action: Action,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.action);
    }
}

/// Everything `mount` started. Dropping it unmounts.
pub struct MountHandle {
    visibility: watch::Sender<Visibility>,
    tasks: Vec<JoinHandle<()>>,
    _watches: Vec<ChangeWatch>,
    _queues: Vec<RefreshQueue>,
    pruner: Pruner,
}

impl MountHandle {
    /// Page visibility drives the heartbeat cadence.
    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pruner.cancel();
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

#[derive(Clone)]
pub struct LiveMap {
    shared: Arc<Shared>,
}

impl LiveMap {
    #[must_use]
    pub fn new(
        backend: Backend,
        presence: PresenceService,
        config: LiveMapConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MapEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let area = AreaPresenceStore::new(&backend, config.persistent_presence_enabled);
        let shared = Shared {
            occupancy: OccupancyService::new(&backend, &config),
            movement: MovementEngine::new(presence.clone(), &config),
            pruner: Pruner::new(area.clone(), config.prune_debounce, config.prune_batch),
            area,
            config,
            backend,
            presence,
            perf: PerfStats::new(),
            events,
            state: Mutex::new(MapState::default()),
            busy: Mutex::new(HashSet::new()),
        };
        (Self { shared: Arc::new(shared) }, rx)
    }

    fn state(&self) -> MutexGuard<'_, MapState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MapEvent) {
        // Receiver gone means the screen unmounted.
        let _ = self.shared.events.send(event);
    }

    pub(crate) fn begin(&self, action: Action) -> Result<BusyGuard, LiveMapError> {
        let mut busy = self.shared.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(action) {
            return Err(LiveMapError::Busy(action.label()));
        }
        Ok(BusyGuard { shared: self.shared.clone(), action })
    }

    // -------------------------------------------------------------------------
    // Mount
    // -------------------------------------------------------------------------

    pub async fn mount(&self) -> Result<MountHandle, LiveMapError> {
        let shared = &self.shared;
        let user_id = shared
            .backend
            .auth
            .current_user_id()
            .await?
            .ok_or(LiveMapError::Unauthenticated)?;
        let floors = shared.backend.floors.list_floors().await?;
        let first_floor = floors.first().map(|f| f.id);
        {
            let mut state = self.state();
            state.user_id = Some(user_id);
            state.floors = floors;
        }
        if let Some(floor_id) = first_floor {
            self.select_floor(floor_id).await?;
        }
        self.refresh_area_presence().await;
        {
            let mut state = self.state();
            let own = state.area_rows.iter().find(|r| r.user_id == user_id && r.is_active());
            state.persisted = own.map(|r| AreaPresenceUpdate::at(r.floor_id, Point::new(r.x, r.y)));
        }

        let mut subscription = shared.presence.subscribe(user_id).await;
        let map = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match event {
                    PresenceEvent::Players(players) => map.on_players(players),
                    PresenceEvent::Error { code, message } => map.emit(MapEvent::Error { code, message }),
                }
            }
        });

        let map = self.clone();
        let workstation_queue = RefreshQueue::spawn(shared.config.refresh_debounce, move || {
            let map = map.clone();
            async move {
                if let Err(e) = map.reload_workstations().await {
                    warn!(error = %e, "workstation reload failed");
                }
            }
        });
        let requests = workstation_queue.handle();
        let workstation_watch = ChangeWatch::spawn(shared.backend.workstations.subscribe_changes(), move |_| {
            requests.request();
        });

        let map = self.clone();
        let area_queue = RefreshQueue::spawn(shared.config.refresh_debounce, move || {
            let map = map.clone();
            async move { map.refresh_area_presence().await }
        });
        let requests = area_queue.handle();
        let area_watch = shared.area.watch_changes(move |_| {
            requests.request();
        });

        let (visibility, visibility_rx) = watch::channel(Visibility::Foreground);
        let map = self.clone();
        let heartbeat = spawn_heartbeat(
            shared.area.clone(),
            move || map.heartbeat_position(),
            shared.config.heartbeat_base,
            visibility_rx,
        );

        let map = self.clone();
        let reconcile = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                map.recompute_presence();
                map.shared.perf.log_snapshot();
            }
        });

        info!(%user_id, floor = ?first_floor, "live map mounted");
        Ok(MountHandle {
            visibility,
            tasks: vec![pump, heartbeat, reconcile],
            _watches: vec![workstation_watch, area_watch],
            _queues: vec![workstation_queue, area_queue],
            pruner: shared.pruner.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Floors + workstations
    // -------------------------------------------------------------------------

    /// Switch floors. Closes any open release prompt.
    pub async fn select_floor(&self, floor_id: Uuid) -> Result<(), LiveMapError> {
        let closed = {
            let mut state = self.state();
            if !state.floors.iter().any(|f| f.id == floor_id) {
                return Err(LiveMapError::UnknownFloor(floor_id));
            }
            state.floor_id = Some(floor_id);
            state.workstations.clear();
            state.pending.take()
        };
        if let Some(pending) = closed {
            pending.timer.abort();
            self.emit(MapEvent::ReleaseIntentClosed { id: pending.intent.id, expired: false });
        }
        self.emit(MapEvent::FloorSelected(floor_id));
        self.reload_workstations().await
    }

    /// Reload the selected floor's workstations. A result for a floor that
    /// is no longer selected is dropped.
    pub async fn reload_workstations(&self) -> Result<(), LiveMapError> {
        let Some(floor_id) = self.current_floor() else {
            return Ok(());
        };
        let started = Instant::now();
        let workstations = self.shared.occupancy.list_workstations(floor_id).await?;
        self.shared.perf.record(OP_WORKSTATION_RELOAD, started.elapsed());
        {
            let mut state = self.state();
            if state.floor_id != Some(floor_id) {
                debug!(%floor_id, "dropping workstation load for previous floor");
                return Ok(());
            }
            state.workstations = workstations;
        }
        self.emit(MapEvent::WorkstationsChanged { floor_id });
        Ok(())
    }

    async fn reload_after_write(&self) {
        if let Err(e) = self.reload_workstations().await {
            warn!(error = %e, "workstation reload after write failed");
        }
    }

    // -------------------------------------------------------------------------
    // Presence view
    // -------------------------------------------------------------------------

    pub async fn refresh_area_presence(&self) {
        match self.shared.area.fetch_active_area_presence().await {
            Ok(rows) => {
                self.state().area_rows = rows;
                self.recompute_presence();
            }
            Err(e) => warn!(error = %e, "area presence fetch failed"),
        }
    }

    fn on_players(&self, players: Arc<Vec<Player>>) {
        self.state().players = players;
        self.recompute_presence();
    }

    pub fn recompute_presence(&self) -> Arc<Vec<MergedPresence>> {
        self.recompute_presence_at(OffsetDateTime::now_utc())
    }

    /// Re-merge as of `now`. Emits and reschedules pruning only when the
    /// memoized result changed.
    pub(crate) fn recompute_presence_at(&self, now: OffsetDateTime) -> Arc<Vec<MergedPresence>> {
        let shared = &self.shared;
        let (changed, merged, me) = {
            let mut state = self.state();
            let previous = state.merged.clone();
            let next = shared.perf.time(OP_MERGE, || {
                merge_workspace_presence_stable(
                    &state.area_rows,
                    &state.players,
                    shared.config.stale_ttl_secs,
                    previous.as_ref(),
                    now,
                )
            });
            let changed = previous.as_ref().is_none_or(|p| !Arc::ptr_eq(p, &next));
            let merged = next.result.clone();
            state.merged = Some(next);
            (changed, merged, state.user_id)
        };
        if changed {
            shared.pruner.schedule(prune_candidates(&merged, me));
            self.emit(MapEvent::PresenceChanged(merged.clone()));
        }
        merged
    }

    /// Scene for the selected floor.
    #[must_use]
    pub fn scene(&self) -> Option<Scene> {
        let state = self.state();
        let floor_id = state.floor_id?;
        let presence = state.merged.as_ref().map(|m| m.result.clone()).unwrap_or_default();
        Some(self.shared.perf.time(OP_SCENE_BUILD, || {
            build_scene(floor_id, &state.workstations, &presence, state.user_id)
        }))
    }

    /// Workstation pin under `at`, if any.
    #[must_use]
    pub fn hit_test(&self, at: Point) -> Option<Uuid> {
        let scene = self.scene()?;
        pin_at(&scene, at, self.shared.config.pin_hit_radius).map(|pin| pin.workstation_id)
    }

    // -------------------------------------------------------------------------
    // Tap to move
    // -------------------------------------------------------------------------

    /// Tap on empty floor at (`x`, `y`).
    pub async fn tap(&self, x: f64, y: f64) -> Result<TapOutcome, LiveMapError> {
        let shared = &self.shared;
        let (floor_id, held) = {
            let state = self.state();
            let floor_id = state.floor_id.ok_or(LiveMapError::NoFloor)?;
            let user_id = state.user_id.ok_or(LiveMapError::Unauthenticated)?;
            let held = state
                .workstations
                .iter()
                .find(|ws| ws.floor_id == floor_id && ws.is_occupied_by(user_id))
                .cloned();
            (floor_id, held)
        };
        let target = Point::clamped(x, y);

        shared.movement.cancel();
        shared.presence.set_exact_location(target.x, target.y, Some(floor_id))?;

        if let Some(ws) = held
            && ws.pin().distance_to(target) > shared.config.interaction_radius
            && self.still_occupying(ws.id).await
        {
            return Ok(TapOutcome::ConfirmRelease(self.raise_release_intent(&ws, target)));
        }

        let update = AreaPresenceUpdate::at(floor_id, target);
        self.state().persisted = Some(update.clone());
        let area = shared.area.clone();
        tokio::spawn(async move {
            if let Err(e) = area.upsert_my_area_presence(&update).await {
                warn!(%floor_id, error = %e, "area presence write after tap failed");
            }
        });
        Ok(TapOutcome::Moved)
    }

    async fn still_occupying(&self, workstation_id: Uuid) -> bool {
        match self
            .shared
            .occupancy
            .is_current_user_occupying_workstation(workstation_id, None)
            .await
        {
            Ok(occupying) => occupying,
            Err(e) => {
                warn!(%workstation_id, error = %e, "ownership check failed; using loaded state");
                true
            }
        }
    }

    fn raise_release_intent(&self, ws: &Workstation, target: Point) -> ReleaseAndMoveIntent {
        let mut state = self.state();
        state.next_intent += 1;
        let intent = ReleaseAndMoveIntent {
            id: state.next_intent,
            workstation_id: ws.id,
            workstation_label: ws.label.clone(),
            floor_id: ws.floor_id,
            target,
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let id = intent.id;
        let wait = self.shared.config.release_confirm_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(shared) = weak.upgrade() {
                LiveMap { shared }.expire_release_intent(id);
            }
        });

        let replaced = state.pending.replace(PendingRelease { intent: intent.clone(), timer });
        drop(state);
        if let Some(previous) = replaced {
            previous.timer.abort();
            self.emit(MapEvent::ReleaseIntentClosed { id: previous.intent.id, expired: false });
        }
        info!(workstation = %ws.id, x = target.x, y = target.y, "release-and-move prompt raised");
        self.emit(MapEvent::ReleaseAndMove(intent.clone()));
        intent
    }

    /// What the heartbeat re-upserts. Nothing while a release prompt is open.
    fn heartbeat_position(&self) -> Option<AreaPresenceUpdate> {
        let state = self.state();
        if state.pending.is_some() {
            return None;
        }
        state.persisted.clone()
    }

    fn expire_release_intent(&self, id: u64) {
        let expired = {
            let mut state = self.state();
            if state.pending.as_ref().is_some_and(|p| p.intent.id == id) {
                state.pending.take()
            } else {
                None
            }
        };
        if expired.is_some() {
            debug!(id, "release-and-move prompt timed out");
            self.emit(MapEvent::ReleaseIntentClosed { id, expired: true });
        }
    }

    #[must_use]
    pub fn pending_release(&self) -> Option<ReleaseAndMoveIntent> {
        self.state().pending.as_ref().map(|p| p.intent.clone())
    }

    /// Dismiss the open prompt. Returns whether one was open.
    pub fn cancel_release_and_move(&self) -> bool {
        let Some(pending) = self.state().pending.take() else {
            return false;
        };
        pending.timer.abort();
        self.emit(MapEvent::ReleaseIntentClosed { id: pending.intent.id, expired: false });
        true
    }

    /// Release the held seat and persist the tapped position.
    pub async fn confirm_release_and_move(&self) -> Result<(), LiveMapError> {
        let _busy = self.begin(Action::ConfirmMove)?;
        let pending = self.state().pending.take().ok_or(LiveMapError::NoPendingRelease)?;
        pending.timer.abort();
        let intent = pending.intent;

        self.shared.occupancy.release(intent.workstation_id).await?;
        let update = AreaPresenceUpdate::at(intent.floor_id, intent.target);
        self.shared.area.upsert_my_area_presence(&update).await?;
        self.state().persisted = Some(update);
        info!(workstation = %intent.workstation_id, "released seat and moved");
        self.reload_after_write().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Workstation actions
    // -------------------------------------------------------------------------

    /// Walk toward the pin and open its panel after the click delay.
    pub fn click_workstation(&self, workstation_id: Uuid) -> Result<Panel, LiveMapError> {
        let (ws, me) = {
            let state = self.state();
            let ws = state
                .workstations
                .iter()
                .find(|w| w.id == workstation_id)
                .cloned()
                .ok_or(LiveMapError::UnknownWorkstation(workstation_id))?;
            (ws, state.user_id)
        };

        if let Err(e) = self.shared.movement.walk_to(ws.x, ws.y, Some(ws.floor_id)) {
            warn!(%workstation_id, error = %e, "walk toward workstation failed");
        }

        let mine = me.is_some_and(|id| ws.is_occupied_by(id));
        let panel = match ws.status {
            WorkstationStatus::InUse if !mine => Panel::OccupantProfile {
                workstation_id,
                occupant_id: ws.occupant_id,
                occupant_name: ws.occupant_name.clone(),
            },
            status => Panel::Actions { workstation_id, status, mine },
        };

        let events = self.shared.events.clone();
        let delay = self.shared.config.click_modal_delay;
        let open = panel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(MapEvent::OpenPanel(open));
        });
        Ok(panel)
    }

    pub async fn claim(&self, workstation_id: Uuid) -> Result<OccupancySession, LiveMapError> {
        let _busy = self.begin(Action::Claim(workstation_id))?;
        let session = self.shared.occupancy.claim(workstation_id).await?;
        self.reload_after_write().await;
        Ok(session)
    }

    pub async fn assign(
        &self,
        workstation_id: Uuid,
        request: &AssignRequest,
    ) -> Result<OccupancySession, LiveMapError> {
        let _busy = self.begin(Action::Assign(workstation_id))?;
        let session = self.shared.occupancy.assign(workstation_id, request).await?;
        self.reload_after_write().await;
        Ok(session)
    }

    /// Returns whether a session was ended.
    pub async fn release(&self, workstation_id: Uuid) -> Result<bool, LiveMapError> {
        let _busy = self.begin(Action::Release(workstation_id))?;
        let ended = self.shared.occupancy.release(workstation_id).await?;
        self.reload_after_write().await;
        Ok(ended)
    }

    pub async fn set_workstation_status(
        &self,
        workstation_id: Uuid,
        message: Option<&str>,
    ) -> Result<(), LiveMapError> {
        let _busy = self.begin(Action::WorkstationStatus(workstation_id))?;
        self.shared
            .occupancy
            .update_status_message(workstation_id, message)
            .await?;
        self.reload_after_write().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Own presence
    // -------------------------------------------------------------------------

    /// Clear persistent presence and take the avatar off every floor.
    pub async fn leave_area(&self) -> Result<(), LiveMapError> {
        let _busy = self.begin(Action::LeaveArea)?;
        self.cancel_release_and_move();
        self.shared.movement.cancel();
        self.shared.area.clear_my_area_presence().await?;
        self.state().persisted = None;
        let off_floor = PlayerPatch { floor_id: Some(None), ..PlayerPatch::default() };
        match self.shared.presence.update_local_player(&off_floor) {
            Ok(_) | Err(TransportError::NotReady) => {}
            Err(e) => return Err(e.into()),
        }
        self.refresh_area_presence().await;
        Ok(())
    }

    /// Set the caller's status on both the channel and the persistent row.
    pub async fn set_my_status(&self, message: Option<&str>) -> Result<(), LiveMapError> {
        let _busy = self.begin(Action::MyStatus)?;
        self.shared.presence.set_status_message(message)?;
        self.shared.area.set_my_area_presence_status(message).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Kick
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn prepare_kick(&self, user_id: Uuid) -> KickPrompt {
        let view = self.presence_view();
        let entry = view.iter().find(|p| p.user_id == user_id);
        KickPrompt {
            user_id,
            display_name: entry.map_or_else(|| UNRESOLVED_DISPLAY_NAME.to_owned(), |p| p.display_name.clone()),
            is_realtime: entry.is_some_and(|p| p.source.has_realtime()),
        }
    }

    /// Remove a user's persistent presence and end every seat they hold.
    pub async fn confirm_kick(&self, user_id: Uuid) -> Result<KickOutcome, LiveMapError> {
        let _busy = self.begin(Action::Kick(user_id))?;
        let rows_removed = self.shared.area.force_remove(user_id).await?;
        let sessions_ended = self.shared.occupancy.force_release_for_user(user_id).await?;
        {
            let mut state = self.state();
            if state.user_id == Some(user_id) {
                state.persisted = None;
            }
        }
        info!(%user_id, rows_removed, sessions_ended, "user removed from live map");
        self.refresh_area_presence().await;
        self.reload_after_write().await;
        Ok(KickOutcome { rows_removed, sessions_ended })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.state().user_id
    }

    #[must_use]
    pub fn floors(&self) -> Vec<Floor> {
        self.state().floors.clone()
    }

    #[must_use]
    pub fn current_floor(&self) -> Option<Uuid> {
        self.state().floor_id
    }

    #[must_use]
    pub fn workstations(&self) -> Vec<Workstation> {
        self.state().workstations.clone()
    }

    /// Last merged presence view.
    #[must_use]
    pub fn presence_view(&self) -> Arc<Vec<MergedPresence>> {
        self.state().merged.as_ref().map(|m| m.result.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn occupancy(&self) -> &OccupancyService {
        &self.shared.occupancy
    }

    #[must_use]
    pub fn movement(&self) -> &MovementEngine {
        &self.shared.movement
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceService {
        &self.shared.presence
    }

    #[must_use]
    pub fn perf(&self) -> &PerfStats {
        &self.shared.perf
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
