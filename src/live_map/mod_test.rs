use super::*;
use crate::backend::StaticAuth;
use crate::backend::memory::MemoryBackend;
use crate::model::{PresenceSource, Profile};
use crate::services::hub::LocalHub;
use crate::storage::MemoryKv;
use tokio::time::timeout;

const TOPIC: &str = "live-map";

struct Fixture {
    tables: Arc<MemoryBackend>,
    hub: LocalHub,
    floor: Uuid,
    other_floor: Uuid,
    desk: Uuid,
    me: Uuid,
    colleague: Uuid,
}

fn add_floor(tables: &MemoryBackend, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    tables.add_floor(Floor {
        id,
        name: name.to_owned(),
        image_url: format!("/floors/{id}.png"),
        width: 1600.0,
        height: 900.0,
    });
    id
}

fn add_person(tables: &MemoryBackend, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    tables.add_profile(Profile {
        id,
        display_name: Some(name.to_owned()),
        avatar_url: None,
        role: Some("Nurse".to_owned()),
        nickname: None,
    });
    id
}

fn fixture() -> Fixture {
    let tables = Arc::new(MemoryBackend::new());
    let floor = add_floor(&tables, "Ward 4");
    let other_floor = add_floor(&tables, "Ward 5");
    let desk = tables.add_workstation(floor, "WS-1", 10.0, 10.0);
    let me = add_person(&tables, "Ada Mensah");
    let colleague = add_person(&tables, "Kofi Ali");
    Fixture { tables, hub: LocalHub::new(), floor, other_floor, desk, me, colleague }
}

impl Fixture {
    fn map_as(&self, user: Option<Uuid>) -> (LiveMap, mpsc::UnboundedReceiver<MapEvent>) {
        let backend = Backend::memory(self.tables.clone(), Arc::new(StaticAuth(user)));
        let presence =
            PresenceService::new(TOPIC, Arc::new(self.hub.clone()), self.tables.clone(), Arc::new(MemoryKv::new()));
        LiveMap::new(backend, presence, LiveMapConfig::default())
    }

    async fn mounted(&self, user: Uuid) -> (LiveMap, MountHandle, mpsc::UnboundedReceiver<MapEvent>) {
        let (map, rx) = self.map_as(Some(user));
        let handle = map.mount().await.unwrap();
        (map, handle, rx)
    }

    fn occupancy_as(&self, user: Uuid) -> OccupancyService {
        let backend = Backend::memory(self.tables.clone(), Arc::new(StaticAuth(Some(user))));
        OccupancyService::new(&backend, &LiveMapConfig::default())
    }

    fn active_rows(&self) -> Vec<AreaPresenceRow> {
        self.tables.area_rows().into_iter().filter(AreaPresenceRow::is_active).collect()
    }

    fn desk_session_open(&self) -> bool {
        self.tables
            .sessions()
            .iter()
            .any(|s| s.workstation_id == self.desk && s.ended_at.is_none())
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_event(rx: &mut mpsc::UnboundedReceiver<MapEvent>, matches: impl Fn(&MapEvent) -> bool) -> MapEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("map event timed out")
}

fn local_position(map: &LiveMap) -> Point {
    map.presence().local_player().expect("local player").position()
}

// =============================================================================
// MOUNT + FLOORS
// =============================================================================

#[tokio::test]
async fn mount_loads_first_floor() {
    let f = fixture();
    let (map, _handle, mut rx) = f.mounted(f.me).await;

    assert_eq!(map.user_id(), Some(f.me));
    assert_eq!(map.floors().len(), 2);
    assert_eq!(map.current_floor(), Some(f.floor));
    assert_eq!(map.workstations().len(), 1);
    let selected = wait_event(&mut rx, |e| matches!(e, MapEvent::FloorSelected(_))).await;
    assert!(matches!(selected, MapEvent::FloorSelected(id) if id == f.floor));
    assert!(map.perf().get(OP_WORKSTATION_RELOAD).is_some_and(|m| m.count >= 1));
    assert!(map.perf().get(OP_MERGE).is_some());
}

#[tokio::test]
async fn mount_requires_signed_in_user() {
    let f = fixture();
    let (map, _rx) = f.map_as(None);
    assert!(matches!(map.mount().await, Err(LiveMapError::Unauthenticated)));
}

#[tokio::test]
async fn select_floor_switches_workstations() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;

    assert!(matches!(map.select_floor(Uuid::new_v4()).await, Err(LiveMapError::UnknownFloor(_))));
    assert_eq!(map.current_floor(), Some(f.floor));

    map.select_floor(f.other_floor).await.unwrap();
    assert_eq!(map.current_floor(), Some(f.other_floor));
    assert!(map.workstations().is_empty());
}

#[tokio::test]
async fn workstation_changes_reload_in_background() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    assert_eq!(map.workstations()[0].status, WorkstationStatus::Available);

    f.occupancy_as(f.colleague).claim(f.desk).await.unwrap();
    eventually("workstation reload", || map.workstations()[0].status == WorkstationStatus::InUse).await;
    assert_eq!(map.workstations()[0].occupant_name.as_deref(), Some("Kofi Ali"));
}

// =============================================================================
// TAP TO MOVE
// =============================================================================

#[tokio::test]
async fn tap_moves_and_persists() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;

    assert_eq!(map.tap(30.0, 40.0).await.unwrap(), TapOutcome::Moved);
    assert_eq!(local_position(&map), Point::new(30.0, 40.0));

    eventually("area presence row", || !f.active_rows().is_empty()).await;
    let row = &f.active_rows()[0];
    assert_eq!((row.user_id, row.floor_id), (f.me, f.floor));
    assert!((row.x - 30.0).abs() < f64::EPSILON && (row.y - 40.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn tap_far_from_held_seat_asks_then_releases_on_confirm() {
    let f = fixture();
    let (map, _handle, mut rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    let TapOutcome::ConfirmRelease(intent) = map.tap(40.0, 60.0).await.unwrap() else {
        panic!("expected a release-and-move prompt");
    };
    assert_eq!(intent.workstation_id, f.desk);
    assert_eq!(intent.target, Point::new(40.0, 60.0));
    let raised = wait_event(&mut rx, |e| matches!(e, MapEvent::ReleaseAndMove(_))).await;
    assert!(matches!(raised, MapEvent::ReleaseAndMove(i) if i.id == intent.id));
    assert_eq!(local_position(&map), Point::new(40.0, 60.0), "avatar moves right away");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.active_rows().is_empty(), "nothing persisted while the prompt is open");
    assert!(f.desk_session_open());

    map.confirm_release_and_move().await.unwrap();
    assert!(!f.desk_session_open());
    let rows = f.active_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].floor_id, f.floor);
    assert!((rows[0].x - 40.0).abs() < f64::EPSILON && (rows[0].y - 60.0).abs() < f64::EPSILON);
    assert!(map.pending_release().is_none());
    assert_eq!(map.workstations()[0].status, WorkstationStatus::Available);
}

#[tokio::test]
async fn cancel_keeps_seat_and_row() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    assert!(matches!(map.tap(40.0, 60.0).await.unwrap(), TapOutcome::ConfirmRelease(_)));
    assert!(map.cancel_release_and_move());
    assert!(!map.cancel_release_and_move());

    assert!(f.desk_session_open());
    assert!(f.active_rows().is_empty());
    assert_eq!(local_position(&map), Point::new(40.0, 60.0));
    assert!(matches!(map.confirm_release_and_move().await, Err(LiveMapError::NoPendingRelease)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompt_expires() {
    let f = fixture();
    let (map, _handle, mut rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    let TapOutcome::ConfirmRelease(intent) = map.tap(40.0, 60.0).await.unwrap() else {
        panic!("expected a release-and-move prompt");
    };
    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert!(map.pending_release().is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(map.pending_release().is_none());
    let closed = wait_event(&mut rx, |e| matches!(e, MapEvent::ReleaseIntentClosed { .. })).await;
    assert!(matches!(closed, MapEvent::ReleaseIntentClosed { id, expired: true } if id == intent.id));
    assert!(f.desk_session_open());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_never_persists_a_cancelled_move() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    assert!(matches!(map.tap(40.0, 60.0).await.unwrap(), TapOutcome::ConfirmRelease(_)));
    assert!(map.cancel_release_and_move());
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert!(f.active_rows().is_empty(), "declined position must not reach the row");
    assert!(f.desk_session_open());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_last_persisted_position_after_expiry() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    assert_eq!(map.tap(12.0, 11.0).await.unwrap(), TapOutcome::Moved);
    eventually("area presence row", || !f.active_rows().is_empty()).await;

    assert!(matches!(map.tap(40.0, 60.0).await.unwrap(), TapOutcome::ConfirmRelease(_)));
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(map.pending_release().is_none());

    let rows = f.active_rows();
    assert_eq!(rows.len(), 1);
    assert!((rows[0].x - 12.0).abs() < f64::EPSILON && (rows[0].y - 11.0).abs() < f64::EPSILON);
    assert!(f.desk_session_open());
}

#[tokio::test]
async fn tap_near_held_seat_moves_without_prompt() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.claim(f.desk).await.unwrap();

    assert_eq!(map.tap(12.0, 11.0).await.unwrap(), TapOutcome::Moved);
    assert!(map.pending_release().is_none());
    assert!(f.desk_session_open());
}

// =============================================================================
// WORKSTATION ACTIONS
// =============================================================================

#[tokio::test]
async fn click_opens_panel_for_viewer() {
    let f = fixture();
    let (map, _handle, mut rx) = f.mounted(f.me).await;

    let panel = map.click_workstation(f.desk).unwrap();
    assert_eq!(panel, Panel::Actions { workstation_id: f.desk, status: WorkstationStatus::Available, mine: false });
    let opened = wait_event(&mut rx, |e| matches!(e, MapEvent::OpenPanel(_))).await;
    assert!(matches!(opened, MapEvent::OpenPanel(p) if p == panel));
    eventually("walk toward pin", || !map.movement().state().is_moving()).await;
    assert_eq!(local_position(&map), Point::new(10.0, 10.0));

    map.claim(f.desk).await.unwrap();
    assert!(matches!(map.click_workstation(f.desk).unwrap(), Panel::Actions { mine: true, .. }));

    map.release(f.desk).await.unwrap();
    f.occupancy_as(f.colleague).claim(f.desk).await.unwrap();
    map.reload_workstations().await.unwrap();
    let panel = map.click_workstation(f.desk).unwrap();
    assert_eq!(
        panel,
        Panel::OccupantProfile {
            workstation_id: f.desk,
            occupant_id: Some(f.colleague),
            occupant_name: Some("Kofi Ali".to_owned()),
        }
    );

    assert!(matches!(map.click_workstation(Uuid::new_v4()), Err(LiveMapError::UnknownWorkstation(_))));
}

#[tokio::test]
async fn duplicate_action_is_busy() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;

    let guard = map.begin(Action::Claim(f.desk)).unwrap();
    let err = map.claim(f.desk).await.unwrap_err();
    assert!(matches!(err, LiveMapError::Busy("claim")));
    assert_eq!(err.error_code(), "E_BUSY");
    assert!(!f.desk_session_open());

    drop(guard);
    map.claim(f.desk).await.unwrap();
    assert!(f.desk_session_open());
}

#[tokio::test]
async fn assign_and_status_flow_through_reload() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;

    map.assign(f.desk, &AssignRequest::external("Locum Dr. Osei")).await.unwrap();
    assert_eq!(map.workstations()[0].occupant_name.as_deref(), Some("Locum Dr. Osei"));

    map.set_workstation_status(f.desk, Some("back at 3")).await.unwrap();
    assert_eq!(map.workstations()[0].status_message.as_deref(), Some("back at 3"));

    assert!(map.release(f.desk).await.unwrap());
    assert!(!map.release(f.desk).await.unwrap(), "release is idempotent");
}

#[tokio::test]
async fn scene_and_hit_test_follow_selected_floor() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;

    let scene = map.scene().unwrap();
    assert_eq!(scene.pins.len(), 1);
    assert_eq!(map.hit_test(Point::new(11.0, 10.0)), Some(f.desk));
    assert_eq!(map.hit_test(Point::new(50.0, 50.0)), None);

    map.select_floor(f.other_floor).await.unwrap();
    assert_eq!(map.hit_test(Point::new(10.0, 10.0)), None);
}

// =============================================================================
// OWN PRESENCE
// =============================================================================

#[tokio::test]
async fn leave_area_clears_row_and_floor() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.tap(30.0, 30.0).await.unwrap();
    eventually("area presence row", || !f.active_rows().is_empty()).await;

    map.leave_area().await.unwrap();
    assert!(f.active_rows().is_empty());
    assert_eq!(map.presence().local_player().unwrap().floor_id, None);
}

#[tokio::test]
async fn my_status_reaches_channel_and_row() {
    let f = fixture();
    let (map, _handle, _rx) = f.mounted(f.me).await;
    map.tap(30.0, 30.0).await.unwrap();
    eventually("area presence row", || !f.active_rows().is_empty()).await;

    map.set_my_status(Some("On break")).await.unwrap();
    assert_eq!(map.presence().local_player().unwrap().status_message.as_deref(), Some("On break"));
    assert_eq!(f.active_rows()[0].status_message.as_deref(), Some("On break"));
}

// =============================================================================
// MERGED PRESENCE
// =============================================================================

#[tokio::test]
async fn persisted_presence_outlives_channel_until_ttl() {
    let f = fixture();
    let (alice, _alice_handle, _alice_rx) = f.mounted(f.me).await;
    let (bob, _bob_handle, _bob_rx) = f.mounted(f.colleague).await;

    alice.tap(12.0, 18.0).await.unwrap();
    eventually("alice's row", || !f.active_rows().is_empty()).await;
    bob.refresh_area_presence().await;
    eventually("alice merged in bob's view", || {
        bob.presence_view()
            .iter()
            .any(|p| p.user_id == f.me && p.source == PresenceSource::Merged)
    })
    .await;

    f.hub.drop_connection(TOPIC, f.me);
    eventually("alice persistent only", || {
        bob.presence_view()
            .iter()
            .any(|p| p.user_id == f.me && p.source == PresenceSource::Persistent)
    })
    .await;

    let now = OffsetDateTime::now_utc();
    let view = bob.recompute_presence_at(now);
    let entry = view.iter().find(|p| p.user_id == f.me).unwrap();
    assert!(!entry.is_stale);
    assert!((entry.x - 12.0).abs() < f64::EPSILON && (entry.y - 18.0).abs() < f64::EPSILON);
    assert_eq!(entry.floor_id, Some(f.floor));
    assert_eq!(entry.display_name, "Ada Mensah");

    let later = bob.recompute_presence_at(now + time::Duration::seconds(91));
    assert!(later.iter().find(|p| p.user_id == f.me).unwrap().is_stale);
}

#[tokio::test]
async fn abandoned_rows_are_pruned() {
    let f = fixture();
    let ghost = Uuid::new_v4();
    let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(2);
    f.tables.seed_presence(ghost, f.floor, 50.0, 50.0, long_ago);

    let (map, _handle, _rx) = f.mounted(f.me).await;
    assert!(map.presence_view().iter().any(|p| p.user_id == ghost && p.is_stale));

    eventually("ghost pruned", || f.tables.area_rows().iter().all(|r| r.user_id != ghost)).await;
}

// =============================================================================
// KICK
// =============================================================================

#[tokio::test]
async fn kick_removes_presence_and_seat() {
    let f = fixture();
    f.tables
        .seed_presence(f.colleague, f.floor, 20.0, 20.0, OffsetDateTime::now_utc());
    f.occupancy_as(f.colleague).claim(f.desk).await.unwrap();

    let (map, _handle, _rx) = f.mounted(f.me).await;
    let prompt = map.prepare_kick(f.colleague);
    assert_eq!(prompt.display_name, "Kofi Ali");
    assert!(!prompt.is_realtime);
    assert!(prompt.warning().is_none());

    let outcome = map.confirm_kick(f.colleague).await.unwrap();
    assert_eq!(outcome, KickOutcome { rows_removed: 1, sessions_ended: 1 });
    assert!(!f.desk_session_open());
    assert!(map.presence_view().iter().all(|p| p.user_id != f.colleague));
    assert_eq!(map.workstations()[0].status, WorkstationStatus::Available);
}

#[tokio::test]
async fn kick_prompt_warns_for_live_user() {
    let f = fixture();
    let (_alice, _alice_handle, _alice_rx) = f.mounted(f.me).await;
    let (bob, _bob_handle, _bob_rx) = f.mounted(f.colleague).await;

    eventually("alice live in bob's view", || bob.presence_view().iter().any(|p| p.user_id == f.me)).await;
    let prompt = bob.prepare_kick(f.me);
    assert!(prompt.is_realtime);
    assert!(prompt.warning().is_some());
}
