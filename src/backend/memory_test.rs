use super::*;
use time::Duration;

fn floor() -> Floor {
    Floor { id: Uuid::new_v4(), name: "Ward 4".into(), image_url: "/maps/ward4.png".into(), width: 1200.0, height: 800.0 }
}

fn profile(name: &str) -> Profile {
    Profile {
        id: Uuid::new_v4(),
        display_name: Some(name.to_owned()),
        avatar_url: Some(format!("/avatars/{name}.png")),
        role: Some("nurse".into()),
        nickname: None,
    }
}

fn new_session(workstation_id: Uuid, user_id: Uuid, mode: OccupancyMode) -> NewSession {
    NewSession {
        workstation_id,
        user_id,
        occupant_user_id: Some(user_id),
        occupant_display_name: None,
        occupancy_mode: mode,
        assigned_by_user_id: None,
        status_message: None,
        started_at: OffsetDateTime::now_utc(),
        expires_at: None,
    }
}

#[tokio::test]
async fn read_model_reflects_latest_active_session() {
    let backend = MemoryBackend::new();
    let floor = floor();
    let nurse = profile("Rangi");
    backend.add_floor(floor.clone());
    backend.add_profile(nurse.clone());
    let ws = backend.add_workstation(floor.id, "Bay 1", 10.0, 10.0);

    let listed = backend.list_by_floor(floor.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, WorkstationStatus::Available);

    backend
        .insert_session(&new_session(ws, nurse.id, OccupancyMode::SelfClaim), SessionPayload::Full)
        .await
        .unwrap();

    let ws_row = backend.get_workstation(ws).await.unwrap().unwrap();
    assert_eq!(ws_row.status, WorkstationStatus::InUse);
    assert_eq!(ws_row.occupant_id, Some(nurse.id));
    assert_eq!(ws_row.occupant_name.as_deref(), Some("Rangi"));
    assert_eq!(ws_row.occupancy_mode, Some(OccupancyMode::SelfClaim));
}

#[tokio::test]
async fn expired_session_leaves_station_available() {
    let backend = MemoryBackend::new();
    let floor = floor();
    backend.add_floor(floor.clone());
    let ws = backend.add_workstation(floor.id, "Bay 2", 20.0, 20.0);
    let now = OffsetDateTime::now_utc();

    backend.seed_session(OccupancySession {
        id: Uuid::new_v4(),
        workstation_id: ws,
        user_id: Uuid::new_v4(),
        occupant_user_id: None,
        occupant_display_name: Some("Visitor".into()),
        occupancy_mode: OccupancyMode::AssignedExternal,
        assigned_by_user_id: None,
        status_message: None,
        started_at: now - Duration::hours(9),
        expires_at: Some(now - Duration::hours(1)),
        ended_at: None,
    });

    let ws_row = backend.get_workstation(ws).await.unwrap().unwrap();
    assert_eq!(ws_row.status, WorkstationStatus::Available);

    let open = backend
        .find_open_session(ws, ExpiryFilter::Ignore)
        .await
        .unwrap();
    assert!(open.is_some(), "ignore filter still sees the unended row");
    let open = backend
        .find_open_session(ws, ExpiryFilter::UnexpiredAt(now))
        .await
        .unwrap();
    assert!(open.is_none());
}

#[tokio::test]
async fn offline_station_never_shows_occupant() {
    let backend = MemoryBackend::new();
    let floor = floor();
    backend.add_floor(floor.clone());
    let ws = backend.add_workstation(floor.id, "Bay 3", 30.0, 30.0);
    backend
        .insert_session(&new_session(ws, Uuid::new_v4(), OccupancyMode::SelfClaim), SessionPayload::Full)
        .await
        .unwrap();
    backend.set_workstation_base_status(ws, WorkstationStatus::OutOfService);

    let ws_row = backend.get_workstation(ws).await.unwrap().unwrap();
    assert_eq!(ws_row.status, WorkstationStatus::OutOfService);
    assert!(ws_row.occupant_id.is_none());
}

#[tokio::test]
async fn legacy_schema_rejects_rich_payloads() {
    let backend = MemoryBackend::new();
    backend.set_schema(MemorySchema { sessions_have_expiry: false, sessions_have_assignment: false });
    let ws = Uuid::new_v4();

    let err = backend
        .find_open_session(ws, ExpiryFilter::UnexpiredAt(OffsetDateTime::now_utc()))
        .await
        .unwrap_err();
    assert!(err.is_missing_column());

    let err = backend
        .insert_session(&new_session(ws, Uuid::new_v4(), OccupancyMode::AssignedUser), SessionPayload::Full)
        .await
        .unwrap_err();
    assert!(err.is_missing_column());

    let row = backend
        .insert_session(&new_session(ws, Uuid::new_v4(), OccupancyMode::AssignedUser), SessionPayload::Legacy)
        .await
        .unwrap();
    assert_eq!(row.occupancy_mode, OccupancyMode::SelfClaim);
    assert!(row.expires_at.is_none());
}

#[tokio::test]
async fn area_presence_lifecycle_and_change_feed() {
    let backend = MemoryBackend::new();
    let nurse = profile("Mere");
    backend.add_profile(nurse.clone());
    let mut changes = AreaPresenceTable::subscribe_changes(&backend);
    let floor_id = Uuid::new_v4();
    let seen_at = OffsetDateTime::now_utc();

    let row = backend
        .insert(&NewAreaPresence { user_id: nurse.id, floor_id, x: 12.0, y: 18.0, status_message: None, seen_at })
        .await
        .unwrap();
    assert_eq!(row.display_name.as_deref(), Some("Mere"));
    assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Insert);

    backend
        .update(
            row.id,
            &AreaPresencePatch {
                is_present: Some(false),
                cleared_at: Some(Some(seen_at)),
                ..AreaPresencePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Update);
    assert!(backend.list_active().await.unwrap().is_empty());
    assert!(backend.find_active_for_user(nurse.id).await.unwrap().is_none());
}

#[tokio::test]
async fn injected_delete_failure_surfaces_error() {
    let backend = MemoryBackend::new();
    let user = Uuid::new_v4();
    backend
        .insert(&NewAreaPresence {
            user_id: user,
            floor_id: Uuid::new_v4(),
            x: 1.0,
            y: 1.0,
            status_message: None,
            seen_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();

    backend.fail_deletes_for(user);
    assert!(backend.delete_for_user(user).await.is_err());
    backend.allow_deletes_for(user);
    assert_eq!(backend.delete_for_user(user).await.unwrap(), 1);
    assert!(backend.area_rows().is_empty());
}

#[tokio::test]
async fn search_matches_display_name_and_nickname() {
    let backend = MemoryBackend::new();
    backend.add_profile(profile("Aroha Ngata"));
    let mut nick = profile("Thomas Reid");
    nick.nickname = Some("Tam".into());
    backend.add_profile(nick);

    let hits = backend.search("tam", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].label(), "Thomas Reid");

    let hits = backend.search("a", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
}
