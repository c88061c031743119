use super::*;
use crate::backend::StaticAuth;
use crate::backend::memory::{MemoryBackend, MemorySchema};
use crate::model::WorkstationStatus;

struct Fixture {
    tables: Arc<MemoryBackend>,
    me: Uuid,
    colleague: Uuid,
    floor: Uuid,
    desk: Uuid,
    service: OccupancyService,
}

fn profile(id: Uuid, name: &str, avatar: Option<&str>) -> Profile {
    Profile {
        id,
        display_name: Some(name.into()),
        avatar_url: avatar.map(str::to_owned),
        role: Some("Nurse".into()),
        nickname: None,
    }
}

fn service_as(tables: &Arc<MemoryBackend>, user: Option<Uuid>) -> OccupancyService {
    let backend = Backend::memory(tables.clone(), Arc::new(StaticAuth(user)));
    OccupancyService::new(&backend, &LiveMapConfig::default())
}

fn fixture() -> Fixture {
    let tables = Arc::new(MemoryBackend::new());
    let me = Uuid::new_v4();
    let colleague = Uuid::new_v4();
    tables.add_profile(profile(me, "Ada Mensah", Some("https://cdn.example/ada.png")));
    tables.add_profile(profile(colleague, "Kofi Ali", Some("https://cdn.example/kofi.png")));
    let floor = Uuid::new_v4();
    let desk = tables.add_workstation(floor, "WS-1", 10.0, 10.0);
    let service = service_as(&tables, Some(me));
    Fixture { tables, me, colleague, floor, desk, service }
}

fn open_sessions(tables: &MemoryBackend) -> usize {
    tables.sessions().iter().filter(|s| s.ended_at.is_none()).count()
}

// =============================================================================
// CLAIM / RELEASE
// =============================================================================

#[tokio::test]
async fn claim_creates_self_session_without_expiry() {
    let f = fixture();
    let session = f.service.claim(f.desk).await.unwrap();

    assert_eq!(session.occupancy_mode, OccupancyMode::SelfClaim);
    assert_eq!(session.user_id, f.me);
    assert_eq!(session.occupant_user_id, Some(f.me));
    assert!(session.expires_at.is_none());

    let listed = f.service.list_workstations(f.floor).await.unwrap();
    assert_eq!(listed[0].status, WorkstationStatus::InUse);
    assert_eq!(listed[0].occupant_id, Some(f.me));
}

#[tokio::test]
async fn claim_on_occupied_workstation_fails_without_new_row() {
    let f = fixture();
    f.service.claim(f.desk).await.unwrap();

    let other = service_as(&f.tables, Some(f.colleague));
    let err = other.claim(f.desk).await.unwrap_err();
    assert!(matches!(err, OccupancyError::AlreadyOccupied));
    assert_eq!(err.error_code(), "E_ALREADY_OCCUPIED");
    assert_eq!(f.tables.sessions().len(), 1);
}

#[tokio::test]
async fn claim_requires_identity() {
    let f = fixture();
    let anonymous = service_as(&f.tables, None);
    assert!(matches!(anonymous.claim(f.desk).await, Err(OccupancyError::Unauthenticated)));
    assert!(f.tables.sessions().is_empty());
}

#[tokio::test]
async fn non_actionable_workstation_rejects_actions() {
    let f = fixture();
    f.tables.set_workstation_base_status(f.desk, WorkstationStatus::OutOfService);

    let err = f.service.claim(f.desk).await.unwrap_err();
    assert!(matches!(err, OccupancyError::NotActionable("OUT_OF_SERVICE")));
    assert!(matches!(f.service.release(f.desk).await, Err(OccupancyError::NotActionable(_))));
    assert!(f.tables.sessions().is_empty());
}

#[tokio::test]
async fn unknown_workstation_is_not_found() {
    let f = fixture();
    let missing = Uuid::new_v4();
    assert!(matches!(f.service.claim(missing).await, Err(OccupancyError::NotFound(id)) if id == missing));
}

#[tokio::test]
async fn release_without_session_is_a_quiet_success() {
    let f = fixture();
    assert!(!f.service.release(f.desk).await.unwrap());
    assert!(f.tables.sessions().is_empty());
}

#[tokio::test]
async fn release_ends_active_session() {
    let f = fixture();
    f.service.claim(f.desk).await.unwrap();
    assert!(f.service.release(f.desk).await.unwrap());
    assert_eq!(open_sessions(&f.tables), 0);
    assert!(!f.service.release(f.desk).await.unwrap(), "second release is a no-op");
}

// =============================================================================
// ASSIGN
// =============================================================================

#[tokio::test]
async fn assign_colleague_expires_after_eight_hours() {
    let f = fixture();
    let before = OffsetDateTime::now_utc();
    let session = f
        .service
        .assign(f.desk, &AssignRequest::colleague(f.colleague))
        .await
        .unwrap();

    assert_eq!(session.occupancy_mode, OccupancyMode::AssignedUser);
    assert_eq!(session.occupant_user_id, Some(f.colleague));
    assert_eq!(session.occupant_display_name.as_deref(), Some("Kofi Ali"));
    assert_eq!(session.assigned_by_user_id, Some(f.me));

    let expires = session.expires_at.unwrap();
    let expected = before + time::Duration::hours(8);
    assert!((expires - expected).abs() < time::Duration::minutes(1));
}

#[tokio::test]
async fn assign_external_visitor() {
    let f = fixture();
    let session = f
        .service
        .assign(f.desk, &AssignRequest::external("  Locum Dr Reyes "))
        .await
        .unwrap();
    assert_eq!(session.occupancy_mode, OccupancyMode::AssignedExternal);
    assert_eq!(session.occupant_display_name.as_deref(), Some("Locum Dr Reyes"));
    assert!(session.occupant_user_id.is_none());
    assert!(session.expires_at.is_some());
}

#[tokio::test]
async fn assign_validates_identifying_field() {
    let f = fixture();
    let blank = AssignRequest::external("   ");
    assert!(matches!(f.service.assign(f.desk, &blank).await, Err(OccupancyError::Validation(_))));

    let no_user = AssignRequest { occupant_user_id: None, ..AssignRequest::colleague(f.colleague) };
    assert!(matches!(f.service.assign(f.desk, &no_user).await, Err(OccupancyError::Validation(_))));
    assert!(f.tables.sessions().is_empty());
}

#[tokio::test]
async fn assign_self_mode_behaves_like_claim() {
    let f = fixture();
    let request = AssignRequest {
        mode: OccupancyMode::SelfClaim,
        occupant_user_id: None,
        occupant_name: None,
        status_message: Some("on call".into()),
    };
    let session = f.service.assign(f.desk, &request).await.unwrap();
    assert_eq!(session.occupancy_mode, OccupancyMode::SelfClaim);
    assert!(session.expires_at.is_none());
    assert_eq!(session.status_message.as_deref(), Some("on call"));
}

#[tokio::test]
async fn expired_assignment_frees_the_workstation() {
    let f = fixture();
    let past = OffsetDateTime::now_utc() - time::Duration::hours(9);
    f.tables.seed_session(OccupancySession {
        id: Uuid::new_v4(),
        workstation_id: f.desk,
        user_id: f.colleague,
        occupant_user_id: None,
        occupant_display_name: Some("Visitor".into()),
        occupancy_mode: OccupancyMode::AssignedExternal,
        assigned_by_user_id: Some(f.colleague),
        status_message: None,
        started_at: past,
        expires_at: Some(past + time::Duration::hours(8)),
        ended_at: None,
    });

    assert!(f.service.get_active_session(f.desk).await.unwrap().is_none());
    f.service.claim(f.desk).await.unwrap();
}

// =============================================================================
// STATUS MESSAGE
// =============================================================================

#[tokio::test]
async fn status_message_requires_active_session() {
    let f = fixture();
    let err = f.service.update_status_message(f.desk, Some("busy")).await.unwrap_err();
    assert!(matches!(err, OccupancyError::NoActiveSession));

    f.service.claim(f.desk).await.unwrap();
    f.service
        .update_status_message(f.desk, Some("  charting discharge summaries  "))
        .await
        .unwrap();
    let session = f.service.get_active_session(f.desk).await.unwrap().unwrap();
    assert_eq!(session.status_message.as_deref(), Some("charting discharge s"));

    f.service.update_status_message(f.desk, None).await.unwrap();
    let session = f.service.get_active_session(f.desk).await.unwrap().unwrap();
    assert!(session.status_message.is_none());
}

// =============================================================================
// SCHEMA CAPABILITIES
// =============================================================================

#[tokio::test]
async fn missing_expiry_column_falls_back_and_is_remembered() {
    let f = fixture();
    f.tables.set_schema(MemorySchema { sessions_have_expiry: false, sessions_have_assignment: true });

    assert!(f.service.get_active_session(f.desk).await.unwrap().is_none());
    assert!(f.service.expiry_column_missing());

    let before = f.tables.session_query_count();
    f.service.get_active_session(f.desk).await.unwrap();
    assert_eq!(f.tables.session_query_count() - before, 1, "no re-probe");
}

#[tokio::test]
async fn missing_assignment_columns_degrade_insert() {
    let f = fixture();
    f.tables.set_schema(MemorySchema { sessions_have_expiry: true, sessions_have_assignment: false });

    let session = f.service.claim(f.desk).await.unwrap();
    assert!(f.service.uses_legacy_insert());
    assert_eq!(session.occupancy_mode, OccupancyMode::SelfClaim);
    assert_eq!(session.user_id, f.me);
    assert_eq!(f.tables.sessions().len(), 1);

    let second = f.tables.add_workstation(f.floor, "WS-2", 30.0, 30.0);
    f.service.claim(second).await.unwrap();
    assert_eq!(f.tables.sessions().len(), 2);
}

// =============================================================================
// OWNERSHIP
// =============================================================================

#[tokio::test]
async fn ownership_check_is_cached() {
    let f = fixture();
    f.service.claim(f.desk).await.unwrap();

    assert!(f.service.is_current_user_occupying_workstation(f.desk, None).await.unwrap());
    let before = f.tables.session_query_count();
    assert!(f.service.is_current_user_occupying_workstation(f.desk, None).await.unwrap());
    assert_eq!(f.tables.session_query_count(), before, "served from cache");

    f.service
        .is_current_user_occupying_workstation(f.desk, Some(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(f.tables.session_query_count(), before + 1);
}

#[tokio::test]
async fn release_invalidates_ownership_cache() {
    let f = fixture();
    f.service.claim(f.desk).await.unwrap();
    assert!(f.service.is_current_user_occupying_workstation(f.desk, None).await.unwrap());
    f.service.release(f.desk).await.unwrap();
    assert!(!f.service.is_current_user_occupying_workstation(f.desk, None).await.unwrap());
}

#[tokio::test]
async fn assigned_occupant_counts_as_occupying() {
    let f = fixture();
    f.service.assign(f.desk, &AssignRequest::colleague(f.colleague)).await.unwrap();

    let colleague = service_as(&f.tables, Some(f.colleague));
    assert!(colleague.is_current_user_occupying_workstation(f.desk, None).await.unwrap());

    let stranger = service_as(&f.tables, Some(Uuid::new_v4()));
    assert!(!stranger.is_current_user_occupying_workstation(f.desk, None).await.unwrap());
}

// =============================================================================
// HYDRATION / SEARCH / ADMIN
// =============================================================================

#[tokio::test]
async fn hydration_fills_profile_fields_and_caches() {
    let f = fixture();
    f.service.assign(f.desk, &AssignRequest::colleague(f.colleague)).await.unwrap();

    let before = f.tables.profile_fetch_count();
    let listed = f.service.list_workstations(f.floor).await.unwrap();
    assert_eq!(f.tables.profile_fetch_count(), before + 1);
    assert_eq!(listed[0].occupant_avatar_url.as_deref(), Some("https://cdn.example/kofi.png"));
    assert_eq!(listed[0].occupant_role.as_deref(), Some("Nurse"));

    f.service.list_workstations(f.floor).await.unwrap();
    assert_eq!(f.tables.profile_fetch_count(), before + 1, "second load hits cache");
}

#[tokio::test]
async fn hydration_skips_unoccupied_lists() {
    let f = fixture();
    let before = f.tables.profile_fetch_count();
    f.service.list_workstations(f.floor).await.unwrap();
    assert_eq!(f.tables.profile_fetch_count(), before);
}

#[tokio::test]
async fn search_ignores_blank_queries() {
    let f = fixture();
    assert!(f.service.search_assignable_occupants("   ").await.unwrap().is_empty());
    let hits = f.service.search_assignable_occupants("kofi").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, f.colleague);
}

#[tokio::test]
async fn force_release_ends_sessions_held_or_occupied() {
    let f = fixture();
    let second = f.tables.add_workstation(f.floor, "WS-2", 40.0, 40.0);
    service_as(&f.tables, Some(f.colleague)).claim(f.desk).await.unwrap();
    f.service.assign(second, &AssignRequest::colleague(f.colleague)).await.unwrap();

    assert_eq!(f.service.force_release_for_user(f.colleague).await.unwrap(), 2);
    assert_eq!(open_sessions(&f.tables), 0);
    assert_eq!(f.service.force_release_for_user(f.colleague).await.unwrap(), 0);
}
