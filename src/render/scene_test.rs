use super::*;
use crate::model::PresenceSource;

fn workstation(floor_id: Uuid, label: &str, x: f64, y: f64, status: WorkstationStatus) -> Workstation {
    Workstation {
        id: Uuid::new_v4(),
        floor_id,
        label: label.to_owned(),
        section: None,
        x,
        y,
        status,
        occupant_id: None,
        occupant_name: None,
        occupant_avatar_url: None,
        occupant_role: None,
        occupant_nickname: None,
        occupancy_mode: None,
        status_message: None,
        expires_at: None,
    }
}

fn presence(user_id: Uuid, floor_id: Option<Uuid>, stale: bool) -> MergedPresence {
    MergedPresence {
        user_id,
        display_name: "Nurse".to_owned(),
        avatar_url: None,
        role: None,
        floor_id,
        x: 10.0,
        y: 20.0,
        is_walking: false,
        target_x: None,
        target_y: None,
        status_message: None,
        source: if stale { PresenceSource::Persistent } else { PresenceSource::Realtime },
        is_stale: stale,
        last_seen_at: None,
    }
}

// --- Pins ---

#[test]
fn pin_style_follows_status_and_viewer() {
    let floor = Uuid::new_v4();
    let me = Uuid::new_v4();
    let mut ws = workstation(floor, "WS-1", 10.0, 10.0, WorkstationStatus::InUse);
    assert_eq!(PinStyle::for_workstation(&ws, Some(me)), PinStyle::Occupied);

    ws.occupant_id = Some(me);
    assert_eq!(PinStyle::for_workstation(&ws, Some(me)), PinStyle::Mine);
    assert_eq!(PinStyle::for_workstation(&ws, None), PinStyle::Occupied);

    ws.status = WorkstationStatus::OutOfService;
    assert_eq!(PinStyle::for_workstation(&ws, Some(me)), PinStyle::OutOfService);
    assert_ne!(PinStyle::Available.color(), PinStyle::Occupied.color());
}

#[test]
fn scene_keeps_only_selected_floor() {
    let floor = Uuid::new_v4();
    let other = Uuid::new_v4();
    let stations = vec![
        workstation(floor, "A", 10.0, 10.0, WorkstationStatus::Available),
        workstation(other, "B", 10.0, 10.0, WorkstationStatus::Available),
    ];
    let people = vec![presence(Uuid::new_v4(), Some(floor), false), presence(Uuid::new_v4(), Some(other), false)];
    let people_nowhere = presence(Uuid::new_v4(), None, false);

    let mut all = people.clone();
    all.push(people_nowhere);
    let scene = build_scene(floor, &stations, &all, None);
    assert_eq!(scene.pins.len(), 1);
    assert_eq!(scene.pins[0].label, "A");
    assert_eq!(scene.avatars.len(), 1);
    assert_eq!(scene.avatars[0].user_id, people[0].user_id);
}

// --- Avatars ---

#[test]
fn avatars_paint_stale_first_and_self_last() {
    let floor = Uuid::new_v4();
    let me = Uuid::new_v4();
    let live = Uuid::new_v4();
    let stale = Uuid::new_v4();
    let people = vec![presence(me, Some(floor), false), presence(live, Some(floor), false), presence(stale, Some(floor), true)];

    let scene = build_scene(floor, &[], &people, Some(me));
    let order: Vec<Uuid> = scene.avatars.iter().map(|a| a.user_id).collect();
    assert_eq!(order, vec![stale, live, me]);
    assert!(scene.avatars[0].stale);
    assert!(scene.avatars[2].mine);
}

// --- Hit testing ---

#[test]
fn pin_at_picks_nearest_within_radius() {
    let floor = Uuid::new_v4();
    let stations = vec![
        workstation(floor, "near", 50.0, 50.0, WorkstationStatus::Available),
        workstation(floor, "nearer", 51.0, 50.0, WorkstationStatus::Available),
    ];
    let scene = build_scene(floor, &stations, &[], None);

    assert_eq!(pin_at(&scene, Point::new(51.5, 50.0), 2.5).unwrap().label, "nearer");
    assert_eq!(pin_at(&scene, Point::new(48.0, 50.0), 2.5).unwrap().label, "near");
    assert!(pin_at(&scene, Point::new(60.0, 60.0), 2.5).is_none());
}

#[test]
fn pin_at_includes_radius_boundary() {
    let floor = Uuid::new_v4();
    let stations = vec![workstation(floor, "edge", 10.0, 10.0, WorkstationStatus::Offline)];
    let scene = build_scene(floor, &stations, &[], None);
    assert!(pin_at(&scene, Point::new(12.5, 10.0), 2.5).is_some());
}
