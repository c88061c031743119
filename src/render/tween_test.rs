use super::*;
use crate::render::scene::AvatarSprite;

fn sprite(user_id: Uuid, x: f64, y: f64, mine: bool) -> AvatarSprite {
    AvatarSprite {
        user_id,
        at: Point::new(x, y),
        label: "Tech".to_owned(),
        avatar_url: None,
        status_message: None,
        walking: false,
        stale: false,
        mine,
    }
}

#[test]
fn first_sight_snaps_to_target() {
    let mut easer = AvatarEaser::default();
    let id = Uuid::new_v4();
    assert_eq!(easer.step(id, Point::new(40.0, 40.0)), Point::new(40.0, 40.0));
}

#[test]
fn step_moves_fraction_of_gap() {
    let mut easer = AvatarEaser::default();
    let id = Uuid::new_v4();
    easer.step(id, Point::new(0.0, 0.0));
    let p = easer.step(id, Point::new(10.0, 0.0));
    assert!((p.x - 2.0).abs() < 1e-9);
    let p = easer.step(id, Point::new(10.0, 0.0));
    assert!((p.x - 3.6).abs() < 1e-9);
}

#[test]
fn snaps_inside_epsilon() {
    let mut easer = AvatarEaser::default();
    let id = Uuid::new_v4();
    easer.step(id, Point::new(10.0, 10.0));
    assert_eq!(easer.step(id, Point::new(10.04, 10.0)), Point::new(10.04, 10.0));
}

#[test]
fn converges_to_target() {
    let mut easer = AvatarEaser::default();
    let id = Uuid::new_v4();
    easer.step(id, Point::new(0.0, 0.0));
    let target = Point::new(80.0, 20.0);
    let mut frames = 0;
    while easer.step(id, target) != target {
        frames += 1;
        assert!(frames < 100, "easing never settled");
    }
}

#[test]
fn apply_skips_own_avatar_and_forgets_departed() {
    let mut easer = AvatarEaser::default();
    let me = Uuid::new_v4();
    let other = Uuid::new_v4();
    let gone = Uuid::new_v4();

    let mut scene = Scene { pins: Vec::new(), avatars: vec![sprite(other, 0.0, 0.0, false), sprite(gone, 5.0, 5.0, false)] };
    assert!(!easer.apply(&mut scene));

    let mut scene = Scene { pins: Vec::new(), avatars: vec![sprite(other, 50.0, 0.0, false), sprite(me, 90.0, 90.0, true)] };
    assert!(easer.apply(&mut scene), "remote avatar still settling");
    assert!((scene.avatars[0].at.x - 10.0).abs() < 1e-9);
    assert_eq!(scene.avatars[1].at, Point::new(90.0, 90.0));
    assert!(easer.drawn(gone).is_none());
    assert!(easer.drawn(me).is_none());
}
