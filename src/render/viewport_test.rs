#![allow(clippy::float_cmp)]

use super::*;

const EPSILON: f64 = 1e-9;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

#[test]
fn percent_maps_onto_image_size() {
    let vp = Viewport::new(1200.0, 800.0);
    let s = vp.percent_to_screen(Point::new(50.0, 25.0));
    assert!(approx(s.x, 600.0));
    assert!(approx(s.y, 200.0));
}

#[test]
fn pan_and_zoom_apply_after_scaling() {
    let vp = Viewport { width_px: 1000.0, height_px: 500.0, pan_x: 10.0, pan_y: -20.0, zoom: 2.0 };
    let s = vp.percent_to_screen(Point::new(10.0, 10.0));
    assert!(approx(s.x, 210.0));
    assert!(approx(s.y, 80.0));
}

#[test]
fn screen_to_percent_inverts_projection() {
    let vp = Viewport { width_px: 1000.0, height_px: 500.0, pan_x: 33.0, pan_y: 7.0, zoom: 1.5 };
    let original = Point::new(40.0, 60.0);
    let back = vp.screen_to_percent(vp.percent_to_screen(original)).unwrap();
    assert!(approx(back.x, original.x));
    assert!(approx(back.y, original.y));
}

#[test]
fn screen_outside_floor_is_none() {
    let vp = Viewport::new(1000.0, 500.0);
    assert!(vp.screen_to_percent(ScreenPoint::new(-1.0, 10.0)).is_none());
    assert!(vp.screen_to_percent(ScreenPoint::new(10.0, 501.0)).is_none());
    assert!(Viewport::new(0.0, 0.0).screen_to_percent(ScreenPoint::new(0.0, 0.0)).is_none());
}

#[test]
fn screen_distance_scales_with_zoom() {
    let mut vp = Viewport::new(1000.0, 500.0);
    assert!(approx(vp.screen_dist_to_percent(10.0), 1.0));
    vp.zoom = 2.0;
    assert!(approx(vp.screen_dist_to_percent(10.0), 0.5));
}

#[test]
fn zoom_at_keeps_anchor_fixed() {
    let mut vp = Viewport::new(1000.0, 500.0);
    let anchor = ScreenPoint::new(300.0, 200.0);
    let under = vp.screen_to_percent(anchor).unwrap();
    vp.zoom_at(anchor, 2.0);
    let after = vp.percent_to_screen(under);
    assert!(approx(after.x, anchor.x));
    assert!(approx(after.y, anchor.y));
    assert_eq!(vp.zoom, 2.0);

    vp.zoom_at(anchor, 100.0);
    assert_eq!(vp.zoom, 8.0);
}
