//! Smoothing for remote avatars between presence syncs.
//!
//! Sync snapshots arrive in bursts of ~90 ms, so remote avatars would hop.
//! Each frame moves the drawn position a fixed fraction toward the latest
//! target and snaps once within `EASE_EPSILON`.

use std::collections::HashMap;

use uuid::Uuid;

use super::scene::Scene;
use crate::model::Point;

pub const EASE_FACTOR: f64 = 0.2;
pub const EASE_EPSILON: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct AvatarEaser {
    factor: f64,
    epsilon: f64,
    drawn: HashMap<Uuid, Point>,
}

impl Default for AvatarEaser {
    fn default() -> Self {
        Self::new(EASE_FACTOR, EASE_EPSILON)
    }
}

impl AvatarEaser {
    #[must_use]
    pub fn new(factor: f64, epsilon: f64) -> Self {
        Self { factor: factor.clamp(0.0, 1.0), epsilon, drawn: HashMap::new() }
    }

    /// Advance one frame toward `target`. First sight snaps.
    pub fn step(&mut self, user_id: Uuid, target: Point) -> Point {
        let current = *self.drawn.entry(user_id).or_insert(target);
        let next = if current.distance_to(target) <= self.epsilon {
            target
        } else {
            Point::new(
                current.x + (target.x - current.x) * self.factor,
                current.y + (target.y - current.y) * self.factor,
            )
        };
        self.drawn.insert(user_id, next);
        next
    }

    #[must_use]
    pub fn drawn(&self, user_id: Uuid) -> Option<Point> {
        self.drawn.get(&user_id).copied()
    }

    /// Ease every remote avatar in `scene` in place and forget users that
    /// left it. The own avatar is drawn where the movement engine put it.
    /// Returns true while any avatar is still settling.
    pub fn apply(&mut self, scene: &mut Scene) -> bool {
        self.drawn.retain(|id, _| scene.avatars.iter().any(|a| a.user_id == *id && !a.mine));
        let mut settling = false;
        for avatar in scene.avatars.iter_mut().filter(|a| !a.mine) {
            let target = avatar.at;
            avatar.at = self.step(avatar.user_id, target);
            settling |= avatar.at != target;
        }
        settling
    }
}

#[cfg(test)]
#[path = "tween_test.rs"]
mod tests;
