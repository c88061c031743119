use uuid::Uuid;

use crate::model::{MergedPresence, Point, Workstation, WorkstationStatus};

/// Pin fill, by what the viewer can do with the workstation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStyle {
    Available,
    Mine,
    Occupied,
    Offline,
    OutOfService,
}

impl PinStyle {
    #[must_use]
    pub fn for_workstation(ws: &Workstation, me: Option<Uuid>) -> Self {
        match ws.status {
            WorkstationStatus::Available => Self::Available,
            WorkstationStatus::InUse if me.is_some_and(|id| ws.is_occupied_by(id)) => Self::Mine,
            WorkstationStatus::InUse => Self::Occupied,
            WorkstationStatus::Offline => Self::Offline,
            WorkstationStatus::OutOfService => Self::OutOfService,
        }
    }

    /// CSS colour used by the map stylesheet.
    #[must_use]
    pub fn color(self) -> &'static str {
        match self {
            Self::Available => "#2e7d32",
            Self::Mine => "#1565c0",
            Self::Occupied => "#c62828",
            Self::Offline => "#757575",
            Self::OutOfService => "#424242",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PinSprite {
    pub workstation_id: Uuid,
    pub at: Point,
    pub style: PinStyle,
    pub label: String,
    pub occupant_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarSprite {
    pub user_id: Uuid,
    pub at: Point,
    pub label: String,
    pub avatar_url: Option<String>,
    pub status_message: Option<String>,
    pub walking: bool,
    pub stale: bool,
    pub mine: bool,
}

impl AvatarSprite {
    /// Draw order: stale under live, own avatar on top.
    fn layer(&self) -> u8 {
        match (self.mine, self.stale) {
            (true, _) => 2,
            (false, false) => 1,
            (false, true) => 0,
        }
    }
}

/// Everything drawn for one floor, in paint order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub pins: Vec<PinSprite>,
    pub avatars: Vec<AvatarSprite>,
}

/// Build the scene for `floor_id`. Avatars on other floors are skipped.
#[must_use]
pub fn build_scene(
    floor_id: Uuid,
    workstations: &[Workstation],
    presence: &[MergedPresence],
    me: Option<Uuid>,
) -> Scene {
    let pins = workstations
        .iter()
        .filter(|ws| ws.floor_id == floor_id)
        .map(|ws| PinSprite {
            workstation_id: ws.id,
            at: ws.pin(),
            style: PinStyle::for_workstation(ws, me),
            label: ws.label.clone(),
            occupant_name: ws.occupant_name.clone(),
        })
        .collect();

    let mut avatars: Vec<AvatarSprite> = presence
        .iter()
        .filter(|p| p.floor_id == Some(floor_id))
        .map(|p| AvatarSprite {
            user_id: p.user_id,
            at: p.position(),
            label: p.display_name.clone(),
            avatar_url: p.avatar_url.clone(),
            status_message: p.status_message.clone(),
            walking: p.is_walking,
            stale: p.is_stale,
            mine: Some(p.user_id) == me,
        })
        .collect();
    // Stable sort keeps the merge's user-id order inside each layer.
    avatars.sort_by_key(AvatarSprite::layer);

    Scene { pins, avatars }
}

/// Nearest pin within `radius` (floor percent units) of `at`.
#[must_use]
pub fn pin_at(scene: &Scene, at: Point, radius: f64) -> Option<&PinSprite> {
    scene
        .pins
        .iter()
        .map(|pin| (pin, pin.at.distance_to(at)))
        .filter(|(_, d)| *d <= radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(pin, _)| pin)
}

#[cfg(test)]
#[path = "scene_test.rs"]
mod tests;
