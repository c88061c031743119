//! Domain types shared by the presence and occupancy services.
//!
//! DESIGN
//! ======
//! Coordinates are percentages (0–100) of a floor's width and height, never
//! pixels, so a stored position stays valid on any viewport. Positions are
//! clamped on construction rather than validated after the fact.
//!
//! Tags that used to travel as string literals (`occupancy_mode`,
//! `presence_source`, workstation status) are enums; the database layer owns
//! the text encoding.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Placeholder name carried by realtime payloads whose profile has not
/// been resolved yet.
pub const UNRESOLVED_DISPLAY_NAME: &str = "User";

/// Status messages are cut to this many characters.
pub const STATUS_MESSAGE_MAX_CHARS: usize = 20;

// =============================================================================
// COORDINATES
// =============================================================================

/// A point in floor percentage space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Clamp both axes into `[0, 100]`.
    #[must_use]
    pub fn clamped(x: f64, y: f64) -> Self {
        Self { x: clamp_percent(x), y: clamp_percent(y) }
    }

    #[must_use]
    pub fn distance_to(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Clamp a coordinate into `[0, 100]`. Non-finite input lands mid-floor.
#[must_use]
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 100.0) } else { 50.0 }
}

/// Trim a status message, drop it when blank, and cut it to
/// [`STATUS_MESSAGE_MAX_CHARS`].
#[must_use]
pub fn normalize_status_message(message: Option<&str>) -> Option<String> {
    let trimmed = message?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cut: String = trimmed.chars().take(STATUS_MESSAGE_MAX_CHARS).collect();
    Some(cut.trim_end().to_owned())
}

// =============================================================================
// PLAYER (REALTIME)
// =============================================================================

/// Ephemeral presence entry tracked on the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub floor_id: Option<Uuid>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub is_walking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_y: Option<f64>,
    #[serde(default)]
    pub status_message: Option<String>,
}

impl Player {
    /// True unless the payload still carries the unresolved placeholder.
    #[must_use]
    pub fn has_resolved_name(&self) -> bool {
        let name = self.display_name.trim();
        !name.is_empty() && name != UNRESOLVED_DISPLAY_NAME
    }

    #[must_use]
    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    #[must_use]
    pub fn target(&self) -> Option<Point> {
        Some(Point::new(self.target_x?, self.target_y?))
    }
}

/// Partial update applied to the local player. `None` leaves a field alone;
/// the nested options on nullable fields distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerPatch {
    pub display_name: Option<String>,
    pub avatar_url: Option<Option<String>>,
    pub role: Option<Option<String>>,
    pub floor_id: Option<Option<Uuid>>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub is_walking: Option<bool>,
    pub target: Option<Option<Point>>,
    pub status_message: Option<Option<String>>,
}

impl PlayerPatch {
    /// Patch that moves the player to `point`, optionally switching floors.
    #[must_use]
    pub fn position(point: Point) -> Self {
        Self { x: Some(point.x), y: Some(point.y), ..Self::default() }
    }

    /// Apply to `player`, clamping coordinates and normalizing the status.
    pub fn apply(&self, player: &mut Player) {
        if let Some(name) = &self.display_name {
            player.display_name.clone_from(name);
        }
        if let Some(avatar) = &self.avatar_url {
            player.avatar_url.clone_from(avatar);
        }
        if let Some(role) = &self.role {
            player.role.clone_from(role);
        }
        if let Some(floor) = self.floor_id {
            player.floor_id = floor;
        }
        if let Some(x) = self.x {
            player.x = clamp_percent(x);
        }
        if let Some(y) = self.y {
            player.y = clamp_percent(y);
        }
        if let Some(walking) = self.is_walking {
            player.is_walking = walking;
        }
        if let Some(target) = self.target {
            player.target_x = target.map(|p| clamp_percent(p.x));
            player.target_y = target.map(|p| clamp_percent(p.y));
        }
        if let Some(status) = &self.status_message {
            player.status_message = normalize_status_message(status.as_deref());
        }
    }
}

// =============================================================================
// AREA PRESENCE (PERSISTED)
// =============================================================================

/// Durable "last seen here" record for one user.
///
/// `last_seen_at` is `None` when the backend value was missing or did not
/// parse; staleness checks treat that as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaPresenceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub floor_id: Uuid,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub status_message: Option<String>,
    pub is_present: bool,
    #[serde(default, with = "lenient_rfc3339")]
    pub last_seen_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cleared_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl AreaPresenceRow {
    /// Active rows are present and not cleared.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_present && self.cleared_at.is_none()
    }
}

/// Write payload for the caller's own area presence.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaPresenceUpdate {
    pub floor_id: Uuid,
    pub x: f64,
    pub y: f64,
    /// `None` keeps the stored message; `Some(None)` clears it.
    pub status_message: Option<Option<String>>,
}

impl AreaPresenceUpdate {
    #[must_use]
    pub fn at(floor_id: Uuid, point: Point) -> Self {
        Self { floor_id, x: point.x, y: point.y, status_message: None }
    }
}

mod lenient_rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        time::serde::rfc3339::option::serialize(value, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.and_then(|s| OffsetDateTime::parse(s.trim(), &Rfc3339).ok()))
    }
}

// =============================================================================
// MERGED PRESENCE
// =============================================================================

/// Which subsystem(s) contributed a merged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceSource {
    Realtime,
    Persistent,
    Merged,
}

impl PresenceSource {
    #[must_use]
    pub fn has_realtime(self) -> bool {
        matches!(self, Self::Realtime | Self::Merged)
    }
}

/// One reconciled presence entry, keyed by user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPresence {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: Option<String>,
    pub floor_id: Option<Uuid>,
    pub x: f64,
    pub y: f64,
    pub is_walking: bool,
    pub target_x: Option<f64>,
    pub target_y: Option<f64>,
    pub status_message: Option<String>,
    pub source: PresenceSource,
    pub is_stale: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
}

impl MergedPresence {
    #[must_use]
    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

// =============================================================================
// FLOORS
// =============================================================================

/// Static floor map definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub id: Uuid,
    pub name: String,
    pub image_url: String,
    pub width: f64,
    pub height: f64,
}

// =============================================================================
// WORKSTATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkstationStatus {
    Available,
    InUse,
    Offline,
    OutOfService,
}

impl WorkstationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::InUse => "IN_USE",
            Self::Offline => "OFFLINE",
            Self::OutOfService => "OUT_OF_SERVICE",
        }
    }

    /// Unknown text reads as `Offline`, the non-actionable state.
    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Self::Available,
            "IN_USE" => Self::InUse,
            "OUT_OF_SERVICE" => Self::OutOfService,
            _ => Self::Offline,
        }
    }

    /// Offline and out-of-service stations accept no claim/assign/release.
    #[must_use]
    pub fn is_actionable(self) -> bool {
        matches!(self, Self::Available | Self::InUse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccupancyMode {
    #[serde(rename = "self")]
    SelfClaim,
    #[serde(rename = "assigned_user")]
    AssignedUser,
    #[serde(rename = "assigned_external")]
    AssignedExternal,
}

impl OccupancyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfClaim => "self",
            Self::AssignedUser => "assigned_user",
            Self::AssignedExternal => "assigned_external",
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim() {
            "self" => Some(Self::SelfClaim),
            "assigned_user" => Some(Self::AssignedUser),
            "assigned_external" => Some(Self::AssignedExternal),
            _ => None,
        }
    }

    /// Assigned occupancy expires; self-claims do not.
    #[must_use]
    pub fn has_ttl(self) -> bool {
        !matches!(self, Self::SelfClaim)
    }
}

/// Current per-workstation read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workstation {
    pub id: Uuid,
    pub floor_id: Uuid,
    pub label: String,
    #[serde(default)]
    pub section: Option<String>,
    pub x: f64,
    pub y: f64,
    pub status: WorkstationStatus,
    #[serde(default)]
    pub occupant_id: Option<Uuid>,
    #[serde(default)]
    pub occupant_name: Option<String>,
    #[serde(default)]
    pub occupant_avatar_url: Option<String>,
    #[serde(default)]
    pub occupant_role: Option<String>,
    #[serde(default)]
    pub occupant_nickname: Option<String>,
    #[serde(default)]
    pub occupancy_mode: Option<OccupancyMode>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Workstation {
    #[must_use]
    pub fn pin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    #[must_use]
    pub fn is_occupied_by(&self, user_id: Uuid) -> bool {
        self.status == WorkstationStatus::InUse && self.occupant_id == Some(user_id)
    }
}

// =============================================================================
// OCCUPANCY SESSIONS
// =============================================================================

/// A time-bounded claim linking an occupant to a workstation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancySession {
    pub id: Uuid,
    pub workstation_id: Uuid,
    /// Actor who created the session.
    pub user_id: Uuid,
    pub occupant_user_id: Option<Uuid>,
    pub occupant_display_name: Option<String>,
    pub occupancy_mode: OccupancyMode,
    pub assigned_by_user_id: Option<Uuid>,
    pub status_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl OccupancySession {
    /// Not ended and not past its expiry.
    #[must_use]
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.ended_at.is_none() && self.expires_at.is_none_or(|expires| expires > now)
    }

    /// The user sitting at the workstation, if it is a colleague account.
    #[must_use]
    pub fn occupant(&self) -> Option<Uuid> {
        match self.occupancy_mode {
            OccupancyMode::SelfClaim => self.occupant_user_id.or(Some(self.user_id)),
            OccupancyMode::AssignedUser => self.occupant_user_id,
            OccupancyMode::AssignedExternal => None,
        }
    }
}

// =============================================================================
// PROFILES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Profile {
    /// Best available human-readable name.
    #[must_use]
    pub fn label(&self) -> String {
        [self.display_name.as_deref(), self.nickname.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map_or_else(|| UNRESOLVED_DISPLAY_NAME.to_owned(), str::to_owned)
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
