//! Runtime configuration loaded from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default and an optional `LIVEMAP_*`
//! override. Unparseable values fall back to the default instead of failing
//! start-up; timing constants are not worth a crash.

use std::time::Duration;

pub const DEFAULT_STALE_TTL_SECS: u64 = 90;
pub const DEFAULT_HEARTBEAT_BASE_SECS: u64 = 15;
/// Heartbeats never run faster than this, whatever the environment says.
pub const MIN_HEARTBEAT_BASE_SECS: u64 = 15;
pub const DEFAULT_WALK_TICK_MS: u64 = 50;
pub const DEFAULT_WALK_SPEED: f64 = 2.5;
pub const DEFAULT_LOCAL_EMIT_THROTTLE_MS: u64 = 100;
pub const DEFAULT_BROADCAST_THROTTLE_MS: u64 = 90;
pub const DEFAULT_INTERACTION_RADIUS: f64 = 3.5;
pub const DEFAULT_PIN_HIT_RADIUS: f64 = 2.5;
pub const DEFAULT_RELEASE_CONFIRM_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLICK_MODAL_DELAY_MS: u64 = 100;
pub const DEFAULT_REFRESH_DEBOUNCE_MS: u64 = 150;
pub const DEFAULT_PRUNE_DEBOUNCE_MS: u64 = 800;
pub const DEFAULT_PRUNE_BATCH: usize = 3;
pub const DEFAULT_ASSIGN_TTL_HOURS: u64 = 8;
pub const DEFAULT_PROFILE_CACHE_TTL_SECS: u64 = 60;
pub const DEFAULT_OWNERSHIP_CACHE_MS: u64 = 3_000;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PRESENCE_TOPIC: &str = "live-map";
pub const DEFAULT_RELAY_QUEUE: usize = 256;

/// Parse an environment variable, falling back to `default` when the key is
/// missing or the value does not parse.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Boolean flags accept `1/0`, `true/false`, `on/off`, `yes/no`.
pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        _ => default,
    }
}

// =============================================================================
// LIVE MAP CONFIG
// =============================================================================

/// Tuning knobs for the presence and occupancy core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveMapConfig {
    /// Persistent-only presence older than this is stale.
    pub stale_ttl_secs: u64,
    /// Foreground heartbeat interval. Background doubles it.
    pub heartbeat_base: Duration,
    /// When false, every area-presence call is a no-op.
    pub persistent_presence_enabled: bool,
    /// Movement simulation tick.
    pub walk_tick: Duration,
    /// Percent units advanced per tick.
    pub walk_speed: f64,
    /// Minimum spacing between local snapshot emissions while walking.
    pub local_emit_throttle: Duration,
    /// Minimum spacing between network broadcasts while walking.
    pub broadcast_throttle: Duration,
    /// Taps farther than this from the occupied pin ask before moving.
    pub interaction_radius: f64,
    /// Pointer distance that still counts as a hit on a workstation pin.
    pub pin_hit_radius: f64,
    /// Unanswered release-and-move prompts cancel after this long.
    pub release_confirm_timeout: Duration,
    /// Delay between walking toward a pin and opening its panel.
    pub click_modal_delay: Duration,
    /// Coalescing window for workstation reloads.
    pub refresh_debounce: Duration,
    /// Quiet period after the stale set changes before pruning.
    pub prune_debounce: Duration,
    /// Maximum rows force-removed per prune pass.
    pub prune_batch: usize,
    /// Lifetime of assigned (non-self) occupancy.
    pub assign_ttl: Duration,
    /// Occupant profile cache lifetime.
    pub profile_cache_ttl: Duration,
    /// Default max age of a cached "do I own this seat" answer.
    pub ownership_cache_max_age: Duration,
}

impl Default for LiveMapConfig {
    fn default() -> Self {
        Self {
            stale_ttl_secs: DEFAULT_STALE_TTL_SECS,
            heartbeat_base: Duration::from_secs(DEFAULT_HEARTBEAT_BASE_SECS),
            persistent_presence_enabled: true,
            walk_tick: Duration::from_millis(DEFAULT_WALK_TICK_MS),
            walk_speed: DEFAULT_WALK_SPEED,
            local_emit_throttle: Duration::from_millis(DEFAULT_LOCAL_EMIT_THROTTLE_MS),
            broadcast_throttle: Duration::from_millis(DEFAULT_BROADCAST_THROTTLE_MS),
            interaction_radius: DEFAULT_INTERACTION_RADIUS,
            pin_hit_radius: DEFAULT_PIN_HIT_RADIUS,
            release_confirm_timeout: Duration::from_millis(DEFAULT_RELEASE_CONFIRM_TIMEOUT_MS),
            click_modal_delay: Duration::from_millis(DEFAULT_CLICK_MODAL_DELAY_MS),
            refresh_debounce: Duration::from_millis(DEFAULT_REFRESH_DEBOUNCE_MS),
            prune_debounce: Duration::from_millis(DEFAULT_PRUNE_DEBOUNCE_MS),
            prune_batch: DEFAULT_PRUNE_BATCH,
            assign_ttl: Duration::from_secs(DEFAULT_ASSIGN_TTL_HOURS * 3600),
            profile_cache_ttl: Duration::from_secs(DEFAULT_PROFILE_CACHE_TTL_SECS),
            ownership_cache_max_age: Duration::from_millis(DEFAULT_OWNERSHIP_CACHE_MS),
        }
    }
}

impl LiveMapConfig {
    /// Build config from `LIVEMAP_*` environment variables.
    ///
    /// - `LIVEMAP_STALE_TTL_SECS` (90)
    /// - `LIVEMAP_HEARTBEAT_SECS` (15, never below 15)
    /// - `LIVEMAP_PERSISTENT_PRESENCE` (on)
    /// - `LIVEMAP_WALK_TICK_MS` (50), `LIVEMAP_WALK_SPEED` (2.5)
    /// - `LIVEMAP_LOCAL_EMIT_MS` (100), `LIVEMAP_BROADCAST_MS` (90)
    /// - `LIVEMAP_INTERACTION_RADIUS` (3.5), `LIVEMAP_PIN_HIT_RADIUS` (2.5)
    /// - `LIVEMAP_RELEASE_CONFIRM_MS` (5000), `LIVEMAP_CLICK_DELAY_MS` (100)
    /// - `LIVEMAP_REFRESH_DEBOUNCE_MS` (150), `LIVEMAP_PRUNE_DEBOUNCE_MS` (800)
    /// - `LIVEMAP_PRUNE_BATCH` (3), `LIVEMAP_ASSIGN_TTL_HOURS` (8)
    /// - `LIVEMAP_PROFILE_CACHE_SECS` (60), `LIVEMAP_OWNERSHIP_CACHE_MS` (3000)
    #[must_use]
    pub fn from_env() -> Self {
        let heartbeat_secs =
            env_parse("LIVEMAP_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_BASE_SECS).max(MIN_HEARTBEAT_BASE_SECS);
        let walk_speed = env_parse("LIVEMAP_WALK_SPEED", DEFAULT_WALK_SPEED);
        let interaction_radius = env_parse("LIVEMAP_INTERACTION_RADIUS", DEFAULT_INTERACTION_RADIUS);
        let pin_hit_radius = env_parse("LIVEMAP_PIN_HIT_RADIUS", DEFAULT_PIN_HIT_RADIUS);

        Self {
            stale_ttl_secs: env_parse("LIVEMAP_STALE_TTL_SECS", DEFAULT_STALE_TTL_SECS),
            heartbeat_base: Duration::from_secs(heartbeat_secs),
            persistent_presence_enabled: env_flag("LIVEMAP_PERSISTENT_PRESENCE", true),
            walk_tick: Duration::from_millis(env_parse("LIVEMAP_WALK_TICK_MS", DEFAULT_WALK_TICK_MS).max(1)),
            walk_speed: positive_or(walk_speed, DEFAULT_WALK_SPEED),
            local_emit_throttle: Duration::from_millis(env_parse(
                "LIVEMAP_LOCAL_EMIT_MS",
                DEFAULT_LOCAL_EMIT_THROTTLE_MS,
            )),
            broadcast_throttle: Duration::from_millis(env_parse("LIVEMAP_BROADCAST_MS", DEFAULT_BROADCAST_THROTTLE_MS)),
            interaction_radius: positive_or(interaction_radius, DEFAULT_INTERACTION_RADIUS),
            pin_hit_radius: positive_or(pin_hit_radius, DEFAULT_PIN_HIT_RADIUS),
            release_confirm_timeout: Duration::from_millis(env_parse(
                "LIVEMAP_RELEASE_CONFIRM_MS",
                DEFAULT_RELEASE_CONFIRM_TIMEOUT_MS,
            )),
            click_modal_delay: Duration::from_millis(env_parse("LIVEMAP_CLICK_DELAY_MS", DEFAULT_CLICK_MODAL_DELAY_MS)),
            refresh_debounce: Duration::from_millis(env_parse(
                "LIVEMAP_REFRESH_DEBOUNCE_MS",
                DEFAULT_REFRESH_DEBOUNCE_MS,
            )),
            prune_debounce: Duration::from_millis(env_parse("LIVEMAP_PRUNE_DEBOUNCE_MS", DEFAULT_PRUNE_DEBOUNCE_MS)),
            prune_batch: env_parse("LIVEMAP_PRUNE_BATCH", DEFAULT_PRUNE_BATCH),
            assign_ttl: Duration::from_secs(env_parse("LIVEMAP_ASSIGN_TTL_HOURS", DEFAULT_ASSIGN_TTL_HOURS) * 3600),
            profile_cache_ttl: Duration::from_secs(env_parse(
                "LIVEMAP_PROFILE_CACHE_SECS",
                DEFAULT_PROFILE_CACHE_TTL_SECS,
            )),
            ownership_cache_max_age: Duration::from_millis(env_parse(
                "LIVEMAP_OWNERSHIP_CACHE_MS",
                DEFAULT_OWNERSHIP_CACHE_MS,
            )),
        }
    }
}

fn positive_or(value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { default }
}

// =============================================================================
// RELAY CONFIG
// =============================================================================

/// Settings for the `livemap-relay` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    /// Optional Postgres URL; when set, migrations run at start-up.
    pub database_url: Option<String>,
    /// Default topic for clients that do not name one.
    pub default_topic: String,
    /// Per-connection outbound queue capacity.
    pub queue_capacity: usize,
}

impl RelayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            default_topic: std::env::var("LIVEMAP_PRESENCE_TOPIC")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PRESENCE_TOPIC.to_owned()),
            queue_capacity: env_parse("LIVEMAP_RELAY_QUEUE", DEFAULT_RELAY_QUEUE).max(1),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
