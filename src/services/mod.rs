//! Live map services.
//!
//! ARCHITECTURE
//! ============
//! Two sources of truth say where people are:
//!
//! - `transport`: ephemeral presence on a shared channel (`hub` in process,
//!   `ws_channel` over the relay), with `movement` animating the local avatar.
//! - `area_presence`: durable rows kept fresh by `heartbeat`.
//!
//! `merge` reconciles the two into one view with staleness flags.
//! `occupancy` owns workstation claim/assign/release, hydrating occupants
//! through `profile_cache`.

pub mod area_presence;
pub mod heartbeat;
pub mod hub;
pub mod merge;
pub mod movement;
pub mod occupancy;
pub mod profile_cache;
pub mod transport;
pub mod ws_channel;
