//! Real-time presence and workstation occupancy for a hospital live map.
//!
//! Staff appear as avatars on floor plans through two sources: an ephemeral
//! presence channel for who is connected right now, and durable area-presence
//! rows for where each person was last seen. The two are merged into one view
//! with staleness flags. Workstations on each floor can be claimed, assigned
//! and released.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`model`] | Shared domain types (players, rows, workstations, sessions) |
//! | [`backend`] | Backend seams with in-memory and Postgres implementations |
//! | [`services`] | Presence transport, movement, area presence, merge, occupancy |
//! | [`live_map`] | Headless controller behind the floor map screen |
//! | [`render`] | Viewport projection, scene building, hit tests, avatar easing |
//! | [`storage`] | Local key-value storage for last location and status |
//! | [`config`] | Environment-driven tuning and relay settings |
//! | [`frame`] | Wire envelope shared by the relay and its clients |
//! | [`routes`] / [`state`] | Presence relay server (`livemap-relay` binary) |
//! | [`db`] | Postgres pool and migrations |

pub mod backend;
pub mod config;
pub mod db;
pub mod frame;
pub mod live_map;
pub mod model;
pub mod render;
pub mod routes;
pub mod services;
pub mod state;
pub mod storage;
