//! Drawing model for the floor map.
//!
//! Pure data: `viewport` projects floor percentages onto the surface,
//! `scene` decides what is painted and in which order, and `tween` smooths
//! remote avatars between syncs. The UI layer owns the actual painting.

pub mod scene;
pub mod tween;
pub mod viewport;

pub use scene::{AvatarSprite, PinSprite, PinStyle, Scene, build_scene, pin_at};
pub use tween::AvatarEaser;
pub use viewport::{ScreenPoint, Viewport};
