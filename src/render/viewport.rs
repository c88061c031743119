#[cfg(test)]
#[path = "viewport_test.rs"]
mod viewport_test;

use crate::model::Point;

/// A point on the drawing surface, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

impl ScreenPoint {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Projection between floor percentages and the drawing surface.
///
/// `width_px` / `height_px` are the floor image size at zoom 1.0.
/// `pan_x` / `pan_y` are in CSS pixels.
/// `zoom` is a scale factor (1.0 = no zoom).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width_px: f64,
    pub height_px: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub zoom: f64,
}

impl Viewport {
    #[must_use]
    pub fn new(width_px: f64, height_px: f64) -> Self {
        Self { width_px, height_px, pan_x: 0.0, pan_y: 0.0, zoom: 1.0 }
    }

    /// Convert a floor percentage point to screen coordinates.
    #[must_use]
    pub fn percent_to_screen(&self, p: Point) -> ScreenPoint {
        ScreenPoint {
            x: p.x / 100.0 * self.width_px * self.zoom + self.pan_x,
            y: p.y / 100.0 * self.height_px * self.zoom + self.pan_y,
        }
    }

    /// Convert a screen point to floor percentages. `None` when the point
    /// falls outside the floor or the viewport has no area.
    #[must_use]
    pub fn screen_to_percent(&self, s: ScreenPoint) -> Option<Point> {
        let scaled_w = self.width_px * self.zoom;
        let scaled_h = self.height_px * self.zoom;
        if scaled_w <= 0.0 || scaled_h <= 0.0 {
            return None;
        }
        let x = (s.x - self.pan_x) / scaled_w * 100.0;
        let y = (s.y - self.pan_y) / scaled_h * 100.0;
        ((0.0..=100.0).contains(&x) && (0.0..=100.0).contains(&y)).then(|| Point::new(x, y))
    }

    /// Horizontal percentage span covered by `px` screen pixels.
    #[must_use]
    pub fn screen_dist_to_percent(&self, px: f64) -> f64 {
        let scaled_w = self.width_px * self.zoom;
        if scaled_w <= 0.0 { 0.0 } else { px / scaled_w * 100.0 }
    }

    /// Zoom by `factor` keeping `anchor` fixed on screen. Zoom stays within
    /// `[0.25, 8.0]`.
    pub fn zoom_at(&mut self, anchor: ScreenPoint, factor: f64) {
        let next = (self.zoom * factor).clamp(0.25, 8.0);
        let ratio = next / self.zoom;
        self.pan_x = anchor.x - (anchor.x - self.pan_x) * ratio;
        self.pan_y = anchor.y - (anchor.y - self.pan_y) * ratio;
        self.zoom = next;
    }
}
