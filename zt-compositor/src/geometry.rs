// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The view geometry the engine sees: logical size, transforms between view
//! and display space, and the device pixel ratio derived from the panel's
//! physical dimensions.

use glam::{Mat3, UVec2, Vec2};

bitflags::bitflags! {
    /// Plane transform bits, matching the KMS "rotation" property layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlaneTransform: u8 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

impl PlaneTransform {
    pub fn is_only_rotation(&self) -> bool {
        matches!(
            *self,
            Self::ROTATE_0 | Self::ROTATE_90 | Self::ROTATE_180 | Self::ROTATE_270
        )
    }

    /// The rotation angle in degrees, for pure rotations.
    pub fn degrees(&self) -> u32 {
        match *self {
            Self::ROTATE_90 => 90,
            Self::ROTATE_180 => 180,
            Self::ROTATE_270 => 270,
            _ => 0,
        }
    }

    pub fn from_degrees(degrees: u32) -> Self {
        match degrees % 360 {
            90 => Self::ROTATE_90,
            180 => Self::ROTATE_180,
            270 => Self::ROTATE_270,
            _ => Self::ROTATE_0,
        }
    }

    /// Whether this rotation swaps width and height.
    pub fn swaps_axes(&self) -> bool {
        matches!(*self, Self::ROTATE_90 | Self::ROTATE_270)
    }
}

impl Default for PlaneTransform {
    fn default() -> Self {
        Self::ROTATE_0
    }
}

/// A requested device orientation, resolved against the display's natural
/// orientation to produce a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    PortraitUp,
    LandscapeLeft,
    PortraitDown,
    LandscapeRight,
}

impl Orientation {
    fn quarter_turns(&self) -> u32 {
        match self {
            Orientation::PortraitUp => 0,
            Orientation::LandscapeLeft => 1,
            Orientation::PortraitDown => 2,
            Orientation::LandscapeRight => 3,
        }
    }

    /// The rotation to apply so a display naturally oriented like
    /// `display_size` ends up in this orientation.
    pub fn as_rotation(&self, display_size: UVec2) -> PlaneTransform {
        let natural = if display_size.x >= display_size.y {
            Orientation::LandscapeLeft
        } else {
            Orientation::PortraitUp
        };

        let turns = (self.quarter_turns() + 4 - natural.quarter_turns()) % 4;
        PlaneTransform::from_degrees(turns * 90)
    }
}

/// Size, transform and pixel ratio as reported to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewGeometry {
    /// The logical size the engine renders at; equals the display size with
    /// the axes swapped for 90/270 degree rotations.
    pub view_size: Vec2,
    pub display_size: UVec2,
    pub rotation: PlaneTransform,
    pub display_to_view: Mat3,
    pub view_to_display: Mat3,
    pub device_pixel_ratio: f32,
}

impl ViewGeometry {
    pub fn new(
        display_size: UVec2,
        dimensions_mm: Option<(u32, u32)>,
        rotation: PlaneTransform,
    ) -> Self {
        let view_size = if rotation.swaps_axes() {
            Vec2::new(display_size.y as f32, display_size.x as f32)
        } else {
            Vec2::new(display_size.x as f32, display_size.y as f32)
        };

        let w = display_size.x as f32;
        let h = display_size.y as f32;
        let view_to_display = match rotation.degrees() {
            90 => Mat3::from_cols_array(&[0.0, 1.0, 0.0, -1.0, 0.0, 0.0, w, 0.0, 1.0]),
            180 => Mat3::from_cols_array(&[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, w, h, 1.0]),
            270 => Mat3::from_cols_array(&[0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, h, 1.0]),
            _ => Mat3::IDENTITY,
        };

        Self {
            view_size,
            display_size,
            rotation,
            display_to_view: view_to_display.inverse(),
            view_to_display,
            device_pixel_ratio: pixel_ratio(display_size, dimensions_mm),
        }
    }
}

/// The ratio reported to the engine as `pixel_ratio`: horizontal DPI over the
/// 38 px/cm baseline, or 1.0 when the panel's dimensions are unknown.
pub fn pixel_ratio(display_size: UVec2, dimensions_mm: Option<(u32, u32)>) -> f32 {
    match dimensions_mm {
        Some((width_mm, _)) if width_mm != 0 => {
            (10.0 * display_size.x as f32) / (width_mm as f32 * 38.0)
        }
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_point(m: Mat3, p: Vec2) -> Vec2 {
        let out = m * glam::Vec3::new(p.x, p.y, 1.0);
        Vec2::new(out.x, out.y)
    }

    #[test]
    fn test_identity_geometry() {
        let geo = ViewGeometry::new(UVec2::new(1920, 1080), None, PlaneTransform::ROTATE_0);
        assert_eq!(geo.view_size, Vec2::new(1920.0, 1080.0));
        assert_eq!(geo.device_pixel_ratio, 1.0);
        assert_eq!(
            transform_point(geo.view_to_display, Vec2::new(12.0, 34.0)),
            Vec2::new(12.0, 34.0)
        );
    }

    #[test]
    fn test_rotated_geometry() {
        let size = UVec2::new(1920, 1080);

        let geo = ViewGeometry::new(size, None, PlaneTransform::ROTATE_90);
        assert_eq!(geo.view_size, Vec2::new(1080.0, 1920.0));
        // The view origin lands at the display's top-right corner.
        assert_eq!(
            transform_point(geo.view_to_display, Vec2::ZERO),
            Vec2::new(1920.0, 0.0)
        );
        assert_eq!(
            transform_point(geo.view_to_display, Vec2::new(0.0, 1920.0)),
            Vec2::new(0.0, 0.0)
        );

        let geo = ViewGeometry::new(size, None, PlaneTransform::ROTATE_180);
        assert_eq!(
            transform_point(geo.view_to_display, Vec2::new(1.0, 1.0)),
            Vec2::new(1919.0, 1079.0)
        );

        let geo = ViewGeometry::new(size, None, PlaneTransform::ROTATE_270);
        assert_eq!(
            transform_point(geo.view_to_display, Vec2::ZERO),
            Vec2::new(0.0, 1080.0)
        );
    }

    #[test]
    fn test_round_trip_transform() {
        let geo = ViewGeometry::new(UVec2::new(800, 480), None, PlaneTransform::ROTATE_270);
        let p = Vec2::new(123.0, 45.0);
        let q = transform_point(geo.display_to_view, transform_point(geo.view_to_display, p));
        assert!((p - q).length() < 1e-4);
    }

    #[test]
    fn test_pixel_ratio() {
        // The 7" DSI panel heuristic: 800px wide, 155mm.
        let ratio = pixel_ratio(UVec2::new(800, 480), Some((155, 86)));
        assert!((ratio - 1.358).abs() < 0.01);

        assert_eq!(pixel_ratio(UVec2::new(1920, 1080), None), 1.0);
        assert_eq!(pixel_ratio(UVec2::new(1920, 1080), Some((0, 0))), 1.0);
    }

    #[test]
    fn test_orientation_to_rotation() {
        let landscape = UVec2::new(1920, 1080);
        assert_eq!(
            Orientation::LandscapeLeft.as_rotation(landscape),
            PlaneTransform::ROTATE_0
        );
        assert_eq!(
            Orientation::PortraitDown.as_rotation(landscape),
            PlaneTransform::ROTATE_90
        );

        let portrait = UVec2::new(480, 800);
        assert_eq!(
            Orientation::PortraitUp.as_rotation(portrait),
            PlaneTransform::ROTATE_0
        );
        assert_eq!(
            Orientation::LandscapeLeft.as_rotation(portrait),
            PlaneTransform::ROTATE_90
        );
    }
}
