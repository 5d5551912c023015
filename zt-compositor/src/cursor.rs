// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The hardware mouse cursor. The cursor image is pre-rotated on the CPU into
//! a linear GBM buffer, uploaded once per icon change, and pushed as a
//! cursor-plane layer into each commit. If the driver ever rejects cursor
//! programming, the cursor latches broken and stays off for the session.

use std::sync::Arc;

use cursor_icon::CursorIcon;
use drm_fourcc::DrmFourcc;
use glam::{IVec2, UVec2};
use tracing::{debug, warn};

use crate::buffers::DisplayBuffer;
use crate::geometry::PlaneTransform;
use crate::kms::request::{FbLayer, KmsReqBuilder};
use crate::kms::KmsDevice;
use crate::{Error, Result};

/// A cursor image: ARGB8888 pixels, row-major, with a hotspot. Any other
/// format is rejected at registration.
#[derive(Clone)]
pub struct PointerIcon {
    pub kind: CursorIcon,
    /// The pixel ratio this icon is drawn for; selection picks the nearest.
    pub pixel_ratio: f32,
    pub size: UVec2,
    pub hotspot: UVec2,
    pub pixels: Arc<[u32]>,
}

/// The icon inventory, keyed by (kind, pixel-ratio bucket).
pub struct PointerIcons {
    icons: Vec<PointerIcon>,
}

impl PointerIcons {
    /// An inventory holding just the built-in arrow.
    pub fn builtin() -> Self {
        Self {
            icons: vec![builtin_arrow()],
        }
    }

    pub fn register(&mut self, icon: PointerIcon) -> Result<()> {
        if icon.pixels.len() != (icon.size.x * icon.size.y) as usize {
            return Err(Error::Other(anyhow::anyhow!(
                "icon pixel data doesn't match its size"
            )));
        }

        self.icons.push(icon);
        Ok(())
    }

    /// The icon for a kind at a pixel ratio, falling back to the default
    /// arrow for unknown kinds.
    pub fn icon_for(&self, kind: CursorIcon, pixel_ratio: f32) -> Option<&PointerIcon> {
        let best = |kind: CursorIcon| {
            self.icons
                .iter()
                .filter(|icon| icon.kind == kind)
                .min_by(|a, b| {
                    let da = (a.pixel_ratio - pixel_ratio).abs();
                    let db = (b.pixel_ratio - pixel_ratio).abs();
                    da.total_cmp(&db)
                })
        };

        best(kind).or_else(|| best(CursorIcon::Default))
    }
}

/// The rotated hotspot: where the pointer tip lands inside the pre-rotated
/// buffer, given the unrotated size and hotspot.
pub fn rotated_hotspot(size: UVec2, hotspot: UVec2, rotation: PlaneTransform) -> UVec2 {
    let (w, h) = (size.x, size.y);
    let (hx, hy) = (hotspot.x, hotspot.y);

    match rotation.degrees() {
        90 => UVec2::new(h - hy - 1, hx),
        180 => UVec2::new(w - hx - 1, h - hy - 1),
        270 => UVec2::new(hy, w - hx - 1),
        _ => hotspot,
    }
}

/// Rotates an ARGB8888 image clockwise by the given rotation, returning the
/// rotated pixels and size.
pub fn rotate_argb(pixels: &[u32], size: UVec2, rotation: PlaneTransform) -> (Vec<u32>, UVec2) {
    let (w, h) = (size.x as usize, size.y as usize);
    assert_eq!(pixels.len(), w * h);

    let rotated_size = if rotation.swaps_axes() {
        UVec2::new(size.y, size.x)
    } else {
        size
    };

    if rotation.degrees() == 0 {
        return (pixels.to_vec(), rotated_size);
    }

    let rw = rotated_size.x as usize;
    let mut out = vec![0u32; pixels.len()];
    for y in 0..h {
        for x in 0..w {
            let (dst_x, dst_y) = match rotation.degrees() {
                90 => (h - 1 - y, x),
                180 => (w - 1 - x, h - 1 - y),
                _ => (y, w - 1 - x),
            };

            out[dst_y * rw + dst_x] = pixels[y * w + x];
        }
    }

    (out, rotated_size)
}

/// An uploaded cursor image, ready to push as a plane layer.
pub struct CursorBuffer {
    buffer: DisplayBuffer,
    pub kind: CursorIcon,
    pub pixel_ratio: f32,
    pub rotation: PlaneTransform,
    pub size: UVec2,
    pub hotspot: IVec2,
}

impl CursorBuffer {
    /// Renders the icon, pre-rotated, into a fresh linear cursor BO.
    pub fn new(
        device: &Arc<KmsDevice>,
        icon: &PointerIcon,
        rotation: PlaneTransform,
    ) -> Result<Self> {
        let (pixels, size) = rotate_argb(&icon.pixels, icon.size, rotation);

        let mut buffer = DisplayBuffer::allocate_gbm(
            device,
            size,
            DrmFourcc::Argb8888,
            gbm::BufferObjectFlags::LINEAR
                | gbm::BufferObjectFlags::SCANOUT
                | gbm::BufferObjectFlags::WRITE
                | gbm::BufferObjectFlags::CURSOR,
        )?;

        // Respect the BO's row stride when writing.
        let stride = buffer.stride().unwrap_or(size.x * 4) as usize;
        let mut data = vec![0u8; stride * size.y as usize];
        for y in 0..size.y as usize {
            let row = &pixels[y * size.x as usize..(y + 1) * size.x as usize];
            let dst = &mut data[y * stride..y * stride + size.x as usize * 4];
            for (x, px) in row.iter().enumerate() {
                dst[x * 4..(x + 1) * 4].copy_from_slice(&px.to_le_bytes());
            }
        }

        buffer.write(&data)?;

        let hotspot = rotated_hotspot(icon.size, icon.hotspot, rotation);
        debug!(kind = ?icon.kind, ?size, ?hotspot, ?rotation, "uploaded cursor buffer");

        Ok(Self {
            buffer,
            kind: icon.kind,
            pixel_ratio: icon.pixel_ratio,
            rotation,
            size,
            hotspot: IVec2::new(hotspot.x as i32, hotspot.y as i32),
        })
    }
}

enum State {
    Disabled,
    Enabled { buffer: Arc<CursorBuffer> },
    /// The driver rejected cursor programming; latched for the session.
    Broken,
}

/// What the window should do after a cursor state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorEffect {
    None,
    /// The composition must be re-presented to apply the change.
    Represent,
    /// The position was applied directly via MoveCursor.
    Moved,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CursorChange {
    pub enabled: Option<bool>,
    pub kind: Option<CursorIcon>,
    pub pos: Option<IVec2>,
}

/// Per-window cursor state. Callers hold the window lock.
pub struct Cursor {
    icons: Arc<PointerIcons>,
    state: State,
    kind: CursorIcon,
    pub pos: IVec2,
}

impl Cursor {
    pub fn new(icons: Arc<PointerIcons>) -> Self {
        Self {
            icons,
            state: State::Disabled,
            kind: CursorIcon::Default,
            pos: IVec2::ZERO,
        }
    }

    pub fn enabled(&self) -> bool {
        matches!(self.state, State::Enabled { .. })
    }

    /// Applies a state change, uploading a new image if the kind, ratio or
    /// rotation changed. Returns what the caller has to do to make the
    /// change visible.
    pub fn set(
        &mut self,
        device: &Arc<KmsDevice>,
        crtc_index: usize,
        rotation: PlaneTransform,
        pixel_ratio: f32,
        change: CursorChange,
    ) -> Result<CursorEffect> {
        let enabled = change.enabled.unwrap_or(self.enabled());
        if let Some(kind) = change.kind {
            self.kind = kind;
        }

        if !enabled {
            let was_enabled = self.enabled();
            if !matches!(self.state, State::Broken) {
                self.state = State::Disabled;
            }

            if let Some(pos) = change.pos {
                self.pos = pos;
            }

            return Ok(if was_enabled {
                CursorEffect::Represent
            } else {
                CursorEffect::None
            });
        }

        if matches!(self.state, State::Broken) {
            return Err(Error::CursorUnavailable);
        }

        let icons = self.icons.clone();
        let icon = icons
            .icon_for(self.kind, pixel_ratio)
            .ok_or(Error::CursorUnavailable)?;

        let needs_upload = match &self.state {
            State::Enabled { buffer } => {
                buffer.kind != icon.kind
                    || buffer.pixel_ratio != icon.pixel_ratio
                    || buffer.rotation != rotation
            }
            _ => true,
        };

        if let Some(pos) = change.pos {
            self.pos = pos;
        }

        if needs_upload {
            let buffer = Arc::new(CursorBuffer::new(device, icon, rotation)?);
            self.state = State::Enabled { buffer };
            return Ok(CursorEffect::Represent);
        }

        if let Some(pos) = change.pos {
            let State::Enabled { buffer } = &self.state else {
                unreachable!()
            };

            device.move_cursor(crtc_index, (pos.x - buffer.hotspot.x, pos.y - buffer.hotspot.y))?;
            return Ok(CursorEffect::Moved);
        }

        Ok(CursorEffect::None)
    }

    /// Pushes the cursor layer, preferring the CURSOR plane. On failure the
    /// cursor latches broken and the composition continues without it.
    pub fn push_layer(&mut self, req: &mut KmsReqBuilder) {
        let State::Enabled { buffer } = &self.state else {
            return;
        };

        let keepalive = buffer.clone();
        let layer = FbLayer {
            fb: buffer.buffer.fb(),
            format: DrmFourcc::Argb8888,
            modifier: buffer.buffer.modifier(),
            src: (0, 0, buffer.size.x, buffer.size.y),
            dst: (
                self.pos.x - buffer.hotspot.x,
                self.pos.y - buffer.hotspot.y,
                buffer.size.x,
                buffer.size.y,
            ),
            rotation: None,
            in_fence_fd: None,
            prefer_cursor: true,
        };

        if let Err(err) = req.push_fb_layer(&layer, Box::new(move || drop(keepalive))) {
            warn!(?err, "cursor plane rejected, disabling the hardware cursor");
            self.state = State::Broken;
        }
    }

    /// Latches the cursor broken after a commit-level rejection.
    pub fn mark_broken(&mut self) {
        self.state = State::Broken;
    }
}

fn builtin_arrow() -> PointerIcon {
    // A plain 24x24 left-pointing arrow, white with a dark outline, drawn
    // from per-row spans.
    const OUTLINE: u32 = 0xFF11_1111;
    const FILL: u32 = 0xFFF5_F5F5;

    let size = UVec2::new(24, 24);
    let mut pixels = vec![0u32; (size.x * size.y) as usize];

    // (fill start, fill end) per row; the arrow widens one pixel per row,
    // then tapers into the tail.
    for y in 0..18usize {
        let extent = (y + 1).min(12);
        for x in 0..extent {
            let edge = x == 0 || x == extent - 1 || y == 17;
            pixels[y * 24 + x] = if edge { OUTLINE } else { FILL };
        }
    }

    for y in 18..23usize {
        let start = y - 14;
        for x in start..(start + 4) {
            let edge = x == start || x == start + 3 || y == 22;
            pixels[y * 24 + x] = if edge { OUTLINE } else { FILL };
        }
    }

    PointerIcon {
        kind: CursorIcon::Default,
        pixel_ratio: 1.0,
        size,
        hotspot: UVec2::new(0, 0),
        pixels: pixels.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_hotspot_formula() {
        let size = UVec2::new(32, 32);
        let hotspot = UVec2::new(5, 7);

        assert_eq!(
            rotated_hotspot(size, hotspot, PlaneTransform::ROTATE_0),
            UVec2::new(5, 7)
        );
        assert_eq!(
            rotated_hotspot(size, hotspot, PlaneTransform::ROTATE_90),
            UVec2::new(32 - 7 - 1, 5)
        );
        assert_eq!(
            rotated_hotspot(size, hotspot, PlaneTransform::ROTATE_180),
            UVec2::new(32 - 5 - 1, 32 - 7 - 1)
        );
        assert_eq!(
            rotated_hotspot(size, hotspot, PlaneTransform::ROTATE_270),
            UVec2::new(7, 32 - 5 - 1)
        );
    }

    #[test]
    fn test_rotation_matches_software_reference() {
        // A 32x32 test pattern where every pixel encodes its coordinates.
        let size = UVec2::new(32, 32);
        let src: Vec<u32> = (0..32u32 * 32)
            .map(|i| {
                let (x, y) = (i % 32, i / 32);
                0xFF00_0000 | (x << 8) | y
            })
            .collect();

        let at = |pixels: &[u32], w: u32, x: u32, y: u32| pixels[(y * w + x) as usize];

        // 90 degrees clockwise: (x, y) lands at (H-1-y, x).
        let (rotated, rsize) = rotate_argb(&src, size, PlaneTransform::ROTATE_90);
        assert_eq!(rsize, size);
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(
                    at(&rotated, 32, 31 - y, x),
                    at(&src, 32, x, y),
                    "mismatch at {x},{y}"
                );
            }
        }

        // 180 degrees: (x, y) lands at (W-1-x, H-1-y).
        let (rotated, _) = rotate_argb(&src, size, PlaneTransform::ROTATE_180);
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(at(&rotated, 32, 31 - x, 31 - y), at(&src, 32, x, y));
            }
        }

        // 270 degrees: (x, y) lands at (y, W-1-x).
        let (rotated, _) = rotate_argb(&src, size, PlaneTransform::ROTATE_270);
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(at(&rotated, 32, y, 31 - x), at(&src, 32, x, y));
            }
        }
    }

    #[test]
    fn test_rotation_of_non_square_image() {
        let size = UVec2::new(4, 2);
        let src: Vec<u32> = (0..8).collect();

        let (rotated, rsize) = rotate_argb(&src, size, PlaneTransform::ROTATE_90);
        assert_eq!(rsize, UVec2::new(2, 4));
        // The bottom-left source pixel becomes the top-left.
        assert_eq!(rotated[0], src[4]);
        // The top-left source pixel becomes the top-right.
        assert_eq!(rotated[1], src[0]);
    }

    #[test]
    fn test_icon_selection() {
        let mut icons = PointerIcons::builtin();
        icons
            .register(PointerIcon {
                kind: CursorIcon::Default,
                pixel_ratio: 2.0,
                size: UVec2::new(2, 2),
                hotspot: UVec2::ZERO,
                pixels: vec![0; 4].into(),
            })
            .unwrap();

        assert_eq!(
            icons.icon_for(CursorIcon::Default, 1.9).unwrap().pixel_ratio,
            2.0
        );
        assert_eq!(
            icons.icon_for(CursorIcon::Default, 1.0).unwrap().pixel_ratio,
            1.0
        );

        // Unknown kinds fall back to the default arrow.
        assert!(icons.icon_for(CursorIcon::Grab, 1.0).is_some());

        // Mismatched pixel data is rejected.
        assert!(icons
            .register(PointerIcon {
                kind: CursorIcon::Default,
                pixel_ratio: 1.0,
                size: UVec2::new(4, 4),
                hotspot: UVec2::ZERO,
                pixels: vec![0; 3].into(),
            })
            .is_err());
    }
}
