// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The engine-supplied layer list, ordered bottom to top. The lowest layer is
//! always a backing store mapped to the window surface; overlays and platform
//! views stack above it.

use std::sync::Arc;

use glam::{Mat3, Vec2};

use crate::render_targets::BackingStoreHandle;
use crate::{Error, Result};

/// A transformation applied to a platform view's layer, accumulated from the
/// engine's mutation stack.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewMutation {
    Opacity(f64),
    ClipRect { offset: Vec2, size: Vec2 },
    Transform(Mat3),
}

#[derive(Clone)]
pub enum LayerContent {
    BackingStore(Arc<BackingStoreHandle>),
    PlatformView {
        view_id: i64,
        mutations: Vec<ViewMutation>,
    },
}

#[derive(Clone)]
pub struct Layer {
    pub content: LayerContent,
    /// Top-left corner, in display pixels.
    pub offset: Vec2,
    pub size: Vec2,
}

impl Layer {
    /// The destination rectangle on the CRTC.
    pub fn pixel_rect(&self) -> (i32, i32, u32, u32) {
        (
            self.offset.x.round() as i32,
            self.offset.y.round() as i32,
            self.size.x.round() as u32,
            self.size.y.round() as u32,
        )
    }
}

#[derive(Clone, Default)]
pub struct Composition {
    pub layers: Vec<Layer>,
}

impl Composition {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// The lowest layer must be a backing store mapped to the window
    /// surface; the engine renders the scene background through the global
    /// drawing surface, never into an overlay.
    pub fn validate(&self) -> Result<()> {
        match self.layers.first() {
            Some(Layer {
                content: LayerContent::BackingStore(handle),
                ..
            }) if handle.is_window_surface() => Ok(()),
            _ => Err(Error::Other(anyhow::anyhow!(
                "the lowest layer must be the window surface backing store"
            ))),
        }
    }

    /// The ids of all platform views in this composition, bottom to top.
    pub fn view_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.layers.iter().filter_map(|layer| match &layer.content {
            LayerContent::PlatformView { view_id, .. } => Some(*view_id),
            _ => None,
        })
    }
}
