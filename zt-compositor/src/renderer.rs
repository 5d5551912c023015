// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The narrow seam to the rendering backend. GL/EGL and Vulkan bring-up live
//! outside the core; we only need the engine's single global drawing surface
//! and the ability to wrap overlay render targets as framebuffer objects.

use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::UVec2;

use crate::buffers::DisplayBuffer;
use crate::kms::request::ReleaseCallback;

/// A scanout-ready front buffer, produced by swapping the window surface. The
/// release callback hands the buffer back to the surface's swapchain and is
/// invoked exactly once, after scanout or on commit failure.
pub struct FrontBuffer {
    pub fb: drm::control::framebuffer::Handle,
    pub format: DrmFourcc,
    pub modifier: Option<DrmModifier>,
    pub size: UVec2,
    pub release: Option<ReleaseCallback>,
}

/// The engine's global drawing surface, backed by the shared GBM surface.
/// Rendering goes to GL framebuffer 0; presentation locks the front buffer
/// after a swap.
pub trait WindowSurface: Send + Sync {
    fn size(&self) -> UVec2;
    fn format(&self) -> DrmFourcc;

    /// Waits for rendering to finish, swaps, and locks the new front buffer
    /// for scanout.
    fn swap_and_lock_front(&self) -> anyhow::Result<FrontBuffer>;
}

/// A dedicated scanout target for an overlay layer: a renderable FBO over a
/// scanout-capable buffer.
pub struct OffscreenSurface {
    pub buffer: Arc<DisplayBuffer>,
    /// The GL framebuffer name the engine renders into.
    pub fbo_name: u32,
    /// Tears down the renderer-side FBO; runs on drop, before the buffer.
    pub destroy: Option<ReleaseCallback>,
}

impl Drop for OffscreenSurface {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy();
        }
    }
}

/// What the compositor core needs from a rendering backend.
pub trait Renderer: Send + Sync {
    /// The one window surface. Called once, lazily, on the first backing
    /// store allocation; the engine only ever draws through one global
    /// surface.
    fn window_surface(&self) -> anyhow::Result<Arc<dyn WindowSurface>>;

    /// Creates an offscreen render target sized for an overlay layer.
    fn create_offscreen(&self, size: UVec2) -> anyhow::Result<OffscreenSurface>;
}
