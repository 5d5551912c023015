// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The pool of engine-visible backing stores. Exactly one window-surface
//! target exists; every other allocation is an offscreen target, recycled
//! through a stale set. The engine's documented teardown order is collect,
//! then the destruction callback, and either may come last; a two-state
//! latch on the handle keeps the teardown single-shot.
//!
//! Creation, collection and destruction run on engine raster threads while
//! presentation runs on the compositor thread, so everything goes through the
//! cache's mutex.

use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::renderer::{OffscreenSurface, Renderer, WindowSurface};
use crate::{Error, Result};

/// A render target handed to the engine as a backing store.
#[derive(Clone)]
pub enum RenderTarget {
    /// The shared window surface; rendering goes to GL framebuffer 0.
    Window(Arc<dyn WindowSurface>),
    Offscreen(Arc<OffscreenSurface>),
}

impl RenderTarget {
    pub fn fbo_name(&self) -> u32 {
        match self {
            RenderTarget::Window(_) => 0,
            RenderTarget::Offscreen(surface) => surface.fbo_name,
        }
    }

    fn size(&self) -> UVec2 {
        match self {
            RenderTarget::Window(surface) => surface.size(),
            RenderTarget::Offscreen(surface) => surface.buffer.size(),
        }
    }
}

struct HandleState {
    target: Option<RenderTarget>,
    should_free_on_next_destroy: bool,
    torn_down: bool,
}

/// The opaque handle the engine holds for a backing store.
pub struct BackingStoreHandle {
    state: Mutex<HandleState>,
}

impl BackingStoreHandle {
    pub(crate) fn new(target: RenderTarget) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HandleState {
                target: Some(target),
                should_free_on_next_destroy: false,
                torn_down: false,
            }),
        })
    }

    /// The target backing this store, while it hasn't been collected.
    pub fn target(&self) -> Option<RenderTarget> {
        self.state.lock().target.clone()
    }

    pub fn is_window_surface(&self) -> bool {
        matches!(self.state.lock().target, Some(RenderTarget::Window(_)))
    }
}

struct CacheState {
    window_surface: Option<Arc<dyn WindowSurface>>,
    /// Whether the one window-surface backing store has been handed out.
    window_store_created: bool,
    stale: Vec<RenderTarget>,
}

pub struct RenderTargetCache {
    renderer: Arc<dyn Renderer>,
    state: Mutex<CacheState>,
}

impl RenderTargetCache {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            state: Mutex::new(CacheState {
                window_surface: None,
                window_store_created: false,
                stale: Vec::new(),
            }),
        }
    }

    /// The window surface, if it has been created yet.
    pub fn window_surface(&self) -> Option<Arc<dyn WindowSurface>> {
        self.state.lock().window_surface.clone()
    }

    /// The window surface, creating it on first use. The engine and input
    /// paths need it before the first backing store is allocated.
    pub fn ensure_window_surface(&self) -> Result<Arc<dyn WindowSurface>> {
        let mut state = self.state.lock();
        match &state.window_surface {
            Some(surface) => Ok(surface.clone()),
            None => {
                let surface = self.renderer.window_surface().map_err(Error::Other)?;
                state.window_surface = Some(surface.clone());
                debug!(size = ?surface.size(), "created window surface");
                Ok(surface)
            }
        }
    }

    /// Allocates a backing store. The first allocation is the window surface;
    /// everything after that is an offscreen target, preferably recycled from
    /// the stale set.
    pub fn create_backing_store(&self, size: UVec2) -> Result<Arc<BackingStoreHandle>> {
        let mut state = self.state.lock();

        if !state.window_store_created {
            let surface = match &state.window_surface {
                Some(surface) => surface.clone(),
                None => {
                    let surface = self.renderer.window_surface().map_err(Error::Other)?;
                    state.window_surface = Some(surface.clone());
                    surface
                }
            };

            state.window_store_created = true;
            debug!(size = ?surface.size(), "created window surface backing store");
            return Ok(BackingStoreHandle::new(RenderTarget::Window(surface)));
        }

        // A recycled window-surface target takes priority; there's only ever
        // one, and it's the target every window-sized composition wants.
        if let Some(index) = state
            .stale
            .iter()
            .position(|t| matches!(t, RenderTarget::Window(_)))
        {
            let target = state.stale.swap_remove(index);
            trace!("reusing the window surface target");
            return Ok(BackingStoreHandle::new(target));
        }

        if let Some(index) = state.stale.iter().position(|t| {
            matches!(t, RenderTarget::Offscreen(_)) && t.size() == size
        }) {
            let target = state.stale.swap_remove(index);
            trace!(?size, "reusing stale render target");
            return Ok(BackingStoreHandle::new(target));
        }

        let surface = self.renderer.create_offscreen(size).map_err(Error::Other)?;
        trace!(?size, fbo = surface.fbo_name, "created offscreen render target");
        Ok(BackingStoreHandle::new(RenderTarget::Offscreen(Arc::new(
            surface,
        ))))
    }

    /// The engine is done compositing with this store; its target moves to
    /// the stale set for reuse.
    pub fn collect_backing_store(&self, handle: &Arc<BackingStoreHandle>) {
        self.release(handle);
    }

    /// The engine's destruction callback for the store's framebuffer. Runs
    /// after (or, on some engine versions, instead of) collect.
    pub fn destroy_backing_store(&self, handle: &Arc<BackingStoreHandle>) {
        self.release(handle);
    }

    fn release(&self, handle: &Arc<BackingStoreHandle>) {
        let mut handle_state = handle.state.lock();

        if let Some(target) = handle_state.target.take() {
            self.state.lock().stale.push(target);
        }

        if handle_state.should_free_on_next_destroy {
            handle_state.torn_down = true;
        } else {
            handle_state.should_free_on_next_destroy = true;
        }
    }

    /// Destroys everything in the stale set, releasing the planes those
    /// targets may still hold through their release callbacks. Called before
    /// every commit.
    pub fn destroy_stale_targets(&self) {
        let stale = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.stale)
        };

        for target in stale {
            match target {
                RenderTarget::Offscreen(surface) => {
                    trace!(fbo = surface.fbo_name, "destroying stale render target");
                    drop(surface);
                }
                // Dropping the handle's clone; the cache keeps the window
                // surface itself alive.
                RenderTarget::Window(_) => (),
            }
        }
    }

    pub fn stale_count(&self) -> usize {
        self.state.lock().stale.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::buffers::DisplayBuffer;
    use crate::kms::resources::test_support::fb_handle;

    struct StubWindowSurface;

    impl WindowSurface for StubWindowSurface {
        fn size(&self) -> UVec2 {
            UVec2::new(1920, 1080)
        }

        fn format(&self) -> drm_fourcc::DrmFourcc {
            drm_fourcc::DrmFourcc::Argb8888
        }

        fn swap_and_lock_front(&self) -> anyhow::Result<crate::renderer::FrontBuffer> {
            Ok(crate::renderer::FrontBuffer {
                fb: fb_handle(1),
                format: drm_fourcc::DrmFourcc::Argb8888,
                modifier: None,
                size: self.size(),
                release: None,
            })
        }
    }

    /// A window-surface-backed handle, for exercising composition logic
    /// without a device.
    pub fn window_handle() -> Arc<BackingStoreHandle> {
        BackingStoreHandle::new(RenderTarget::Window(Arc::new(StubWindowSurface)))
    }

    /// An offscreen-backed handle over a fabricated framebuffer id, for
    /// exercising composition logic without a device.
    pub fn offscreen_handle() -> Arc<BackingStoreHandle> {
        BackingStoreHandle::new(RenderTarget::Offscreen(Arc::new(OffscreenSurface {
            buffer: Arc::new(DisplayBuffer::external(
                fb_handle(999),
                UVec2::new(16, 16),
                drm_fourcc::DrmFourcc::Argb8888,
            )),
            fbo_name: 99,
            destroy: None,
        })))
    }
}
