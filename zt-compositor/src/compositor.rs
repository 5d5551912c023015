// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The compositor core: owns the windows, the render-target cache, the
//! platform-view registry and the frame scheduler, and implements the
//! engine's composition callbacks on top of them.

use std::sync::Arc;

use glam::{IVec2, UVec2};
use tracing::{debug, error};

use crate::composition::{Composition, Layer};
use crate::cursor::{CursorChange, PointerIcons};
use crate::kms::KmsDevice;
use crate::platform_views::{PlatformView, PlatformViewRegistry};
use crate::render_targets::{BackingStoreHandle, RenderTargetCache};
use crate::renderer::Renderer;
use crate::scheduler::{FrameCallback, FrameScheduler, PresentMode};
use crate::window::{Window, WindowConfig};
use crate::Result;

/// What the engine gets back for a created backing store: the handle it will
/// later collect and destroy, and the GL framebuffer to render into (0 for
/// the window surface).
pub struct CreatedBackingStore {
    pub handle: Arc<BackingStoreHandle>,
    pub fbo_name: u32,
}

pub struct Compositor {
    device: Arc<KmsDevice>,
    cache: Arc<RenderTargetCache>,
    views: Arc<PlatformViewRegistry>,
    scheduler: Arc<FrameScheduler>,
    windows: Vec<Arc<Window>>,
}

impl Compositor {
    /// Brings up the compositor over one KMS display.
    pub fn new(
        device: Arc<KmsDevice>,
        renderer: Arc<dyn Renderer>,
        present_mode: PresentMode,
        icons: Arc<PointerIcons>,
        config: WindowConfig,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(RenderTargetCache::new(renderer));
        let views = Arc::new(PlatformViewRegistry::default());
        let scheduler = Arc::new(FrameScheduler::new(present_mode));

        let window = Arc::new(Window::new(
            device.clone(),
            cache.clone(),
            views.clone(),
            scheduler.clone(),
            icons,
            config,
        )?);

        Ok(Arc::new(Self {
            device,
            cache,
            views,
            scheduler,
            windows: vec![window],
        }))
    }

    pub fn device(&self) -> &Arc<KmsDevice> {
        &self.device
    }

    pub fn main_window(&self) -> &Arc<Window> {
        &self.windows[0]
    }

    pub fn scheduler(&self) -> &Arc<FrameScheduler> {
        &self.scheduler
    }

    /// The handle the engine runtime plugs its callbacks into.
    pub fn frame_sink(self: &Arc<Self>) -> FrameSink {
        FrameSink {
            compositor: self.clone(),
        }
    }

    /// Registers the callback quadruple for a platform view id.
    pub fn put_platform_view(&self, view_id: i64, view: Box<dyn PlatformView>) {
        self.views.put_view(view_id, view);
    }

    pub fn remove_platform_view(&self, view_id: i64) -> bool {
        self.views.remove_view(view_id)
    }

    /// Routes a cursor change from the input subsystem to the main window.
    pub fn set_cursor(&self, change: CursorChange) -> Result<()> {
        self.main_window().set_cursor(change)
    }

    pub fn set_cursor_pos(&self, pos: IVec2) -> Result<()> {
        self.main_window().set_cursor(CursorChange {
            pos: Some(pos),
            ..Default::default()
        })
    }

    /// Starts a cooperative shutdown: windows refuse new commits. The event
    /// loop drains outstanding page-flip events before resources go away.
    pub fn shutdown(&self) {
        debug!("shutting down compositor");
        for window in &self.windows {
            window.shutdown();
        }
    }
}

/// The engine-facing composition interface. The engine runtime adapts its
/// callback ABI onto these; all of them run on engine-managed threads.
#[derive(Clone)]
pub struct FrameSink {
    compositor: Arc<Compositor>,
}

impl FrameSink {
    pub fn create_backing_store(&self, size: UVec2) -> Result<CreatedBackingStore> {
        let handle = self.compositor.cache.create_backing_store(size)?;
        let fbo_name = handle.target().map(|t| t.fbo_name()).unwrap_or(0);
        Ok(CreatedBackingStore { handle, fbo_name })
    }

    /// Always true on success; the engine's contract wants a boolean.
    pub fn collect_backing_store(&self, handle: &Arc<BackingStoreHandle>) -> bool {
        self.compositor.cache.collect_backing_store(handle);
        true
    }

    /// The destruction callback the engine invokes for a store's
    /// framebuffer, after (or instead of) collecting it.
    pub fn destroy_backing_store(&self, handle: &Arc<BackingStoreHandle>) {
        self.compositor.cache.destroy_backing_store(handle);
    }

    /// Presents a frame's layers. Reports failure to the engine as `false`;
    /// recoverable driver errors drop the frame but keep the session going.
    pub fn present_layers(&self, layers: Vec<Layer>) -> bool {
        let composition = Composition::new(layers);
        match self.compositor.main_window().push_composition(composition) {
            Ok(()) => true,
            Err(err) => {
                error!(?err, "present failed");
                false
            }
        }
    }

    /// The engine's vsync request: the callback is the baton, answered per
    /// the scheduler's present mode.
    pub fn request_frame(&self, callback: FrameCallback) {
        self.compositor.scheduler.request_frame(callback);
    }
}

/// Convenience constructor wiring the usual pieces together.
pub fn new_with_builtin_icons(
    device: Arc<KmsDevice>,
    renderer: Arc<dyn Renderer>,
    present_mode: PresentMode,
    config: WindowConfig,
) -> Result<Arc<Compositor>> {
    Compositor::new(
        device,
        renderer,
        present_mode,
        Arc::new(PointerIcons::builtin()),
        config,
    )
}
