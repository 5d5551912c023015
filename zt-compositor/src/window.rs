// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The per-display facade. A window owns its output selection (connector,
//! CRTC, mode), the derived view geometry, and the cursor, and turns each
//! composition into one commit. It's the object the engine and input
//! subsystems talk to.

use std::sync::Arc;

use drm::control::Mode;
use glam::IVec2;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::composition::{Composition, LayerContent};
use crate::cursor::{Cursor, CursorChange, CursorEffect, PointerIcons};
use crate::geometry::{Orientation, PlaneTransform, ViewGeometry};
use crate::kms::mode::{connector_dimensions_mm, precise_vrefresh, select_output};
use crate::kms::request::{CommitOutcome, FbLayer};
use crate::kms::KmsDevice;
use crate::platform_views::{PlatformViewRegistry, ViewLayer};
use crate::render_targets::{RenderTarget, RenderTargetCache};
use crate::renderer::WindowSurface;
use crate::scheduler::{FrameCallback, FrameScheduler};
use crate::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct WindowConfig {
    /// A "WxH@Hz" or "WxH" videomode request.
    pub desired_videomode: Option<String>,
    /// An explicit display rotation; takes precedence over `orientation`.
    pub rotation: Option<PlaneTransform>,
    pub orientation: Option<Orientation>,
    /// Explicit physical dimensions, overriding the connector's.
    pub dimensions_mm: Option<(u32, u32)>,
    pub forced_pixel_format: Option<drm_fourcc::DrmFourcc>,
}

struct WindowState {
    should_apply_mode: bool,
    /// Latched once a non-blocking commit hits EBUSY; some drivers never
    /// recover, so all further commits go through the blocking path.
    do_blocking_commits: bool,
    composition: Option<Composition>,
    cursor: Cursor,
    shutting_down: bool,
}

pub struct Window {
    device: Arc<KmsDevice>,
    cache: Arc<RenderTargetCache>,
    views: Arc<PlatformViewRegistry>,
    scheduler: Arc<FrameScheduler>,

    connector_index: usize,
    crtc_index: usize,
    mode: Mode,
    geometry: ViewGeometry,
    forced_pixel_format: Option<drm_fourcc::DrmFourcc>,

    state: Mutex<WindowState>,
}

impl Window {
    pub fn new(
        device: Arc<KmsDevice>,
        cache: Arc<RenderTargetCache>,
        views: Arc<PlatformViewRegistry>,
        scheduler: Arc<FrameScheduler>,
        icons: Arc<PointerIcons>,
        config: WindowConfig,
    ) -> Result<Self> {
        let resources = device.resources();
        let selection = select_output(resources, config.desired_videomode.as_deref())?;

        let connector = &resources.connectors[selection.connector_index];
        let mode = connector.modes[selection.mode_index];

        let dimensions_mm = config
            .dimensions_mm
            .or_else(|| connector_dimensions_mm(connector.interface, connector.size_mm));

        let display_size = glam::UVec2::new(mode.size().0 as u32, mode.size().1 as u32);
        let rotation = config
            .rotation
            .or_else(|| config.orientation.map(|o| o.as_rotation(display_size)))
            .unwrap_or(PlaneTransform::ROTATE_0);

        let geometry = ViewGeometry::new(display_size, dimensions_mm, rotation);

        let refresh = precise_vrefresh(&mode);
        scheduler.set_refresh_period_ns((1_000_000_000.0 / refresh) as u64);

        info!(
            width = display_size.x,
            height = display_size.y,
            refresh,
            ?dimensions_mm,
            pixel_ratio = geometry.device_pixel_ratio,
            ?rotation,
            "configured display"
        );

        Ok(Self {
            device,
            cache,
            views,
            scheduler,
            connector_index: selection.connector_index,
            crtc_index: selection.crtc_index,
            mode,
            geometry,
            forced_pixel_format: config.forced_pixel_format,
            state: Mutex::new(WindowState {
                should_apply_mode: true,
                do_blocking_commits: false,
                composition: None,
                cursor: Cursor::new(icons),
                shutting_down: false,
            }),
        })
    }

    pub fn geometry(&self) -> &ViewGeometry {
        &self.geometry
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn crtc_index(&self) -> usize {
        self.crtc_index
    }

    pub fn forced_pixel_format(&self) -> Option<drm_fourcc::DrmFourcc> {
        self.forced_pixel_format
    }

    /// The engine's drawing surface, created on first use.
    pub fn render_surface(&self) -> Result<Arc<dyn WindowSurface>> {
        self.cache.ensure_window_surface()
    }

    /// The next vblank's timestamp estimate, one refresh period from now.
    pub fn next_vblank_ns(&self) -> u64 {
        crate::kms::monotonic_ns() + self.scheduler.refresh_period_ns()
    }

    pub fn request_frame(&self, callback: FrameCallback) {
        self.scheduler.request_frame(callback);
    }

    /// Translates a composition into one commit against our CRTC.
    pub fn push_composition(&self, composition: Composition) -> Result<()> {
        let mut state = self.state.lock();
        self.push_composition_locked(&mut state, composition)
    }

    fn push_composition_locked(
        &self,
        state: &mut WindowState,
        composition: Composition,
    ) -> Result<()> {
        if state.shutting_down {
            return Err(Error::ShuttingDown);
        }

        composition.validate()?;

        // Tear down collected render targets first, releasing the planes
        // they may still hold.
        self.cache.destroy_stale_targets();

        state.composition = Some(composition.clone());

        let mut req = self.device.request_builder(self.crtc_index);

        // The mode is applied once, on the first commit.
        if state.should_apply_mode {
            req.set_connector(self.connector_index);
            req.set_mode(self.mode);
        }

        // Platform-view lifecycle first: unmounts, updates, mounts.
        self.views.dispatch_frame(&composition, &mut req);

        for (zpos, layer) in composition.layers.iter().enumerate() {
            match &layer.content {
                LayerContent::BackingStore(handle) => {
                    let Some(target) = handle.target() else {
                        warn!(zpos, "composition references a collected backing store");
                        continue;
                    };

                    let result = match target {
                        RenderTarget::Window(surface) => {
                            let front = surface.swap_and_lock_front().map_err(Error::Other);
                            front.and_then(|mut front| {
                                let release =
                                    front.release.take().unwrap_or_else(|| Box::new(|| {}));
                                req.push_fb_layer(
                                    &FbLayer {
                                        fb: front.fb,
                                        format: front.format,
                                        modifier: front.modifier,
                                        src: (0, 0, front.size.x, front.size.y),
                                        dst: layer.pixel_rect(),
                                        rotation: None,
                                        in_fence_fd: None,
                                        prefer_cursor: false,
                                    },
                                    release,
                                )
                            })
                        }
                        RenderTarget::Offscreen(surface) => {
                            let buffer = surface.buffer.clone();
                            let keepalive = surface.clone();
                            req.push_fb_layer(
                                &FbLayer {
                                    fb: buffer.fb(),
                                    format: buffer.format(),
                                    modifier: buffer.modifier(),
                                    src: (0, 0, buffer.size().x, buffer.size().y),
                                    dst: layer.pixel_rect(),
                                    rotation: None,
                                    in_fence_fd: None,
                                    prefer_cursor: false,
                                },
                                Box::new(move || drop(keepalive)),
                            )
                        }
                    };

                    if let Err(err) = result {
                        error!(zpos, ?err, "couldn't push backing store layer");
                        // Settle the already-pushed producers.
                        drop(req.build());
                        return Err(err);
                    }
                }
                LayerContent::PlatformView { view_id, mutations } => {
                    self.views.present_view(
                        *view_id,
                        &ViewLayer {
                            zpos: zpos as i64,
                            offset: layer.offset,
                            size: layer.size,
                            mutations: mutations.clone(),
                        },
                        &mut req,
                    );
                }
            }
        }

        // The cursor goes on top, on the CURSOR plane when available.
        state.cursor.push_layer(&mut req);

        let req = req.build();
        let scheduler = self.scheduler.clone();
        let blocking = state.do_blocking_commits;

        match req.commit(
            &self.device,
            blocking,
            Box::new(move |vblank_ns| scheduler.on_scanout(vblank_ns)),
        ) {
            Ok(outcome) => {
                if outcome == CommitOutcome::Blocking && !blocking {
                    debug!("latching into blocking commits");
                    state.do_blocking_commits = true;
                }

                state.should_apply_mode = false;
                self.scheduler.on_commit();
                Ok(())
            }
            Err(err) => {
                // The frame is dropped, but the scheduler must not stall
                // waiting for a scanout that will never come.
                error!(?err, "commit failed, dropping frame");
                self.scheduler.on_scanout(crate::kms::monotonic_ns());
                self.scheduler.on_commit();
                Err(err)
            }
        }
    }

    /// Updates cursor state. A changed icon or enablement re-presents the
    /// last composition; a pure movement goes through MoveCursor and skips
    /// the commit path entirely.
    pub fn set_cursor(&self, change: CursorChange) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let effect = {
            let state = &mut *state;
            state.cursor.set(
                &self.device,
                self.crtc_index,
                self.geometry.rotation,
                self.geometry.device_pixel_ratio,
                change,
            )?
        };

        if effect == CursorEffect::Represent {
            if let Some(composition) = state.composition.clone() {
                if let Err(err) = self.push_composition_locked(&mut state, composition) {
                    warn!(?err, "re-presenting for cursor change failed");
                }
            }
        }

        Ok(())
    }

    pub fn cursor_pos(&self) -> IVec2 {
        self.state.lock().cursor.pos
    }

    /// Refuses new commits; outstanding page-flip events drain on the event
    /// loop.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
    }
}
