// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The per-frame request builder. Layers are pushed bottom-to-top; each push
//! reserves a plane and records the property writes for it. A built request
//! commits either blockingly or via a page-flip event, with a legacy
//! SetCrtc/PageFlip/SetPlane fallback for devices without atomic support.
//!
//! Every pushed layer carries a release callback. The builder guarantees it
//! fires exactly once: after the frame's scanout, or on commit failure (in
//! reverse push order), or immediately if the push itself fails.

use std::os::fd::RawFd;
use std::sync::Arc;

use drm::control::{atomic::AtomicModeReq, property, AtomicCommitFlags, Mode, PlaneType};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace, warn};

use super::resources::{Resources, ZposKind};
use super::{KmsDevice, PendingScanout};
use crate::geometry::PlaneTransform;
use crate::{Error, Result};

pub type ReleaseCallback = Box<dyn FnOnce() + Send + Sync>;

/// A framebuffer layer to scan out. The source rectangle is in pixels; the
/// 16.16 fixed-point conversion the plane properties want happens internally.
pub struct FbLayer {
    pub fb: drm::control::framebuffer::Handle,
    pub format: DrmFourcc,
    pub modifier: Option<DrmModifier>,
    /// Source rectangle in buffer pixels.
    pub src: (u32, u32, u32, u32),
    /// Destination rectangle in CRTC coordinates.
    pub dst: (i32, i32, u32, u32),
    pub rotation: Option<PlaneTransform>,
    pub in_fence_fd: Option<RawFd>,
    /// Land on a CURSOR-type plane if the CRTC has one that accepts this
    /// format and size.
    pub prefer_cursor: bool,
}

/// How a commit completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Submitted non-blockingly; a page-flip event will follow.
    Flipped,
    /// Completed synchronously; a synthetic scanout event was posted. When
    /// this comes back from a non-blocking commit, the driver returned EBUSY
    /// and the caller should latch into blocking commits.
    Blocking,
}

#[derive(Debug, Clone, Copy)]
struct PlannedLayer {
    plane_index: usize,
    zpos: i64,
}

struct LegacyLayer {
    plane_index: usize,
    fb: drm::control::framebuffer::Handle,
    src: (u32, u32, u32, u32),
    dst: (i32, i32, u32, u32),
}

enum BuilderKind {
    Atomic { req: AtomicModeReq },
    Legacy { layers: Vec<LegacyLayer> },
}

pub struct KmsReqBuilder<'a> {
    resources: &'a Resources,
    crtc_index: usize,
    cursor_caps: Option<(u32, u32)>,

    kind: BuilderKind,
    reserved: Vec<usize>,
    planned: Vec<PlannedLayer>,
    releases: Vec<ReleaseCallback>,

    connector_index: Option<usize>,
    mode: Option<Mode>,
    unset_mode: bool,
    next_zpos: i64,
}

impl<'a> KmsReqBuilder<'a> {
    pub fn new_atomic(
        resources: &'a Resources,
        crtc_index: usize,
        cursor_caps: Option<(u32, u32)>,
    ) -> Self {
        Self::new(
            resources,
            crtc_index,
            cursor_caps,
            BuilderKind::Atomic {
                req: AtomicModeReq::new(),
            },
        )
    }

    pub fn new_legacy(
        resources: &'a Resources,
        crtc_index: usize,
        cursor_caps: Option<(u32, u32)>,
    ) -> Self {
        Self::new(
            resources,
            crtc_index,
            cursor_caps,
            BuilderKind::Legacy { layers: Vec::new() },
        )
    }

    fn new(
        resources: &'a Resources,
        crtc_index: usize,
        cursor_caps: Option<(u32, u32)>,
        kind: BuilderKind,
    ) -> Self {
        let next_zpos = resources.crtcs[crtc_index].min_zpos;
        Self {
            resources,
            crtc_index,
            cursor_caps,
            kind,
            reserved: Vec::new(),
            planned: Vec::new(),
            releases: Vec::new(),
            connector_index: None,
            mode: None,
            unset_mode: false,
            next_zpos,
        }
    }

    /// Marks the request as a modeset, linking the connector to our CRTC.
    pub fn set_connector(&mut self, connector_index: usize) {
        self.connector_index = Some(connector_index);
    }

    /// Marks the request as a modeset, applying the mode on commit.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(mode);
    }

    /// Marks the request as a modeset that deactivates the CRTC.
    pub fn unset_mode(&mut self) {
        self.unset_mode = true;
        self.mode = None;
    }

    pub fn is_modeset(&self) -> bool {
        self.connector_index.is_some() || self.mode.is_some() || self.unset_mode
    }

    /// The zpos the next pushed layer will get.
    pub fn current_zpos(&self) -> i64 {
        self.next_zpos
    }

    #[cfg(test)]
    fn planned(&self) -> &[PlannedLayer] {
        &self.planned
    }

    /// Reserves a plane for the layer and records its property writes. On
    /// failure the release callback is invoked before returning, so the
    /// producer never leaks.
    pub fn push_fb_layer(&mut self, layer: &FbLayer, release: ReleaseCallback) -> Result<()> {
        let plane_index = match self.select_plane(layer) {
            Some(index) => index,
            None => {
                warn!(
                    format = ?layer.format,
                    prefer_cursor = layer.prefer_cursor,
                    "no unused plane accepts the layer"
                );
                release();
                return Err(Error::ResourceExhausted);
            }
        };

        let zpos = self.next_zpos;
        if let Err(err) = self.write_plane(plane_index, layer, zpos) {
            release();
            return Err(err);
        }

        trace!(
            plane = ?self.resources.planes[plane_index].handle,
            fb = ?layer.fb,
            zpos,
            dst = ?layer.dst,
            "pushed fb layer"
        );

        self.reserved.push(plane_index);
        self.planned.push(PlannedLayer { plane_index, zpos });
        self.releases.push(release);
        self.next_zpos += 1;
        Ok(())
    }

    /// Skips over zpos values claimed by layers composited outside of this
    /// builder (a platform view that programs its own plane).
    pub fn push_placeholder_layers(&mut self, count: usize) {
        self.next_zpos += count as i64;
    }

    fn select_plane(&self, layer: &FbLayer) -> Option<usize> {
        let crtc = &self.resources.crtcs[self.crtc_index];
        let first_layer = self.planned.is_empty();

        let usable = |index: &usize| {
            let plane = &self.resources.planes[*index];
            if self.reserved.contains(index) {
                return false;
            }

            if !plane.supports_format(layer.format, layer.modifier) {
                return false;
            }

            if let Some(rotation) = layer.rotation {
                if rotation != PlaneTransform::ROTATE_0 && !plane.supports_rotation(rotation) {
                    return false;
                }
            }

            true
        };

        let candidates: Vec<usize> = self
            .resources
            .planes_for_crtc(self.crtc_index)
            .filter(usable)
            .collect();

        let of_kind = |kind: PlaneType| {
            candidates
                .iter()
                .copied()
                .find(|i| self.resources.planes[*i].kind == kind)
        };

        if layer.prefer_cursor && crtc.supports_hardware_cursor && self.cursor_fits(layer) {
            if let Some(index) = of_kind(PlaneType::Cursor) {
                return Some(index);
            }
        }

        if first_layer {
            of_kind(PlaneType::Primary).or_else(|| of_kind(PlaneType::Overlay))
        } else {
            of_kind(PlaneType::Overlay).or_else(|| of_kind(PlaneType::Primary))
        }
    }

    fn cursor_fits(&self, layer: &FbLayer) -> bool {
        match self.cursor_caps {
            Some((w, h)) => layer.dst.2 <= w && layer.dst.3 <= h,
            None => true,
        }
    }

    fn write_plane(&mut self, plane_index: usize, layer: &FbLayer, zpos: i64) -> Result<()> {
        let plane = &self.resources.planes[plane_index];
        let crtc = &self.resources.crtcs[self.crtc_index];

        match &mut self.kind {
            BuilderKind::Atomic { req } => {
                let props = &plane.props;
                let handle = plane.handle;

                let mut add = |prop: Option<property::Handle>, value: property::Value<'static>| {
                    if let Some(prop) = prop {
                        req.add_property(handle, prop, value);
                    }
                };

                add(props.fb_id, property::Value::Framebuffer(Some(layer.fb)));
                add(props.crtc_id, property::Value::CRTC(Some(crtc.handle)));
                add(
                    props.src_x,
                    property::Value::UnsignedRange((layer.src.0 as u64) << 16),
                );
                add(
                    props.src_y,
                    property::Value::UnsignedRange((layer.src.1 as u64) << 16),
                );
                add(
                    props.src_w,
                    property::Value::UnsignedRange((layer.src.2 as u64) << 16),
                );
                add(
                    props.src_h,
                    property::Value::UnsignedRange((layer.src.3 as u64) << 16),
                );
                add(
                    props.crtc_x,
                    property::Value::SignedRange(layer.dst.0 as i64),
                );
                add(
                    props.crtc_y,
                    property::Value::SignedRange(layer.dst.1 as i64),
                );
                add(
                    props.crtc_w,
                    property::Value::UnsignedRange(layer.dst.2 as u64),
                );
                add(
                    props.crtc_h,
                    property::Value::UnsignedRange(layer.dst.3 as u64),
                );

                if let Some(fd) = layer.in_fence_fd {
                    add(props.in_fence_fd, property::Value::SignedRange(fd as i64));
                }

                if let Some(rotation) = layer.rotation {
                    if rotation != PlaneTransform::ROTATE_0 {
                        add(
                            props.rotation,
                            property::Value::Bitmask(rotation.bits() as u64),
                        );
                    }
                }

                if let Some(info) = plane.zpos {
                    if plane.supports_setting_zpos() {
                        let clamped = zpos.clamp(info.min, info.max);
                        let value = match info.kind {
                            ZposKind::SignedRange => property::Value::SignedRange(clamped),
                            _ => property::Value::UnsignedRange(clamped as u64),
                        };
                        req.add_property(handle, info.prop, value);
                    }
                }

                Ok(())
            }
            BuilderKind::Legacy { layers } => {
                // The legacy ioctls can't express rotation or fences.
                if layer
                    .rotation
                    .map_or(false, |r| r != PlaneTransform::ROTATE_0)
                {
                    return Err(Error::DriverRejected(std::io::Error::from_raw_os_error(
                        libc::EINVAL,
                    )));
                }

                layers.push(LegacyLayer {
                    plane_index,
                    fb: layer.fb,
                    src: layer.src,
                    dst: layer.dst,
                });

                Ok(())
            }
        }
    }

    /// Freezes the request. For atomic requests, every compatible plane left
    /// unreserved is disabled (FB_ID and CRTC_ID zeroed) so stale layers from
    /// previous frames don't linger.
    pub fn build(mut self) -> KmsReq {
        if let BuilderKind::Atomic { req } = &mut self.kind {
            let unreserved: Vec<usize> = self
                .resources
                .planes_for_crtc(self.crtc_index)
                .filter(|i| !self.reserved.contains(i))
                .collect();

            for index in unreserved {
                let plane = &self.resources.planes[index];
                if let (Some(fb_id), Some(crtc_id)) = (plane.props.fb_id, plane.props.crtc_id) {
                    req.add_property(plane.handle, fb_id, property::Value::Framebuffer(None));
                    req.add_property(plane.handle, crtc_id, property::Value::CRTC(None));
                }
            }
        }

        KmsReq {
            crtc_index: self.crtc_index,
            kind: self.kind,
            releases: self.releases,
            connector_index: self.connector_index,
            mode: self.mode,
            unset_mode: self.unset_mode,
        }
    }
}

/// A frozen request, ready to commit exactly once.
pub struct KmsReq {
    crtc_index: usize,
    kind: BuilderKind,
    releases: Vec<ReleaseCallback>,
    connector_index: Option<usize>,
    mode: Option<Mode>,
    unset_mode: bool,
}

impl KmsReq {
    pub fn is_modeset(&self) -> bool {
        self.connector_index.is_some() || self.mode.is_some() || self.unset_mode
    }

    /// Commits the request. `blocking` selects the synchronous path up front;
    /// a non-blocking commit that hits EBUSY retries blockingly and reports
    /// it through the outcome.
    ///
    /// On success, `on_scanout` runs (with the vblank timestamp, then the
    /// release callbacks) when the flip's page-flip event arrives, or via a
    /// synthetic scanout event for synchronous paths. On failure, the release
    /// callbacks fire in reverse push order and the error is returned.
    pub fn commit(
        mut self,
        dev: &Arc<KmsDevice>,
        blocking: bool,
        on_scanout: Box<dyn FnOnce(u64) + Send>,
    ) -> Result<CommitOutcome> {
        let result = match &self.kind {
            BuilderKind::Atomic { .. } => self.commit_atomic(dev, blocking, on_scanout),
            BuilderKind::Legacy { .. } => self.commit_legacy(dev, on_scanout),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                debug!(?err, "commit failed, releasing producers");
                self.fire_releases();
                Err(err)
            }
        }
    }

    fn commit_atomic(
        &mut self,
        dev: &Arc<KmsDevice>,
        blocking: bool,
        on_scanout: Box<dyn FnOnce(u64) + Send>,
    ) -> Result<CommitOutcome> {
        let resources = dev.resources();
        let crtc = &resources.crtcs[self.crtc_index];

        let BuilderKind::Atomic { req } = &mut self.kind else {
            unreachable!()
        };

        let flags = AtomicCommitFlags::ALLOW_MODESET;
        if self.unset_mode {
            if let Some(active) = crtc.prop_active {
                req.add_property(crtc.handle, active, property::Value::Boolean(false));
            }
        } else if self.connector_index.is_some() || self.mode.is_some() {
            if let (Some(connector_index), Some(mode)) = (self.connector_index, self.mode) {
                let connector = &resources.connectors[connector_index];
                if let Some(prop) = connector.prop_crtc_id {
                    req.add_property(
                        connector.handle,
                        prop,
                        property::Value::CRTC(Some(crtc.handle)),
                    );
                }

                let blob = dev.mode_blob(self.crtc_index, &mode)?;
                if let Some(prop) = crtc.prop_mode_id {
                    req.add_property(crtc.handle, prop, property::Value::Unknown(blob));
                }

                if let Some(prop) = crtc.prop_active {
                    req.add_property(crtc.handle, prop, property::Value::Boolean(true));
                }
            }
        }

        // Park the scanout callback before submitting. The page-flip event is
        // dispatched on the event loop thread and can fire before the commit
        // ioctl returns to us.
        let pending = PendingScanout {
            on_scanout,
            releases: std::mem::take(&mut self.releases),
        };
        dev.park_scanout(self.crtc_index, pending);

        if !blocking {
            match dev.atomic_commit(
                flags | AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
                req.clone(),
            ) {
                Ok(()) => return Ok(CommitOutcome::Flipped),
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    debug!("non-blocking commit returned EBUSY, retrying blocking");
                }
                Err(err) => {
                    self.releases = dev.unpark_scanout(self.crtc_index);
                    return Err(Error::DriverRejected(err));
                }
            }
        }

        match dev.atomic_commit(flags, req.clone()) {
            Ok(()) => {
                dev.post_synthetic_scanout(self.crtc_index);
                Ok(CommitOutcome::Blocking)
            }
            Err(err) => {
                self.releases = dev.unpark_scanout(self.crtc_index);
                Err(Error::DriverRejected(err))
            }
        }
    }

    fn commit_legacy(
        &mut self,
        dev: &Arc<KmsDevice>,
        on_scanout: Box<dyn FnOnce(u64) + Send>,
    ) -> Result<CommitOutcome> {
        let resources = dev.resources();
        let crtc = &resources.crtcs[self.crtc_index];

        let BuilderKind::Legacy { layers } = &self.kind else {
            unreachable!()
        };

        let Some(primary) = layers.first() else {
            return Err(Error::ResourceExhausted);
        };

        let pending = PendingScanout {
            on_scanout,
            releases: std::mem::take(&mut self.releases),
        };
        dev.park_scanout(self.crtc_index, pending);

        let modeset = self.is_modeset();
        if modeset {
            let connector = self
                .connector_index
                .map(|i| resources.connectors[i].handle);
            if let Err(err) = dev.set_crtc(crtc.handle, Some(primary.fb), connector, self.mode) {
                self.releases = dev.unpark_scanout(self.crtc_index);
                return Err(Error::DriverRejected(err));
            }
        } else if let Err(err) = dev.page_flip(crtc.handle, primary.fb) {
            self.releases = dev.unpark_scanout(self.crtc_index);
            return Err(Error::DriverRejected(err));
        }

        // Overlays go through SetPlane, which in practice is blocking and
        // vsynced everywhere it matters.
        for layer in &layers[1..] {
            let plane = &resources.planes[layer.plane_index];
            if let Err(err) = dev.set_plane(plane.handle, crtc.handle, layer.fb, layer.src, layer.dst)
            {
                warn!(plane = ?plane.handle, ?err, "legacy SetPlane failed, dropping layer");
            }
        }

        if modeset {
            dev.post_synthetic_scanout(self.crtc_index);
            Ok(CommitOutcome::Blocking)
        } else {
            Ok(CommitOutcome::Flipped)
        }
    }

    /// Fires all unfired release callbacks, most recent first.
    pub(crate) fn fire_releases(&mut self) {
        for release in self.releases.drain(..).rev() {
            release();
        }
    }
}

impl Drop for KmsReq {
    fn drop(&mut self) {
        // An uncommitted or failed request still owes its producers their
        // buffers back.
        self.fire_releases();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::kms::resources::test_support::*;

    fn release_counter(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> ReleaseCallback {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(name))
    }

    fn fb_layer(format: DrmFourcc, dst: (i32, i32, u32, u32)) -> FbLayer {
        FbLayer {
            fb: fb_handle(1),
            format,
            modifier: None,
            src: (0, 0, dst.2, dst.3),
            dst,
            rotation: None,
            in_fence_fd: None,
            prefer_cursor: false,
        }
    }

    fn two_plane_resources() -> Resources {
        test_resources(
            vec![test_crtc(1, 0, false)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Overlay, 0b1, &[DrmFourcc::Xrgb8888]),
            ],
        )
    }

    #[test]
    fn test_first_layer_gets_primary() {
        let resources = two_plane_resources();
        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);

        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();

        assert_eq!(builder.planned().len(), 1);
        assert_eq!(builder.planned()[0].plane_index, 0);
        assert_eq!(builder.planned()[0].zpos, 0);
    }

    #[test]
    fn test_format_mismatch_exhausts_planes() {
        // Two ARGB8888 layers, but only the primary plane supports the
        // format: the second push must fail-reserve.
        let resources = two_plane_resources();
        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);

        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();

        let released = Arc::new(AtomicUsize::new(0));
        let released_ = released.clone();
        let result = builder.push_fb_layer(
            &fb_layer(DrmFourcc::Argb8888, (100, 100, 300, 200)),
            Box::new(move || {
                released_.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(matches!(result, Err(Error::ResourceExhausted)));
        // The producer got its buffer back despite the failure.
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // Swapping formats allows both layers.
        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Xrgb8888, (100, 100, 300, 200)),
                Box::new(|| {}),
            )
            .unwrap();

        assert_eq!(builder.planned()[1].plane_index, 1);
        assert_eq!(builder.planned()[1].zpos, 1);
    }

    #[test]
    fn test_overlay_preferred_after_first() {
        let resources = test_resources(
            vec![test_crtc(1, 0, false)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Overlay, 0b1, &[DrmFourcc::Argb8888]),
            ],
        );

        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (100, 100, 300, 200)),
                Box::new(|| {}),
            )
            .unwrap();

        assert_eq!(builder.planned()[0].plane_index, 0);
        assert_eq!(builder.planned()[1].plane_index, 1);
    }

    #[test]
    fn test_prefer_cursor() {
        let resources = test_resources(
            vec![test_crtc(1, 0, true)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Cursor, 0b1, &[DrmFourcc::Argb8888]),
            ],
        );

        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, Some((64, 64)));
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();

        let mut cursor = fb_layer(DrmFourcc::Argb8888, (100, 100, 32, 32));
        cursor.prefer_cursor = true;
        builder.push_fb_layer(&cursor, Box::new(|| {})).unwrap();
        assert_eq!(builder.planned()[1].plane_index, 1);

        // An oversized cursor image can't use the cursor plane; with no
        // overlay or primary left, the push fails.
        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, Some((64, 64)));
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();

        let mut huge = fb_layer(DrmFourcc::Argb8888, (0, 0, 256, 256));
        huge.prefer_cursor = true;
        assert!(matches!(
            builder.push_fb_layer(&huge, Box::new(|| {})),
            Err(Error::ResourceExhausted)
        ));
    }

    #[test]
    fn test_cursor_plane_not_used_without_preference() {
        let resources = test_resources(
            vec![test_crtc(1, 0, true)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Cursor, 0b1, &[DrmFourcc::Argb8888]),
            ],
        );

        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();

        assert!(matches!(
            builder.push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 64, 64)),
                Box::new(|| {})
            ),
            Err(Error::ResourceExhausted)
        ));
    }

    #[test]
    fn test_placeholder_layers_advance_zpos() {
        let resources = test_resources(
            vec![test_crtc(1, 0, false)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Overlay, 0b1, &[DrmFourcc::Argb8888]),
            ],
        );

        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                Box::new(|| {}),
            )
            .unwrap();
        builder.push_placeholder_layers(2);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 100, 100)),
                Box::new(|| {}),
            )
            .unwrap();

        assert_eq!(builder.planned()[1].zpos, 3);
    }

    #[test]
    fn test_releases_fire_in_reverse_order_once() {
        let resources = test_resources(
            vec![test_crtc(1, 0, false)],
            vec![
                test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Overlay, 0b1, &[DrmFourcc::Argb8888]),
            ],
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                release_counter(&log, "primary"),
            )
            .unwrap();
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 100, 100)),
                release_counter(&log, "overlay"),
            )
            .unwrap();

        let mut req = builder.build();
        req.fire_releases();
        assert_eq!(*log.lock().unwrap(), ["overlay", "primary"]);

        // Dropping the request doesn't fire them again.
        drop(req);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_drop_fires_releases() {
        let resources = two_plane_resources();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut builder = KmsReqBuilder::new_atomic(&resources, 0, None);
        builder
            .push_fb_layer(
                &fb_layer(DrmFourcc::Argb8888, (0, 0, 1920, 1080)),
                release_counter(&log, "primary"),
            )
            .unwrap();

        drop(builder.build());
        assert_eq!(*log.lock().unwrap(), ["primary"]);
    }
}
