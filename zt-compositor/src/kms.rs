// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Ownership of the DRM device: the file descriptor, the resource snapshot,
//! client capability negotiation, the per-CRTC scanout slots page-flip events
//! are matched against, and thin wrappers over the modesetting ioctls.

pub mod mode;
pub mod request;
pub mod resources;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use drm::control::{
    atomic::AtomicModeReq, connector, crtc, plane, AtomicCommitFlags, Device as ControlDevice,
    Event, Mode, PageFlipFlags,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffers::BufferRegistry;
use crate::events::{LoopEvent, WakingSender};
use crate::{Error, Result};
use request::{KmsReqBuilder, ReleaseCallback};
use resources::Resources;

/// The opened DRM node. Implementing the drm device traits on the wrapper is
/// what gives us the typed control API.
pub struct DrmFd(File);

impl AsFd for DrmFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for DrmFd {}
impl ControlDevice for DrmFd {}

impl DrmFd {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self(self.0.try_clone()?))
    }
}

/// A scanout callback parked on a CRTC until its page-flip event (or a
/// synthetic scanout for blocking commits) arrives.
pub struct PendingScanout {
    pub on_scanout: Box<dyn FnOnce(u64) + Send>,
    pub releases: Vec<ReleaseCallback>,
}

struct CrtcSlot {
    pending: Option<PendingScanout>,
    mode_blob: Option<(Mode, u64)>,
}

struct DeviceState {
    crtcs: Vec<CrtcSlot>,
    loop_sender: Option<WakingSender<LoopEvent>>,
}

pub struct KmsDevice {
    fd: DrmFd,
    supports_atomic: bool,
    cursor_caps: Option<(u32, u32)>,
    resources: Resources,
    gbm: Mutex<gbm::Device<DrmFd>>,
    buffers: BufferRegistry,

    // Guards every ioctl below; never held while running callbacks.
    ioctl: Mutex<()>,
    state: Mutex<DeviceState>,
}

impl KmsDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);

        let file = options.open(path.as_ref())?;
        debug!(path = ?path.as_ref(), "opened DRM device");
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Arc<Self>> {
        let fd = DrmFd(file);

        fd.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(Error::Io)?;

        let supports_atomic = fd
            .set_client_capability(ClientCapability::Atomic, true)
            .is_ok();

        let cursor_caps = match (
            fd.get_driver_capability(DriverCapability::CursorWidth),
            fd.get_driver_capability(DriverCapability::CursorHeight),
        ) {
            (Ok(w), Ok(h)) if w != 0 && h != 0 => Some((w as u32, h as u32)),
            _ => None,
        };

        let resources = Resources::snapshot(&fd)?;
        let n_crtcs = resources.crtcs.len();

        let gbm = gbm::Device::new(fd.try_clone()?)?;

        debug!(
            supports_atomic,
            ?cursor_caps,
            "negotiated DRM client capabilities"
        );

        Ok(Arc::new(Self {
            fd,
            supports_atomic,
            cursor_caps,
            resources,
            gbm: Mutex::new(gbm),
            buffers: BufferRegistry::default(),
            ioctl: Mutex::new(()),
            state: Mutex::new(DeviceState {
                crtcs: (0..n_crtcs)
                    .map(|_| CrtcSlot {
                        pending: None,
                        mode_blob: None,
                    })
                    .collect(),
                loop_sender: None,
            }),
        }))
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn supports_atomic(&self) -> bool {
        self.supports_atomic
    }

    pub fn cursor_caps(&self) -> Option<(u32, u32)> {
        self.cursor_caps
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    /// Starts a request against the given CRTC, atomic when the device
    /// supports it.
    pub fn request_builder(&self, crtc_index: usize) -> KmsReqBuilder<'_> {
        if self.supports_atomic {
            KmsReqBuilder::new_atomic(&self.resources, crtc_index, self.cursor_caps)
        } else {
            KmsReqBuilder::new_legacy(&self.resources, crtc_index, self.cursor_caps)
        }
    }

    pub(crate) fn with_gbm<T>(&self, f: impl FnOnce(&gbm::Device<DrmFd>) -> T) -> T {
        let gbm = self.gbm.lock();
        f(&gbm)
    }

    pub(crate) fn set_loop_sender(&self, sender: WakingSender<LoopEvent>) {
        self.state.lock().loop_sender = Some(sender);
    }

    // Ioctl wrappers. Each takes the device mutex for the duration of the
    // call and nothing else.

    pub(crate) fn atomic_commit(
        &self,
        flags: AtomicCommitFlags,
        req: AtomicModeReq,
    ) -> io::Result<()> {
        let _guard = self.ioctl.lock();
        self.fd.atomic_commit(flags, req).map_err(io::Error::from)
    }

    pub(crate) fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<drm::control::framebuffer::Handle>,
        connector: Option<connector::Handle>,
        mode: Option<Mode>,
    ) -> io::Result<()> {
        let _guard = self.ioctl.lock();
        let connectors: &[connector::Handle] = match &connector {
            Some(c) => std::slice::from_ref(c),
            None => &[],
        };

        self.fd
            .set_crtc(crtc, fb, (0, 0), connectors, mode)
            .map_err(io::Error::from)
    }

    pub(crate) fn page_flip(
        &self,
        crtc: crtc::Handle,
        fb: drm::control::framebuffer::Handle,
    ) -> io::Result<()> {
        let _guard = self.ioctl.lock();
        self.fd
            .page_flip(crtc, fb, PageFlipFlags::EVENT, None)
            .map_err(io::Error::from)
    }

    pub(crate) fn set_plane(
        &self,
        plane: plane::Handle,
        crtc: crtc::Handle,
        fb: drm::control::framebuffer::Handle,
        src: (u32, u32, u32, u32),
        dst: (i32, i32, u32, u32),
    ) -> io::Result<()> {
        let _guard = self.ioctl.lock();
        self.fd
            .set_plane(
                plane,
                crtc,
                Some(fb),
                0,
                dst,
                (src.0 << 16, src.1 << 16, src.2 << 16, src.3 << 16),
            )
            .map_err(io::Error::from)
    }

    pub fn move_cursor(&self, crtc_index: usize, pos: (i32, i32)) -> Result<()> {
        let _guard = self.ioctl.lock();
        let crtc = self.resources.crtcs[crtc_index].handle;
        self.fd
            .move_cursor(crtc, pos)
            .map_err(|e| Error::Io(e.into()))
    }

    pub(crate) fn add_planar_framebuffer<B: drm::buffer::PlanarBuffer>(
        &self,
        buffer: &B,
        flags: drm::control::FbCmd2Flags,
    ) -> io::Result<drm::control::framebuffer::Handle> {
        let _guard = self.ioctl.lock();
        self.fd
            .add_planar_framebuffer(buffer, flags)
            .map_err(io::Error::from)
    }

    pub(crate) fn add_framebuffer<B: drm::buffer::Buffer>(
        &self,
        buffer: &B,
        depth: u32,
        bpp: u32,
    ) -> io::Result<drm::control::framebuffer::Handle> {
        let _guard = self.ioctl.lock();
        self.fd
            .add_framebuffer(buffer, depth, bpp)
            .map_err(io::Error::from)
    }

    pub(crate) fn destroy_framebuffer(&self, fb: drm::control::framebuffer::Handle) {
        let _guard = self.ioctl.lock();
        if let Err(err) = self.fd.destroy_framebuffer(fb) {
            warn!(?fb, ?err, "RmFB failed");
        }
    }

    pub(crate) fn create_dumb_buffer(
        &self,
        size: (u32, u32),
        format: drm_fourcc::DrmFourcc,
    ) -> io::Result<drm::control::dumbbuffer::DumbBuffer> {
        let _guard = self.ioctl.lock();
        self.fd
            .create_dumb_buffer(size, format, 32)
            .map_err(io::Error::from)
    }

    pub(crate) fn write_dumb_buffer(
        &self,
        buffer: &mut drm::control::dumbbuffer::DumbBuffer,
        data: &[u8],
    ) -> io::Result<()> {
        let _guard = self.ioctl.lock();
        let mut mapping = self.fd.map_dumb_buffer(buffer)?;
        let len = data.len().min(mapping.len());
        mapping[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    pub(crate) fn destroy_dumb_buffer(&self, buffer: drm::control::dumbbuffer::DumbBuffer) {
        let _guard = self.ioctl.lock();
        if let Err(err) = self.fd.destroy_dumb_buffer(buffer) {
            warn!(?err, "destroying dumb buffer failed");
        }
    }

    /// Uploads (or reuses) the property blob for a mode. One blob is cached
    /// per CRTC; a new mode replaces and destroys the old blob.
    pub(crate) fn mode_blob(&self, crtc_index: usize, mode: &Mode) -> Result<u64> {
        {
            let state = self.state.lock();
            if let Some((cached, id)) = &state.crtcs[crtc_index].mode_blob {
                if cached == mode {
                    return Ok(*id);
                }
            }
        }

        let value = {
            let _guard = self.ioctl.lock();
            self.fd
                .create_property_blob(mode)
                .map_err(|e| Error::Io(e.into()))?
        };

        let id = match value {
            drm::control::property::Value::Blob(id) => id,
            drm::control::property::Value::Unknown(id) => id,
            other => {
                warn!(?other, "unexpected property blob value");
                return Err(Error::Io(io::Error::other("bad mode blob")));
            }
        };

        let old = {
            let mut state = self.state.lock();
            state.crtcs[crtc_index].mode_blob.replace((*mode, id))
        };

        if let Some((_, old_id)) = old {
            let _guard = self.ioctl.lock();
            if let Err(err) = self.fd.destroy_property_blob(old_id) {
                warn!(old_id, ?err, "destroying stale mode blob failed");
            }
        }

        Ok(id)
    }

    // Scanout slot management.

    pub(crate) fn park_scanout(&self, crtc_index: usize, pending: PendingScanout) {
        let displaced = {
            let mut state = self.state.lock();
            state.crtcs[crtc_index].pending.replace(pending)
        };

        if let Some(displaced) = displaced {
            // A commit raced past the previous frame's scanout event. Settle
            // the old frame now so its producers don't leak.
            warn!(crtc_index, "scanout slot already occupied, settling old frame");
            run_scanout(displaced, monotonic_ns());
        }
    }

    pub(crate) fn unpark_scanout(&self, crtc_index: usize) -> Vec<ReleaseCallback> {
        let mut state = self.state.lock();
        match state.crtcs[crtc_index].pending.take() {
            Some(pending) => pending.releases,
            None => Vec::new(),
        }
    }

    /// Queues a synthetic scanout event for commits that completed
    /// synchronously, so they're delivered on the event loop like real ones.
    /// Without an event loop attached, delivery is inline.
    pub(crate) fn post_synthetic_scanout(self: &Arc<Self>, crtc_index: usize) {
        let timestamp_ns = monotonic_ns();
        let sender = self.state.lock().loop_sender.clone();
        match sender {
            Some(sender) => {
                if sender
                    .send(LoopEvent::Scanout {
                        crtc_index,
                        timestamp_ns,
                    })
                    .is_err()
                {
                    self.complete_scanout(crtc_index, timestamp_ns);
                }
            }
            None => self.complete_scanout(crtc_index, timestamp_ns),
        }
    }

    /// Fires the parked scanout callback for a CRTC. Runs outside the device
    /// locks; release callbacks run after the scanout callback, most recent
    /// first.
    pub(crate) fn complete_scanout(&self, crtc_index: usize, timestamp_ns: u64) {
        let pending = {
            let mut state = self.state.lock();
            state.crtcs[crtc_index].pending.take()
        };

        match pending {
            Some(pending) => run_scanout(pending, timestamp_ns),
            None => trace!(crtc_index, "scanout event with no parked frame"),
        }
    }

    /// Whether any CRTC still has a frame in flight.
    pub fn has_pending_scanouts(&self) -> bool {
        self.state.lock().crtcs.iter().any(|c| c.pending.is_some())
    }

    /// Reads and dispatches pending device events. Called by the event loop
    /// when the fd is readable.
    pub fn dispatch_events(&self) -> Result<()> {
        let events: Vec<(crtc::Handle, u64)> = {
            let _guard = self.ioctl.lock();
            self.fd
                .receive_events()?
                .filter_map(|event| match event {
                    Event::PageFlip(flip) => {
                        Some((flip.crtc, flip.duration.as_nanos() as u64))
                    }
                    _ => None,
                })
                .collect()
        };

        for (crtc, timestamp_ns) in events {
            trace!(?crtc, timestamp_ns, "page flip");
            match self.resources.crtc_index(crtc) {
                Some(index) => self.complete_scanout(index, timestamp_ns),
                None => warn!(?crtc, "page flip for unknown CRTC"),
            }
        }

        Ok(())
    }
}

impl Drop for KmsDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for slot in state.crtcs.iter_mut() {
            if let Some(pending) = slot.pending.take() {
                run_scanout(pending, monotonic_ns());
            }

            if let Some((_, id)) = slot.mode_blob.take() {
                let _ = self.fd.destroy_property_blob(id);
            }
        }
    }
}

fn run_scanout(pending: PendingScanout, timestamp_ns: u64) {
    (pending.on_scanout)(timestamp_ns);
    for release in pending.releases.into_iter().rev() {
        release();
    }
}

/// The current CLOCK_MONOTONIC time in nanoseconds, matching the timestamps
/// the kernel puts on page-flip events.
pub fn monotonic_ns() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
