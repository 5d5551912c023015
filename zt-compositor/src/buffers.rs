// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Scanout buffers and their KMS framebuffer lifecycle. A [DisplayBuffer]
//! wraps a GBM BO, a dumb buffer, or a bare GEM handle, and carries the
//! framebuffer id for it; the id is created exactly once per buffer and torn
//! down exactly once. For GBM BOs, the framebuffer id is cached as BO
//! userdata, so a BO cycling back out of a swapchain reuses its id instead of
//! re-importing.

use std::num::NonZeroU32;
use std::sync::{Arc, Weak};

use drm::control::{framebuffer, FbCmd2Flags};
use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::UVec2;
use parking_lot::Mutex;
use slotmap::SlotMap;
use tracing::{trace, warn};

use crate::kms::KmsDevice;
use crate::{Error, Result};

slotmap::new_key_type! { pub struct BufferKey; }

#[derive(Debug, Clone, Copy)]
pub struct BufferInfo {
    pub size: UVec2,
    pub format: DrmFourcc,
}

/// Tracks the buffers alive on a device. The registry holds metadata only;
/// producers own the buffers themselves.
#[derive(Default)]
pub struct BufferRegistry {
    inner: Mutex<SlotMap<BufferKey, BufferInfo>>,
}

impl BufferRegistry {
    fn register(&self, info: BufferInfo) -> BufferKey {
        self.inner.lock().insert(info)
    }

    fn unregister(&self, key: BufferKey) {
        self.inner.lock().remove(key);
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A framebuffer id stashed as GBM BO userdata. Dropped together with the BO,
/// which is when the id is removed.
pub struct CachedFb {
    fb: framebuffer::Handle,
    device: Weak<KmsDevice>,
}

impl Drop for CachedFb {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade() {
            device.destroy_framebuffer(self.fb);
        }
    }
}

enum BufferBacking {
    Gbm {
        bo: gbm::BufferObject<CachedFb>,
    },
    Dumb {
        buffer: Option<drm::control::dumbbuffer::DumbBuffer>,
    },
    /// A framebuffer created over a bare GEM handle.
    Gem,
    /// A framebuffer some other owner manages; we never remove it.
    External,
}

pub struct DisplayBuffer {
    device: Weak<KmsDevice>,
    key: Option<BufferKey>,
    fb: framebuffer::Handle,
    size: UVec2,
    format: DrmFourcc,
    modifier: Option<DrmModifier>,
    backing: BufferBacking,
    destroy_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DisplayBuffer {
    /// Allocates a GBM BO and imports it as a framebuffer.
    pub fn allocate_gbm(
        device: &Arc<KmsDevice>,
        size: UVec2,
        format: DrmFourcc,
        flags: gbm::BufferObjectFlags,
    ) -> Result<Self> {
        let bo = device
            .with_gbm(|gbm| gbm.create_buffer_object::<CachedFb>(size.x, size.y, format, flags))
            .map_err(|e| Error::Io(e))?;

        Self::from_gbm_bo(device, bo)
    }

    /// Wraps an existing GBM BO, reusing a cached framebuffer id if this BO
    /// has been imported before.
    pub fn from_gbm_bo(
        device: &Arc<KmsDevice>,
        mut bo: gbm::BufferObject<CachedFb>,
    ) -> Result<Self> {
        let fb = import_gbm_fb(device, &mut bo)?;
        let size = UVec2::new(bo.width(), bo.height());
        let format = bo.format();
        let modifier = match bo.modifier() {
            DrmModifier::Invalid => None,
            modifier => Some(modifier),
        };

        Ok(Self {
            device: Arc::downgrade(device),
            key: Some(device.registry().register(BufferInfo { size, format })),
            fb,
            size,
            format,
            modifier,
            backing: BufferBacking::Gbm { bo },
            destroy_cb: Mutex::new(None),
        })
    }

    /// Allocates a CPU-mapped dumb buffer and wraps it as a framebuffer.
    pub fn allocate_dumb(device: &Arc<KmsDevice>, size: UVec2, format: DrmFourcc) -> Result<Self> {
        let buffer = device.create_dumb_buffer((size.x, size.y), format)?;

        let depth = match format {
            DrmFourcc::Xrgb8888 => 24,
            _ => 32,
        };

        let fb = match device.add_framebuffer(&buffer, depth, 32) {
            Ok(fb) => fb,
            Err(err) => {
                device.destroy_dumb_buffer(buffer);
                return Err(Error::Io(err));
            }
        };

        Ok(Self {
            device: Arc::downgrade(device),
            key: Some(device.registry().register(BufferInfo { size, format })),
            fb,
            size,
            format,
            modifier: None,
            backing: BufferBacking::Dumb {
                buffer: Some(buffer),
            },
            destroy_cb: Mutex::new(None),
        })
    }

    /// Wraps a bare GEM handle as a framebuffer.
    pub fn from_gem_handle(
        device: &Arc<KmsDevice>,
        handle: u32,
        size: UVec2,
        format: DrmFourcc,
        pitch: u32,
    ) -> Result<Self> {
        let handle = NonZeroU32::new(handle)
            .map(drm::buffer::Handle::from)
            .ok_or_else(|| Error::Io(std::io::Error::other("null GEM handle")))?;

        let gem = GemBuffer {
            handle,
            size,
            format,
            pitch,
        };

        let depth = match format {
            DrmFourcc::Xrgb8888 => 24,
            _ => 32,
        };

        let fb = device.add_framebuffer(&gem, depth, 32)?;
        Ok(Self {
            device: Arc::downgrade(device),
            key: Some(device.registry().register(BufferInfo { size, format })),
            fb,
            size,
            format,
            modifier: None,
            backing: BufferBacking::Gem,
            destroy_cb: Mutex::new(None),
        })
    }

    /// Wraps a framebuffer whose lifecycle someone else owns.
    pub fn external(fb: framebuffer::Handle, size: UVec2, format: DrmFourcc) -> Self {
        Self {
            device: Weak::new(),
            key: None,
            fb,
            size,
            format,
            modifier: None,
            backing: BufferBacking::External,
            destroy_cb: Mutex::new(None),
        }
    }

    pub fn fb(&self) -> framebuffer::Handle {
        self.fb
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    pub fn modifier(&self) -> Option<DrmModifier> {
        self.modifier
    }

    /// The row stride in bytes, for writable backings.
    pub fn stride(&self) -> Option<u32> {
        match &self.backing {
            BufferBacking::Gbm { bo } => Some(bo.stride()),
            BufferBacking::Dumb { buffer } => buffer
                .as_ref()
                .map(|b| drm::buffer::Buffer::pitch(b)),
            _ => None,
        }
    }

    /// Invoked once, right before the framebuffer is torn down.
    pub fn set_destroy_callback(&self, cb: Box<dyn FnOnce() + Send>) {
        *self.destroy_cb.lock() = Some(cb);
    }

    /// Writes pixel data into the buffer. Only GBM- and dumb-backed buffers
    /// are writable.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.backing {
            BufferBacking::Gbm { bo } => bo
                .write(data)
                .map_err(|e| Error::Io(e)),
            BufferBacking::Dumb { buffer } => {
                let device = self
                    .device
                    .upgrade()
                    .ok_or_else(|| Error::Io(std::io::Error::other("device is gone")))?;
                let buffer = buffer.as_mut().expect("dumb buffer taken");
                Ok(device.write_dumb_buffer(buffer, data)?)
            }
            _ => Err(Error::Io(std::io::Error::other("buffer is not writable"))),
        }
    }
}

impl Drop for DisplayBuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying display buffer");

        if let Some(cb) = self.destroy_cb.lock().take() {
            cb();
        }

        if let Some(device) = self.device.upgrade() {
            match &mut self.backing {
                // The BO's userdata owns the framebuffer id.
                BufferBacking::Gbm { .. } => (),
                BufferBacking::Dumb { buffer } => {
                    device.destroy_framebuffer(self.fb);
                    if let Some(buffer) = buffer.take() {
                        device.destroy_dumb_buffer(buffer);
                    }
                }
                BufferBacking::Gem => device.destroy_framebuffer(self.fb),
                BufferBacking::External => (),
            }

            if let Some(key) = self.key {
                device.registry().unregister(key);
            }
        }
    }
}

fn import_gbm_fb(
    device: &Arc<KmsDevice>,
    bo: &mut gbm::BufferObject<CachedFb>,
) -> Result<framebuffer::Handle> {
    if let Some(cached) = bo.userdata() {
        trace!(fb = ?cached.fb, "reusing cached framebuffer id");
        return Ok(cached.fb);
    }

    let flags = if bo.modifier() == DrmModifier::Invalid {
        FbCmd2Flags::empty()
    } else {
        FbCmd2Flags::MODIFIERS
    };

    // On failure the userdata stays unset, so the import can be retried next
    // frame without leaking anything.
    let fb = device.add_planar_framebuffer(bo, flags).map_err(|err| {
        warn!(?err, "AddFB2 failed");
        Error::Io(err)
    })?;

    let _ = bo.set_userdata(CachedFb {
        fb,
        device: Arc::downgrade(device),
    });

    Ok(fb)
}

struct GemBuffer {
    handle: drm::buffer::Handle,
    size: UVec2,
    format: DrmFourcc,
    pitch: u32,
}

impl drm::buffer::Buffer for GemBuffer {
    fn size(&self) -> (u32, u32) {
        (self.size.x, self.size.y)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::kms::resources::test_support::fb_handle;

    #[test]
    fn test_external_buffer_runs_destroy_callback_once() {
        let destroyed = Arc::new(AtomicBool::new(false));
        let destroyed_ = destroyed.clone();

        let buffer = DisplayBuffer::external(
            fb_handle(42),
            UVec2::new(64, 64),
            DrmFourcc::Argb8888,
        );
        buffer.set_destroy_callback(Box::new(move || {
            destroyed_.store(true, Ordering::SeqCst);
        }));

        assert_eq!(buffer.size(), UVec2::new(64, 64));
        drop(buffer);
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_registry_counts() {
        let registry = BufferRegistry::default();
        let key = registry.register(BufferInfo {
            size: UVec2::new(1, 1),
            format: DrmFourcc::Argb8888,
        });
        assert_eq!(registry.live_count(), 1);
        registry.unregister(key);
        assert_eq!(registry.live_count(), 0);
    }
}
