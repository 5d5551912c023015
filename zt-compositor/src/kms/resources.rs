// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A typed snapshot of the device's connectors, encoders, CRTCs and planes,
//! with the property handles we care about resolved once at open. References
//! between objects are indices into the snapshot's vectors; the snapshot is
//! immutable for the lifetime of the device.

use std::io;

use drm::control::{
    connector, crtc, encoder, plane, property, Device as ControlDevice, Mode, PlaneType,
};
use drm::Device as _;
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace, warn};

use crate::geometry::PlaneTransform;

#[derive(Debug)]
pub struct Resources {
    pub connectors: Vec<Connector>,
    pub encoders: Vec<Encoder>,
    pub crtcs: Vec<Crtc>,
    pub planes: Vec<Plane>,
}

#[derive(Debug)]
pub struct Connector {
    pub handle: connector::Handle,
    pub interface: connector::Interface,
    pub connected: bool,
    /// Physical dimensions in millimeters, as reported by the connector.
    pub size_mm: Option<(u32, u32)>,
    pub modes: Vec<Mode>,
    pub encoders: Vec<encoder::Handle>,
    pub current_encoder: Option<encoder::Handle>,
    pub prop_crtc_id: Option<property::Handle>,
}

#[derive(Debug)]
pub struct Encoder {
    pub handle: encoder::Handle,
    pub crtc: Option<crtc::Handle>,
    pub possible_crtcs: u32,
}

#[derive(Debug)]
pub struct Crtc {
    pub handle: crtc::Handle,
    /// `1 << index`; stable for the lifetime of the device.
    pub bitmask: u32,
    pub prop_mode_id: Option<property::Handle>,
    pub prop_active: Option<property::Handle>,
    /// Whether a CURSOR-type plane can scan out on this CRTC.
    pub supports_hardware_cursor: bool,
    pub min_zpos: i64,
    pub max_zpos: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneFormat {
    pub code: DrmFourcc,
    pub modifier: Option<DrmModifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZposKind {
    Immutable,
    SignedRange,
    UnsignedRange,
}

#[derive(Debug, Clone, Copy)]
pub struct ZposInfo {
    pub prop: property::Handle,
    pub kind: ZposKind,
    pub min: i64,
    pub max: i64,
}

/// The per-plane property handles written by the atomic request builder.
/// `None` means the driver doesn't expose the property.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaneProps {
    pub crtc_id: Option<property::Handle>,
    pub fb_id: Option<property::Handle>,
    pub src_x: Option<property::Handle>,
    pub src_y: Option<property::Handle>,
    pub src_w: Option<property::Handle>,
    pub src_h: Option<property::Handle>,
    pub crtc_x: Option<property::Handle>,
    pub crtc_y: Option<property::Handle>,
    pub crtc_w: Option<property::Handle>,
    pub crtc_h: Option<property::Handle>,
    pub rotation: Option<property::Handle>,
    pub in_fence_fd: Option<property::Handle>,
}

#[derive(Debug)]
pub struct Plane {
    pub handle: plane::Handle,
    pub kind: PlaneType,
    pub possible_crtcs: u32,
    pub formats: Vec<PlaneFormat>,
    pub props: PlaneProps,
    pub zpos: Option<ZposInfo>,
    /// Rotation values the plane advertises, if it has a rotation property.
    pub rotations: PlaneTransform,
}

impl Plane {
    pub fn supports_format(&self, code: DrmFourcc, modifier: Option<DrmModifier>) -> bool {
        match modifier {
            Some(modifier) => self
                .formats
                .iter()
                .any(|f| f.code == code && f.modifier == Some(modifier)),
            None => self.formats.iter().any(|f| f.code == code),
        }
    }

    pub fn supports_rotation(&self, rotation: PlaneTransform) -> bool {
        self.props.rotation.is_some() && self.rotations.contains(rotation)
    }

    pub fn supports_setting_zpos(&self) -> bool {
        matches!(
            self.zpos,
            Some(ZposInfo {
                kind: ZposKind::SignedRange | ZposKind::UnsignedRange,
                ..
            })
        )
    }

    pub fn min_zpos(&self) -> Option<i64> {
        self.zpos.map(|z| z.min)
    }

    pub fn max_zpos(&self) -> Option<i64> {
        self.zpos.map(|z| z.max)
    }
}

impl Resources {
    /// Enumerates all resources and resolves property handles. Called once at
    /// device open; all ioctls happen here.
    pub fn snapshot<D: ControlDevice>(dev: &D) -> io::Result<Self> {
        let res = dev.resource_handles()?;

        let mut connectors = Vec::with_capacity(res.connectors().len());
        for handle in res.connectors() {
            let info = dev.get_connector(*handle, false)?;
            let prop_crtc_id = find_prop(dev, *handle, "CRTC_ID");

            connectors.push(Connector {
                handle: *handle,
                interface: info.interface(),
                connected: info.state() == connector::State::Connected,
                size_mm: match info.size() {
                    Some((0, 0)) | None => None,
                    Some(dims) => Some(dims),
                },
                modes: info.modes().to_vec(),
                encoders: info.encoders().to_vec(),
                current_encoder: info.current_encoder(),
                prop_crtc_id,
            });
        }

        let mut encoders = Vec::with_capacity(res.encoders().len());
        for handle in res.encoders() {
            let info = dev.get_encoder(*handle)?;
            encoders.push(Encoder {
                handle: *handle,
                crtc: info.crtc(),
                possible_crtcs: crtc_bitmask(&res.filter_crtcs(info.possible_crtcs()), res.crtcs()),
            });
        }

        let mut crtcs = Vec::with_capacity(res.crtcs().len());
        for (index, handle) in res.crtcs().iter().enumerate() {
            crtcs.push(Crtc {
                handle: *handle,
                bitmask: 1 << index,
                prop_mode_id: find_prop(dev, *handle, "MODE_ID"),
                prop_active: find_prop(dev, *handle, "ACTIVE"),
                supports_hardware_cursor: false,
                min_zpos: 0,
                max_zpos: 0,
            });
        }

        let supports_modifiers = matches!(
            dev.get_driver_capability(drm::DriverCapability::AddFB2Modifiers),
            Ok(1)
        );

        let mut planes = Vec::new();
        for handle in dev.plane_handles()? {
            let info = dev.get_plane(handle)?;
            let possible_crtcs =
                crtc_bitmask(&res.filter_crtcs(info.possible_crtcs()), res.crtcs());

            let mut formats: Vec<PlaneFormat> = info
                .formats()
                .iter()
                .filter_map(|raw| DrmFourcc::try_from(*raw).ok())
                .map(|code| PlaneFormat {
                    code,
                    modifier: None,
                })
                .collect();

            let mut kind = PlaneType::Overlay;
            let mut props = PlaneProps::default();
            let mut zpos = None;
            let mut rotations = PlaneTransform::empty();

            let set = dev.get_properties(handle)?;
            let (prop_handles, raw_values) = set.as_props_and_values();
            for (prop, raw) in prop_handles.iter().zip(raw_values.iter()) {
                let Ok(prop_info) = dev.get_property(*prop) else {
                    continue;
                };

                let Ok(name) = prop_info.name().to_str() else {
                    continue;
                };

                match name {
                    "type" => {
                        kind = match *raw as u32 {
                            v if v == PlaneType::Primary as u32 => PlaneType::Primary,
                            v if v == PlaneType::Cursor as u32 => PlaneType::Cursor,
                            _ => PlaneType::Overlay,
                        };
                    }
                    "CRTC_ID" => props.crtc_id = Some(*prop),
                    "FB_ID" => props.fb_id = Some(*prop),
                    "SRC_X" => props.src_x = Some(*prop),
                    "SRC_Y" => props.src_y = Some(*prop),
                    "SRC_W" => props.src_w = Some(*prop),
                    "SRC_H" => props.src_h = Some(*prop),
                    "CRTC_X" => props.crtc_x = Some(*prop),
                    "CRTC_Y" => props.crtc_y = Some(*prop),
                    "CRTC_W" => props.crtc_w = Some(*prop),
                    "CRTC_H" => props.crtc_h = Some(*prop),
                    "IN_FENCE_FD" => props.in_fence_fd = Some(*prop),
                    "zpos" => {
                        zpos = match prop_info.value_type() {
                            property::ValueType::SignedRange(min, max) => Some(ZposInfo {
                                prop: *prop,
                                kind: if prop_info.mutable() {
                                    ZposKind::SignedRange
                                } else {
                                    ZposKind::Immutable
                                },
                                min,
                                max,
                            }),
                            property::ValueType::UnsignedRange(min, max) => Some(ZposInfo {
                                prop: *prop,
                                kind: if prop_info.mutable() {
                                    ZposKind::UnsignedRange
                                } else {
                                    ZposKind::Immutable
                                },
                                min: min as i64,
                                max: max as i64,
                            }),
                            _ => Some(ZposInfo {
                                prop: *prop,
                                kind: ZposKind::Immutable,
                                min: *raw as i64,
                                max: *raw as i64,
                            }),
                        };
                    }
                    "rotation" => {
                        props.rotation = Some(*prop);
                        if let property::ValueType::Bitmask = prop_info.value_type() {
                            // The supported bits are the union of the
                            // advertised enum values.
                            rotations = PlaneTransform::from_bits_truncate(!0u8);
                        }

                        if let property::ValueType::Enum(values) = prop_info.value_type() {
                            let (raw_bits, _) = values.values();
                            let mut bits = PlaneTransform::empty();
                            for bit in raw_bits {
                                bits |= PlaneTransform::from_bits_truncate(1 << bit);
                            }
                            rotations = bits;
                        }
                    }
                    "IN_FORMATS" if supports_modifiers => {
                        if let property::ValueType::Blob = prop_info.value_type() {
                            match read_format_modifiers(dev, *raw) {
                                Ok(pairs) => formats.extend(pairs),
                                Err(err) => {
                                    warn!(?handle, ?err, "failed to read IN_FORMATS blob")
                                }
                            }
                        }
                    }
                    _ => (),
                }
            }

            trace!(
                plane = ?handle,
                ?kind,
                possible_crtcs,
                formats = formats.len(),
                "snapshotted plane"
            );

            planes.push(Plane {
                handle,
                kind,
                possible_crtcs,
                formats,
                props,
                zpos,
                rotations,
            });
        }

        // Derive the per-CRTC cursor support and zpos range from the planes
        // that can scan out on it.
        for crtc in crtcs.iter_mut() {
            let compatible = planes
                .iter()
                .filter(|p| p.possible_crtcs & crtc.bitmask != 0)
                .collect::<Vec<_>>();

            crtc.supports_hardware_cursor =
                compatible.iter().any(|p| p.kind == PlaneType::Cursor);

            let ranges = compatible.iter().filter_map(|p| p.zpos).collect::<Vec<_>>();
            if ranges.is_empty() {
                crtc.min_zpos = 0;
                crtc.max_zpos = compatible.len().saturating_sub(1) as i64;
            } else {
                crtc.min_zpos = ranges.iter().map(|z| z.min).min().unwrap();
                crtc.max_zpos = ranges.iter().map(|z| z.max).max().unwrap();
            }
        }

        debug!(
            connectors = connectors.len(),
            encoders = encoders.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "snapshotted KMS resources"
        );

        Ok(Self {
            connectors,
            encoders,
            crtcs,
            planes,
        })
    }

    pub fn crtc_index(&self, handle: crtc::Handle) -> Option<usize> {
        self.crtcs.iter().position(|c| c.handle == handle)
    }

    /// Indices of the planes that can scan out on the given CRTC.
    pub fn planes_for_crtc(&self, crtc_index: usize) -> impl Iterator<Item = usize> + '_ {
        let bitmask = self.crtcs[crtc_index].bitmask;
        self.planes
            .iter()
            .enumerate()
            .filter_map(move |(i, p)| (p.possible_crtcs & bitmask != 0).then_some(i))
    }
}

fn crtc_bitmask(filtered: &[crtc::Handle], all: &[crtc::Handle]) -> u32 {
    let mut mask = 0;
    for handle in filtered {
        if let Some(index) = all.iter().position(|h| h == handle) {
            mask |= 1 << index;
        }
    }

    mask
}

fn find_prop<D: ControlDevice, H>(dev: &D, handle: H, name: &str) -> Option<property::Handle>
where
    H: drm::control::ResourceHandle,
{
    let set = dev.get_properties(handle).ok()?;
    let (prop_handles, _) = set.as_props_and_values();
    for prop in prop_handles {
        if let Ok(info) = dev.get_property(*prop) {
            if info.name().to_str().map(|n| n == name).unwrap_or(false) {
                return Some(*prop);
            }
        }
    }

    None
}

/// Parses the IN_FORMATS blob into format/modifier pairs. The blob layout has
/// no alignment guarantees, so everything is read unaligned.
fn read_format_modifiers<D: ControlDevice>(
    dev: &D,
    blob_id: u64,
) -> io::Result<Vec<PlaneFormat>> {
    let data = dev.get_property_blob(blob_id)?;
    let mut out = Vec::new();

    unsafe {
        let blob_ptr = data.as_ptr() as *const drm_ffi::drm_format_modifier_blob;
        let blob = blob_ptr.read_unaligned();

        let formats_ptr =
            (blob_ptr as *const u8).offset(blob.formats_offset as isize) as *const u32;
        let modifiers_ptr = (blob_ptr as *const u8).offset(blob.modifiers_offset as isize)
            as *const drm_ffi::drm_format_modifier;

        for i in 0..blob.count_modifiers {
            let info = modifiers_ptr.offset(i as isize).read_unaligned();
            for bit in 0..64u64 {
                if info.formats & (1 << bit) == 0 {
                    continue;
                }

                let raw = formats_ptr
                    .offset((bit + info.offset as u64) as isize)
                    .read_unaligned();
                if let Ok(code) = DrmFourcc::try_from(raw) {
                    out.push(PlaneFormat {
                        code,
                        modifier: Some(DrmModifier::from(info.modifier)),
                    });
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::num::NonZeroU32;

    use super::*;

    pub fn plane_handle(id: u32) -> plane::Handle {
        plane::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn crtc_handle(id: u32) -> crtc::Handle {
        crtc::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn prop_handle(id: u32) -> property::Handle {
        property::Handle::from(NonZeroU32::new(id).unwrap())
    }

    pub fn fb_handle(id: u32) -> drm::control::framebuffer::Handle {
        drm::control::framebuffer::Handle::from(NonZeroU32::new(id).unwrap())
    }

    /// A plane with every property the builder writes, supporting the given
    /// formats without modifiers.
    pub fn test_plane(
        id: u32,
        kind: PlaneType,
        possible_crtcs: u32,
        formats: &[DrmFourcc],
    ) -> Plane {
        Plane {
            handle: plane_handle(id),
            kind,
            possible_crtcs,
            formats: formats
                .iter()
                .map(|code| PlaneFormat {
                    code: *code,
                    modifier: None,
                })
                .collect(),
            props: PlaneProps {
                crtc_id: Some(prop_handle(100 + id * 16)),
                fb_id: Some(prop_handle(101 + id * 16)),
                src_x: Some(prop_handle(102 + id * 16)),
                src_y: Some(prop_handle(103 + id * 16)),
                src_w: Some(prop_handle(104 + id * 16)),
                src_h: Some(prop_handle(105 + id * 16)),
                crtc_x: Some(prop_handle(106 + id * 16)),
                crtc_y: Some(prop_handle(107 + id * 16)),
                crtc_w: Some(prop_handle(108 + id * 16)),
                crtc_h: Some(prop_handle(109 + id * 16)),
                rotation: None,
                in_fence_fd: None,
            },
            zpos: Some(ZposInfo {
                prop: prop_handle(110 + id * 16),
                kind: ZposKind::UnsignedRange,
                min: 0,
                max: 7,
            }),
            rotations: PlaneTransform::ROTATE_0,
        }
    }

    pub fn test_crtc(id: u32, index: usize, supports_hardware_cursor: bool) -> Crtc {
        Crtc {
            handle: crtc_handle(id),
            bitmask: 1 << index,
            prop_mode_id: Some(prop_handle(50 + id)),
            prop_active: Some(prop_handle(60 + id)),
            supports_hardware_cursor,
            min_zpos: 0,
            max_zpos: 7,
        }
    }

    pub fn test_resources(crtcs: Vec<Crtc>, planes: Vec<Plane>) -> Resources {
        Resources {
            connectors: Vec::new(),
            encoders: Vec::new(),
            crtcs,
            planes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    #[test]
    fn test_format_queries() {
        let mut plane = test_plane(1, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888]);
        plane.formats.push(PlaneFormat {
            code: DrmFourcc::Xrgb8888,
            modifier: Some(DrmModifier::Linear),
        });

        assert!(plane.supports_format(DrmFourcc::Argb8888, None));
        assert!(!plane.supports_format(DrmFourcc::Argb8888, Some(DrmModifier::Linear)));
        assert!(plane.supports_format(DrmFourcc::Xrgb8888, Some(DrmModifier::Linear)));
        assert!(plane.supports_format(DrmFourcc::Xrgb8888, None));
        assert!(!plane.supports_format(DrmFourcc::Nv12, None));
    }

    #[test]
    fn test_zpos_queries() {
        let plane = test_plane(1, PlaneType::Overlay, 0b1, &[DrmFourcc::Argb8888]);
        assert!(plane.supports_setting_zpos());
        assert_eq!(plane.min_zpos(), Some(0));
        assert_eq!(plane.max_zpos(), Some(7));

        let mut immutable = test_plane(2, PlaneType::Overlay, 0b1, &[DrmFourcc::Argb8888]);
        immutable.zpos = Some(ZposInfo {
            prop: prop_handle(9),
            kind: ZposKind::Immutable,
            min: 2,
            max: 2,
        });
        assert!(!immutable.supports_setting_zpos());
    }

    #[test]
    fn test_planes_for_crtc() {
        let resources = test_resources(
            vec![test_crtc(1, 0, false), test_crtc(2, 1, false)],
            vec![
                test_plane(10, PlaneType::Primary, 0b01, &[DrmFourcc::Argb8888]),
                test_plane(11, PlaneType::Primary, 0b10, &[DrmFourcc::Argb8888]),
                test_plane(12, PlaneType::Overlay, 0b11, &[DrmFourcc::Argb8888]),
            ],
        );

        assert_eq!(resources.planes_for_crtc(0).collect::<Vec<_>>(), [0, 2]);
        assert_eq!(resources.planes_for_crtc(1).collect::<Vec<_>>(), [1, 2]);
    }
}
