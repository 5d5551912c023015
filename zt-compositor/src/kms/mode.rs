// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Output selection: find a connected connector, choose a mode (honoring an
//! optional "WxH@Hz" or "WxH" request), and pair it with an encoder and CRTC.

use drm::control::{Mode, ModeFlags, ModeTypeFlags};
use tracing::{debug, warn};

use super::resources::Resources;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct OutputSelection {
    pub connector_index: usize,
    pub encoder_index: usize,
    pub crtc_index: usize,
    pub mode_index: usize,
}

/// The refresh rate with the decimals the integer `vrefresh` field drops.
pub fn precise_vrefresh(mode: &Mode) -> f64 {
    let htotal = mode.hsync().2 as f64;
    let vtotal = mode.vsync().2 as f64;
    if htotal == 0.0 || vtotal == 0.0 {
        return mode.vrefresh() as f64;
    }

    mode.clock() as f64 * 1000.0 / (htotal * vtotal)
}

/// Picks the mode matching a "WxH@Hz" or "WxH" request, preferring the
/// highest precise refresh rate among equal matches. Returns None if nothing
/// matches.
fn select_requested_mode(modes: &[Mode], desired: &str) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, mode) in modes.iter().enumerate() {
        let (w, h) = mode.size();
        let modeline = format!("{}x{}@{}", w, h, mode.vrefresh());
        let modeline_nohz = format!("{}x{}", w, h);

        if modeline == desired || modeline_nohz == desired {
            // The refresh rate can still vary in the decimal places.
            match best {
                Some(prev) if precise_vrefresh(&modes[prev]) >= precise_vrefresh(mode) => (),
                _ => best = Some(index),
            }
        }
    }

    best
}

/// Picks the PREFERRED mode if the driver flags one; otherwise the mode with
/// the largest area, breaking ties by refresh rate and then by progressive
/// scanout.
fn select_default_mode(modes: &[Mode]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, mode) in modes.iter().enumerate() {
        if mode.mode_type().contains(ModeTypeFlags::PREFERRED) {
            return Some(index);
        }

        let Some(prev) = best else {
            best = Some(index);
            continue;
        };

        let prev = &modes[prev];
        let area = mode.size().0 as u32 * mode.size().1 as u32;
        let prev_area = prev.size().0 as u32 * prev.size().1 as u32;

        let better = area > prev_area
            || (area == prev_area && mode.vrefresh() > prev.vrefresh())
            || (area == prev_area
                && mode.vrefresh() == prev.vrefresh()
                && !mode.flags().contains(ModeFlags::INTERLACE)
                && prev.flags().contains(ModeFlags::INTERLACE));

        if better {
            best = Some(index);
        }
    }

    best
}

pub fn select_mode(modes: &[Mode], desired_videomode: Option<&str>) -> Result<usize> {
    if let Some(desired) = desired_videomode {
        if let Some(index) = select_requested_mode(modes, desired) {
            return Ok(index);
        }

        warn!(
            desired,
            "no videomode matching the request, falling back to the display preferred mode"
        );
    }

    select_default_mode(modes).ok_or(Error::NoMode)
}

/// Selects the full output pipeline: the first connected connector, a mode
/// for it, the encoder it's wired to (or any it supports), and a CRTC that
/// can drive that encoder.
pub fn select_output(
    resources: &Resources,
    desired_videomode: Option<&str>,
) -> Result<OutputSelection> {
    let connector_index = resources
        .connectors
        .iter()
        .position(|c| c.connected)
        .ok_or(Error::NoConnector)?;
    let connector = &resources.connectors[connector_index];

    let mode_index = select_mode(&connector.modes, desired_videomode)?;

    // Prefer the encoder currently linked to the connector.
    let mut encoder_index = connector.current_encoder.and_then(|current| {
        resources
            .encoders
            .iter()
            .position(|e| e.handle == current)
    });

    if encoder_index.is_none() {
        encoder_index = connector.encoders.iter().find_map(|handle| {
            resources
                .encoders
                .iter()
                .position(|e| e.handle == *handle && e.possible_crtcs != 0)
        });
    }

    let encoder_index = encoder_index.ok_or(Error::NoCrtc)?;
    let encoder = &resources.encoders[encoder_index];

    // Prefer the CRTC currently linked to the encoder.
    let mut crtc_index = encoder
        .crtc
        .and_then(|current| resources.crtcs.iter().position(|c| c.handle == current));

    if crtc_index.is_none() {
        crtc_index = resources
            .crtcs
            .iter()
            .position(|c| c.bitmask & encoder.possible_crtcs != 0);
    }

    let crtc_index = crtc_index.ok_or(Error::NoCrtc)?;

    let mode = &connector.modes[mode_index];
    debug!(
        connector = ?connector.handle,
        crtc = ?resources.crtcs[crtc_index].handle,
        mode = ?mode.name(),
        width = mode.size().0,
        height = mode.size().1,
        refresh = precise_vrefresh(mode),
        "selected output"
    );

    Ok(OutputSelection {
        connector_index,
        encoder_index,
        crtc_index,
        mode_index,
    })
}

/// The connector's physical dimensions, with two heuristics: dimensions that
/// are both multiples of 10 (160x90, 150x100) are usually made up by the
/// driver and treated as absent, and a DSI connector reporting 0x0 is assumed
/// to be the well-known 7" panel at 155x86mm.
pub fn connector_dimensions_mm(
    interface: drm::control::connector::Interface,
    size_mm: Option<(u32, u32)>,
) -> Option<(u32, u32)> {
    use drm::control::connector::Interface;

    match size_mm {
        Some((w, h)) if w % 10 != 0 || h % 10 != 0 => Some((w, h)),
        None if interface == Interface::DSI => Some((155, 86)),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    const PREFERRED: u32 = 1 << 3;
    const INTERLACE: u32 = 1 << 4;

    #[test]
    fn test_preferred_mode_wins() {
        let modes = vec![
            test_mode(3840, 2160, 30, 0, 0),
            test_mode(1920, 1080, 60, PREFERRED, 0),
            test_mode(1920, 1080, 144, 0, 0),
        ];

        assert_eq!(select_mode(&modes, None).unwrap(), 1);
    }

    #[test]
    fn test_default_ordering() {
        // No preferred flag: the largest area wins, then refresh, then
        // progressive scanout.
        let modes = vec![
            test_mode(1280, 720, 60, 0, 0),
            test_mode(1920, 1080, 30, 0, INTERLACE),
            test_mode(1920, 1080, 30, 0, 0),
            test_mode(1920, 1080, 60, 0, 0),
        ];

        assert_eq!(select_mode(&modes, None).unwrap(), 3);

        let modes = vec![
            test_mode(1920, 1080, 30, 0, INTERLACE),
            test_mode(1920, 1080, 30, 0, 0),
        ];
        assert_eq!(select_mode(&modes, None).unwrap(), 1);
    }

    #[test]
    fn test_requested_videomode() {
        let modes = vec![
            test_mode(1920, 1080, 60, PREFERRED, 0),
            test_mode(1280, 720, 60, 0, 0),
            test_mode(1280, 720, 75, 0, 0),
        ];

        assert_eq!(select_mode(&modes, Some("1280x720@75")).unwrap(), 2);
        // Without a refresh, the highest matching refresh wins.
        assert_eq!(select_mode(&modes, Some("1280x720")).unwrap(), 2);
        // An unmatched request falls back to the preferred mode.
        assert_eq!(select_mode(&modes, Some("640x480")).unwrap(), 0);
    }

    #[test]
    fn test_no_usable_mode() {
        assert!(matches!(select_mode(&[], None), Err(Error::NoMode)));
    }

    #[test]
    fn test_connector_dimensions() {
        use drm::control::connector::Interface;

        // Not multiples of ten: genuine.
        assert_eq!(
            connector_dimensions_mm(Interface::HDMIA, Some((344, 193))),
            Some((344, 193))
        );
        // Multiples of ten: bogus.
        assert_eq!(connector_dimensions_mm(Interface::HDMIA, Some((160, 90))), None);
        // The 7" DSI panel heuristic.
        assert_eq!(
            connector_dimensions_mm(Interface::DSI, None),
            Some((155, 86))
        );
        assert_eq!(connector_dimensions_mm(Interface::HDMIA, None), None);
    }
}
