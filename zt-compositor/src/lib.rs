// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A compositor core for an embedded UI-toolkit engine driving a KMS display
//! directly. The engine hands us layer compositions; we translate each one
//! into an atomic (or legacy) commit against the selected CRTC, pace frames
//! off the display's vertical blank, and multiplex platform views and the
//! hardware mouse cursor into the same pool of KMS planes.

pub mod buffers;
pub mod composition;
pub mod compositor;
pub mod cursor;
pub mod events;
pub mod geometry;
pub mod kms;
pub mod platform_views;
pub mod render_targets;
pub mod renderer;
pub mod scheduler;
pub mod window;

pub use composition::{Composition, Layer, LayerContent, ViewMutation};
pub use compositor::{Compositor, FrameSink};
pub use cursor::PointerIcons;
pub use geometry::{Orientation, PlaneTransform, ViewGeometry};
pub use kms::KmsDevice;
pub use renderer::{FrontBuffer, OffscreenSurface, Renderer, WindowSurface};
pub use scheduler::{FrameScheduler, PresentMode};
pub use window::{Window, WindowConfig};

/// The error surface of the compositor core.
///
/// Driver errors that leave us able to make forward progress (EBUSY, commit
/// rejection, cursor rejection, a failing platform view) are recovered where
/// they occur and never abort a session; the variants here are what callers
/// can observe.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no connected connector")]
    NoConnector,
    #[error("no usable mode on the selected connector")]
    NoMode,
    #[error("no CRTC can drive the selected encoder")]
    NoCrtc,
    #[error("atomic commit rejected by the driver")]
    DriverRejected(#[source] std::io::Error),
    #[error("hardware cursor is unavailable")]
    CursorUnavailable,
    #[error("out of KMS planes for the requested layers")]
    ResourceExhausted,
    #[error("platform view {view_id} failed in {phase}")]
    PlatformView { view_id: i64, phase: &'static str },
    #[error("compositor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
