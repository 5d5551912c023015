// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Externally-produced layers composited into the engine's layer tree. Each
//! view registers four callbacks; the registry diffs the layer list frame to
//! frame so a view is mounted and unmounted exactly once, and updated only
//! when its geometry or mutations actually change.

use glam::Vec2;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::composition::{Composition, LayerContent, ViewMutation};
use crate::kms::request::KmsReqBuilder;

/// A platform view's layer as seen this frame. Also kept as the last-frame
/// snapshot for change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewLayer {
    /// The layer's position in the composition, bottom to top.
    pub zpos: i64,
    pub offset: Vec2,
    pub size: Vec2,
    pub mutations: Vec<ViewMutation>,
}

/// The callback quadruple a platform view plugin provides. All callbacks run
/// on the thread presenting the frame, with the frame's request builder, so a
/// view can push its own plane layers.
#[allow(unused_variables)]
pub trait PlatformView: Send {
    fn mount(&mut self, view_id: i64, req: &mut KmsReqBuilder, layer: &ViewLayer) -> anyhow::Result<()> {
        Ok(())
    }

    fn unmount(&mut self, view_id: i64, req: &mut KmsReqBuilder) -> anyhow::Result<()> {
        Ok(())
    }

    fn update_view(
        &mut self,
        view_id: i64,
        req: &mut KmsReqBuilder,
        layer: &ViewLayer,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn present(
        &mut self,
        view_id: i64,
        req: &mut KmsReqBuilder,
        layer: &ViewLayer,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ViewEntry {
    view: Box<dyn PlatformView>,
    was_present_last_frame: bool,
    last: Option<ViewLayer>,
}

#[derive(Default)]
pub struct PlatformViewRegistry {
    views: Mutex<HashMap<i64, ViewEntry>>,
}

impl PlatformViewRegistry {
    /// Registers (or replaces) the callbacks for a view id.
    pub fn put_view(&self, view_id: i64, view: Box<dyn PlatformView>) {
        debug!(view_id, "registered platform view");
        self.views.lock().insert(
            view_id,
            ViewEntry {
                view,
                was_present_last_frame: false,
                last: None,
            },
        );
    }

    pub fn remove_view(&self, view_id: i64) -> bool {
        debug!(view_id, "removed platform view");
        self.views.lock().remove(&view_id).is_some()
    }

    /// Runs the frame's lifecycle callbacks: all unmounts, then all updates,
    /// then all mounts. Present callbacks are issued separately, in layer
    /// order, as the compositor walks the layers.
    ///
    /// Callback failures are logged with the view and phase and never abort
    /// the frame.
    pub fn dispatch_frame(&self, composition: &Composition, req: &mut KmsReqBuilder) {
        let current = frame_layers(composition);
        let mut views = self.views.lock();

        let mut unmounted = Vec::new();
        let mut updated = Vec::new();
        let mut mounted = Vec::new();

        for (view_id, entry) in views.iter() {
            match (current.get(view_id), entry.was_present_last_frame) {
                (None, true) => unmounted.push(*view_id),
                (Some(layer), true) => {
                    if entry.last.as_ref() != Some(layer) {
                        updated.push(*view_id);
                    }
                }
                (Some(_), false) => mounted.push(*view_id),
                (None, false) => (),
            }
        }

        for view_id in unmounted {
            let entry = views.get_mut(&view_id).unwrap();
            trace!(view_id, "unmounting platform view");
            if let Err(err) = entry.view.unmount(view_id, req) {
                error!(view_id, phase = "unmount", ?err, "platform view failed");
            }

            entry.was_present_last_frame = false;
            entry.last = None;
        }

        for view_id in updated {
            let entry = views.get_mut(&view_id).unwrap();
            let layer = current[&view_id].clone();
            trace!(view_id, zpos = layer.zpos, "updating platform view");
            if let Err(err) = entry.view.update_view(view_id, req, &layer) {
                error!(view_id, phase = "update_view", ?err, "platform view failed");
            }

            entry.last = Some(layer);
        }

        for view_id in mounted {
            let entry = views.get_mut(&view_id).unwrap();
            let layer = current[&view_id].clone();
            trace!(view_id, zpos = layer.zpos, "mounting platform view");
            if let Err(err) = entry.view.mount(view_id, req, &layer) {
                error!(view_id, phase = "mount", ?err, "platform view failed");
            }

            entry.was_present_last_frame = true;
            entry.last = Some(layer);
        }
    }

    /// Invokes a view's present callback for its layer.
    pub fn present_view(&self, view_id: i64, layer: &ViewLayer, req: &mut KmsReqBuilder) {
        let mut views = self.views.lock();
        let Some(entry) = views.get_mut(&view_id) else {
            error!(view_id, "composition references an unregistered platform view");
            return;
        };

        if let Err(err) = entry.view.present(view_id, req, layer) {
            error!(view_id, phase = "present", ?err, "platform view failed");
        }
    }
}

/// Collects the platform-view layers of a composition, keyed by view id.
pub fn frame_layers(composition: &Composition) -> HashMap<i64, ViewLayer> {
    let mut out = HashMap::new();
    for (zpos, layer) in composition.layers.iter().enumerate() {
        if let LayerContent::PlatformView { view_id, mutations } = &layer.content {
            out.insert(
                *view_id,
                ViewLayer {
                    zpos: zpos as i64,
                    offset: layer.offset,
                    size: layer.size,
                    mutations: mutations.clone(),
                },
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::composition::Layer;
    use crate::kms::resources::test_support::*;
    use crate::kms::resources::Resources;
    use crate::render_targets::BackingStoreHandle;
    use drm::control::PlaneType;
    use drm_fourcc::DrmFourcc;

    struct RecordingView {
        log: Arc<StdMutex<Vec<String>>>,
        fail_phase: Option<&'static str>,
    }

    impl RecordingView {
        fn record(&self, entry: String, phase: &'static str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(entry);
            if self.fail_phase == Some(phase) {
                anyhow::bail!("scripted failure");
            }

            Ok(())
        }
    }

    impl PlatformView for RecordingView {
        fn mount(
            &mut self,
            view_id: i64,
            _req: &mut KmsReqBuilder,
            _layer: &ViewLayer,
        ) -> anyhow::Result<()> {
            self.record(format!("mount({view_id})"), "mount")
        }

        fn unmount(&mut self, view_id: i64, _req: &mut KmsReqBuilder) -> anyhow::Result<()> {
            self.record(format!("unmount({view_id})"), "unmount")
        }

        fn update_view(
            &mut self,
            view_id: i64,
            _req: &mut KmsReqBuilder,
            layer: &ViewLayer,
        ) -> anyhow::Result<()> {
            self.record(format!("update({view_id}@{},{})", layer.offset.x, layer.offset.y), "update")
        }

        fn present(
            &mut self,
            view_id: i64,
            _req: &mut KmsReqBuilder,
            _layer: &ViewLayer,
        ) -> anyhow::Result<()> {
            self.record(format!("present({view_id})"), "present")
        }
    }

    fn test_resources_one_crtc() -> Resources {
        test_resources(
            vec![test_crtc(1, 0, false)],
            vec![test_plane(10, PlaneType::Primary, 0b1, &[DrmFourcc::Argb8888])],
        )
    }

    fn backing_store_layer() -> Layer {
        // The diffing machinery only looks at platform-view layers, so a
        // plain handle is fine here.
        Layer {
            content: crate::composition::LayerContent::BackingStore(test_handle()),
            offset: Vec2::ZERO,
            size: Vec2::new(1920.0, 1080.0),
        }
    }

    fn test_handle() -> Arc<BackingStoreHandle> {
        crate::render_targets::test_support::offscreen_handle()
    }

    fn view_layer(view_id: i64, offset: Vec2) -> Layer {
        Layer {
            content: LayerContent::PlatformView {
                view_id,
                mutations: Vec::new(),
            },
            offset,
            size: Vec2::new(300.0, 200.0),
        }
    }

    fn dispatch_and_present(
        registry: &PlatformViewRegistry,
        resources: &Resources,
        composition: &Composition,
    ) {
        let mut req = KmsReqBuilder::new_atomic(resources, 0, None);
        registry.dispatch_frame(composition, &mut req);
        for (view_id, layer) in
            composition
                .layers
                .iter()
                .enumerate()
                .filter_map(|(zpos, layer)| match &layer.content {
                    LayerContent::PlatformView { view_id, mutations } => Some((
                        *view_id,
                        ViewLayer {
                            zpos: zpos as i64,
                            offset: layer.offset,
                            size: layer.size,
                            mutations: mutations.clone(),
                        },
                    )),
                    _ => None,
                })
        {
            registry.present_view(view_id, &layer, &mut req);
        }
    }

    #[test_log::test]
    fn test_mount_update_unmount_lifecycle() {
        let resources = test_resources_one_crtc();
        let registry = PlatformViewRegistry::default();
        let log = Arc::new(StdMutex::new(Vec::new()));

        registry.put_view(
            42,
            Box::new(RecordingView {
                log: log.clone(),
                fail_phase: None,
            }),
        );
        registry.put_view(
            7,
            Box::new(RecordingView {
                log: log.clone(),
                fail_phase: None,
            }),
        );

        // Frame n: [BS, PV(42)].
        let frame_n = Composition::new(vec![
            backing_store_layer(),
            view_layer(42, Vec2::new(10.0, 10.0)),
        ]);
        dispatch_and_present(&registry, &resources, &frame_n);
        assert_eq!(*log.lock().unwrap(), ["mount(42)", "present(42)"]);
        log.lock().unwrap().clear();

        // Frame n+1: [BS, PV(7), PV(42)] with PV(42) moved. Unmounts come
        // first, then updates, then mounts; presents follow in layer order.
        let frame_n1 = Composition::new(vec![
            backing_store_layer(),
            view_layer(7, Vec2::new(50.0, 50.0)),
            view_layer(42, Vec2::new(20.0, 10.0)),
        ]);
        dispatch_and_present(&registry, &resources, &frame_n1);
        assert_eq!(
            *log.lock().unwrap(),
            ["update(42@20,10)", "mount(7)", "present(7)", "present(42)"]
        );
        log.lock().unwrap().clear();

        // Frame n+2: both views gone.
        let frame_n2 = Composition::new(vec![backing_store_layer()]);
        dispatch_and_present(&registry, &resources, &frame_n2);
        let mut calls = log.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, ["unmount(42)", "unmount(7)"]);
    }

    #[test_log::test]
    fn test_no_update_without_change() {
        let resources = test_resources_one_crtc();
        let registry = PlatformViewRegistry::default();
        let log = Arc::new(StdMutex::new(Vec::new()));

        registry.put_view(
            1,
            Box::new(RecordingView {
                log: log.clone(),
                fail_phase: None,
            }),
        );

        let frame = Composition::new(vec![
            backing_store_layer(),
            view_layer(1, Vec2::new(10.0, 10.0)),
        ]);

        dispatch_and_present(&registry, &resources, &frame);
        log.lock().unwrap().clear();

        // Identical frame: present only, no update.
        dispatch_and_present(&registry, &resources, &frame);
        assert_eq!(*log.lock().unwrap(), ["present(1)"]);

        // A mutation change alone triggers an update.
        let mut changed = frame.clone();
        if let LayerContent::PlatformView { mutations, .. } = &mut changed.layers[1].content {
            mutations.push(ViewMutation::Opacity(0.5));
        }

        log.lock().unwrap().clear();
        dispatch_and_present(&registry, &resources, &changed);
        assert_eq!(*log.lock().unwrap(), ["update(1@10,10)", "present(1)"]);
    }

    #[test_log::test]
    fn test_callback_failure_does_not_abort() {
        let resources = test_resources_one_crtc();
        let registry = PlatformViewRegistry::default();
        let log = Arc::new(StdMutex::new(Vec::new()));

        registry.put_view(
            1,
            Box::new(RecordingView {
                log: log.clone(),
                fail_phase: Some("mount"),
            }),
        );
        registry.put_view(
            2,
            Box::new(RecordingView {
                log: log.clone(),
                fail_phase: None,
            }),
        );

        let frame = Composition::new(vec![
            backing_store_layer(),
            view_layer(1, Vec2::new(0.0, 0.0)),
            view_layer(2, Vec2::new(10.0, 0.0)),
        ]);
        dispatch_and_present(&registry, &resources, &frame);

        // View 1's mount failed, but everything still ran.
        let calls = log.lock().unwrap().clone();
        assert!(calls.contains(&"mount(1)".to_string()));
        assert!(calls.contains(&"mount(2)".to_string()));
        assert!(calls.contains(&"present(1)".to_string()));
        assert!(calls.contains(&"present(2)".to_string()));
    }
}
