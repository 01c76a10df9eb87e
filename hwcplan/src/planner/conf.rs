use hwcrect::Rotation;

use super::{DisplayPlan, OverlayDesc, PrepareState, PreparedLayer};
use crate::{geom::scale_window, layer::DisplayContents, surface::SurfaceAllocator};

impl<A: SurfaceAllocator> DisplayPlan<A> {
    /// Translate the slot assignment into a [`WindowConfig`].
    ///
    /// [`WindowConfig`]: super::WindowConfig
    pub(super) fn conf_prepare(&mut self, state: &PrepareState, contents: &mut DisplayContents) {
        let num_windows = self.caps.num_windows();

        self.conf.overlays.clear();
        self.conf.protect = state.protect;

        for slot in 0..num_windows {
            let mut overlay = OverlayDesc {
                window_index: state.layer_map[slot].window,
                ..OverlayDesc::default()
            };

            if Some(slot) == self.fb_index {
                if let Some(mut fb) = state.fb.target {
                    fb.src = state.fb.bounds;
                    fb.dst = if self.panel == Rotation::Identity {
                        fb.src
                    } else {
                        fb.src.rotate(
                            self.panel,
                            self.layer_clip.width(),
                            self.layer_clip.height(),
                        )
                    };
                    fb.blending = state.fb.blending;
                    self.window_attrs(&mut overlay, slot, &fb);
                } else {
                    log::warn!("{:?}: framebuffer in use without a target layer", self.id);
                }
            } else if let Some(li) = state.layer_map[slot].layer {
                self.window_attrs(&mut overlay, slot, &state.layers[li]);
            }

            self.conf.overlays.push(overlay);
        }

        self.statusbar_prepare(state, contents);
    }

    fn window_attrs(&self, overlay: &mut OverlayDesc, slot: usize, ll: &PreparedLayer) {
        overlay.blend = ll.blending;
        overlay.surf_index = if self.map[slot].scratch.is_some() {
            0
        } else {
            ll.surf_index
        };
        overlay.transform = ll.transform.fix();

        let (src, dst) = scale_window(&self.device_clip, ll.transform, &ll.src, &ll.dst);
        overlay.src = src;
        overlay.dst = dst;
    }
}
