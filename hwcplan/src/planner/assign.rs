//! Window assignment.
use hwcrect::Rect;

use super::{DisplayPlan, FrameContext, FrameOutcome, LayerMap, PrepareState, PreparedLayer, WindowMapping};
use crate::{
    blend::{detect_overlap_risk, BlendSafety, OverlapRisk},
    caps::{pick_window, WindowCaps, WINDOW_B, WINDOW_C},
    config::{CompositePolicy, CompositorEngine},
    geom::{get_scale, need_scale},
    layer::{BlendMode, CompositionType, DisplayContents, Layer, LayerHints, PixelFormat, Transform},
    surface::SurfaceAllocator,
};

/// The smallest downscale factor the scaling window supports.
const DC_MIN_SCALE: f32 = 0.5;

/// Windows narrower or shorter than this underflow.
const MIN_WINDOW_SIZE: i32 = 4;

fn can_use_window(layer: &Layer) -> bool {
    layer.handle.is_some()
        && layer.display_frame.width() >= MIN_WINDOW_SIZE
        && layer.display_frame.height() >= MIN_WINDOW_SIZE
}

fn layer_requirements(ll: &PreparedLayer, format: PixelFormat, scale: [f32; 2]) -> WindowCaps {
    let mut req = WindowCaps::empty();
    if ll.transform.swaps_axes() {
        req |= WindowCaps::SWAP_XY;
    }
    if need_scale(scale) {
        req |= WindowCaps::SCALE;
    }
    if format.is_yuv() {
        req |= WindowCaps::YUV;
    }
    if format.bits_per_pixel() <= 16 {
        req |= WindowCaps::SIXTEEN_BIT;
    }
    req
}

impl<A: SurfaceAllocator> DisplayPlan<A> {
    /// Give each candidate a window, or route it to the framebuffer, and
    /// finalize the window configuration.
    pub fn assign_windows(
        &mut self,
        ctx: &FrameContext<'_>,
        state: &mut PrepareState,
        contents: &mut DisplayContents,
    ) -> FrameOutcome {
        let num_windows = self.caps.num_windows();
        let num_layers = state.layers.len();
        let mut windows_used = 0;

        for ii in 0..num_layers {
            let index = state.layers[ii].index;

            if !state.use_windows && !(ii == 0 && state.priority) {
                self.add_to_framebuffer(state, contents, index);
                continue;
            }

            // The bottom-most window has nothing to blend with
            if state.free_slots == num_windows && state.layers[ii].blending == BlendMode::Premultiplied {
                state.layers[ii].blending = BlendMode::None;
            }

            if state.layers[ii].blending.is_blending() && state.blend_safety == BlendSafety::Unknown {
                let risky = if state.free_slots < num_layers - ii {
                    // Some of the remaining layers will be composited
                    true
                } else {
                    match detect_overlap_risk(
                        &state.layers,
                        ii,
                        &self.device_clip,
                        ctx.config.statusbar_blend,
                    ) {
                        OverlapRisk::Statusbar(sb) => {
                            state.statusbar = Some(sb);
                            false
                        }
                        risk => risk.is_risky(),
                    }
                };

                if risky {
                    log::debug!("{:?}: unsafe blend at layer {}, compositing", self.id, index);
                    state.blend_safety = BlendSafety::Unsafe;
                    state.use_windows = false;
                    self.add_to_framebuffer(state, contents, index);
                    continue;
                }
                state.blend_safety = BlendSafety::Safe;
            }

            if Some(ii) == state.statusbar {
                // Pre-composited into the framebuffer scratch by
                // `statusbar_prepare`
                self.composite.engine = CompositorEngine::Passthrough;
                state.use_windows = false;
                self.add_to_framebuffer(state, contents, index);
                contents.layers[index].composition = CompositionType::Overlay;
                continue;
            }

            let more = num_layers - ii - 1 > 0;
            let mut window = None;
            if self.num_free_windows(state.free_slots, more) > 0 {
                window = self.assign_window(ctx, state, contents, ii);
            }

            // Window B can't keep up with a large 32-bit surface while
            // another layer is being composited
            if let Some(w) = window {
                if ctx.limit_window_b && state.window_mask == 1 << WINDOW_B && more && self.fb_index.is_none() {
                    let next = &contents.layers[state.layers[ii + 1].index];
                    let next_bpp = next.format().map_or(32, PixelFormat::bits_per_pixel);
                    if num_layers > num_windows || !can_use_window(next) || next_bpp > 16 {
                        log::warn!("potential underflow detected, enacting countermeasures");
                        state.window_mask |= 1 << w;
                        window = None;
                    }
                }
            }

            match window {
                Some(w) => {
                    self.add_window(state, contents, ii, w);
                    windows_used += 1;
                }
                None => {
                    state.use_windows = false;
                    self.add_to_framebuffer(state, contents, index);
                    if state.statusbar.take().is_some() {
                        log::debug!("status bar optimization cancelled");
                    }
                }
            }
        }

        if let Some(fb_index) = self.fb_index {
            self.map[fb_index].index = self.fb_target;
        }

        // Turn off the slots nobody claimed
        for slot in (0..state.free_slots).rev() {
            state.layer_map[slot] = LayerMap {
                window: pick_window(&self.caps, &mut state.window_mask, WindowCaps::empty(), false)
                    .map(|p| p.window),
                layer: None,
            };
            self.map[slot] = WindowMapping::default();
        }

        let fb_cache = self.policy.contains(CompositePolicy::FB_CACHE);
        if fb_cache {
            self.fb_cache.validate(state.statusbar.is_some());
        }

        if !self.fb_cache.recycle() {
            if let Some(handle) = self.composite.scratch.take() {
                self.scratch.unlock(handle);
            }
        }

        if self.fb_index.is_some() && self.composite.engine != CompositorEngine::Passthrough {
            debug_assert!(state.statusbar.is_none());
            self.composite_prepare(state, contents);
        }

        if fb_cache && self.fb_cache.recycle() {
            for i in self.fb_cache.cached_indices() {
                if let Some(layer) = contents.layers.get_mut(i) {
                    layer.composition = CompositionType::Overlay;
                }
            }
        }

        if self.fb_index.is_none() || !self.composite.list.is_empty() || self.fb_cache.recycle() {
            self.clear_layer_disable(contents);
        }

        self.conf_prepare(state, contents);

        self.outcome = FrameOutcome {
            use_windows: state.use_windows,
            windows_used,
            fb_index: self.fb_index,
        };

        log::trace!("{:?}: {:?}", self.id, self.outcome);
        self.outcome
    }

    /// Count the windows available to the current layer. One is held back
    /// for the framebuffer if more layers follow and none went there yet.
    fn num_free_windows(&self, free_slots: usize, more: bool) -> usize {
        if self.fb_index.is_none() && more {
            free_slots.saturating_sub(1)
        } else {
            free_slots
        }
    }

    /// Find a window for the candidate `ii`, reserving a scratch set if the
    /// window needs help from the 2D engine.
    fn assign_window(
        &mut self,
        ctx: &FrameContext<'_>,
        state: &mut PrepareState,
        contents: &mut DisplayContents,
        ii: usize,
    ) -> Option<usize> {
        let slot = state.free_slots.checked_sub(1)?;
        let layer = &mut contents.layers[state.layers[ii].index];

        if !can_use_window(layer) {
            return None;
        }
        let surface = layer.handle.clone()?;
        let format = surface.format();
        let bpp = format.bits_per_pixel();

        let ll = &mut state.layers[ii];
        let mut scale = get_scale(ll.transform, &ll.src, &ll.dst);
        let mut req = layer_requirements(ll, format, scale);

        let mut need_scale = false;
        let mut need_swapxy = false;

        if req.contains(WindowCaps::SCALE) {
            let min_scale = if ctx.limit_window_b || bpp > 16 {
                1.0
            } else {
                DC_MIN_SCALE
            };

            if (ctx.limit_window_b && bpp > 16) || scale[0] < min_scale || scale[1] < min_scale {
                need_scale = true;
                req.remove(WindowCaps::SCALE);
            }
        }

        // Window C underflows when it downscales a 32-bit surface. Scale in
        // the other direction with the 2D engine instead.
        let axis = if ll.transform.swaps_axes() { 1 } else { 0 };
        let (window, mut unsatisfied) = if need_scale
            && bpp > 16
            && state.window_mask & (1 << WINDOW_C) != 0
            && scale[axis] >= 1.0
        {
            state.window_mask &= !(1 << WINDOW_C);
            scale[axis] = 1.0;
            (WINDOW_C, req - self.caps.window(WINDOW_C))
        } else {
            let pick = pick_window(&self.caps, &mut state.window_mask, req, true)?;
            (pick.window, pick.unsatisfied)
        };

        if unsatisfied.contains(WindowCaps::SCALE) {
            unsatisfied.remove(WindowCaps::SCALE);
            need_scale = true;
        }
        if unsatisfied.contains(WindowCaps::SWAP_XY) {
            unsatisfied.remove(WindowCaps::SWAP_XY);
            need_swapxy = true;
        }
        unsatisfied.remove(WindowCaps::SIXTEEN_BIT);

        if !unsatisfied.is_empty() {
            log::trace!("window {} lacks {:?}", window, unsatisfied);
            state.window_mask |= 1 << window;
            return None;
        }

        if need_scale || need_swapxy {
            let (width, height, crop) = if need_scale {
                (
                    (scale[0] * ll.src.width() as f32) as u32,
                    (scale[1] * ll.src.height() as f32) as u32,
                    Some(ll.src),
                )
            } else {
                (surface.width(), surface.height(), None)
            };
            let transform = if need_swapxy {
                ll.transform & Transform::ROT_90
            } else {
                Transform::empty()
            };

            let handle = match self.scratch.assign(transform, width, height, format, crop) {
                Some(handle) => handle,
                None => {
                    log::debug!("no scratch for layer {}", ll.index);
                    state.window_mask |= 1 << window;
                    return None;
                }
            };

            self.map[slot].scratch = Some(handle);
            self.map[slot].surf_index = ll.surf_index;

            if need_scale {
                ll.src = Rect::with_size(width as i32, height as i32);
            }
            if need_swapxy {
                let (src, h) = (ll.src, height as i32);
                ll.src = Rect::ltrb(h - src.bottom(), src.left(), h - src.top(), src.right());
            }
        } else {
            self.map[slot].scratch = None;
            if ctx.config.triple_buffering {
                layer.hints |= LayerHints::TRIPLE_BUFFER;
            }
        }

        Some(window)
    }

    fn add_window(&mut self, state: &mut PrepareState, contents: &mut DisplayContents, ii: usize, window: usize) {
        let index = state.layers[ii].index;
        let slot = state.free_slots - 1;

        let layer = &mut contents.layers[index];
        layer.composition = CompositionType::Overlay;
        layer.hints |= LayerHints::CLEAR_FB;
        self.clear_layer_add(index);

        log::trace!("{:?}: layer {} -> window {} (slot {})", self.id, index, window, slot);

        self.map[slot].index = Some(index);
        state.layer_map[slot] = LayerMap {
            window: Some(window),
            layer: Some(ii),
        };
        state.free_slots = slot;
    }

    /// Route a layer to the framebuffer window, claiming a slot for it the
    /// first time.
    pub(super) fn add_to_framebuffer(
        &mut self,
        state: &mut PrepareState,
        contents: &mut DisplayContents,
        index: usize,
    ) {
        let layer = &mut contents.layers[index];
        layer.composition = CompositionType::Framebuffer;
        let skip = layer.is_skip();

        if self.fb_index.is_none() {
            match state.free_slots.checked_sub(1) {
                Some(slot) => {
                    state.free_slots = slot;
                    self.fb_index = Some(slot);
                    self.map[slot] = WindowMapping::default();
                    state.layer_map[slot] = LayerMap {
                        window: pick_window(&self.caps, &mut state.window_mask, WindowCaps::empty(), false)
                            .map(|p| p.window),
                        layer: None,
                    };
                }
                None => log::warn!("{:?}: no slot left for the framebuffer", self.id),
            }

            if state.overflow || skip {
                state.fb.bounds = self.layer_clip;
                state.fb.blending = BlendMode::Premultiplied;
            } else {
                state.fb.bounds = self.layer_clip.clip(&layer.display_frame);
                state.fb.blending = if layer.blending.is_blending() {
                    BlendMode::Premultiplied
                } else {
                    BlendMode::None
                };
            }
        } else {
            state.fb.blending = BlendMode::Premultiplied;
            if skip {
                state.fb.bounds = self.layer_clip;
            } else {
                state.fb.bounds.grow(&self.layer_clip.clip(&layer.display_frame));
            }
        }

        self.fb_cache.add_layer(index, layer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{Surface, Usage};

    #[test]
    fn window_size_limit() {
        let surface = Surface::new_handle(64, 64, PixelFormat::Rgba8888, Usage::HW_TEXTURE);
        assert!(can_use_window(&Layer::with_surface(surface.clone(), Rect::with_size(4, 4))));
        assert!(!can_use_window(&Layer::with_surface(surface, Rect::with_size(3, 64))));
        assert!(!can_use_window(&Layer::new(None, Rect::with_size(64, 64), Rect::with_size(64, 64))));
    }

    #[test]
    fn requirements() {
        let ll = PreparedLayer {
            index: 0,
            blending: BlendMode::None,
            transform: Transform::ROT_90,
            surf_index: 0,
            src: Rect::with_size(100, 100),
            dst: Rect::with_size(100, 100),
        };
        assert_eq!(
            layer_requirements(&ll, PixelFormat::Rgba8888, [1.0, 1.0]),
            WindowCaps::SWAP_XY
        );
        assert_eq!(
            layer_requirements(&ll, PixelFormat::Nv12, [2.0, 1.0]),
            WindowCaps::SWAP_XY | WindowCaps::SCALE | WindowCaps::YUV | WindowCaps::SIXTEEN_BIT
        );
    }
}
