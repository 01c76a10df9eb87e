//! Per-display frame planning.
//!
//! # Slots
//!
//! A display with `n` hardware windows has `n` *slots*. Slots are filled
//! from the top (`n - 1`) downwards as candidates are considered in
//! back-to-front order, so a slot records both which layer a window shows
//! and where it sits in the blending order. The framebuffer gets the next
//! free slot at the moment the first layer is routed to it.
//!
//! # Phases
//!
//!  - [`DisplayPlan::begin_prepare`] classifies the layers and collects
//!    window candidates.
//!  - [`DisplayPlan::assign_windows`] walks the candidates, giving each a
//!    window or routing it to the framebuffer, then finalizes the window
//!    configuration.
//!  - [`DisplayPlan::end_prepare`] releases idle scratch sets and records
//!    whether the windows overlap.
//!
//! [`DisplayPlan::prepare`] runs all three when the geometry has changed,
//! and only re-evaluates the framebuffer cache otherwise.
//!
//! [`DisplayPlan::set`] then realizes the plan: it fills scratch surfaces,
//! composites the framebuffer if it's done locally, and posts.
use arrayvec::ArrayVec;
use cgmath::Point2;
use hwcrect::{Rect, Rotation};

use crate::{
    blend::BlendSafety,
    caps::{DisplayCaps, WindowMask},
    config::{CompositePolicy, CompositorEngine, PlannerConfig},
    device::{DisplayDevice, Fence},
    display::{DisplayId, DisplayState},
    error::DeviceError,
    fbcache::FramebufferCache,
    layer::{BlendMode, CompositionType, DisplayContents, Layer, LayerHints, Transform},
    scratch::{ScratchHandle, ScratchPool},
    surface::{Blitter, CompositeList, SurfaceAllocator, SurfaceHandle, Usage},
    COMPOSITE_LIST_MAX, MAX_LAYERS, MAX_WINDOWS,
};

mod assign;
mod composite;
mod conf;

/// A window candidate in display-controller space.
///
/// `dst` and `transform` have the panel rotation folded in. `src` may be
/// replaced by the scratch surface's coordinates when the layer is
/// pre-transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedLayer {
    /// The index into [`DisplayContents::layers`].
    pub index: usize,
    pub blending: BlendMode,
    pub transform: Transform,
    pub surf_index: usize,
    pub src: Rect,
    pub dst: Rect,
}

impl PreparedLayer {
    fn new(layer: &Layer, index: usize, panel: Rotation, layer_size: [i32; 2]) -> Self {
        let (transform, dst) = if panel == Rotation::Identity {
            (layer.transform, layer.display_frame)
        } else {
            (
                layer.transform.combine(panel.into()),
                layer
                    .display_frame
                    .rotate(panel, layer_size[0], layer_size[1]),
            )
        };

        Self {
            index,
            blending: layer.blending,
            transform,
            surf_index: 0,
            src: layer.source_crop,
            dst,
        }
    }
}

/// The configuration of one hardware window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayDesc {
    /// The hardware window, or `None` if the slot has no window.
    pub window_index: Option<usize>,
    pub blend: BlendMode,
    pub surf_index: usize,
    pub transform: Transform,
    pub src: Rect,
    pub dst: Rect,
    /// Where the image starts in the buffer, as reported by the blitter.
    pub offset: Point2<i32>,
}

impl Default for OverlayDesc {
    fn default() -> Self {
        Self {
            window_index: None,
            blend: BlendMode::None,
            surf_index: 0,
            transform: Transform::empty(),
            src: Rect::zero(),
            dst: Rect::zero(),
            offset: Point2::new(0, 0),
        }
    }
}

/// What gets posted to the display controller, one entry per slot.
#[derive(Debug, Clone, Default)]
pub struct WindowConfig {
    pub overlays: ArrayVec<[OverlayDesc; MAX_WINDOWS]>,
    /// A protected layer is on screen.
    pub protect: bool,
    /// The hotplug generation the plan was made against.
    pub hotplug_generation: u64,
}

/// A summary of a planned frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOutcome {
    /// `true` if no layer was forced to the framebuffer after windows ran
    /// out or turned out to be unusable.
    pub use_windows: bool,
    /// The number of layers scanned out directly.
    pub windows_used: usize,
    /// The slot of the framebuffer window.
    pub fb_index: Option<usize>,
}

/// Frame-independent inputs shared by every display.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub config: &'a PlannerConfig,
    /// The primary display is too large to trust window B with 32-bit
    /// surfaces.
    pub limit_window_b: bool,
    /// The idle machine asks for composition.
    pub idle_composite: bool,
    pub hotplug_generation: u64,
}

impl<'a> FrameContext<'a> {
    pub fn new(config: &'a PlannerConfig) -> Self {
        Self {
            config,
            limit_window_b: false,
            idle_composite: false,
            hotplug_generation: 0,
        }
    }
}

/// The persistent state of a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WindowMapping {
    /// The layer shown by the slot.
    index: Option<usize>,
    /// The scratch set the layer is pre-transformed into.
    scratch: Option<ScratchHandle>,
    surf_index: usize,
}

/// The planning-time state of a slot.
#[derive(Debug, Clone, Copy, Default)]
struct LayerMap {
    window: Option<usize>,
    /// The index into [`PrepareState::layers`].
    layer: Option<usize>,
}

/// The layers routed to the framebuffer, summarized.
#[derive(Debug, Clone, Copy)]
struct FramebufferAccum {
    bounds: Rect,
    blending: BlendMode,
    /// The framebuffer target layer, prepared like a candidate.
    target: Option<PreparedLayer>,
}

/// The transient state of one planning pass.
#[derive(Debug, Clone)]
pub struct PrepareState {
    layers: ArrayVec<[PreparedLayer; MAX_LAYERS]>,
    layer_map: [LayerMap; MAX_WINDOWS],
    use_windows: bool,
    overflow: bool,
    protect: bool,
    /// The first candidate is a protected layer that keeps its window even
    /// when windows are disabled for the rest.
    priority: bool,
    /// Slots `0..free_slots` are still unassigned.
    free_slots: usize,
    window_mask: WindowMask,
    fb: FramebufferAccum,
    blend_safety: BlendSafety,
    /// The candidate pre-composited as a status bar.
    statusbar: Option<usize>,
}

impl PrepareState {
    fn new(num_windows: usize, window_mask: WindowMask, use_windows: bool) -> Self {
        Self {
            layers: ArrayVec::new(),
            layer_map: Default::default(),
            use_windows,
            overflow: false,
            protect: false,
            priority: false,
            free_slots: num_windows,
            window_mask,
            fb: FramebufferAccum {
                bounds: Rect::DEGENERATE,
                blending: BlendMode::None,
                target: None,
            },
            blend_safety: BlendSafety::Unknown,
            statusbar: None,
        }
    }

    /// The window candidates in back-to-front order.
    pub fn candidates(&self) -> &[PreparedLayer] {
        &self.layers
    }

    pub fn use_windows(&self) -> bool {
        self.use_windows
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn protect(&self) -> bool {
        self.protect
    }

    pub fn blend_safety(&self) -> BlendSafety {
        self.blend_safety
    }
}

/// The framebuffer composited by the planner.
#[derive(Debug)]
struct LocalComposite {
    engine: CompositorEngine,
    list: CompositeList,
    /// The layer index of each entry of `list`.
    map: ArrayVec<[usize; COMPOSITE_LIST_MAX]>,
    scratch: Option<ScratchHandle>,
    /// `scratch` doesn't hold the result of `list` yet.
    stale: bool,
}

impl LocalComposite {
    fn clear(&mut self) {
        self.list.clear();
        self.map.clear();
    }
}

/// The planner of one display.
#[derive(Debug)]
pub struct DisplayPlan<A: SurfaceAllocator> {
    id: DisplayId,
    caps: DisplayCaps,
    panel: Rotation,
    /// The display controller's coordinate space.
    device_clip: Rect,
    /// The window system's coordinate space.
    layer_clip: Rect,
    map: [WindowMapping; MAX_WINDOWS],
    fb_index: Option<usize>,
    fb_target: Option<usize>,
    /// Layers the window system must punch out of the framebuffer.
    clear_layers: u32,
    composite: LocalComposite,
    fb_cache: FramebufferCache,
    scratch: ScratchPool<A>,
    conf: WindowConfig,
    windows_overlap: bool,
    outcome: FrameOutcome,
    /// The buffers on screen, held locked until replaced.
    buffers: ArrayVec<[Option<SurfaceHandle>; MAX_WINDOWS]>,
    last_fence: Option<Fence>,
    vblank_timeout: std::time::Duration,
    policy: CompositePolicy,
}

impl<A: SurfaceAllocator> DisplayPlan<A> {
    pub fn new(id: DisplayId, allocator: A, config: &PlannerConfig) -> Self {
        Self {
            id,
            caps: DisplayCaps::new(&[]),
            panel: Rotation::Identity,
            device_clip: Rect::zero(),
            layer_clip: Rect::zero(),
            map: Default::default(),
            fb_index: None,
            fb_target: None,
            clear_layers: 0,
            composite: LocalComposite {
                engine: config.compositor,
                list: CompositeList::default(),
                map: ArrayVec::new(),
                scratch: None,
                stale: false,
            },
            fb_cache: FramebufferCache::new(config.statusbar_blend),
            scratch: ScratchPool::new(allocator, config.scratch_capacity, config.triple_buffering),
            conf: WindowConfig::default(),
            windows_overlap: false,
            outcome: FrameOutcome::default(),
            buffers: ArrayVec::new(),
            last_fence: None,
            vblank_timeout: crate::device::vblank_timeout(0),
            policy: config.composite_policy,
        }
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    /// Adopt the capabilities and geometry of a display.
    pub fn configure(&mut self, state: &DisplayState) {
        if self.caps != state.caps {
            log::debug!(
                "{:?}: {} windows",
                self.id,
                state.caps.num_windows()
            );
            self.caps = state.caps.clone();
            self.map = Default::default();
            self.conf.overlays.clear();
        }
        self.panel = state.panel_rotation;
        self.device_clip = state.device_clip;
        self.layer_clip = state.layer_clip;
        if let Some(mode) = &state.mode {
            self.vblank_timeout = mode.vblank_timeout();
        }
    }

    pub fn caps(&self) -> &DisplayCaps {
        &self.caps
    }

    /// The window configuration produced by the last planning pass.
    pub fn window_config(&self) -> &WindowConfig {
        &self.conf
    }

    pub fn outcome(&self) -> FrameOutcome {
        self.outcome
    }

    pub fn fb_index(&self) -> Option<usize> {
        self.fb_index
    }

    /// The layer shown by `slot`.
    pub fn slot_layer(&self, slot: usize) -> Option<usize> {
        self.map.get(slot).and_then(|m| m.index)
    }

    /// Whether `slot` shows a pre-transformed scratch surface.
    pub fn slot_uses_scratch(&self, slot: usize) -> bool {
        self.map.get(slot).map_or(false, |m| m.scratch.is_some())
    }

    pub fn windows_overlap(&self) -> bool {
        self.windows_overlap
    }

    pub fn fb_cache(&self) -> &FramebufferCache {
        &self.fb_cache
    }

    pub fn scratch_pool(&self) -> &ScratchPool<A> {
        &self.scratch
    }

    /// The layers composited locally this frame.
    pub fn composite_list(&self) -> &CompositeList {
        &self.composite.list
    }

    /// Plan a frame.
    ///
    /// `changed` forces a full re-plan, e.g., after the idle state changed.
    /// Otherwise, a frame without geometry changes keeps the previous plan
    /// and only re-evaluates the framebuffer cache.
    pub fn prepare(
        &mut self,
        ctx: &FrameContext<'_>,
        contents: &mut DisplayContents,
        changed: bool,
    ) -> FrameOutcome {
        let changed = changed || contents.geometry_changed();
        self.composite.list.geometry_changed = changed;

        if changed {
            let mut state = self.begin_prepare(ctx, contents, true, Usage::empty());
            self.assign_windows(ctx, &mut state, contents);
            self.end_prepare(&state, contents);
        } else if self.policy.contains(CompositePolicy::FB_CACHE) {
            self.fb_cache_check(contents);
        }

        self.outcome
    }

    /// Reset the per-frame state and collect window candidates.
    ///
    /// Layers whose buffer usage intersects `ignore_mask` are left for
    /// another consumer: they're marked as overlays and punched out of the
    /// framebuffer, but get no window.
    pub fn begin_prepare(
        &mut self,
        ctx: &FrameContext<'_>,
        contents: &mut DisplayContents,
        use_windows: bool,
        ignore_mask: Usage,
    ) -> PrepareState {
        self.policy = ctx.config.composite_policy;
        self.fb_index = None;
        self.fb_target = None;
        self.clear_layers = 0;
        self.fb_cache.begin_frame();
        self.composite.clear();
        self.composite.engine = ctx.config.compositor;
        self.conf.hotplug_generation = ctx.hotplug_generation;

        // Only a locked scratch (a composited framebuffer) outlives a frame
        if let Some(handle) = self.composite.scratch {
            if self.scratch.state(handle) != crate::scratch::ScratchState::Locked {
                self.composite.scratch = None;
            }
        }

        let use_windows = if !use_windows || self.policy.contains(CompositePolicy::FORCE_COMPOSITE) {
            false
        } else if self.policy.contains(CompositePolicy::COMPOSITE_ON_IDLE) {
            !ctx.idle_composite
        } else {
            true
        };

        let mut state = PrepareState::new(self.caps.num_windows(), self.caps.all_windows(), use_windows);

        // A protected layer must never be composited
        let mut priority = None;
        if state.use_windows || self.composite.engine == CompositorEngine::Passthrough {
            if let Some(index) = contents.find_layer(Usage::PROTECTED, false) {
                state.protect = true;
                let layer = &contents.layers[index];
                if index == 0 || layer.blending == BlendMode::None {
                    log::debug!("protected layer {} gets priority", index);
                    let prepared = self.prepare_layer(layer, index);
                    state.layers.push(prepared);
                    state.priority = true;
                    if index > 0 {
                        state.use_windows = false;
                    }
                    priority = Some(index);
                }
            }
        }

        for index in 0..contents.layers.len() {
            if Some(index) == priority {
                continue;
            }

            let layer = &contents.layers[index];

            if layer.is_framebuffer_target() {
                debug_assert!(self.fb_target.is_none());
                self.fb_target = Some(index);
                state.fb.target = Some(self.prepare_layer(layer, index));
                continue;
            }

            if layer.is_skip() {
                state.use_windows = false;
                self.composite.engine = CompositorEngine::Passthrough;
                self.add_to_framebuffer(&mut state, contents, index);
                continue;
            }

            if layer.usage().intersects(ignore_mask) {
                let layer = &mut contents.layers[index];
                layer.composition = CompositionType::Overlay;
                layer.hints |= LayerHints::CLEAR_FB;
                self.clear_layer_add(index);
                continue;
            }

            if !state.layers.is_full() {
                let prepared = self.prepare_layer(layer, index);
                state.layers.push(prepared);
            } else {
                state.overflow = true;
                self.composite.engine = CompositorEngine::Passthrough;
                self.add_to_framebuffer(&mut state, contents, index);
                state.use_windows = false;
            }
        }

        if state.overflow {
            log::debug!(
                "{:?}: {} layers exceed the candidate limit",
                self.id,
                contents.layers.len()
            );
        }

        self.scratch.frame_start();
        state
    }

    /// Release idle scratch sets and decide whether the windows overlap.
    pub fn end_prepare(&mut self, state: &PrepareState, contents: &DisplayContents) {
        self.scratch.frame_end();

        if contents.geometry_changed() {
            self.windows_overlap = self.detect_overlap(state.free_slots);
        }
    }

    fn prepare_layer(&self, layer: &Layer, index: usize) -> PreparedLayer {
        PreparedLayer::new(
            layer,
            index,
            self.panel,
            [self.layer_clip.width(), self.layer_clip.height()],
        )
    }

    /// Re-evaluate the framebuffer cache for a frame with unchanged
    /// geometry.
    fn fb_cache_check(&mut self, contents: &mut DisplayContents) {
        if !self.fb_cache.check(&contents.layers) {
            return;
        }
        if self.composite.engine != CompositorEngine::Passthrough {
            return;
        }

        let recycle = self.fb_cache.recycle();
        let composition = if recycle {
            CompositionType::Overlay
        } else {
            CompositionType::Framebuffer
        };
        for index in self.fb_cache.cached_indices() {
            if let Some(layer) = contents.layers.get_mut(index) {
                layer.composition = composition;
            }
        }

        if recycle {
            self.clear_layer_disable(contents);
        } else {
            self.clear_layer_enable(contents);
        }
    }

    fn clear_layer_add(&mut self, index: usize) {
        if index < 32 {
            self.clear_layers |= 1 << index;
        }
    }

    fn clear_layer_indices(&self) -> impl Iterator<Item = usize> {
        crate::caps::iter_windows(self.clear_layers)
    }

    /// Ask the window system to punch window layers out of the framebuffer.
    fn clear_layer_enable(&self, contents: &mut DisplayContents) {
        for index in self.clear_layer_indices() {
            if let Some(layer) = contents.layers.get_mut(index) {
                debug_assert_eq!(layer.composition, CompositionType::Overlay);
                layer.hints |= LayerHints::CLEAR_FB;
            }
        }
    }

    /// Don't punch out window layers because nothing is drawn underneath
    /// them, or the framebuffer is produced elsewhere.
    fn clear_layer_disable(&self, contents: &mut DisplayContents) {
        for index in self.clear_layer_indices() {
            if let Some(layer) = contents.layers.get_mut(index) {
                layer.hints.remove(LayerHints::CLEAR_FB);
            }
        }
    }

    /// Check whether the windows in slots `start..` overlap each other.
    fn detect_overlap(&self, start: usize) -> bool {
        let overlays = &self.conf.overlays;
        for i in start..overlays.len() {
            for j in i + 1..overlays.len() {
                if overlays[i].dst.intersects(&overlays[j].dst) {
                    log::trace!("windows in slots {} and {} overlap", i, j);
                    return true;
                }
            }
        }
        false
    }

    /// Realize the plan made by the last planning pass and flip.
    ///
    /// Must be called with the display state lock held. Failing blits and
    /// composites are logged and the frame is posted anyway.
    pub fn set<D: DisplayDevice + ?Sized, B: Blitter + ?Sized>(
        &mut self,
        device: &D,
        blitter: &B,
        contents: &DisplayContents,
    ) -> Result<(), DeviceError> {
        let num_windows = self.caps.num_windows().min(self.conf.overlays.len());
        let mut buffers: ArrayVec<[Option<SurfaceHandle>; MAX_WINDOWS]> =
            (0..num_windows).map(|_| None).collect();

        // Scratch rings are sized so that this rarely blocks
        if (0..num_windows).any(|slot| self.map[slot].scratch.is_some()) {
            if let Some(fence) = &self.last_fence {
                fence.wait_or_warn(self.vblank_timeout);
            }
        }

        for slot in 0..num_windows {
            let mapping = self.map[slot];
            let handle = match mapping
                .index
                .and_then(|i| contents.layers.get(i))
                .and_then(|l| l.handle.clone())
            {
                Some(handle) => handle,
                None => continue,
            };

            let overlay = &mut self.conf.overlays[slot];
            buffers[slot] = Some(match mapping.scratch {
                Some(scratch) => {
                    match self.scratch.blit(
                        blitter,
                        &handle,
                        mapping.surf_index,
                        scratch,
                        overlay.transform,
                    ) {
                        Ok(offset) => overlay.offset = offset,
                        Err(e) => log::error!("{:?}: blit for slot {} failed: {}", self.id, slot, e),
                    }
                    self.scratch.buffer(scratch).clone()
                }
                None => {
                    overlay.offset = Point2::new(0, 0);
                    handle
                }
            });
        }

        if let (Some(scratch), Some(fb_index)) = (self.composite.scratch, self.fb_index) {
            // A recycled framebuffer still needs one composite if its
            // scratch was only just assigned
            if !self.fb_cache.recycle() || self.composite.stale {
                let composite = &mut self.composite;
                for (entry, &index) in composite.list.layers.iter_mut().zip(composite.map.iter()) {
                    entry.surface = contents.layers.get(index).and_then(|l| l.handle.clone());
                }
                match self.scratch.composite(blitter, &composite.list, scratch) {
                    Ok(()) => composite.stale = false,
                    Err(e) => log::error!("{:?}: composite failed: {}", self.id, e),
                }
            }
            if fb_index < buffers.len() {
                buffers[fb_index] = Some(self.scratch.buffer(scratch).clone());
            }
        }

        // Pin the buffers that aren't on screen yet
        let mut old = std::mem::replace(&mut self.buffers, ArrayVec::new());
        for buffer in buffers.iter().flatten() {
            match old
                .iter()
                .position(|b| b.as_ref().map(|b| b.id()) == Some(buffer.id()))
            {
                Some(i) => old[i] = None,
                None => {
                    if let Err(e) = self
                        .scratch
                        .allocator()
                        .lock(buffer, Usage::HW_FB, buffer.bounds())
                    {
                        log::warn!("{:?}: failed to lock {}: {}", self.id, buffer.id(), e);
                    }
                }
            }
        }

        let posted = device.post(self.id, Some(&self.conf), &buffers);
        let fence = posted.as_ref().ok().cloned();
        if let Err(e) = &posted {
            log::error!("{:?}: post failed: {}", self.id, e);
        }

        for buffer in old.iter().flatten() {
            self.scratch.allocator().unlock(buffer, fence.as_ref());
        }
        self.buffers = buffers;
        self.last_fence = fence;

        posted.map(|_| ())
    }

    /// Drop everything that depends on the display being lit.
    ///
    /// `fence` signals when the buffers last posted are no longer scanned
    /// out.
    pub fn release(&mut self, fence: Option<&Fence>) {
        self.fb_cache.cancel_recycle();
        for buffer in self.buffers.drain(..).flatten() {
            self.scratch.allocator().unlock(&buffer, fence);
        }
        self.last_fence = None;
    }

    /// Whether [`Self::release`] has nothing left to do.
    pub fn is_released(&self) -> bool {
        self.buffers.iter().all(Option::is_none)
    }
}
