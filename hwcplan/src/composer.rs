//! Ties the per-display planners, the display state, and the background
//! threads together.
use std::{sync::Arc, time::Instant};

use crate::{
    config::PlannerConfig,
    device::DisplayDevice,
    display::{DisplayId, DisplayStateMachine, HotplugSource, HotplugWatcher},
    error::DeviceError,
    idle::IdleMachine,
    layer::DisplayContents,
    planner::{DisplayPlan, FrameContext},
    surface::{Blitter, SurfaceAllocator},
    vsync::VsyncThread,
};

/// Receives the notifications a [`Composer`] sends to the window system.
///
/// Every method may be called from a background thread.
pub trait EventListener: Send + Sync {
    /// A vertical blank of `display` happened at `timestamp`.
    fn vsync(&self, _display: DisplayId, _timestamp: Instant) {}

    /// The window system should submit another frame.
    fn invalidate(&self) {}

    fn hotplug(&self, _display: DisplayId, _connected: bool) {}
}

impl EventListener for () {}

/// The composer of a display device.
pub struct Composer<D, A, B>
where
    D: DisplayDevice + 'static,
    A: SurfaceAllocator + Clone,
    B: Blitter,
{
    config: PlannerConfig,
    machine: Arc<DisplayStateMachine<D>>,
    blitter: B,
    /// Indexed by [`DisplayId::index`].
    plans: Vec<DisplayPlan<A>>,
    seen_generation: u64,
    idle: IdleMachine,
    vsync: Option<VsyncThread>,
    hotplug: Option<HotplugWatcher>,
    listener: Arc<dyn EventListener>,
}

impl<D, A, B> Composer<D, A, B>
where
    D: DisplayDevice + 'static,
    A: SurfaceAllocator + Clone,
    B: Blitter,
{
    /// Construct a `Composer` without background threads.
    ///
    /// Idle composition still works, but only reacts to frames; nothing
    /// requests a frame when they stop.
    pub fn new(device: D, allocator: A, blitter: B, config: PlannerConfig) -> Self {
        let idle = IdleMachine::new(config.idle_minimum_fps);
        Self::with_parts(device, allocator, blitter, config, idle, Arc::new(()))
    }

    /// Construct a `Composer` delivering vsync and idle notifications to
    /// `listener`.
    pub fn with_listener(
        device: D,
        allocator: A,
        blitter: B,
        config: PlannerConfig,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self, DeviceError> {
        let idle = {
            let listener = Arc::clone(&listener);
            IdleMachine::spawn(config.idle_minimum_fps, move || listener.invalidate())?
        };

        let mut this = Self::with_parts(device, allocator, blitter, config, idle, listener);

        let machine = Arc::clone(&this.machine);
        let listener = Arc::clone(&this.listener);
        this.vsync = Some(VsyncThread::spawn(
            move || machine.device().vblank_wait(),
            move |timestamp| listener.vsync(DisplayId::Primary, timestamp),
        )?);

        Ok(this)
    }

    fn with_parts(
        device: D,
        allocator: A,
        blitter: B,
        config: PlannerConfig,
        idle: IdleMachine,
        listener: Arc<dyn EventListener>,
    ) -> Self {
        let machine = Arc::new(DisplayStateMachine::new(device, config.panel_rotation));
        let plans = DisplayId::ALL
            .iter()
            .map(|&id| DisplayPlan::new(id, allocator.clone(), &config))
            .collect();

        Self {
            config,
            machine,
            blitter,
            plans,
            seen_generation: 0,
            idle,
            vsync: None,
            hotplug: None,
            listener,
        }
    }

    /// Start feeding hotplug events from `source` into the display state.
    /// Replaces the previous source, if any.
    pub fn watch_hotplug(&mut self, source: impl HotplugSource) -> Result<(), DeviceError> {
        // Stop the old watcher before starting a new one
        self.hotplug = None;

        let listener = Arc::clone(&self.listener);
        self.hotplug = Some(HotplugWatcher::spawn(
            Arc::clone(&self.machine),
            source,
            move |event| listener.hotplug(event.display, event.connected),
        )?);
        Ok(())
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &Arc<DisplayStateMachine<D>> {
        &self.machine
    }

    pub fn plan(&self, id: DisplayId) -> &DisplayPlan<A> {
        &self.plans[id.index()]
    }

    pub fn blitter(&self) -> &B {
        &self.blitter
    }

    /// Plan a frame for every display. `frames` is indexed by
    /// [`DisplayId::index`]; displays without an entry are left alone.
    pub fn prepare(&mut self, frames: &mut [DisplayContents]) {
        let mut changed = self.idle.update();

        let generation = self.machine.generation();
        if generation != self.seen_generation {
            log::debug!("hotplug generation {} -> {}", self.seen_generation, generation);
            self.seen_generation = generation;
            changed = true;
        }

        let primary = self.machine.snapshot(DisplayId::Primary);
        let threshold = self.config.limit_window_b_threshold as i32;
        let limit_window_b =
            primary.device_clip.width() > threshold || primary.device_clip.height() > threshold;

        let ctx = FrameContext {
            config: &self.config,
            limit_window_b,
            idle_composite: self.idle.composite(),
            hotplug_generation: generation,
        };

        let mut windows_overlap = false;

        for (&id, contents) in DisplayId::ALL.iter().zip(frames.iter_mut()) {
            let plan = &mut self.plans[id.index()];
            let state = self.machine.snapshot(id);

            if !state.is_active() {
                if !plan.is_released() {
                    log::debug!("{:?}: inactive, releasing buffers", id);
                    plan.release(state.release_fence.as_ref());
                }
                continue;
            }

            plan.configure(&state);
            plan.prepare(&ctx, contents, changed);
            windows_overlap |= plan.windows_overlap();
        }

        if windows_overlap {
            self.idle.enable();
        } else {
            self.idle.disable();
        }
    }

    /// Realize the plans made by [`Self::prepare`] and flip every display.
    ///
    /// A failing display doesn't prevent the others from being updated; the
    /// first error is returned.
    pub fn set(&mut self, frames: &[DisplayContents]) -> Result<(), DeviceError> {
        let machine = &self.machine;
        let blitter = &self.blitter;
        let mut result = Ok(());

        for (&id, contents) in DisplayId::ALL.iter().zip(frames.iter()) {
            let plan = &mut self.plans[id.index()];

            let display_result = machine.with_display(id, |state| {
                if !state.is_active() {
                    plan.release(state.release_fence.as_ref());
                    return Ok(());
                }
                if state.generation > plan.window_config().hotplug_generation {
                    log::debug!("{:?}: plan predates a hotplug event, skipping", id);
                    return Ok(());
                }
                plan.set(machine.device(), blitter, contents)
            });

            if let Err(e) = display_result {
                log::error!("{:?}: set failed: {}", id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Turn a display off or on.
    pub fn blank(&mut self, id: DisplayId, blank: bool) -> Result<(), DeviceError> {
        self.machine.blank(id, blank)?;

        if blank {
            let state = self.machine.snapshot(id);
            self.plans[id.index()].release(state.release_fence.as_ref());
        }
        Ok(())
    }

    /// Turn the delivery of vsync events on or off.
    pub fn event_control(&self, enabled: bool) {
        match &self.vsync {
            Some(vsync) => vsync.set_enabled(enabled),
            None => log::warn!("event_control({}) without a vsync thread", enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompositePolicy,
        layer::{Layer, PixelFormat},
        null::{NullAllocator, NullBlitter, NullDisplay},
        surface::{Surface, Usage},
    };
    use hwcrect::Rect;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    type TestComposer = Composer<NullDisplay, NullAllocator, NullBlitter>;

    fn composer() -> TestComposer {
        Composer::new(
            NullDisplay::new(),
            NullAllocator::new(),
            NullBlitter::new(),
            PlannerConfig {
                composite_policy: CompositePolicy::ASSIGN_WINDOWS,
                idle_minimum_fps: 0,
                ..PlannerConfig::default()
            },
        )
    }

    fn two_layers() -> DisplayContents {
        let surface = |w, h| Surface::new_handle(w, h, PixelFormat::Rgba8888, Usage::HW_TEXTURE);
        DisplayContents::new(vec![
            Layer::with_surface(surface(1280, 800), Rect::with_size(1280, 800)),
            Layer::with_surface(surface(200, 100), Rect::ltrb(100, 100, 300, 200)),
        ])
    }

    #[test]
    fn prepare_and_set() {
        let mut composer = composer();
        let mut frames = vec![two_layers()];

        composer.prepare(&mut frames);
        let outcome = composer.plan(DisplayId::Primary).outcome();
        assert!(outcome.use_windows);
        assert_eq!(outcome.windows_used, 2);
        assert_eq!(outcome.fb_index, None);

        composer.set(&frames).unwrap();
        let device = composer.state_machine().device();
        assert_eq!(device.post_count(DisplayId::Primary), 1);
        let post = device.last_post(DisplayId::Primary).unwrap();
        assert_eq!(post.buffers.iter().flatten().count(), 2);
    }

    #[test]
    fn blank_releases_buffers() {
        let mut composer = composer();
        let mut frames = vec![two_layers()];

        composer.prepare(&mut frames);
        composer.set(&frames).unwrap();
        assert_eq!(composer.plan(DisplayId::Primary).scratch_pool().allocator().locked(), 2);

        composer.blank(DisplayId::Primary, true).unwrap();
        assert!(composer.plan(DisplayId::Primary).is_released());
        assert_eq!(composer.plan(DisplayId::Primary).scratch_pool().allocator().locked(), 0);

        // Nothing is posted while blank
        let posts = composer.state_machine().device().post_count(DisplayId::Primary);
        composer.prepare(&mut frames);
        composer.set(&frames).unwrap();
        assert_eq!(
            composer.state_machine().device().post_count(DisplayId::Primary),
            posts
        );
    }

    #[test]
    fn stale_plan_is_not_posted() {
        let mut composer = composer();
        let mut frames = vec![two_layers(), two_layers()];

        composer.prepare(&mut frames);
        composer
            .state_machine()
            .hotplug(DisplayId::External, true)
            .unwrap();
        composer.set(&frames).unwrap();

        let device = composer.state_machine().device();
        assert_eq!(device.post_count(DisplayId::Primary), 1);
        assert_eq!(device.post_count(DisplayId::External), 0);

        // The next frame picks the new display up
        composer.prepare(&mut frames);
        composer.set(&frames).unwrap();
        let device = composer.state_machine().device();
        assert_eq!(device.post_count(DisplayId::External), 1);
    }

    #[derive(Default)]
    struct CountingListener {
        vsyncs: AtomicUsize,
    }

    impl EventListener for CountingListener {
        fn vsync(&self, display: DisplayId, _timestamp: Instant) {
            assert_eq!(display, DisplayId::Primary);
            self.vsyncs.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn vsync_events() {
        let listener = Arc::new(CountingListener::default());
        let composer = Composer::with_listener(
            NullDisplay::new(),
            NullAllocator::new(),
            NullBlitter::new(),
            PlannerConfig::default(),
            Arc::clone(&listener) as Arc<dyn EventListener>,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(listener.vsyncs.load(Ordering::Relaxed), 0);

        composer.event_control(true);
        std::thread::sleep(Duration::from_millis(200));
        composer.event_control(false);

        assert!(listener.vsyncs.load(Ordering::Relaxed) >= 3);
    }
}
