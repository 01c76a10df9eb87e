//! Collaborators that don't touch any hardware.
//!
//! They record what the planner asks of them, which makes them suitable for
//! testing as well as for running the planner headless.
use cgmath::Point2;
use hwcrect::Rect;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    caps::DisplayCaps,
    device::{select_mode, BackendKind, DisplayDevice, Fence, Mode, ModePolicy},
    display::{DisplayId, NUM_DISPLAYS},
    error::{AllocError, BlitError, DeviceError},
    layer::{PixelFormat, Transform},
    planner::WindowConfig,
    surface::{
        Blitter, CompositeList, Layout, Surface, SurfaceAllocator, SurfaceHandle, SurfaceId, Usage,
    },
};

/// The refresh period simulated by [`NullDisplay::vblank_wait`].
const REFRESH_PERIOD: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// What a [`NullDisplay`] was last asked to show.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub config: Option<WindowConfig>,
    pub buffers: Vec<Option<SurfaceId>>,
}

#[derive(Debug)]
struct Output {
    caps: DisplayCaps,
    modes: Vec<Mode>,
    mode: Option<Mode>,
    blank: bool,
    posts: usize,
    last_post: Option<PostRecord>,
}

/// A [`DisplayDevice`] with a 1280x800 built-in panel and an external
/// output supporting a few common modes.
#[derive(Debug)]
pub struct NullDisplay {
    outputs: Mutex<[Output; NUM_DISPLAYS]>,
    epoch: Instant,
}

impl NullDisplay {
    pub fn new() -> Self {
        let primary_mode = Mode::new(1280, 800, 60);
        Self {
            outputs: Mutex::new([
                Output {
                    caps: DisplayCaps::reference(),
                    modes: vec![primary_mode],
                    mode: Some(primary_mode),
                    blank: true,
                    posts: 0,
                    last_post: None,
                },
                Output {
                    caps: DisplayCaps::reference(),
                    modes: vec![
                        Mode::new(640, 480, 60),
                        Mode::new(1280, 720, 60),
                        Mode::new(1920, 1080, 60),
                    ],
                    mode: None,
                    blank: true,
                    posts: 0,
                    last_post: None,
                },
            ]),
            epoch: Instant::now(),
        }
    }

    pub fn with_caps(mut self, id: DisplayId, caps: DisplayCaps) -> Self {
        self.outputs.get_mut().unwrap()[id.index()].caps = caps;
        self
    }

    /// Replace the supported modes. The primary display runs in the first
    /// one.
    pub fn with_modes(mut self, id: DisplayId, modes: Vec<Mode>) -> Self {
        let output = &mut self.outputs.get_mut().unwrap()[id.index()];
        if id == DisplayId::Primary {
            output.mode = modes.first().cloned();
        } else if !output.mode.map_or(true, |m| modes.contains(&m)) {
            output.mode = None;
        }
        output.modes = modes;
        self
    }

    pub fn post_count(&self, id: DisplayId) -> usize {
        self.outputs.lock().unwrap()[id.index()].posts
    }

    pub fn last_post(&self, id: DisplayId) -> Option<PostRecord> {
        self.outputs.lock().unwrap()[id.index()].last_post.clone()
    }

    pub fn is_blank(&self, id: DisplayId) -> bool {
        self.outputs.lock().unwrap()[id.index()].blank
    }
}

impl Default for NullDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayDevice for NullDisplay {
    fn kind(&self, _display: DisplayId) -> BackendKind {
        BackendKind::NullDisplay
    }

    fn capabilities(&self, display: DisplayId) -> Result<DisplayCaps, DeviceError> {
        Ok(self.outputs.lock().unwrap()[display.index()].caps.clone())
    }

    fn current_mode(&self, display: DisplayId) -> Result<Mode, DeviceError> {
        self.outputs.lock().unwrap()[display.index()]
            .mode
            .ok_or(DeviceError::Disconnected)
    }

    fn choose_mode(
        &self,
        display: DisplayId,
        width: u32,
        height: u32,
        policy: ModePolicy,
    ) -> Option<Mode> {
        let outputs = self.outputs.lock().unwrap();
        select_mode(&outputs[display.index()].modes, width, height, policy)
    }

    fn set_mode(&self, display: DisplayId, mode: &Mode) -> Result<(), DeviceError> {
        let mut outputs = self.outputs.lock().unwrap();
        let output = &mut outputs[display.index()];
        if !output.modes.contains(mode) {
            return Err(DeviceError::ModeSetFailed);
        }
        output.mode = Some(*mode);
        Ok(())
    }

    fn post(
        &self,
        display: DisplayId,
        config: Option<&WindowConfig>,
        buffers: &[Option<SurfaceHandle>],
    ) -> Result<Fence, DeviceError> {
        let mut outputs = self.outputs.lock().unwrap();
        let output = &mut outputs[display.index()];
        output.posts += 1;
        output.last_post = Some(PostRecord {
            config: config.cloned(),
            buffers: buffers
                .iter()
                .map(|b| b.as_ref().map(|s| s.id()))
                .collect(),
        });
        log::trace!("{:?}: post #{}", display, output.posts);
        Ok(Fence::signaled())
    }

    fn blank(&self, display: DisplayId, blank: bool) -> Result<(), DeviceError> {
        self.outputs.lock().unwrap()[display.index()].blank = blank;
        Ok(())
    }

    fn vblank_wait(&self) -> Result<(), DeviceError> {
        let elapsed = self.epoch.elapsed().as_nanos();
        let period = REFRESH_PERIOD.as_nanos();
        let until_next = period - elapsed % period;
        std::thread::sleep(Duration::from_nanos(until_next as u64));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AllocStats {
    live: AtomicUsize,
    locked: AtomicUsize,
    limit: Option<usize>,
}

/// A [`SurfaceAllocator`] producing surfaces without backing memory.
///
/// Clones share the statistics.
#[derive(Debug, Clone, Default)]
pub struct NullAllocator {
    stats: Arc<AllocStats>,
}

impl NullAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with [`AllocError::OutOfMemory`] once `limit` surfaces are live.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            stats: Arc::new(AllocStats {
                limit: Some(limit),
                ..AllocStats::default()
            }),
        }
    }

    /// The number of scratch surfaces allocated and not freed.
    pub fn live(&self) -> usize {
        self.stats.live.load(Ordering::Relaxed)
    }

    /// The number of outstanding pins.
    pub fn locked(&self) -> usize {
        self.stats.locked.load(Ordering::Relaxed)
    }
}

impl SurfaceAllocator for NullAllocator {
    fn alloc_scratch(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
        layout: Layout,
    ) -> Result<SurfaceHandle, AllocError> {
        if width == 0 || height == 0 {
            return Err(AllocError::Unsupported);
        }
        if let Some(limit) = self.stats.limit {
            if self.live() >= limit {
                return Err(AllocError::OutOfMemory);
            }
        }
        self.stats.live.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Surface::new(width, height, format, layout, usage)))
    }

    fn free_scratch(&self, _surface: SurfaceHandle) {
        self.stats.live.fetch_sub(1, Ordering::Relaxed);
    }

    fn lock(&self, _surface: &SurfaceHandle, _usage: Usage, _rect: Rect) -> Result<(), AllocError> {
        self.stats.locked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unlock(&self, _surface: &SurfaceHandle, _fence: Option<&Fence>) {
        self.stats.locked.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A [`Blitter`] that only records its invocations.
#[derive(Debug, Default)]
pub struct NullBlitter {
    failing: bool,
    blits: AtomicUsize,
    composites: AtomicUsize,
    last_blit: Mutex<Option<(Rect, Rect, Transform)>>,
    last_composite: Mutex<Option<CompositeList>>,
}

impl NullBlitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a `NullBlitter` whose every operation fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn blit_count(&self) -> usize {
        self.blits.load(Ordering::Relaxed)
    }

    pub fn composite_count(&self) -> usize {
        self.composites.load(Ordering::Relaxed)
    }

    /// The source rectangle, destination rectangle, and transform of the
    /// most recent blit.
    pub fn last_blit(&self) -> Option<(Rect, Rect, Transform)> {
        *self.last_blit.lock().unwrap()
    }

    pub fn last_composite(&self) -> Option<CompositeList> {
        self.last_composite.lock().unwrap().clone()
    }
}

impl Blitter for NullBlitter {
    fn blit(
        &self,
        _src: &Surface,
        _src_index: usize,
        _dst: &Surface,
        _dst_index: usize,
        src_rect: Rect,
        dst_rect: Rect,
        transform: Transform,
    ) -> Result<Point2<i32>, BlitError> {
        if self.failing {
            return Err(BlitError::Failed);
        }
        self.blits.fetch_add(1, Ordering::Relaxed);
        *self.last_blit.lock().unwrap() = Some((src_rect, dst_rect, transform));
        Ok(dst_rect.min)
    }

    fn composite(&self, _dst: &Surface, list: &CompositeList) -> Result<(), BlitError> {
        if self.failing {
            return Err(BlitError::Failed);
        }
        self.composites.fetch_add(1, Ordering::Relaxed);
        *self.last_composite.lock().unwrap() = Some(list.clone());
        Ok(())
    }
}
