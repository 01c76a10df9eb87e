//! The display controller driver as seen by the planner.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{
    caps::DisplayCaps, display::DisplayId, error::DeviceError, planner::WindowConfig,
    surface::SurfaceHandle,
};

/// The refresh rate assumed when a mode doesn't report one.
pub const DEFAULT_REFRESH_HZ: u32 = 60;

/// The slack added to a refresh period to obtain a wait deadline.
const VBLANK_MARGIN: Duration = Duration::from_millis(10);

/// A display timing, reduced to what the planner cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display(fmt = "{}x{}@{}", width, height, refresh_hz)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    /// `0` if unknown.
    pub refresh_hz: u32,
    pub stereo: bool,
}

impl Mode {
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        Self {
            width,
            height,
            refresh_hz,
            stereo: false,
        }
    }

    /// The deadline for waiting on a vblank or a present fence.
    pub fn vblank_timeout(&self) -> Duration {
        vblank_timeout(self.refresh_hz)
    }
}

/// How [`DisplayDevice::choose_mode`] matches a requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModePolicy {
    Exact,
    Closest,
    /// The smallest mode at least as large as requested.
    RoundUp,
    StereoExact,
    StereoClosest,
}

impl ModePolicy {
    fn is_stereo(self) -> bool {
        match self {
            ModePolicy::StereoExact | ModePolicy::StereoClosest => true,
            _ => false,
        }
    }
}

/// Pick a mode from `modes` according to `policy`.
///
/// A building block for [`DisplayDevice::choose_mode`] implementations.
pub fn select_mode(modes: &[Mode], width: u32, height: u32, policy: ModePolicy) -> Option<Mode> {
    let distance = |m: &Mode| {
        (i64::from(m.width) - i64::from(width)).abs() + (i64::from(m.height) - i64::from(height)).abs()
    };
    let candidates = modes.iter().filter(|m| m.stereo == policy.is_stereo());

    match policy {
        ModePolicy::Exact | ModePolicy::StereoExact => candidates
            .filter(|m| m.width == width && m.height == height)
            .max_by_key(|m| m.refresh_hz)
            .cloned(),
        ModePolicy::Closest | ModePolicy::StereoClosest => candidates
            .min_by_key(|m| (distance(m), std::cmp::Reverse(m.refresh_hz)))
            .cloned(),
        ModePolicy::RoundUp => candidates
            .filter(|m| m.width >= width && m.height >= height)
            .min_by_key(|m| (u64::from(m.width) * u64::from(m.height), std::cmp::Reverse(m.refresh_hz)))
            .cloned(),
    }
}

/// Compute the deadline for a wait tied to the refresh cycle: one refresh
/// period rounded to the nearest millisecond plus a fixed margin.
pub fn vblank_timeout(refresh_hz: u32) -> Duration {
    let refresh_hz = if refresh_hz == 0 {
        DEFAULT_REFRESH_HZ
    } else {
        refresh_hz
    };
    let period_ns = 1_000_000_000 / u64::from(refresh_hz);
    Duration::from_millis((period_ns + 500_000) / 1_000_000) + VBLANK_MARGIN
}

/// Signals when the hardware is done with a set of buffers.
#[derive(Debug, Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

#[derive(Debug)]
struct FenceInner {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                signaled: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Construct a fence that has already signaled.
    pub fn signaled() -> Self {
        let this = Self::new();
        this.signal();
        this
    }

    pub fn signal(&self) {
        let mut signaled = self.inner.signaled.lock().unwrap();
        *signaled = true;
        self.inner.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock().unwrap()
    }

    /// Block until the fence signals or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.inner.signaled.lock().unwrap();

        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return Err(DeviceError::Timeout);
            }
            signaled = self.inner.cv.wait_timeout(signaled, deadline - now).unwrap().0;
        }

        Ok(())
    }

    /// [`Self::wait`], logging a timeout instead of returning it. A stale
    /// frame is preferable to a hung compositor.
    pub fn wait_or_warn(&self, timeout: Duration) {
        if let Err(e) = self.wait(timeout) {
            log::warn!("fence wait ({:?}): {}", timeout, e);
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

/// The kinds of display outputs behind a [`DisplayDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// A built-in panel driven by the display controller.
    FixedFunctionPanel,
    HdmiOutput,
    /// A virtual output captured into memory (e.g., for streaming).
    VideoCaptureSink,
    NullDisplay,
}

/// The display controller driver.
///
/// All methods are called with the display state lock held, except for
/// [`Self::vblank_wait`], which runs on the vsync thread.
pub trait DisplayDevice: Send + Sync {
    fn kind(&self, display: DisplayId) -> BackendKind;

    fn capabilities(&self, display: DisplayId) -> Result<DisplayCaps, DeviceError>;

    /// The mode currently programmed, or [`DeviceError::Disconnected`].
    fn current_mode(&self, display: DisplayId) -> Result<Mode, DeviceError>;

    fn choose_mode(
        &self,
        display: DisplayId,
        width: u32,
        height: u32,
        policy: ModePolicy,
    ) -> Option<Mode>;

    fn set_mode(&self, display: DisplayId, mode: &Mode) -> Result<(), DeviceError>;

    /// Program the windows and flip. `None` turns every window off.
    ///
    /// `buffers` is indexed like [`WindowConfig::overlays`]. Returns a fence
    /// that signals when the previous buffers are no longer scanned out.
    fn post(
        &self,
        display: DisplayId,
        config: Option<&WindowConfig>,
        buffers: &[Option<SurfaceHandle>],
    ) -> Result<Fence, DeviceError>;

    fn blank(&self, display: DisplayId, blank: bool) -> Result<(), DeviceError>;

    /// Block until the next vertical blank of the primary display.
    fn vblank_wait(&self) -> Result<(), DeviceError>;
}

impl<T: DisplayDevice + ?Sized> DisplayDevice for Arc<T> {
    fn kind(&self, display: DisplayId) -> BackendKind {
        (**self).kind(display)
    }

    fn capabilities(&self, display: DisplayId) -> Result<DisplayCaps, DeviceError> {
        (**self).capabilities(display)
    }

    fn current_mode(&self, display: DisplayId) -> Result<Mode, DeviceError> {
        (**self).current_mode(display)
    }

    fn choose_mode(
        &self,
        display: DisplayId,
        width: u32,
        height: u32,
        policy: ModePolicy,
    ) -> Option<Mode> {
        (**self).choose_mode(display, width, height, policy)
    }

    fn set_mode(&self, display: DisplayId, mode: &Mode) -> Result<(), DeviceError> {
        (**self).set_mode(display, mode)
    }

    fn post(
        &self,
        display: DisplayId,
        config: Option<&WindowConfig>,
        buffers: &[Option<SurfaceHandle>],
    ) -> Result<Fence, DeviceError> {
        (**self).post(display, config, buffers)
    }

    fn blank(&self, display: DisplayId, blank: bool) -> Result<(), DeviceError> {
        (**self).blank(display, blank)
    }

    fn vblank_wait(&self) -> Result<(), DeviceError> {
        (**self).vblank_wait()
    }
}
