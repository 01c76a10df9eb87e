//! Display connection state and the hotplug watcher.
//!
//! Everything the planner needs to know about a display's connection lives
//! in [`DisplayState`]. [`DisplayStateMachine`] owns one per display and is
//! the only place that mutates them, always under a single mutex. The
//! planner takes a copy at the start of each frame and compares
//! [`DisplayStateMachine::generation`] (a lock-free read) to find out
//! whether it has to replan.
use hwcrect::{Rect, Rotation};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    caps::DisplayCaps,
    device::{DisplayDevice, Fence, Mode, ModePolicy},
    error::DeviceError,
};

pub const NUM_DISPLAYS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayId {
    /// The built-in display. Always present.
    Primary,
    External,
}

impl DisplayId {
    pub const ALL: [DisplayId; NUM_DISPLAYS] = [DisplayId::Primary, DisplayId::External];

    pub fn index(self) -> usize {
        match self {
            DisplayId::Primary => 0,
            DisplayId::External => 1,
        }
    }
}

/// A snapshot of a display's connection state.
#[derive(Debug, Clone)]
pub struct DisplayState {
    pub connected: bool,
    pub blank: bool,
    pub mode: Option<Mode>,
    /// The first mode seen after connecting.
    pub default_mode: Option<Mode>,
    pub caps: DisplayCaps,
    pub panel_rotation: Rotation,
    /// The display controller's coordinate space.
    pub device_clip: Rect,
    /// The window system's coordinate space. Transposed from `device_clip`
    /// for a panel mounted sideways.
    pub layer_clip: Rect,
    /// Signals when the buffers on screen before blanking were released.
    pub release_fence: Option<Fence>,
    /// The hotplug generation as of the last change to this display.
    pub generation: u64,
}

impl DisplayState {
    fn disconnected() -> Self {
        Self {
            connected: false,
            blank: true,
            mode: None,
            default_mode: None,
            caps: DisplayCaps::new(&[]),
            panel_rotation: Rotation::Identity,
            device_clip: Rect::zero(),
            layer_clip: Rect::zero(),
            release_fence: None,
            generation: 0,
        }
    }

    /// Whether frames should be planned for the display.
    pub fn is_active(&self) -> bool {
        self.connected && !self.blank
    }
}

/// Owns the [`DisplayState`] of every display.
#[derive(Debug)]
pub struct DisplayStateMachine<D> {
    device: D,
    panel_rotation: Rotation,
    displays: Mutex<[DisplayState; NUM_DISPLAYS]>,
    generation: AtomicU64,
}

impl<D: DisplayDevice> DisplayStateMachine<D> {
    /// Construct a `DisplayStateMachine` and bring up the primary display.
    pub fn new(device: D, panel_rotation: Rotation) -> Self {
        let this = Self {
            device,
            panel_rotation,
            displays: Mutex::new([DisplayState::disconnected(), DisplayState::disconnected()]),
            generation: AtomicU64::new(0),
        };

        if let Err(e) = this.hotplug(DisplayId::Primary, true) {
            log::error!("failed to bring up the primary display: {}", e);
        }

        this
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// The number of connect/disconnect transitions and mode changes so
    /// far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn snapshot(&self, id: DisplayId) -> DisplayState {
        self.lock()[id.index()].clone()
    }

    /// Run `f` with the state lock held, e.g., to post without racing a
    /// hotplug transition.
    pub fn with_display<R>(&self, id: DisplayId, f: impl FnOnce(&DisplayState) -> R) -> R {
        f(&self.lock()[id.index()])
    }

    fn lock(&self) -> MutexGuard<'_, [DisplayState; NUM_DISPLAYS]> {
        self.displays.lock().unwrap()
    }

    /// Process a connection change.
    ///
    /// A failure to bring up a connected display leaves it disconnected.
    pub fn hotplug(&self, id: DisplayId, connected: bool) -> Result<(), DeviceError> {
        let mut displays = self.lock();

        if displays[id.index()].connected == connected {
            log::debug!("{:?}: redundant hotplug event", id);
            return Ok(());
        }

        log::info!(
            "{:?} {}",
            id,
            if connected { "connected" } else { "disconnected" }
        );

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let result = if connected {
            self.unblank_locked(&mut displays, id)
        } else {
            self.blank_locked(&mut displays[id.index()], id)
        };

        let state = &mut displays[id.index()];
        state.generation = generation;
        state.connected = connected && result.is_ok();
        if !state.connected {
            state.blank = true;
            state.mode = None;
            state.default_mode = None;
        }

        result
    }

    /// Turn a display off or on.
    pub fn blank(&self, id: DisplayId, blank: bool) -> Result<(), DeviceError> {
        let mut displays = self.lock();

        if !displays[id.index()].connected {
            return Err(DeviceError::Disconnected);
        }
        if displays[id.index()].blank == blank {
            return Ok(());
        }

        log::info!("{:?} {}", id, if blank { "blank" } else { "unblank" });

        if blank {
            self.blank_locked(&mut displays[id.index()], id)
        } else {
            self.unblank_locked(&mut displays, id)
        }
    }

    /// Program a new mode and adopt the resulting geometry.
    ///
    /// Like a connection change, this bumps the hotplug generation, so
    /// configurations planned against the old geometry are never posted.
    pub fn set_mode(&self, id: DisplayId, mode: &Mode) -> Result<(), DeviceError> {
        let mut displays = self.lock();

        if !displays[id.index()].connected {
            return Err(DeviceError::Disconnected);
        }

        log::info!("{:?}: mode {}", id, mode);
        self.device.set_mode(id, mode).map_err(|e| {
            log::error!("{:?}: failed to set mode {}: {}", id, mode, e);
            e
        })?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let state = &mut displays[id.index()];
        state.generation = generation;
        self.refresh_locked(state, id)
    }

    fn blank_locked(&self, state: &mut DisplayState, id: DisplayId) -> Result<(), DeviceError> {
        state.blank = true;

        // Turn off every window so that the buffers can be released
        state.release_fence = match self.device.post(id, None, &[]) {
            Ok(fence) => Some(fence),
            Err(e) => {
                log::warn!("{:?}: failed to disable windows: {}", id, e);
                None
            }
        };

        self.device.blank(id, true)
    }

    fn unblank_locked(
        &self,
        displays: &mut [DisplayState; NUM_DISPLAYS],
        id: DisplayId,
    ) -> Result<(), DeviceError> {
        if id == DisplayId::External {
            // Mirror the primary display as closely as possible
            let primary = &displays[DisplayId::Primary.index()].layer_clip;
            let (width, height) = (primary.width() as u32, primary.height() as u32);

            let mode = self
                .device
                .choose_mode(id, width, height, ModePolicy::Closest)
                .ok_or(DeviceError::NoMode)?;
            log::info!("{:?}: mode {} for {}x{}", id, mode, width, height);
            self.device.set_mode(id, &mode).map_err(|e| {
                log::error!("{:?}: failed to set mode {}: {}", id, mode, e);
                e
            })?;
        }

        self.device.blank(id, false)?;
        self.refresh_locked(&mut displays[id.index()], id)
    }

    /// Re-read the mode and capabilities from the device.
    fn refresh_locked(&self, state: &mut DisplayState, id: DisplayId) -> Result<(), DeviceError> {
        let mode = self.device.current_mode(id)?;
        let caps = self.device.capabilities(id)?;

        let panel_rotation = match id {
            DisplayId::Primary => self.panel_rotation,
            DisplayId::External => Rotation::Identity,
        };
        let (width, height) = (mode.width as i32, mode.height as i32);

        state.device_clip = Rect::with_size(width, height);
        state.layer_clip = if panel_rotation.swaps_axes() {
            Rect::with_size(height, width)
        } else {
            state.device_clip
        };
        state.panel_rotation = panel_rotation;
        state.caps = caps;
        state.mode = Some(mode);
        if state.default_mode.is_none() {
            state.default_mode = Some(mode);
        }
        state.blank = false;
        state.release_fence = None;

        log::debug!(
            "{:?}: {} with {} windows",
            id,
            mode,
            state.caps.num_windows()
        );
        Ok(())
    }
}

/// A connection change reported by a [`HotplugSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotplugEvent {
    pub display: DisplayId,
    pub connected: bool,
}

/// The hotplug notification channel of the display driver.
pub trait HotplugSource: Send + 'static {
    /// Block until an event arrives or `timeout` elapses.
    fn wait_event(&mut self, timeout: Duration) -> Option<HotplugEvent>;
}

/// How often the watcher thread checks for shutdown.
const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Feeds the events of a [`HotplugSource`] into a [`DisplayStateMachine`]
/// on a background thread. The thread is stopped on drop.
#[derive(Debug)]
pub struct HotplugWatcher {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Spawn the watcher thread. `on_event` is called after each
    /// transition, without the state lock held.
    pub fn spawn<D, S, F>(
        machine: Arc<DisplayStateMachine<D>>,
        mut source: S,
        on_event: F,
    ) -> Result<Self, DeviceError>
    where
        D: DisplayDevice + Send + Sync + 'static,
        S: HotplugSource,
        F: Fn(HotplugEvent) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown2 = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("hwcplan hotplug".to_owned())
            .spawn(move || {
                while !shutdown2.load(Ordering::Acquire) {
                    let event = match source.wait_event(WATCHER_POLL_INTERVAL) {
                        Some(event) => event,
                        None => continue,
                    };

                    if let Err(e) = machine.hotplug(event.display, event.connected) {
                        log::error!("{:?}: hotplug failed: {}", event.display, e);
                    }
                    on_event(event);
                }
                log::debug!("hotplug watcher exiting");
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::NullDisplay;

    #[test]
    fn primary_comes_up() {
        let sm = DisplayStateMachine::new(NullDisplay::new(), Rotation::Identity);
        let primary = sm.snapshot(DisplayId::Primary);
        assert!(primary.is_active());
        assert_eq!(primary.device_clip, Rect::with_size(1280, 800));
        assert_eq!(primary.layer_clip, primary.device_clip);
        assert_eq!(sm.generation(), 1);

        let external = sm.snapshot(DisplayId::External);
        assert!(!external.connected);
        assert!(!external.is_active());
    }

    #[test]
    fn sideways_panel() {
        let sm = DisplayStateMachine::new(NullDisplay::new(), Rotation::Deg90);
        let primary = sm.snapshot(DisplayId::Primary);
        assert_eq!(primary.device_clip, Rect::with_size(1280, 800));
        assert_eq!(primary.layer_clip, Rect::with_size(800, 1280));
    }

    #[test]
    fn external_hotplug() {
        let sm = DisplayStateMachine::new(NullDisplay::new(), Rotation::Identity);

        sm.hotplug(DisplayId::External, true).unwrap();
        assert_eq!(sm.generation(), 2);
        let external = sm.snapshot(DisplayId::External);
        assert!(external.is_active());
        assert_eq!(external.generation, 2);
        // The mode closest to the primary display
        assert_eq!(external.mode, Some(Mode::new(1280, 720, 60)));

        // Redundant events don't bump the generation
        sm.hotplug(DisplayId::External, true).unwrap();
        assert_eq!(sm.generation(), 2);

        sm.hotplug(DisplayId::External, false).unwrap();
        assert_eq!(sm.generation(), 3);
        let external = sm.snapshot(DisplayId::External);
        assert!(!external.connected);
        assert!(external.release_fence.is_some());
        assert_eq!(sm.device().post_count(DisplayId::External), 1);
    }

    #[test]
    fn mode_change_bumps_the_generation() {
        let sm = DisplayStateMachine::new(NullDisplay::new(), Rotation::Identity);
        sm.hotplug(DisplayId::External, true).unwrap();
        assert_eq!(sm.generation(), 2);

        sm.set_mode(DisplayId::External, &Mode::new(1920, 1080, 60)).unwrap();
        assert_eq!(sm.generation(), 3);
        let external = sm.snapshot(DisplayId::External);
        assert_eq!(external.generation, 3);
        assert_eq!(external.device_clip, Rect::with_size(1920, 1080));
        // The first mode stays the default
        assert_eq!(external.default_mode, Some(Mode::new(1280, 720, 60)));
    }

    #[test]
    fn blank_and_unblank() {
        let sm = DisplayStateMachine::new(NullDisplay::new(), Rotation::Identity);

        sm.blank(DisplayId::Primary, true).unwrap();
        let primary = sm.snapshot(DisplayId::Primary);
        assert!(primary.connected);
        assert!(primary.blank);
        assert!(sm.device().is_blank(DisplayId::Primary));

        sm.blank(DisplayId::Primary, false).unwrap();
        assert!(sm.snapshot(DisplayId::Primary).is_active());
        assert!(!sm.device().is_blank(DisplayId::Primary));

        match sm.blank(DisplayId::External, true) {
            Err(DeviceError::Disconnected) => {}
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn failed_mode_query_leaves_disconnected() {
        let sm = DisplayStateMachine::new(
            NullDisplay::new().with_modes(DisplayId::External, Vec::new()),
            Rotation::Identity,
        );
        match sm.hotplug(DisplayId::External, true) {
            Err(DeviceError::NoMode) => {}
            other => panic!("{:?}", other),
        }
        assert!(!sm.snapshot(DisplayId::External).connected);
    }
}
