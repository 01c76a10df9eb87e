//! Idle detection.
//!
//! Overlapping windows are expensive to maintain for the display controller
//! but cheap to recompose when nothing moves. When the frame rate drops below
//! a threshold while windows overlap, the planner switches to composition
//! until frames start flowing again.
//!
//! The decision is made from the timestamps of the last [`IDLE_FRAMES`]
//! prepares. A timer thread covers the case where frames stop altogether: it
//! fires at the moment the display would be considered idle and asks the
//! window system for another frame, which then gets composited.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::error::DeviceError;

/// The number of frames over which the frame rate is measured.
pub const IDLE_FRAMES: usize = 8;

#[derive(Debug)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    mutex: Mutex<TimerState>,
    cv: Condvar,
    enabled: AtomicBool,
    composite: AtomicBool,
}

#[derive(Debug)]
pub struct IdleMachine {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    /// `None` if idle detection is off.
    time_limit: Option<Duration>,
    ring: [Instant; IDLE_FRAMES],
    index: usize,
    timeout: Instant,
    enabled: bool,
    /// The value of the composite flag as of the last update.
    composite: bool,
}

impl IdleMachine {
    /// Construct an `IdleMachine` without a timer thread. `min_fps == 0`
    /// disables idle detection.
    pub fn new(min_fps: u32) -> Self {
        Self::with_start(min_fps, Instant::now())
    }

    fn with_start(min_fps: u32, start: Instant) -> Self {
        let time_limit = if min_fps > 0 {
            Some(Duration::from_millis(
                IDLE_FRAMES as u64 * 1000 / u64::from(min_fps),
            ))
        } else {
            None
        };

        Self {
            shared: Arc::new(Shared {
                mutex: Mutex::new(TimerState {
                    deadline: None,
                    shutdown: false,
                }),
                cv: Condvar::new(),
                enabled: AtomicBool::new(false),
                composite: AtomicBool::new(false),
            }),
            thread: None,
            time_limit,
            ring: [start; IDLE_FRAMES],
            index: 0,
            timeout: start + time_limit.unwrap_or_default(),
            enabled: false,
            composite: false,
        }
    }

    /// Construct an `IdleMachine` with a timer thread calling `on_idle`
    /// when no frame arrives in time.
    pub fn spawn(min_fps: u32, on_idle: impl Fn() + Send + 'static) -> Result<Self, DeviceError> {
        let mut this = Self::new(min_fps);
        if this.time_limit.is_none() {
            return Ok(this);
        }

        let shared = Arc::clone(&this.shared);
        this.thread = Some(
            std::thread::Builder::new()
                .name("hwcplan idle".to_owned())
                .spawn(move || timer_main(&shared, on_idle))?,
        );

        Ok(this)
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the planner should composite instead of using windows.
    pub fn composite(&self) -> bool {
        self.shared.composite.load(Ordering::Acquire)
    }

    /// Record a frame. Returns `true` if the composite decision changed.
    pub fn update(&mut self) -> bool {
        self.update_at(Instant::now())
    }

    fn update_at(&mut self, now: Instant) -> bool {
        let time_limit = match self.time_limit {
            Some(x) => x,
            None => return false,
        };

        let is_idle = now > self.timeout;
        let composite = is_idle && self.enabled;
        let changed = composite != self.composite;
        self.composite = composite;
        self.shared.composite.store(composite, Ordering::Release);

        if changed {
            log::debug!(
                "{} idle composition",
                if composite { "entering" } else { "leaving" }
            );
        }

        self.ring[self.index] = now;
        self.index = (self.index + 1) % IDLE_FRAMES;
        self.timeout = self.ring[self.index] + time_limit;

        if self.enabled {
            if composite {
                self.disarm();
            } else {
                self.arm(self.timeout);
            }
        }

        changed
    }

    /// Start watching the frame rate.
    pub fn enable(&mut self) {
        if self.enabled || self.time_limit.is_none() {
            return;
        }
        log::trace!("idle detection enabled");
        self.enabled = true;
        self.shared.enabled.store(true, Ordering::Release);
        self.arm(self.timeout);
    }

    pub fn disable(&mut self) {
        if self.enabled {
            log::trace!("idle detection disabled");
        }
        self.composite = false;
        self.shared.composite.store(false, Ordering::Release);
        self.enabled = false;
        self.shared.enabled.store(false, Ordering::Release);
        self.disarm();
    }

    fn arm(&self, deadline: Instant) {
        let mut state = self.shared.mutex.lock().unwrap();
        state.deadline = Some(deadline);
        self.shared.cv.notify_one();
    }

    fn disarm(&self) {
        let mut state = self.shared.mutex.lock().unwrap();
        state.deadline = None;
        self.shared.cv.notify_one();
    }
}

impl Drop for IdleMachine {
    fn drop(&mut self) {
        {
            let mut state = self.shared.mutex.lock().unwrap();
            state.shutdown = true;
            self.shared.cv.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn timer_main(shared: &Shared, on_idle: impl Fn()) {
    let mut state = shared.mutex.lock().unwrap();

    while !state.shutdown {
        let deadline = match state.deadline {
            Some(x) => x,
            None => {
                state = shared.cv.wait(state).unwrap();
                continue;
            }
        };

        let now = Instant::now();
        if now < deadline {
            state = shared.cv.wait_timeout(state, deadline - now).unwrap().0;
            continue;
        }

        // One-shot
        state.deadline = None;

        if shared.enabled.load(Ordering::Acquire) {
            shared.composite.store(true, Ordering::Release);
            drop(state);
            log::debug!("no frame in time, requesting one");
            on_idle();
            state = shared.mutex.lock().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ms(x: u64) -> Duration {
        Duration::from_millis(x)
    }

    #[test]
    fn time_limit() {
        assert_eq!(IdleMachine::new(10).time_limit(), Some(ms(800)));
        assert_eq!(IdleMachine::new(8).time_limit(), Some(ms(1000)));
        assert_eq!(IdleMachine::new(0).time_limit(), None);
    }

    #[test]
    fn slow_frames_trigger_composition() {
        let t0 = Instant::now();
        let mut idle = IdleMachine::with_start(10, t0);
        idle.enable();

        assert!(!idle.update_at(t0 + ms(100)));
        assert!(!idle.composite());

        assert!(idle.update_at(t0 + ms(900)));
        assert!(idle.composite());

        // Frames flow again. Composition stops once the measurement window
        // has caught up.
        let mut changes = 0;
        for i in 1..=16 {
            if idle.update_at(t0 + ms(900 + 10 * i)) {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
        assert!(!idle.composite());
    }

    #[test]
    fn disabled_never_composites() {
        let t0 = Instant::now();
        let mut idle = IdleMachine::with_start(10, t0);
        assert!(!idle.update_at(t0 + ms(5000)));
        assert!(!idle.composite());

        let mut idle = IdleMachine::with_start(0, t0);
        idle.enable();
        assert!(!idle.is_enabled());
        assert!(!idle.update_at(t0 + ms(5000)));
    }

    #[test]
    fn disable_clears_composite() {
        let t0 = Instant::now();
        let mut idle = IdleMachine::with_start(10, t0);
        idle.enable();
        assert!(idle.update_at(t0 + ms(900)));
        idle.disable();
        assert!(!idle.composite());
        assert!(!idle.update_at(t0 + ms(5000)));
    }

    #[test]
    fn timer_fires_when_frames_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        // 8 frames at 100fps = 80ms
        let mut idle = IdleMachine::spawn(100, move || {
            count2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        idle.enable();
        std::thread::sleep(ms(300));
        // One-shot until the next frame re-arms it
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(idle.composite());

        idle.disable();
        count.store(0, Ordering::Relaxed);
        std::thread::sleep(ms(200));
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
