//! Vertical sync event delivery.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::error::DeviceError;

/// The delay before retrying after a failed vblank wait.
const RETRY_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug)]
struct Shared {
    mutex: Mutex<()>,
    cv: Condvar,
    enabled: AtomicBool,
    shutdown: AtomicBool,
}

/// A thread waiting for vertical blanks and reporting them while enabled.
///
/// The thread parks while disabled, so it doesn't consume CPU time or wake
/// the display controller when nobody is listening.
#[derive(Debug)]
pub struct VsyncThread {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl VsyncThread {
    pub fn spawn(
        mut wait: impl FnMut() -> Result<(), DeviceError> + Send + 'static,
        on_vsync: impl Fn(Instant) + Send + 'static,
    ) -> Result<Self, DeviceError> {
        let shared = Arc::new(Shared {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            enabled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let shared2 = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("hwcplan vsync".to_owned())
            .spawn(move || {
                let shared = shared2;
                loop {
                    {
                        let mut guard = shared.mutex.lock().unwrap();
                        while !shared.enabled.load(Ordering::Relaxed)
                            && !shared.shutdown.load(Ordering::Relaxed)
                        {
                            guard = shared.cv.wait(guard).unwrap();
                        }
                    }

                    if shared.shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    if let Err(e) = wait() {
                        log::warn!("vblank wait failed: {:?}", e);
                        std::thread::sleep(RETRY_INTERVAL);
                        continue;
                    }

                    let timestamp = Instant::now();

                    // The listener may have been turned off while we were
                    // waiting
                    if shared.enabled.load(Ordering::Relaxed) {
                        on_vsync(timestamp);
                    }
                }
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        let _guard = self.shared.mutex.lock().unwrap();
        self.shared.enabled.store(enabled, Ordering::Relaxed);
        self.shared.cv.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }
}

impl Drop for VsyncThread {
    fn drop(&mut self) {
        {
            let _guard = self.shared.mutex.lock().unwrap();
            self.shared.shutdown.store(true, Ordering::Relaxed);
            self.shared.cv.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
