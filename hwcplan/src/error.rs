//! Errors reported by collaborators.
//!
//! Planning itself never fails. Everything here comes from the allocator,
//! the blitter, the display device, or the configuration loader, and the
//! planner turns it into a degraded (more composited) frame.
use quick_error::quick_error;

quick_error! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AllocError {
        /// The allocator ran out of backing memory.
        OutOfMemory {
            display("out of surface memory")
        }
        /// The requested format/layout combination can't be allocated.
        Unsupported {
            display("unsupported surface configuration")
        }
    }
}

quick_error! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum BlitError {
        Failed {
            display("blit failed")
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum DeviceError {
        Disconnected {
            display("display is not connected")
        }
        /// No mode satisfies the requested policy.
        NoMode {
            display("no matching display mode")
        }
        ModeSetFailed {
            display("failed to set the display mode")
        }
        /// A fence or vblank wait did not complete in time.
        Timeout {
            display("wait timed out")
        }
        Io(err: std::io::Error) {
            from()
            cause(err)
            display("I/O error: {}", err)
        }
    }
}

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ConfigError {
        InvalidValue { key: &'static str, value: String } {
            display("invalid value for {}: {:?}", key, value)
        }
    }
}
