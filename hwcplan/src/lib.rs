//! Per-frame hardware overlay planning for display compositors.
//!
//! Every frame, the window system hands over a list of layers. The planner
//! decides which of them are scanned out directly by the display
//! controller's overlay windows and which are merged into a single
//! framebuffer image, either by the window system or locally through a 2D/3D
//! [`Blitter`].
//!
//! The entry point for most users is [`Composer`], which owns a
//! [`DisplayPlan`] per display and runs the prepare/set cycle:
//!
//! ```text
//!  prepare: begin_prepare ─▶ assign_windows ─▶ end_prepare
//!                 (classify)   (pick windows,     (scratch sweep,
//!                               fb cache,          overlap check)
//!                               composite)
//!  set:     blit scratches ─▶ composite ─▶ DisplayDevice::post
//! ```
//!
//! The planning steps never fail. Every infeasibility moves more layers into
//! the framebuffer window; in the worst case everything is composited.
//!
//! Collaborators are abstracted as traits: [`DisplayDevice`] (the display
//! controller driver), [`SurfaceAllocator`] (buffer allocation), and
//! [`Blitter`] (the 2D/3D engine). The [`null`] module provides in-memory
//! implementations.

pub mod blend;
pub mod caps;
pub mod composer;
pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod fbcache;
pub mod geom;
pub mod idle;
pub mod layer;
pub mod null;
pub mod planner;
pub mod scratch;
pub mod surface;
pub mod vsync;

/// The maximum number of hardware windows per display.
pub const MAX_WINDOWS: usize = 6;

/// The maximum number of layers considered for window assignment. Layers
/// beyond this are composited.
pub const MAX_LAYERS: usize = 32;

/// The maximum number of layers tracked by the framebuffer cache.
pub const FB_CACHE_LAYERS: usize = 8;

/// The maximum number of layers in a [`CompositeList`](surface::CompositeList).
pub const COMPOSITE_LIST_MAX: usize = 5;

pub use self::{
    caps::{pick_window, DisplayCaps, WindowCaps, WindowMask},
    composer::{Composer, EventListener},
    config::{CompositePolicy, CompositorEngine, PlannerConfig},
    device::{DisplayDevice, Fence, Mode, ModePolicy},
    display::{DisplayId, DisplayState, DisplayStateMachine},
    error::{AllocError, BlitError, ConfigError, DeviceError},
    layer::{BlendMode, CompositionType, DisplayContents, Layer, PixelFormat, Transform},
    planner::{DisplayPlan, FrameOutcome, WindowConfig},
    surface::{Blitter, Surface, SurfaceAllocator, SurfaceHandle},
};
