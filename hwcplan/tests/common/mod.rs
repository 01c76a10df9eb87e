#![allow(dead_code)]
use hwcplan::{
    layer::LayerFlags,
    null::NullAllocator,
    planner::FrameContext,
    surface::{Surface, Usage},
    CompositePolicy, DisplayCaps, DisplayContents, DisplayId, DisplayPlan, DisplayState,
    FrameOutcome, Layer, Mode, PixelFormat, PlannerConfig, SurfaceHandle,
};
use hwcrect::{Rect, Rotation};
use std::time::Duration;

pub fn set_timelimit_default() {
    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_secs(30));
        eprintln!("!!! Time limit exceeed.");
        std::process::abort();
    });
}

pub fn try_init_logger_for_default_harness() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A lit 1280x800 display with the given window capabilities.
pub fn display_state(caps: DisplayCaps) -> DisplayState {
    DisplayState {
        connected: true,
        blank: false,
        mode: Some(Mode::new(1280, 800, 60)),
        default_mode: Some(Mode::new(1280, 800, 60)),
        caps,
        panel_rotation: Rotation::Identity,
        device_clip: Rect::with_size(1280, 800),
        layer_clip: Rect::with_size(1280, 800),
        release_fence: None,
        generation: 1,
    }
}

/// Windows only; no idle detection and no framebuffer cache.
pub fn config() -> PlannerConfig {
    PlannerConfig {
        composite_policy: CompositePolicy::ASSIGN_WINDOWS,
        idle_minimum_fps: 0,
        ..PlannerConfig::default()
    }
}

pub fn new_plan(config: &PlannerConfig, caps: DisplayCaps) -> DisplayPlan<NullAllocator> {
    let mut plan = DisplayPlan::new(DisplayId::Primary, NullAllocator::new(), config);
    plan.configure(&display_state(caps));
    plan
}

pub fn plan_frame(
    plan: &mut DisplayPlan<NullAllocator>,
    config: &PlannerConfig,
    contents: &mut DisplayContents,
) -> FrameOutcome {
    plan.prepare(&FrameContext::new(config), contents, true)
}

pub fn surface(width: u32, height: u32, format: PixelFormat) -> SurfaceHandle {
    Surface::new_handle(width, height, format, Usage::HW_TEXTURE)
}

/// An opaque RGBA layer showing its whole buffer at `dst`.
pub fn layer(dst: Rect) -> Layer {
    Layer::with_surface(
        surface(dst.width() as u32, dst.height() as u32, PixelFormat::Rgba8888),
        dst,
    )
}

pub fn fb_target() -> Layer {
    layer(Rect::with_size(1280, 800)).with_flags(LayerFlags::FRAMEBUFFER_TARGET)
}
