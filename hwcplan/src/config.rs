//! Policy configuration.
use bitflags::bitflags;
use hwcrect::Rotation;
use std::{env::var_os, ffi::OsStr};

use crate::error::ConfigError;

bitflags! {
    pub struct CompositePolicy: u32 {
        /// Never use windows for individual layers.
        const FORCE_COMPOSITE = 1 << 0;
        /// Reuse the previous framebuffer contents when nothing composited
        /// changed.
        const FB_CACHE = 1 << 1;
        /// Fall back to composition when the frame rate drops while windows
        /// overlap.
        const COMPOSITE_ON_IDLE = 1 << 2;

        const AUTO = Self::FB_CACHE.bits | Self::COMPOSITE_ON_IDLE.bits;
        const COMPOSITE_ALWAYS = Self::FORCE_COMPOSITE.bits;
        const ASSIGN_WINDOWS = 0;
    }
}

impl Default for CompositePolicy {
    fn default() -> Self {
        CompositePolicy::AUTO
    }
}

/// Who merges the layers routed to the framebuffer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositorEngine {
    /// The window system composes the framebuffer target.
    Passthrough,
    /// The planner composes through [`Blitter::composite`].
    ///
    /// [`Blitter::composite`]: crate::surface::Blitter::composite
    Blitter,
}

impl Default for CompositorEngine {
    fn default() -> Self {
        CompositorEngine::Passthrough
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    pub composite_policy: CompositePolicy,
    pub compositor: CompositorEngine,
    /// The frame rate below which overlapping windows are composited. `0`
    /// disables idle detection.
    pub idle_minimum_fps: u32,
    /// Use three buffers per scratch set instead of two.
    pub triple_buffering: bool,
    /// The number of scratch sets per display.
    pub scratch_capacity: usize,
    /// Pre-composite a status bar overlapping two blending windows instead of
    /// giving up on windows.
    pub statusbar_blend: bool,
    /// Displays larger than this (in either dimension) don't trust window B
    /// with 32-bit surfaces.
    pub limit_window_b_threshold: u32,
    /// How the primary panel is mounted. Layer coordinates are rotated by
    /// this before reaching the display controller.
    pub panel_rotation: Rotation,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            composite_policy: CompositePolicy::AUTO,
            compositor: CompositorEngine::Passthrough,
            idle_minimum_fps: 8,
            triple_buffering: false,
            scratch_capacity: 4,
            statusbar_blend: false,
            limit_window_b_threshold: 1366,
            panel_rotation: Rotation::Identity,
        }
    }
}

const ENV_COMPOSITE_POLICY: &str = "HWCPLAN_COMPOSITE_POLICY";
const ENV_COMPOSITOR: &str = "HWCPLAN_COMPOSITOR";
const ENV_IDLE_MINIMUM_FPS: &str = "HWCPLAN_IDLE_MINIMUM_FPS";
const ENV_TRIPLE_BUFFERING: &str = "HWCPLAN_TRIPLE_BUFFERING";
const ENV_STATUSBAR_BLEND: &str = "HWCPLAN_STATUSBAR_BLEND";
const ENV_PANEL_ROTATION: &str = "HWCPLAN_PANEL_ROTATION";

impl PlannerConfig {
    /// Construct a `PlannerConfig` with overrides from the environment.
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut this = Self::default();
        this.apply_env(|key| var_os(key), |e| log::error!("{}", e));
        this
    }

    /// Like [`Self::from_env`], but fails on the first invalid value.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_vars(|key| var_os(key))
    }

    /// Apply overrides from an arbitrary variable source. Exposed for
    /// testing without touching the process environment.
    pub fn try_from_vars<S: AsRef<OsStr>>(
        get: impl Fn(&'static str) -> Option<S>,
    ) -> Result<Self, ConfigError> {
        let mut this = Self::default();
        let mut first_error = None;
        this.apply_env(get, |e| {
            if first_error.is_none() {
                first_error = Some(e);
            }
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(this),
        }
    }

    fn apply_env<S: AsRef<OsStr>>(
        &mut self,
        get: impl Fn(&'static str) -> Option<S>,
        mut on_error: impl FnMut(ConfigError),
    ) {
        let mut read = |key: &'static str| -> Option<String> {
            let value = get(key)?;
            match value.as_ref().to_str() {
                Some(s) => Some(s.trim().to_owned()),
                None => {
                    on_error(invalid(key, &value.as_ref().to_string_lossy()));
                    None
                }
            }
        };

        let policy = read(ENV_COMPOSITE_POLICY);
        let compositor = read(ENV_COMPOSITOR);
        let idle_fps = read(ENV_IDLE_MINIMUM_FPS);
        let triple = read(ENV_TRIPLE_BUFFERING);
        let statusbar = read(ENV_STATUSBAR_BLEND);
        let rotation = read(ENV_PANEL_ROTATION);

        if let Some(value) = policy {
            match &value.to_ascii_lowercase()[..] {
                "auto" => self.composite_policy = CompositePolicy::AUTO,
                "composite-always" => self.composite_policy = CompositePolicy::COMPOSITE_ALWAYS,
                "assign-overlays" => self.composite_policy = CompositePolicy::ASSIGN_WINDOWS,
                _ => on_error(invalid(ENV_COMPOSITE_POLICY, &value)),
            }
        }

        if let Some(value) = compositor {
            match &value.to_ascii_lowercase()[..] {
                "passthrough" => self.compositor = CompositorEngine::Passthrough,
                "blitter" => self.compositor = CompositorEngine::Blitter,
                _ => on_error(invalid(ENV_COMPOSITOR, &value)),
            }
        }

        if let Some(value) = idle_fps {
            match value.parse() {
                Ok(fps) => self.idle_minimum_fps = fps,
                Err(_) => on_error(invalid(ENV_IDLE_MINIMUM_FPS, &value)),
            }
        }

        if let Some(value) = triple {
            match parse_bool(&value) {
                Some(x) => self.triple_buffering = x,
                None => on_error(invalid(ENV_TRIPLE_BUFFERING, &value)),
            }
        }

        if let Some(value) = statusbar {
            match parse_bool(&value) {
                Some(x) => self.statusbar_blend = x,
                None => on_error(invalid(ENV_STATUSBAR_BLEND, &value)),
            }
        }

        if let Some(value) = rotation {
            match &value[..] {
                "0" => self.panel_rotation = Rotation::Identity,
                "90" => self.panel_rotation = Rotation::Deg90,
                "180" => self.panel_rotation = Rotation::Deg180,
                "270" => self.panel_rotation = Rotation::Deg270,
                _ => on_error(invalid(ENV_PANEL_ROTATION, &value)),
            }
        }

        log::debug!("{:?}", self);
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match &value.to_ascii_lowercase()[..] {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&'static str, &'static str)]) -> HashMap<&'static str, &'static str> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn defaults() {
        let config = PlannerConfig::try_from_vars(|_| None::<&str>).unwrap();
        assert_eq!(config, PlannerConfig::default());
        assert_eq!(config.composite_policy, CompositePolicy::AUTO);
        assert!(config.composite_policy.contains(CompositePolicy::FB_CACHE));
        assert_eq!(config.idle_minimum_fps, 8);
    }

    #[test]
    fn overrides() {
        let env = vars(&[
            (ENV_COMPOSITE_POLICY, "Composite-Always"),
            (ENV_COMPOSITOR, "blitter"),
            (ENV_IDLE_MINIMUM_FPS, " 20 "),
            (ENV_TRIPLE_BUFFERING, "yes"),
            (ENV_STATUSBAR_BLEND, "on"),
            (ENV_PANEL_ROTATION, "270"),
        ]);
        let config = PlannerConfig::try_from_vars(|k| env.get(k).cloned()).unwrap();
        assert_eq!(config.composite_policy, CompositePolicy::COMPOSITE_ALWAYS);
        assert_eq!(config.compositor, CompositorEngine::Blitter);
        assert_eq!(config.idle_minimum_fps, 20);
        assert!(config.triple_buffering);
        assert!(config.statusbar_blend);
        assert_eq!(config.panel_rotation, Rotation::Deg270);
    }

    #[test]
    fn invalid_value() {
        let env = vars(&[
            (ENV_COMPOSITOR, "gpu"),
            (ENV_TRIPLE_BUFFERING, "maybe"),
        ]);
        let err = PlannerConfig::try_from_vars(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_COMPOSITOR,
                value: "gpu".to_owned()
            }
        );
    }

    #[test]
    fn bools() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
