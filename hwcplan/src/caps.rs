//! Hardware window capabilities and the window matcher.
//!
//! Display controllers expose a handful of overlay windows, each with a
//! different feature set. [`pick_window`] hands out the least capable free
//! window that can do what a layer needs, so that more capable windows stay
//! available for the layers that follow.
//!
//! The numeric order of the capability bits is meaningful. When no window
//! satisfies every requirement, the window whose *unsatisfied* bits form the
//! smallest number wins. The bits are therefore ordered by how cheaply the
//! planner can make up for their absence: the 16-bit hint costs nothing,
//! scaling and rotation can be done by the 2D engine, and YUV can't be
//! compensated at all.
use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::MAX_WINDOWS;

bitflags! {
    pub struct WindowCaps: u32 {
        /// The window prefers 16-bit surfaces. A hint, never a requirement.
        const SIXTEEN_BIT = 1 << 0;
        /// The window can scale.
        const SCALE = 1 << 1;
        /// The window can exchange the X and Y axes (90° rotation).
        const SWAP_XY = 1 << 2;
        /// The window can scan out YUV formats.
        const YUV = 1 << 3;
    }
}

/// A set of hardware windows, one bit per window index.
pub type WindowMask = u32;

/// The window indices with special handling for display erratas.
pub const WINDOW_A: usize = 0;
pub const WINDOW_B: usize = 1;
pub const WINDOW_C: usize = 2;

/// The static capabilities of a display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCaps {
    windows: ArrayVec<[WindowCaps; MAX_WINDOWS]>,
}

impl DisplayCaps {
    /// Construct a `DisplayCaps`. Windows beyond [`MAX_WINDOWS`] are
    /// ignored.
    pub fn new(windows: &[WindowCaps]) -> Self {
        Self {
            windows: windows.iter().cloned().take(MAX_WINDOWS).collect(),
        }
    }

    /// The three-window controller of the reference hardware: a plain
    /// window A, a scaling/YUV window B, and a YUV-only window C.
    pub fn reference() -> Self {
        Self::new(&[
            WindowCaps::empty(),
            WindowCaps::YUV | WindowCaps::SCALE | WindowCaps::SIXTEEN_BIT,
            WindowCaps::YUV,
        ])
    }

    pub fn num_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self, index: usize) -> WindowCaps {
        self.windows[index]
    }

    pub fn windows(&self) -> &[WindowCaps] {
        &self.windows
    }

    /// The mask with every window of this display set.
    pub fn all_windows(&self) -> WindowMask {
        ((1u64 << self.windows.len()) - 1) as WindowMask
    }
}

/// The outcome of a successful [`pick_window`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPick {
    pub window: usize,
    /// The required capabilities the window lacks. Always empty for an exact
    /// match.
    pub unsatisfied: WindowCaps,
}

/// Pick a free window for `required` and remove it from `mask`.
///
/// With `allow_partial == false`, only windows providing every bit of
/// `required` are considered, and the one with the numerically smallest
/// capability set wins. Otherwise the window with the fewest (numerically
/// smallest) unsatisfied requirements wins, ties going to the smaller
/// capability set, and `None` is returned only if `mask` has no window.
///
/// `mask` is left untouched when `None` is returned.
pub fn pick_window(
    caps: &DisplayCaps,
    mask: &mut WindowMask,
    required: WindowCaps,
    allow_partial: bool,
) -> Option<WindowPick> {
    let mut best: Option<usize> = None;
    let mut best_unsatisfied = required;
    let mut exact = !allow_partial;

    for (i, &window_caps) in caps.windows().iter().enumerate() {
        if *mask & (1 << i) == 0 {
            continue;
        }

        let unsatisfied = required - window_caps;
        let smaller_caps = |best: Option<usize>| match best {
            Some(b) => caps.window(b).bits() > window_caps.bits(),
            None => true,
        };

        if exact {
            // Consider only the windows meeting every requirement
            if unsatisfied.is_empty() && smaller_caps(best) {
                best = Some(i);
            }
            continue;
        }

        if unsatisfied.is_empty() {
            // From now on, only full matches are considered
            exact = true;
            best = Some(i);
            best_unsatisfied = WindowCaps::empty();
            continue;
        }

        let better = match best {
            None => true,
            Some(_) => {
                best_unsatisfied.bits() > unsatisfied.bits()
                    || (best_unsatisfied == unsatisfied && smaller_caps(best))
            }
        };
        if better {
            best = Some(i);
            best_unsatisfied = unsatisfied;
        }
    }

    let window = best?;
    *mask &= !(1 << window);

    log::trace!(
        "pick_window({:?}, partial = {}) = {} (unsatisfied = {:?})",
        required,
        allow_partial,
        window,
        best_unsatisfied
    );

    Some(WindowPick {
        window,
        unsatisfied: if exact {
            WindowCaps::empty()
        } else {
            best_unsatisfied
        },
    })
}

/// Iterate over the set bits of a [`WindowMask`].
pub fn iter_windows(mut mask: WindowMask) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            None
        } else {
            let i = mask.trailing_zeros();
            mask &= mask - 1;
            Some(i as usize)
        }
    })
}
