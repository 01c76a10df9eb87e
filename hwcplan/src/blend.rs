//! Blend safety analysis.
//!
//! The display controller blends windows in a fixed back-to-front order and
//! can't blend a window against more than one window beneath it. A blending
//! layer whose footprint is overlapped by a layer above it may therefore
//! misrender when both get windows. [`detect_overlap_risk`] decides whether
//! that may happen; the planner evaluates it at most once per frame and
//! composites every remaining layer if it reports a risk.
use hwcrect::Rect;

use crate::{layer::BlendMode, planner::PreparedLayer};

/// The per-frame cache of [`detect_overlap_risk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendSafety {
    Unknown,
    Safe,
    Unsafe,
}

impl Default for BlendSafety {
    fn default() -> Self {
        BlendSafety::Unknown
    }
}

/// The outcome of [`detect_overlap_risk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlapRisk {
    None,
    /// The only overlap is a status bar (the candidate at the given index),
    /// which can be pre-composited with the windows below it.
    Statusbar(usize),
    Overlap,
}

impl OverlapRisk {
    pub fn is_risky(self) -> bool {
        self == OverlapRisk::Overlap
    }
}

/// Check if any candidate above `base` may trigger an overlapping blend
/// with it.
///
/// `layers` are the window candidates in back-to-front order. With
/// `statusbar_blend`, a three-layer stack whose top layer is a status bar
/// fully covered by both layers beneath it is reported as
/// [`OverlapRisk::Statusbar`].
pub fn detect_overlap_risk(
    layers: &[PreparedLayer],
    base: usize,
    device_clip: &Rect,
    statusbar_blend: bool,
) -> OverlapRisk {
    let num_layers = layers.len();

    // A single non-blending layer above the base may overlap it. If it ends
    // up composited, the framebuffer won't blend.
    if base + 2 == num_layers && layers[base + 1].blending == BlendMode::None {
        return OverlapRisk::None;
    }

    // The bottom layer may not cover the whole screen. Where it doesn't,
    // there's nothing to blend with.
    let mut blend_area = if base == 1 && layers[base].blending == BlendMode::Premultiplied {
        layers[0].dst.clip(&layers[1].dst)
    } else {
        layers[base].dst
    };

    // Non-blending layers count too because any layer might be composited
    for (i, layer) in layers.iter().enumerate().skip(base + 1) {
        let clipped = device_clip.clip(&layer.dst);

        if blend_area.intersects(&clipped) {
            if statusbar_blend && num_layers == 3 && base == 1 && is_statusbar_blend(layers, device_clip) {
                log::debug!("overlap resolved by pre-compositing the status bar");
                return OverlapRisk::Statusbar(i);
            }
            log::debug!(
                "layer {} overlaps the blending layer {}",
                layer.index,
                layers[base].index
            );
            return OverlapRisk::Overlap;
        }

        blend_area.grow(&clipped);
    }

    OverlapRisk::None
}

/// Return `true` if `dst` resembles a status bar: a thin strip against one
/// edge of the screen, spanning the screen in the other direction.
pub fn is_statusbar(dst: &Rect, device_clip: &Rect) -> bool {
    let (w, h) = (device_clip.right(), device_clip.bottom());

    let vertical = dst.top() == 0
        && dst.bottom() == h
        && (dst.left() == 0 || dst.right() == w)
        && dst.width() < w / 8;

    let horizontal = dst.left() == 0
        && dst.right() == w
        && (dst.top() == 0 || dst.bottom() == h)
        && dst.height() < h / 8;

    vertical || horizontal
}

/// Check whether the top layer of a three-layer stack is a status bar
/// entirely covered by both layers beneath it.
fn is_statusbar_blend(layers: &[PreparedLayer], device_clip: &Rect) -> bool {
    debug_assert_eq!(layers.len(), 3);
    let statusbar = &layers[2].dst;

    is_statusbar(statusbar, device_clip)
        && layers[..2]
            .iter()
            .all(|l| l.dst.clip(statusbar) == *statusbar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Transform;
    use quickcheck_macros::quickcheck;

    fn layer(index: usize, dst: Rect, blending: BlendMode) -> PreparedLayer {
        PreparedLayer {
            index,
            blending,
            transform: Transform::empty(),
            surf_index: 0,
            src: Rect::with_size(dst.width(), dst.height()),
            dst,
        }
    }

    fn clip() -> Rect {
        Rect::with_size(1280, 800)
    }

    #[quickcheck]
    fn single_opaque_layer_above_is_safe(a: Rect, b: Rect, c: Rect) -> bool {
        let layers = [
            layer(0, a, BlendMode::Premultiplied),
            layer(1, b, BlendMode::Coverage),
            layer(2, c, BlendMode::None),
        ];
        detect_overlap_risk(&layers, 1, &clip(), false) == OverlapRisk::None
    }

    #[test]
    fn overlap_detected() {
        let layers = [
            layer(0, Rect::with_size(1280, 800), BlendMode::None),
            layer(1, Rect::ltrb(0, 0, 600, 600), BlendMode::Coverage),
            layer(2, Rect::ltrb(500, 500, 700, 700), BlendMode::Premultiplied),
        ];
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip(), false),
            OverlapRisk::Overlap
        );
    }

    #[test]
    fn disjoint_is_safe() {
        let layers = [
            layer(0, Rect::with_size(1280, 800), BlendMode::None),
            layer(1, Rect::ltrb(0, 0, 600, 600), BlendMode::Coverage),
            layer(2, Rect::ltrb(600, 0, 700, 100), BlendMode::Premultiplied),
            layer(3, Rect::ltrb(700, 0, 800, 100), BlendMode::Premultiplied),
        ];
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip(), false),
            OverlapRisk::None
        );
    }

    #[test]
    fn premultiplied_second_layer_narrows() {
        // The blending layer overhangs the bottom layer; the part above it
        // has nothing to blend with
        let layers = [
            layer(0, Rect::ltrb(0, 0, 400, 400), BlendMode::None),
            layer(1, Rect::ltrb(0, 0, 800, 400), BlendMode::Premultiplied),
            layer(2, Rect::ltrb(500, 0, 600, 100), BlendMode::Coverage),
        ];
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip(), false),
            OverlapRisk::None
        );

        let mut layers = layers;
        layers[1].blending = BlendMode::Coverage;
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip(), false),
            OverlapRisk::Overlap
        );
    }

    #[test]
    fn offscreen_layers_are_clipped() {
        let layers = [
            layer(0, Rect::with_size(1280, 800), BlendMode::None),
            layer(1, Rect::ltrb(0, 0, 1280, 800), BlendMode::Coverage),
            layer(2, Rect::ltrb(1280, 0, 1400, 100), BlendMode::Premultiplied),
            layer(3, Rect::ltrb(-100, 0, 0, 100), BlendMode::Premultiplied),
        ];
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip(), false),
            OverlapRisk::None
        );
    }

    #[test]
    fn statusbar() {
        let clip = clip();
        assert!(is_statusbar(&Rect::ltrb(0, 0, 1280, 48), &clip));
        assert!(is_statusbar(&Rect::ltrb(1232, 0, 1280, 800), &clip));
        assert!(!is_statusbar(&Rect::ltrb(0, 0, 1280, 200), &clip));
        assert!(!is_statusbar(&Rect::ltrb(0, 10, 1280, 48), &clip));

        let layers = [
            layer(0, Rect::with_size(1280, 800), BlendMode::None),
            layer(1, Rect::ltrb(0, 0, 1280, 800), BlendMode::Premultiplied),
            layer(2, Rect::ltrb(0, 752, 1280, 800), BlendMode::Premultiplied),
        ];
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip, false),
            OverlapRisk::Overlap
        );
        assert_eq!(
            detect_overlap_risk(&layers, 1, &clip, true),
            OverlapRisk::Statusbar(2)
        );
    }
}
