//! Local composition of the framebuffer window.
use cgmath::Vector2;
use hwcrect::Rect;

use super::{DisplayPlan, OverlayDesc, PrepareState, PreparedLayer, WindowMapping};
use crate::{
    layer::{CompositionType, DisplayContents, PixelFormat, Transform},
    surface::{CompositeLayer, CompositeList, Layout, SurfaceAllocator},
    COMPOSITE_LIST_MAX,
};

/// Check whether the blitter can merge `list` in one pass.
fn can_composite(list: &CompositeList) -> bool {
    let transform = match list.layers.first() {
        Some(first) => first.transform,
        None => return false,
    };

    list.layers.iter().all(|l| {
        l.transform == transform
            && l.surface
                .as_ref()
                .map_or(true, |s| s.layout() != Layout::Tiled)
    })
}

/// The screen edges, in the order a clockwise quarter turn moves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Left,
    Top,
    Right,
    Bottom,
}

impl Edge {
    fn from_index(i: usize) -> Self {
        match i % 4 {
            0 => Edge::Left,
            1 => Edge::Top,
            2 => Edge::Right,
            _ => Edge::Bottom,
        }
    }

    /// Map a display edge to the source edge it came from.
    fn to_source(self, transform: Transform) -> Self {
        let mut i = self as usize;
        if transform.contains(Transform::ROT_90) {
            i += 3;
        }
        let mut edge = Edge::from_index(i);

        let horizontal = edge == Edge::Left || edge == Edge::Right;
        if (horizontal && transform.contains(Transform::FLIP_H))
            || (!horizontal && transform.contains(Transform::FLIP_V))
        {
            edge = Edge::from_index(edge as usize + 2);
        }
        edge
    }
}

/// Cut the part of a window hidden by the status bar `sb`, which lies
/// against an edge of `device_clip`.
fn subtract_statusbar(device_clip: &Rect, overlay: &mut OverlayDesc, sb: &Rect) {
    let (edge, delta) = if sb.bottom() != device_clip.bottom() {
        overlay.dst.min.y = sb.bottom();
        (Edge::Top, sb.height())
    } else if sb.top() != 0 {
        overlay.dst.max.y = sb.top();
        (Edge::Bottom, sb.height())
    } else if sb.right() != device_clip.right() {
        overlay.dst.min.x = sb.right();
        (Edge::Left, sb.width())
    } else {
        overlay.dst.max.x = sb.left();
        (Edge::Right, sb.width())
    };

    match edge.to_source(overlay.transform) {
        Edge::Left => overlay.src.min.x += delta,
        Edge::Top => overlay.src.min.y += delta,
        Edge::Right => overlay.src.max.x -= delta,
        Edge::Bottom => overlay.src.max.y -= delta,
    }
}

impl<A: SurfaceAllocator> DisplayPlan<A> {
    fn add_to_composite(&mut self, ll: &PreparedLayer, contents: &DisplayContents) -> bool {
        if self.composite.list.layers.is_full() {
            log::warn!(
                "{:?}: composite list overflow (limit {})",
                self.id,
                COMPOSITE_LIST_MAX
            );
            return false;
        }

        let layer = &contents.layers[ll.index];
        self.composite.map.push(ll.index);
        self.composite.list.layers.push(CompositeLayer {
            surface: layer.handle.clone(),
            blend: ll.blending,
            transform: ll.transform,
            src: ll.src,
            dst: ll.dst,
        });
        true
    }

    /// Merge the framebuffer layers with the blitter instead of the window
    /// system, if possible.
    pub(super) fn composite_prepare(&mut self, state: &PrepareState, contents: &mut DisplayContents) {
        debug_assert!(self.composite.list.is_empty());

        for ll in state.layers.iter() {
            if contents.layers[ll.index].composition == CompositionType::Framebuffer
                && !self.add_to_composite(ll, contents)
            {
                self.composite.clear();
                return;
            }
        }

        if !can_composite(&self.composite.list) {
            self.composite.clear();
            if let Some(handle) = self.composite.scratch.take() {
                log::debug!("{:?}: dropping the composited framebuffer", self.id);
                self.fb_cache.cancel_recycle();
                self.clear_layer_enable(contents);
                self.scratch.unlock(handle);
            }
            return;
        }

        if self.composite.scratch.is_some() {
            // Recycling the previous result
            return;
        }

        self.composite.list.clip = self.device_clip;
        match self.scratch.assign(
            Transform::empty(),
            self.device_clip.width() as u32,
            self.device_clip.height() as u32,
            PixelFormat::Rgba8888,
            None,
        ) {
            Some(handle) => {
                self.scratch.lock(handle);
                self.composite.scratch = Some(handle);
                self.composite.stale = true;
                for &index in self.composite.map.iter() {
                    contents.layers[index].composition = CompositionType::Overlay;
                }
            }
            None => {
                log::warn!("{:?}: no scratch for the composited framebuffer", self.id);
                self.composite.clear();
            }
        }
    }

    /// Pre-composite the status bar with the parts of the windows it
    /// covers, and shrink the windows to exclude it.
    pub(super) fn statusbar_prepare(&mut self, state: &PrepareState, contents: &mut DisplayContents) {
        let (sb, fb_index) = match (state.statusbar, self.fb_index) {
            (Some(sb), Some(fb_index)) => (state.layers[sb], fb_index),
            _ => return,
        };

        self.composite.list.clip = sb.dst;

        for slot in (0..self.conf.overlays.len()).rev() {
            if slot == fb_index {
                continue;
            }
            let ll = match state.layer_map[slot].layer {
                Some(li) => state.layers[li],
                None => continue,
            };

            self.add_to_composite(&ll, contents);

            let overlay = &mut self.conf.overlays[slot];
            subtract_statusbar(&self.device_clip, overlay, &sb.dst);
            if overlay.dst.is_empty() {
                self.map[slot] = WindowMapping::default();
            }
        }

        self.add_to_composite(&sb, contents);

        let (width, height) = (sb.dst.width(), sb.dst.height());
        match self
            .scratch
            .assign(Transform::empty(), width as u32, height as u32, PixelFormat::Rgb565, None)
        {
            Some(handle) => {
                self.composite.scratch = Some(handle);
                self.composite.stale = true;

                let offset = Vector2::new(-sb.dst.left(), -sb.dst.top());
                let list = &mut self.composite.list;
                for entry in list.layers.iter_mut() {
                    entry.dst = entry.dst.translate(offset);
                }
                list.clip = list.clip.translate(offset);

                let overlay = &mut self.conf.overlays[fb_index];
                overlay.src = Rect::with_size(width, height);
                overlay.transform = Transform::empty();
            }
            None => {
                log::warn!("{:?}: no scratch for the status bar", self.id);
                self.composite.clear();
                contents.layers[sb.index].composition = CompositionType::Framebuffer;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::BlendMode;
    use crate::surface::{Surface, Usage};

    fn overlay(transform: Transform) -> OverlayDesc {
        OverlayDesc {
            transform,
            src: Rect::with_size(800, 1280),
            dst: Rect::with_size(1280, 800),
            ..OverlayDesc::default()
        }
    }

    #[test]
    fn subtract_top_bar() {
        let clip = Rect::with_size(1280, 800);
        let sb = Rect::ltrb(0, 0, 1280, 48);

        let mut o = overlay(Transform::empty());
        subtract_statusbar(&clip, &mut o, &sb);
        assert_eq!(o.dst, Rect::ltrb(0, 48, 1280, 800));
        assert_eq!(o.src, Rect::ltrb(0, 48, 800, 1280));

        // The top of the screen shows the left edge of a 90° source
        let mut o = overlay(Transform::ROT_90);
        subtract_statusbar(&clip, &mut o, &sb);
        assert_eq!(o.src, Rect::ltrb(48, 0, 800, 1280));

        let mut o = overlay(Transform::FLIP_V);
        subtract_statusbar(&clip, &mut o, &sb);
        assert_eq!(o.src, Rect::ltrb(0, 0, 800, 1232));
    }

    #[test]
    fn subtract_side_bars() {
        let clip = Rect::with_size(1280, 800);

        let mut o = overlay(Transform::empty());
        subtract_statusbar(&clip, &mut o, &Rect::ltrb(1232, 0, 1280, 800));
        assert_eq!(o.dst, Rect::ltrb(0, 0, 1232, 800));
        assert_eq!(o.src, Rect::ltrb(0, 0, 752, 1280));

        let mut o = overlay(Transform::FLIP_H);
        subtract_statusbar(&clip, &mut o, &Rect::ltrb(0, 0, 48, 800));
        assert_eq!(o.dst, Rect::ltrb(48, 0, 1280, 800));
        assert_eq!(o.src, Rect::ltrb(0, 0, 752, 1280));
    }

    #[test]
    fn composite_eligibility() {
        let entry = |transform, layout| CompositeLayer {
            surface: Some(std::sync::Arc::new(Surface::new(
                16,
                16,
                PixelFormat::Rgba8888,
                layout,
                Usage::HW_TEXTURE,
            ))),
            blend: BlendMode::None,
            transform,
            src: Rect::with_size(16, 16),
            dst: Rect::with_size(16, 16),
        };

        let mut list = CompositeList::default();
        assert!(!can_composite(&list));

        list.layers.push(entry(Transform::empty(), Layout::Pitch));
        list.layers.push(entry(Transform::empty(), Layout::Pitch));
        assert!(can_composite(&list));

        list.layers.push(entry(Transform::ROT_90, Layout::Pitch));
        assert!(!can_composite(&list));

        list.layers.pop();
        list.layers.push(entry(Transform::empty(), Layout::Tiled));
        assert!(!can_composite(&list));
    }
}
