//! The per-frame layer list handed over by the window system.
use bitflags::bitflags;
use hwcrect::{Rect, Rotation};

use crate::surface::{SurfaceHandle, Usage};

bitflags! {
    /// Source-to-display transform. The flips apply before the rotation.
    pub struct Transform: u32 {
        const FLIP_H = 1 << 0;
        const FLIP_V = 1 << 1;
        const ROT_90 = 1 << 2;
        const ROT_180 = Self::FLIP_H.bits | Self::FLIP_V.bits;
        const ROT_270 = Self::ROT_180.bits | Self::ROT_90.bits;
    }
}

impl Transform {
    /// Fold a panel rotation into a layer transform.
    pub fn combine(self, panel: Transform) -> Transform {
        let mut mask = self & Transform::ROT_90;

        if panel.intersects(mask) {
            mask |= !self & Transform::ROT_180;
        } else {
            mask |= self & Transform::ROT_180;
        }

        panel ^ mask
    }

    /// Adjust a transform for a display that flips *after* a 2D rotation.
    ///
    /// Mirroring combined with a quarter turn depends on the order of the two
    /// operations, so the flip axes are exchanged in that case.
    pub fn fix(self) -> Transform {
        if self == Transform::ROT_90 | Transform::FLIP_H {
            Transform::ROT_90 | Transform::FLIP_V
        } else if self == Transform::ROT_90 | Transform::FLIP_V {
            Transform::ROT_90 | Transform::FLIP_H
        } else {
            self
        }
    }

    #[inline]
    pub fn swaps_axes(self) -> bool {
        self.contains(Transform::ROT_90)
    }

    /// Convert a pure rotation (no mirroring) to [`Rotation`].
    pub fn rotation(self) -> Option<Rotation> {
        if self.is_empty() {
            Some(Rotation::Identity)
        } else if self == Transform::ROT_90 {
            Some(Rotation::Deg90)
        } else if self == Transform::ROT_180 {
            Some(Rotation::Deg180)
        } else if self == Transform::ROT_270 {
            Some(Rotation::Deg270)
        } else {
            None
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::empty()
    }
}

impl From<Rotation> for Transform {
    fn from(x: Rotation) -> Self {
        match x {
            Rotation::Identity => Transform::empty(),
            Rotation::Deg90 => Transform::ROT_90,
            Rotation::Deg180 => Transform::ROT_180,
            Rotation::Deg270 => Transform::ROT_270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Opaque copy.
    None,
    /// Alpha already multiplied into the color channels.
    Premultiplied,
    /// Straight (non-premultiplied) alpha.
    Coverage,
}

impl BlendMode {
    #[inline]
    pub fn is_blending(self) -> bool {
        self != BlendMode::None
    }
}

impl Default for BlendMode {
    fn default() -> Self {
        BlendMode::None
    }
}

/// The pixel formats a layer or scratch surface may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Rgb565,
    /// Planar 4:2:0 YUV.
    Yv12,
    /// Semi-planar 4:2:0 YUV.
    Nv12,
}

impl PixelFormat {
    /// Bits per pixel of the (first) plane.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Bgra8888 => 32,
            PixelFormat::Rgb565 => 16,
            PixelFormat::Yv12 | PixelFormat::Nv12 => 8,
        }
    }

    pub fn is_yuv(self) -> bool {
        match self {
            PixelFormat::Yv12 | PixelFormat::Nv12 => true,
            _ => false,
        }
    }

    /// The dimension alignment required by the tiled 90° rotation path.
    ///
    /// The rotator works on 64-byte tiles for RGB formats. Subsampled YUV
    /// surfaces use a fixed 32-pixel alignment so that the chroma planes
    /// stay tile-aligned too.
    pub fn fast_rotate_align(self) -> u32 {
        if self.is_yuv() {
            32
        } else {
            64 / (self.bits_per_pixel() / 8)
        }
    }
}

bitflags! {
    pub struct LayerFlags: u32 {
        /// The window system composes this layer itself. Nothing else about
        /// the layer is reliable.
        const SKIP = 1 << 0;
        /// The layer receives the window system's framebuffer composition.
        const FRAMEBUFFER_TARGET = 1 << 1;
    }
}

bitflags! {
    /// Hints returned to the window system.
    pub struct LayerHints: u32 {
        /// Clear the framebuffer region under this layer.
        const CLEAR_FB = 1 << 0;
        /// The buffer is scanned out directly; a third buffer avoids stalls.
        const TRIPLE_BUFFER = 1 << 1;
    }
}

/// Who draws a layer, as decided by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositionType {
    /// The window system composes the layer into the framebuffer target.
    Framebuffer,
    /// The planner takes care of the layer.
    Overlay,
}

impl Default for CompositionType {
    fn default() -> Self {
        CompositionType::Framebuffer
    }
}

/// A layer the window system wants drawn.
///
/// Only `composition` and `hints` are written by the planner.
#[derive(Debug, Clone)]
pub struct Layer {
    pub handle: Option<SurfaceHandle>,
    /// The source crop in surface pixel coordinates.
    pub source_crop: Rect,
    /// The destination in display pixel coordinates.
    pub display_frame: Rect,
    pub transform: Transform,
    pub blending: BlendMode,
    pub flags: LayerFlags,
    pub composition: CompositionType,
    pub hints: LayerHints,
}

impl Layer {
    pub fn new(handle: Option<SurfaceHandle>, source_crop: Rect, display_frame: Rect) -> Self {
        Self {
            handle,
            source_crop,
            display_frame,
            transform: Transform::empty(),
            blending: BlendMode::None,
            flags: LayerFlags::empty(),
            composition: CompositionType::Framebuffer,
            hints: LayerHints::empty(),
        }
    }

    /// A layer showing the whole of `handle` at `display_frame`.
    pub fn with_surface(handle: SurfaceHandle, display_frame: Rect) -> Self {
        let crop = Rect::with_size(handle.width() as i32, handle.height() as i32);
        Self::new(Some(handle), crop, display_frame)
    }

    pub fn with_transform(self, transform: Transform) -> Self {
        Self { transform, ..self }
    }

    pub fn with_blending(self, blending: BlendMode) -> Self {
        Self { blending, ..self }
    }

    pub fn with_flags(self, flags: LayerFlags) -> Self {
        Self { flags, ..self }
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.handle.as_ref().map(|h| h.format())
    }

    /// The allocation usage of the layer's buffer, or empty for a layer
    /// without a buffer.
    pub fn usage(&self) -> Usage {
        self.handle.as_ref().map(|h| h.usage()).unwrap_or_else(Usage::empty)
    }

    pub fn is_skip(&self) -> bool {
        self.flags.contains(LayerFlags::SKIP)
    }

    pub fn is_framebuffer_target(&self) -> bool {
        self.flags.contains(LayerFlags::FRAMEBUFFER_TARGET)
    }
}

bitflags! {
    pub struct ContentsFlags: u32 {
        /// Something other than buffer contents changed since the last frame.
        const GEOMETRY_CHANGED = 1 << 0;
    }
}

/// The layer list of one display for one frame.
#[derive(Debug, Clone, Default)]
pub struct DisplayContents {
    pub layers: Vec<Layer>,
    pub flags: ContentsFlags,
}

impl Default for ContentsFlags {
    fn default() -> Self {
        ContentsFlags::GEOMETRY_CHANGED
    }
}

impl DisplayContents {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            flags: ContentsFlags::GEOMETRY_CHANGED,
        }
    }

    pub fn geometry_changed(&self) -> bool {
        self.flags.contains(ContentsFlags::GEOMETRY_CHANGED)
    }

    /// Find a layer whose buffer has `usage`, searching from the bottom.
    /// `Skip` layers are ignored.
    ///
    /// With `unique`, finding more than one such layer counts as finding
    /// none.
    pub fn find_layer(&self, usage: Usage, unique: bool) -> Option<usize> {
        let mut found = None;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.is_skip() {
                continue;
            }
            if layer.usage().intersects(usage) {
                if !unique {
                    return Some(i);
                }
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::Surface;
    use quickcheck_macros::quickcheck;

    fn transform_from_bits(x: u8) -> Transform {
        Transform::from_bits_truncate(u32::from(x))
    }

    #[test]
    fn combine_with_identity_panel() {
        for bits in 0..8 {
            let t = Transform::from_bits_truncate(bits);
            assert_eq!(t.combine(Transform::empty()), t, "{:?}", t);
        }
    }

    #[test]
    fn combine_rotations() {
        assert_eq!(
            Transform::ROT_90.combine(Transform::ROT_90),
            Transform::ROT_180
        );
        assert_eq!(
            Transform::ROT_180.combine(Transform::ROT_90),
            Transform::ROT_270
        );
        assert_eq!(
            Transform::ROT_270.combine(Transform::ROT_90),
            Transform::empty()
        );
    }

    #[quickcheck]
    fn fix_is_involution(x: u8) -> bool {
        let t = transform_from_bits(x);
        t.fix().fix() == t
    }

    #[test]
    fn rotation_round_trip() {
        for &r in &[
            Rotation::Identity,
            Rotation::Deg90,
            Rotation::Deg180,
            Rotation::Deg270,
        ] {
            assert_eq!(Transform::from(r).rotation(), Some(r));
        }
        assert_eq!(Transform::FLIP_H.rotation(), None);
    }

    #[test]
    fn find_protected_layer() {
        let frame = Rect::with_size(64, 64);
        let plain = Surface::new_handle(64, 64, PixelFormat::Rgba8888, Usage::HW_TEXTURE);
        let secure = Surface::new_handle(64, 64, PixelFormat::Nv12, Usage::PROTECTED);
        let contents = DisplayContents::new(vec![
            Layer::with_surface(secure.clone(), frame).with_flags(LayerFlags::SKIP),
            Layer::with_surface(plain, frame),
            Layer::with_surface(secure.clone(), frame),
            Layer::with_surface(secure, frame),
        ]);
        assert_eq!(contents.find_layer(Usage::PROTECTED, false), Some(2));
        assert_eq!(contents.find_layer(Usage::PROTECTED, true), None);
        assert_eq!(contents.find_layer(Usage::HW_TEXTURE, true), Some(1));
    }

    #[test]
    fn fast_rotate_align() {
        assert_eq!(PixelFormat::Rgba8888.fast_rotate_align(), 16);
        assert_eq!(PixelFormat::Rgb565.fast_rotate_align(), 32);
        assert_eq!(PixelFormat::Nv12.fast_rotate_align(), 32);
    }
}
