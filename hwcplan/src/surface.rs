//! Buffers and the collaborators that allocate and draw into them.
use arrayvec::ArrayVec;
use bitflags::bitflags;
use cgmath::Point2;
use hwcrect::Rect;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};

use crate::{
    device::Fence,
    error::{AllocError, BlitError},
    layer::{BlendMode, PixelFormat, Transform},
    COMPOSITE_LIST_MAX,
};

bitflags! {
    /// Allocation usage of a surface.
    pub struct Usage: u32 {
        /// The surface holds protected content that must not be read back.
        const PROTECTED = 1 << 0;
        /// The surface is meant for an external display (e.g. video).
        const EXTERNAL_DISPLAY = 1 << 1;
        /// Scanned out by the display controller.
        const HW_FB = 1 << 2;
        /// Accessed by the 2D engine.
        const HW_2D = 1 << 3;
        /// Sampled by the 3D engine.
        const HW_TEXTURE = 1 << 4;
    }
}

/// The memory layout of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Pitch,
    /// Required by the fast 90° rotation path. The 3D engine can't sample
    /// from it.
    Tiled,
}

/// Identifies a surface for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display(fmt = "surface#{}", _0)]
pub struct SurfaceId(u64);

impl SurfaceId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A buffer shared between the window system, the planner, and the
/// hardware.
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: Layout,
    usage: Usage,
    /// Bumped every time a producer finishes writing.
    write_count: AtomicU32,
    /// Set when the current contents were consumed by a blit.
    posted: AtomicBool,
}

pub type SurfaceHandle = Arc<Surface>;

impl Surface {
    pub fn new(width: u32, height: u32, format: PixelFormat, layout: Layout, usage: Usage) -> Self {
        Self {
            id: SurfaceId::new(),
            width,
            height,
            format,
            layout,
            usage,
            write_count: AtomicU32::new(0),
            posted: AtomicBool::new(false),
        }
    }

    /// Construct a pitch-linear surface wrapped in a [`SurfaceHandle`].
    pub fn new_handle(width: u32, height: u32, format: PixelFormat, usage: Usage) -> SurfaceHandle {
        Arc::new(Self::new(width, height, format, Layout::Pitch, usage))
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }
    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn format(&self) -> PixelFormat {
        self.format
    }
    pub fn layout(&self) -> Layout {
        self.layout
    }
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The full extent of the surface.
    pub fn bounds(&self) -> Rect {
        Rect::with_size(self.width as i32, self.height as i32)
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Acquire)
    }

    /// Record that a producer has written new contents.
    pub fn mark_written(&self) {
        self.write_count.fetch_add(1, Ordering::AcqRel);
        self.posted.store(false, Ordering::Release);
    }

    pub fn is_posted(&self) -> bool {
        self.posted.load(Ordering::Acquire)
    }

    pub(crate) fn set_posted(&self) {
        self.posted.store(true, Ordering::Release);
    }
}

/// The buffer allocator.
pub trait SurfaceAllocator {
    fn alloc_scratch(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
        layout: Layout,
    ) -> Result<SurfaceHandle, AllocError>;

    fn free_scratch(&self, surface: SurfaceHandle);

    /// Pin `surface` for access by `usage` within `rect`.
    fn lock(&self, surface: &SurfaceHandle, usage: Usage, rect: Rect) -> Result<(), AllocError>;

    /// Release a pin. The surface may not be reused until `fence` signals.
    fn unlock(&self, surface: &SurfaceHandle, fence: Option<&Fence>);
}

/// One entry of a [`CompositeList`].
#[derive(Debug, Clone)]
pub struct CompositeLayer {
    pub surface: Option<SurfaceHandle>,
    pub blend: BlendMode,
    pub transform: Transform,
    pub src: Rect,
    pub dst: Rect,
}

/// Layers to be merged into a single scratch image, bottom first.
#[derive(Debug, Clone)]
pub struct CompositeList {
    pub layers: ArrayVec<[CompositeLayer; COMPOSITE_LIST_MAX]>,
    /// The region of the target to produce.
    pub clip: Rect,
    pub geometry_changed: bool,
}

impl Default for CompositeList {
    fn default() -> Self {
        Self {
            layers: ArrayVec::new(),
            clip: Rect::zero(),
            geometry_changed: false,
        }
    }
}

impl CompositeList {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }
}

/// The 2D/3D engine.
pub trait Blitter {
    /// Copy `src_rect` of `src` into `dst_rect` of `dst`, applying
    /// `transform`. Returns the offset at which the result starts in `dst`.
    fn blit(
        &self,
        src: &Surface,
        src_index: usize,
        dst: &Surface,
        dst_index: usize,
        src_rect: Rect,
        dst_rect: Rect,
        transform: Transform,
    ) -> Result<Point2<i32>, BlitError>;

    /// Merge `list` into `dst`.
    fn composite(&self, dst: &Surface, list: &CompositeList) -> Result<(), BlitError>;
}

impl<T: SurfaceAllocator + ?Sized> SurfaceAllocator for Arc<T> {
    fn alloc_scratch(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
        layout: Layout,
    ) -> Result<SurfaceHandle, AllocError> {
        (**self).alloc_scratch(width, height, format, usage, layout)
    }

    fn free_scratch(&self, surface: SurfaceHandle) {
        (**self).free_scratch(surface)
    }

    fn lock(&self, surface: &SurfaceHandle, usage: Usage, rect: Rect) -> Result<(), AllocError> {
        (**self).lock(surface, usage, rect)
    }

    fn unlock(&self, surface: &SurfaceHandle, fence: Option<&Fence>) {
        (**self).unlock(surface, fence)
    }
}

impl<T: Blitter + ?Sized> Blitter for Arc<T> {
    fn blit(
        &self,
        src: &Surface,
        src_index: usize,
        dst: &Surface,
        dst_index: usize,
        src_rect: Rect,
        dst_rect: Rect,
        transform: Transform,
    ) -> Result<Point2<i32>, BlitError> {
        (**self).blit(src, src_index, dst, dst_index, src_rect, dst_rect, transform)
    }

    fn composite(&self, dst: &Surface, list: &CompositeList) -> Result<(), BlitError> {
        (**self).composite(dst, list)
    }
}
