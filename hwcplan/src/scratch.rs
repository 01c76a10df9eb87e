//! Scratch surfaces for work the display hardware can't do by itself.
//!
//! When a window can't rotate or scale a layer, the 2D engine pre-transforms
//! the layer into a *scratch set* that the window then scans out. A scratch
//! set is a small ring of identically-configured surfaces (two, or three
//! with triple buffering): each blit advances to the next surface so the
//! planner never writes into a surface the display may still be reading.
//!
//! # Lifecycle
//!
//! ```text
//!          assign             lock
//!  Free ──────────▶ Assigned ──────▶ Locked
//!   ▲                  │               │
//!   │ frame_end        │ frame_start   │ unlock
//!   │                  ▼               │
//!   └────────────── Allocated ◀────────┘
//!                      │  ▲
//!                      └──┘ assign (exact match)
//! ```
//!
//! `Assigned` reserves a set for the current frame; `Locked` keeps it across
//! frames (the composited framebuffer survives geometry changes this way).
//! A set that nobody asked for during a whole frame is `Allocated` by the
//! time [`ScratchPool::frame_end`] runs and is released.
use arrayvec::ArrayVec;
use cgmath::Point2;
use hwcrect::Rect;

use crate::{
    error::BlitError,
    layer::{PixelFormat, Transform},
    surface::{Blitter, CompositeList, Layout, SurfaceAllocator, SurfaceHandle, SurfaceId, Usage},
};

/// The maximum number of surfaces in a scratch set.
pub const MAX_SCRATCH_BUFFERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchState {
    Free,
    Allocated,
    Assigned,
    Locked,
}

/// Refers to a scratch set of a [`ScratchPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchHandle(usize);

#[derive(Debug)]
struct ScratchSet {
    state: ScratchState,
    buffers: ArrayVec<[SurfaceHandle; MAX_SCRATCH_BUFFERS]>,
    active_index: usize,
    format: PixelFormat,
    layout: Layout,
    /// The allocated (aligned) size.
    alloc_size: [u32; 2],
    /// The blit size requested by the current assignment.
    size: [u32; 2],
    src_crop: Option<Rect>,
    use_src_crop: bool,
    /// The source and its write count as of the last blit.
    last_source: Option<(SurfaceId, u32)>,
    offset: Point2<i32>,
    last_used: u64,
}

impl ScratchSet {
    fn new() -> Self {
        Self {
            state: ScratchState::Free,
            buffers: ArrayVec::new(),
            active_index: 0,
            format: PixelFormat::Rgba8888,
            layout: Layout::Pitch,
            alloc_size: [0, 0],
            size: [0, 0],
            src_crop: None,
            use_src_crop: false,
            last_source: None,
            offset: Point2::new(0, 0),
            last_used: 0,
        }
    }

    fn matches(&self, size: [u32; 2], format: PixelFormat, layout: Layout) -> bool {
        self.alloc_size == size && self.format == format && self.layout == layout
    }

    fn invalidate(&mut self) {
        self.last_source = None;
    }
}

/// A per-display pool of scratch sets.
#[derive(Debug)]
pub struct ScratchPool<A: SurfaceAllocator> {
    allocator: A,
    sets: Vec<ScratchSet>,
    num_buffers: usize,
    clock: u64,
}

#[inline]
fn align_up(x: u32, align: u32) -> u32 {
    (x + align - 1) / align * align
}

impl<A: SurfaceAllocator> ScratchPool<A> {
    /// Construct a pool of `capacity` scratch sets.
    pub fn new(allocator: A, capacity: usize, triple_buffering: bool) -> Self {
        Self {
            allocator,
            sets: (0..capacity).map(|_| ScratchSet::new()).collect(),
            num_buffers: if triple_buffering { 3 } else { 2 },
            clock: 0,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn capacity(&self) -> usize {
        self.sets.len()
    }

    pub fn state(&self, handle: ScratchHandle) -> ScratchState {
        self.sets[handle.0].state
    }

    /// Count the sets holding memory.
    pub fn num_in_use(&self) -> usize {
        self.sets
            .iter()
            .filter(|s| s.state != ScratchState::Free)
            .count()
    }

    /// The surface most recently written by [`Self::blit`] or
    /// [`Self::composite`].
    pub fn buffer(&self, handle: ScratchHandle) -> &SurfaceHandle {
        let set = &self.sets[handle.0];
        &set.buffers[set.active_index]
    }

    /// The size of the image produced by the current assignment.
    pub fn blit_size(&self, handle: ScratchHandle) -> [u32; 2] {
        self.sets[handle.0].size
    }

    /// Reserve a scratch set for this frame.
    ///
    /// `width` and `height` are the size of the *source* image; with a 90°
    /// `transform`, the scratch is allocated transposed. Returns `None` if
    /// every set is reserved or allocation fails.
    pub fn assign(
        &mut self,
        transform: Transform,
        width: u32,
        height: u32,
        format: PixelFormat,
        src_crop: Option<Rect>,
    ) -> Option<ScratchHandle> {
        let (mut width, mut height) = (width, height);

        // Subsampled formats need even dimensions
        if format.is_yuv() {
            width = align_up(width, 2);
            height = align_up(height, 2);
        }

        let (alloc_size, layout) = if transform.swaps_axes() {
            let align = format.fast_rotate_align();
            std::mem::swap(&mut width, &mut height);
            (
                [align_up(width, align), align_up(height, align)],
                Layout::Tiled,
            )
        } else {
            // The 3D engine can only sample from pitch-linear surfaces
            ([width, height], Layout::Pitch)
        };

        let index = self.find_set(alloc_size, format, layout)?;

        self.clock += 1;
        let set = &mut self.sets[index];
        debug_assert_eq!(set.state, ScratchState::Allocated);
        set.state = ScratchState::Assigned;
        set.size = [width, height];
        set.last_used = self.clock;

        // The previous image was produced from a different part of the
        // source
        if set.src_crop != src_crop {
            set.invalidate();
            set.src_crop = src_crop;
        }
        set.use_src_crop = src_crop.is_some();

        Some(ScratchHandle(index))
    }

    /// Find an allocated set matching the configuration, or allocate one.
    fn find_set(&mut self, size: [u32; 2], format: PixelFormat, layout: Layout) -> Option<usize> {
        let mut free = None;
        let mut evictable: Option<usize> = None;

        for (i, set) in self.sets.iter().enumerate() {
            match set.state {
                ScratchState::Free => {
                    if free.is_none() {
                        free = Some(i);
                    }
                }
                ScratchState::Allocated => {
                    if set.matches(size, format, layout) {
                        log::trace!("reusing scratch set {} ({:?})", i, size);
                        return Some(i);
                    }
                    let older = match evictable {
                        Some(j) => self.sets[j].last_used > set.last_used,
                        None => true,
                    };
                    if older {
                        evictable = Some(i);
                    }
                }
                ScratchState::Assigned | ScratchState::Locked => {}
            }
        }

        // Reallocating an allocated set is the last resort to avoid
        // thrashing
        let index = match (free, evictable) {
            (Some(i), _) => i,
            (None, Some(i)) => {
                log::debug!("evicting scratch set {}", i);
                self.free_set(i);
                i
            }
            (None, None) => {
                log::warn!(
                    "no free scratch slot (capacity = {})",
                    self.sets.len()
                );
                return None;
            }
        };

        if self.alloc_set(index, size, format, layout) {
            Some(index)
        } else {
            None
        }
    }

    fn alloc_set(&mut self, index: usize, size: [u32; 2], format: PixelFormat, layout: Layout) -> bool {
        let usage = Usage::HW_2D | Usage::HW_FB;

        for _ in 0..self.num_buffers {
            match self
                .allocator
                .alloc_scratch(size[0], size[1], format, usage, layout)
            {
                Ok(surface) => self.sets[index].buffers.push(surface),
                Err(e) => {
                    log::error!("scratch allocation of {:?} failed: {}", size, e);
                    self.free_set(index);
                    return false;
                }
            }
        }

        let set = &mut self.sets[index];
        set.state = ScratchState::Allocated;
        set.format = format;
        set.layout = layout;
        set.alloc_size = size;
        set.size = size;
        set.active_index = 0;
        set.src_crop = None;
        set.invalidate();
        true
    }

    fn free_set(&mut self, index: usize) {
        let set = &mut self.sets[index];
        for surface in set.buffers.drain(..) {
            self.allocator.free_scratch(surface);
        }
        set.state = ScratchState::Free;
    }

    /// Keep an assigned set reserved across frames.
    pub fn lock(&mut self, handle: ScratchHandle) {
        let set = &mut self.sets[handle.0];
        debug_assert_eq!(set.state, ScratchState::Assigned);
        set.state = ScratchState::Locked;
    }

    pub fn unlock(&mut self, handle: ScratchHandle) {
        let set = &mut self.sets[handle.0];
        debug_assert!(
            set.state == ScratchState::Locked || set.state == ScratchState::Allocated,
            "{:?}",
            set.state
        );
        set.state = ScratchState::Allocated;
    }

    /// Release the previous frame's reservations.
    pub fn frame_start(&mut self) {
        for set in self.sets.iter_mut() {
            if set.state == ScratchState::Assigned {
                set.state = ScratchState::Allocated;
            }
        }
    }

    /// Free every set that wasn't reserved during this frame.
    pub fn frame_end(&mut self) {
        for i in 0..self.sets.len() {
            if self.sets[i].state == ScratchState::Allocated {
                log::trace!("releasing unused scratch set {}", i);
                self.free_set(i);
            }
        }
    }

    /// Transform `src` into the scratch set.
    ///
    /// The blit is skipped, and the previous image reused, if `src` is the
    /// source of the previous blit, hasn't been written since, and is still
    /// marked as posted.
    pub fn blit<B: Blitter + ?Sized>(
        &mut self,
        blitter: &B,
        src: &SurfaceHandle,
        src_index: usize,
        handle: ScratchHandle,
        transform: Transform,
    ) -> Result<Point2<i32>, BlitError> {
        let set = &mut self.sets[handle.0];
        debug_assert!(
            set.state == ScratchState::Assigned || set.state == ScratchState::Locked,
            "{:?}",
            set.state
        );

        let write_count = src.write_count();
        if set.last_source == Some((src.id(), write_count)) && src.is_posted() {
            log::trace!("{} unchanged, skipping blit", src.id());
            return Ok(set.offset);
        }

        set.active_index = (set.active_index + 1) % set.buffers.len();
        set.last_source = Some((src.id(), write_count));
        src.set_posted();

        let src_rect = match (set.use_src_crop, set.src_crop) {
            (true, Some(crop)) => crop,
            _ => src.bounds(),
        };
        let dst_rect = Rect::with_size(set.size[0] as i32, set.size[1] as i32);

        match blitter.blit(
            src,
            src_index,
            &set.buffers[set.active_index],
            0,
            src_rect,
            dst_rect,
            transform & Transform::ROT_90,
        ) {
            Ok(offset) => {
                set.offset = offset;
                Ok(offset)
            }
            Err(e) => {
                set.invalidate();
                Err(e)
            }
        }
    }

    /// Merge `list` into the next surface of the scratch set.
    pub fn composite<B: Blitter + ?Sized>(
        &mut self,
        blitter: &B,
        list: &CompositeList,
        handle: ScratchHandle,
    ) -> Result<(), BlitError> {
        let set = &mut self.sets[handle.0];
        debug_assert!(
            set.state == ScratchState::Assigned || set.state == ScratchState::Locked,
            "{:?}",
            set.state
        );

        set.active_index = (set.active_index + 1) % set.buffers.len();
        blitter.composite(&set.buffers[set.active_index], list)
    }
}

impl<A: SurfaceAllocator> Drop for ScratchPool<A> {
    fn drop(&mut self) {
        for i in 0..self.sets.len() {
            self.free_set(i);
        }
    }
}
