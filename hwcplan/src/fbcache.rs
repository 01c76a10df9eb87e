//! The framebuffer cache.
//!
//! Remembers which layers were merged into the framebuffer window so that
//! the merge can be skipped ("recycled") while none of them changes. Two
//! generations are kept: `old` describes the framebuffer currently on
//! screen and `new` is filled while planning the current frame.
use arrayvec::ArrayVec;
use hwcrect::Rect;

use crate::{
    layer::{BlendMode, Layer, Transform},
    surface::SurfaceId,
    FB_CACHE_LAYERS,
};

/// A snapshot of a layer merged into the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// The index into the display's layer list.
    pub index: usize,
    pub handle: Option<SurfaceId>,
    pub transform: Transform,
    pub blending: BlendMode,
    pub source_crop: Rect,
    pub display_frame: Rect,
}

impl CacheEntry {
    fn new(index: usize, layer: &Layer) -> Self {
        Self {
            index,
            handle: layer.handle.as_ref().map(|h| h.id()),
            transform: layer.transform,
            blending: layer.blending,
            source_crop: layer.source_crop,
            display_frame: layer.display_frame,
        }
    }

    /// Compare everything but the buffer handle.
    fn same_shape(&self, other: &Self) -> bool {
        self.index == other.index
            && self.transform == other.transform
            && self.blending == other.blending
            && self.source_crop == other.source_crop
            && self.display_frame == other.display_frame
    }
}

#[derive(Debug, Clone, Default)]
struct Generation {
    entries: ArrayVec<[CacheEntry; FB_CACHE_LAYERS]>,
    /// A `Skip` layer was added. Its snapshot can't be trusted.
    poisoned: bool,
}

impl Generation {
    fn clear(&mut self) {
        self.entries.clear();
        self.poisoned = false;
    }
}

#[derive(Debug, Clone)]
pub struct FramebufferCache {
    generations: [Generation; 2],
    old_index: usize,
    recycle: bool,
    /// The number of layers routed to the framebuffer this frame, including
    /// the ones that didn't fit in the cache.
    fb_layers: usize,
    /// Whether the status-bar optimization disqualifies a frame.
    statusbar_blend: bool,
}

impl FramebufferCache {
    pub fn new(statusbar_blend: bool) -> Self {
        Self {
            generations: Default::default(),
            old_index: 0,
            recycle: false,
            fb_layers: 0,
            statusbar_blend,
        }
    }

    fn old(&self) -> &Generation {
        &self.generations[self.old_index]
    }

    fn new_gen(&mut self) -> &mut Generation {
        &mut self.generations[self.old_index ^ 1]
    }

    /// Whether the framebuffer contents on screen can be shown again.
    pub fn recycle(&self) -> bool {
        self.recycle
    }

    /// Stop recycling, e.g., because the display was blanked.
    pub fn cancel_recycle(&mut self) {
        self.recycle = false;
    }

    pub fn fb_layers(&self) -> usize {
        self.fb_layers
    }

    /// The layer indices recorded in the generation on screen.
    pub fn cached_indices<'a>(&'a self) -> impl Iterator<Item = usize> + 'a {
        self.old().entries.iter().map(|e| e.index)
    }

    /// Start collecting the framebuffer layers of a new frame.
    pub fn begin_frame(&mut self) {
        self.fb_layers = 0;
        self.new_gen().clear();
    }

    /// Record a layer routed to the framebuffer.
    pub fn add_layer(&mut self, index: usize, layer: &Layer) {
        self.fb_layers += 1;

        let new = self.new_gen();
        if new.poisoned || new.entries.is_full() {
            return;
        }
        if layer.is_skip() {
            new.poisoned = true;
            return;
        }
        new.entries.push(CacheEntry::new(index, layer));
    }

    /// Decide whether the previous framebuffer can be reused for the frame
    /// collected since [`Self::begin_frame`].
    ///
    /// When the shape matches but buffers differ, the previous generation,
    /// handles included, stays the reference for the next frame.
    pub fn validate(&mut self, statusbar: bool) -> bool {
        let old_index = self.old_index;
        let new_index = old_index ^ 1;

        {
            let new = &self.generations[new_index];
            let unusable = new.poisoned || self.fb_layers != new.entries.len();
            let statusbar = statusbar && self.statusbar_blend;

            if unusable || statusbar {
                if self.fb_layers > FB_CACHE_LAYERS {
                    log::debug!(
                        "fb cache de-activated ({} layers exceeds limit)",
                        self.fb_layers
                    );
                } else if statusbar {
                    log::debug!("fb cache de-activated (statusbar detected)");
                } else if new.poisoned {
                    log::debug!("fb cache de-activated (skip layer)");
                }
                self.generations[old_index].clear();
                self.recycle = false;
                return false;
            }
        }

        let old = &self.generations[old_index];
        let new = &self.generations[new_index];

        if !old.entries.is_empty()
            && old.entries.len() == new.entries.len()
            && old
                .entries
                .iter()
                .zip(new.entries.iter())
                .all(|(a, b)| a.same_shape(b))
        {
            self.recycle = old
                .entries
                .iter()
                .zip(new.entries.iter())
                .all(|(a, b)| a.handle == b.handle);
            log::debug!(
                "fb cache re-using previous config ({})",
                if self.recycle { "enabled" } else { "disabled" }
            );
            return self.recycle;
        }

        if !new.entries.is_empty() {
            if old.entries.is_empty() {
                log::debug!("fb cache activated ({} layers)", new.entries.len());
            }
        } else if !old.entries.is_empty() {
            log::debug!("fb cache de-activated (0 layers)");
        }

        self.old_index = new_index;
        self.recycle = false;
        false
    }

    /// Recompute [`Self::recycle`] for a frame whose geometry is unchanged,
    /// tracking the current buffers.
    ///
    /// Returns `true` if the decision changed.
    pub fn check(&mut self, layers: &[Layer]) -> bool {
        let old = &mut self.generations[self.old_index];
        let mut clean = true;

        for entry in old.entries.iter_mut() {
            let handle = layers
                .get(entry.index)
                .and_then(|l| l.handle.as_ref())
                .map(|h| h.id());
            if handle != entry.handle {
                clean = false;
            }
            entry.handle = handle;
        }

        let recycle = !old.entries.is_empty() && clean;
        if recycle == self.recycle {
            return false;
        }

        log::debug!(
            "fb cache {}",
            if recycle { "enabled" } else { "disabled" }
        );
        self.recycle = recycle;
        true
    }
}
