// arena.rs — aligned host allocations and level-major pyramid packing.
//
// A fusion batch holds K pyramids of the same geometry. Rather than K×N
// separate buffers, all of them live in ONE allocation laid out level-major:
//
//   ┌──────────── level 0 ────────────┬──────── level 1 ────────┬─ ...
//   │ img 0 │ img 1 │ ... │ img K-1   │ img 0 │ ... │ img K-1   │
//   └─────────────────────────────────┴─────────────────────────┴─ ...
//
// so that "level L of every exposure" is one contiguous slice, which is one
// 2D-array texture upload instead of K uploads.
//
// Level geometry: each level is the previous one halved with ceiling
// division, stopping once the shorter side is ≤ MIN_LEVEL_EXTENT.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::slice;

use crate::error::{FusionError, Result};
use crate::image::{ImageView, ImageViewMut, Rgba, StackView};

/// Byte alignment of every host arena. Matches the copy-offset alignment the
/// device side expects, so an arena slice can be handed to a transfer as-is.
pub const ARENA_ALIGNMENT: usize = 256;

/// A pyramid stops once its shorter side is at or below this extent.
pub const MIN_LEVEL_EXTENT: usize = 8;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// One halving step with ceiling division: `ceil(n / 2)`.
#[inline]
pub fn halve_dimension(n: usize) -> usize {
    (n + 1) / 2
}

/// Number of pyramid levels for a `width × height` base: 1 plus the number of
/// ceiling-halvings of the shorter side needed to reach ≤ `MIN_LEVEL_EXTENT`.
pub fn calculate_num_levels(width: usize, height: usize) -> usize {
    let mut shortest = width.min(height);
    let mut levels = 1;
    while shortest > MIN_LEVEL_EXTENT {
        shortest = halve_dimension(shortest);
        levels += 1;
    }
    levels
}

/// `[width, height]` of each of `num_levels` levels, base first.
pub fn level_dimensions(width: usize, height: usize, num_levels: usize) -> Vec<[usize; 2]> {
    let mut dims = Vec::with_capacity(num_levels);
    let (mut w, mut h) = (width, height);
    for _ in 0..num_levels {
        dims.push([w, h]);
        w = halve_dimension(w);
        h = halve_dimension(h);
    }
    dims
}

/// Product of `extents` as a pixel count.
///
/// # Errors
/// `Allocation` if the product overflows `usize`; no allocation that large
/// could succeed.
pub fn pixel_count(extents: &[usize]) -> Result<usize> {
    extents
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or(FusionError::Allocation { bytes: usize::MAX })
}

/// Total pixel count of a `num_levels`-level pyramid over a `width × height`
/// base.
pub fn pyramid_size(width: usize, height: usize, num_levels: usize) -> usize {
    level_dimensions(width, height, num_levels)
        .iter()
        .map(|[w, h]| w * h)
        .sum()
}

// ---------------------------------------------------------------------------
// ImageArena
// ---------------------------------------------------------------------------

/// One zero-initialised, 256-byte aligned allocation of `Rgba` pixels.
///
/// Move-only. [`ImageArena::take`] moves the allocation out and leaves an
/// empty arena behind (`valid() == false`, `len() == 0`).
pub struct ImageArena {
    ptr: NonNull<Rgba>,
    len: usize,
    // None for an empty arena: nothing was allocated, nothing to free.
    layout: Option<Layout>,
}

// The arena uniquely owns its allocation, exactly like a Box<[Rgba]>.
unsafe impl Send for ImageArena {}
unsafe impl Sync for ImageArena {}

impl ImageArena {
    /// Allocate `len` zeroed pixels.
    ///
    /// # Errors
    /// `Allocation` if the size overflows a `Layout` or the allocator
    /// returns null.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(ImageArena::empty());
        }
        let bytes = len
            .checked_mul(size_of::<Rgba>())
            .ok_or(FusionError::Allocation { bytes: usize::MAX })?;
        let layout = Layout::from_size_align(bytes, ARENA_ALIGNMENT)
            .map_err(|_| FusionError::Allocation { bytes })?;

        // SAFETY: layout has non-zero size (len > 0).
        let raw = unsafe { alloc_zeroed(layout) } as *mut Rgba;
        let ptr = NonNull::new(raw).ok_or(FusionError::Allocation { bytes })?;

        Ok(ImageArena { ptr, len, layout: Some(layout) })
    }

    /// An arena with no backing storage.
    #[inline]
    pub const fn empty() -> Self {
        ImageArena { ptr: NonNull::dangling(), len: 0, layout: None }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True while the arena owns an allocation.
    #[inline]
    pub fn valid(&self) -> bool {
        self.layout.is_some()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Rgba] {
        // SAFETY: ptr is either a live allocation of len pixels or dangling
        // with len == 0; both are valid for from_raw_parts.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Rgba] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const Rgba {
        self.ptr.as_ptr()
    }

    /// Move the allocation out, leaving this arena empty.
    #[inline]
    pub fn take(&mut self) -> ImageArena {
        std::mem::replace(self, ImageArena::empty())
    }
}

impl Drop for ImageArena {
    fn drop(&mut self) {
        if let Some(layout) = self.layout.take() {
            // SAFETY: ptr came from alloc_zeroed with this exact layout.
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

impl fmt::Debug for ImageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageArena")
            .field("len", &self.len)
            .field("valid", &self.valid())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PyramidLayout
// ---------------------------------------------------------------------------

/// Level-major geometry for `count` pyramids over a common base size.
///
/// `offset(level, index) = Σ_{l<level} count·area(l) + index·area(level)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidLayout {
    width: usize,
    height: usize,
    count: usize,
    dims: Vec<[usize; 2]>,
    // Pixel offset of the first image of each level.
    level_offsets: Vec<usize>,
    total: usize,
}

impl PyramidLayout {
    pub fn new(width: usize, height: usize, num_levels: usize, count: usize) -> Self {
        let dims = level_dimensions(width, height, num_levels);
        let mut level_offsets = Vec::with_capacity(num_levels);
        let mut total = 0;
        // Saturates on overflow; an arena of `usize::MAX` pixels then fails
        // to allocate with `Allocation`.
        for [w, h] in &dims {
            level_offsets.push(total);
            total = count.saturating_mul(w.saturating_mul(*h)).saturating_add(total);
        }
        PyramidLayout { width, height, count, dims, level_offsets, total }
    }

    #[inline]
    pub fn base_dimensions(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.dims.len()
    }

    /// Number of pyramids packed side by side.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn level_dimensions(&self, level: usize) -> [usize; 2] {
        self.dims[level]
    }

    /// Pixel offset of image `index` at `level`.
    #[inline]
    pub fn offset(&self, level: usize, index: usize) -> usize {
        assert!(index < self.count, "pyramid index {index} out of range (count {})", self.count);
        let [w, h] = self.dims[level];
        self.level_offsets[level] + index * w * h
    }

    /// Pixels needed for the whole layout.
    #[inline]
    pub fn total_pixels(&self) -> usize {
        self.total
    }

    /// True when an arena of this layout could hold a layout for
    /// `width × height` with the same level and pyramid counts.
    pub fn matches(&self, width: usize, height: usize, num_levels: usize, count: usize) -> bool {
        self.width == width && self.height == height && self.num_levels() == num_levels && self.count == count
    }
}

// ---------------------------------------------------------------------------
// PyramidArena
// ---------------------------------------------------------------------------

/// An [`ImageArena`] sized and addressed by a [`PyramidLayout`].
///
/// Views are lifetime-scoped borrows of the arena, so none of them can
/// survive a `take()` or drop of the arena.
pub struct PyramidArena {
    arena: ImageArena,
    layout: PyramidLayout,
}

impl PyramidArena {
    pub fn new(layout: PyramidLayout) -> Result<Self> {
        let arena = ImageArena::new(layout.total_pixels())?;
        Ok(PyramidArena { arena, layout })
    }

    /// Arena with no levels and no storage.
    pub fn empty() -> Self {
        PyramidArena { arena: ImageArena::empty(), layout: PyramidLayout::new(0, 0, 0, 0) }
    }

    #[inline]
    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.layout.num_levels()
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.arena.valid()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Rgba] {
        self.arena.as_slice()
    }

    /// Level `level` of pyramid `index`.
    pub fn view_at(&self, level: usize, index: usize) -> ImageView<'_> {
        let [w, h] = self.layout.level_dimensions(level);
        let start = self.layout.offset(level, index);
        ImageView::from_parts(w, h, &self.arena.as_slice()[start..start + w * h])
    }

    pub fn view_at_mut(&mut self, level: usize, index: usize) -> ImageViewMut<'_> {
        let [w, h] = self.layout.level_dimensions(level);
        let start = self.layout.offset(level, index);
        ImageViewMut::from_parts(w, h, &mut self.arena.as_mut_slice()[start..start + w * h])
    }

    /// All `count` images of `level` as one contiguous stack.
    pub fn level_stack(&self, level: usize) -> StackView<'_> {
        let [w, h] = self.layout.level_dimensions(level);
        let start = self.layout.level_offsets[level];
        let len = self.layout.count * w * h;
        StackView::from_parts(w, h, self.layout.count, &self.arena.as_slice()[start..start + len])
    }

    /// Every level of pyramid `index`, base first.
    pub fn pyramid_views(&self, index: usize) -> Vec<ImageView<'_>> {
        (0..self.num_levels()).map(|level| self.view_at(level, index)).collect()
    }

    /// Every level of pyramid `index` as disjoint writable views, base
    /// first. This is what a pyramid build writes into.
    pub fn pyramid_views_mut(&mut self, index: usize) -> Vec<ImageViewMut<'_>> {
        let layout = &self.layout;
        let mut views = Vec::with_capacity(layout.num_levels());
        let mut rest = self.arena.as_mut_slice();
        let mut consumed = 0;
        for level in 0..layout.num_levels() {
            let [w, h] = layout.level_dimensions(level);
            let start = layout.offset(level, index);
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(start - consumed);
            let (region, tail) = tail.split_at_mut(w * h);
            views.push(ImageViewMut::from_parts(w, h, region));
            consumed = start + w * h;
            rest = tail;
        }
        views
    }

    /// Every `(level, index)` view in arena order. Together they cover the
    /// arena exactly.
    pub fn all_views(&self) -> Vec<ImageView<'_>> {
        let mut views = Vec::with_capacity(self.num_levels() * self.layout.count);
        for level in 0..self.num_levels() {
            for index in 0..self.layout.count {
                views.push(self.view_at(level, index));
            }
        }
        views
    }

    /// Move the storage out, leaving an empty arena with no levels.
    pub fn take(&mut self) -> PyramidArena {
        std::mem::replace(self, PyramidArena::empty())
    }
}

impl fmt::Debug for PyramidArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [w, h] = self.layout.base_dimensions();
        write!(
            f,
            "PyramidArena {{ {w}×{h}, levels={}, count={} }}",
            self.num_levels(),
            self.layout.count
        )
    }
}
