// pyramid.rs — Laplacian pyramid engine: build, collapse, fuse.
//
// The engine knows the *shape* of the algorithm and nothing about where the
// pixels live. Every numeric step goes through a `PyramidBackend`:
//
//   CpuBackend  (kernels.rs)      HostImage in, HostImage out
//   GpuBackend  (gpu/pyramid.rs)  PendingImage in, PendingImage out
//
// Build, one level transition from image I (w × h):
//
//   I ──downsample_row──▶ (⌈w/2⌉ × h) ──downsample_col──▶ D (⌈w/2⌉ × ⌈h/2⌉)
//   D ──upsample_col──▶ (⌈w/2⌉ × h) ──upsample_row──▶ U (w × h)
//   detail = I − U              stored as this level
//   D                           input of the next level
//
// The last level is stored as-is (no differencing). Each stored level is
// read back into its caller-supplied view before the next transition starts,
// so at most one level pair is alive on the device at a time.
//
// Collapse walks the other way, smallest level first:
//
//   acc = levels[N-1]
//   acc = upsample(acc) + levels[l]     for l = N-2 … 0
//
// Odd extents: going down uses ceil(n/2); going up always receives the exact
// target extent, so `up(down(I))` has I's size whatever the parity.
//
// NEW RUST CONCEPTS:
// - Associated types (`type Image;`) — each backend names its own image
//   handle, and the engine is generic over it without boxing.
// - `&mut [ImageViewMut<'_>]` — a slice of disjoint mutable borrows into one
//   arena. `reborrow()` hands each one to a callee without giving it up.

use tracing::{debug, info};

use crate::arena::{halve_dimension, PyramidArena, PyramidLayout};
use crate::config::LevelCount;
use crate::error::{FusionError, Result};
use crate::image::{check_dims, HostImage, HostImageArray, ImageView, ImageViewMut, StackView};

// ---------------------------------------------------------------------------
// Backend strategy
// ---------------------------------------------------------------------------

/// Output of one build step: the detail level to store and the smoothed,
/// half-size image the next step starts from.
pub struct LevelPair<I> {
    pub detail: I,
    pub next: I,
}

/// The numeric steps the pyramid engine delegates.
///
/// `Image` is a 2D image handle, `Stack` a depth-K stack of same-size images.
/// Handles may be lazy (a GPU backend returns work that has been enqueued but
/// not finished); `read_into` is where a backend must materialise.
pub trait PyramidBackend {
    type Image;
    type Stack;

    fn upload(&self, view: ImageView<'_>) -> Result<Self::Image>;

    fn upload_stack(&self, stack: StackView<'_>) -> Result<Self::Stack>;

    /// Blocking write of `image` into `dst`. Dimensions must match.
    fn read_into(&self, image: &Self::Image, dst: ImageViewMut<'_>) -> Result<()>;

    /// Downsample, upsample back, difference. See the module header.
    fn next_level(&self, image: &Self::Image) -> Result<LevelPair<Self::Image>>;

    /// Upsample `lower` to the size of `upper` and add the two.
    fn collapse_level(&self, lower: &Self::Image, upper: &Self::Image) -> Result<Self::Image>;

    /// Reduce a stack to one image using each layer's alpha as its weight.
    fn fuse_level(&self, stack: &Self::Stack) -> Result<Self::Image>;

    /// Write the per-pixel quality weight into the alpha channel of `image`.
    fn compute_quality(&self, image: ImageViewMut<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Check that `dims` follow the halving chain from `base`.
fn check_level_geometry(base: [usize; 2], dims: impl Iterator<Item = [usize; 2]>) -> Result<()> {
    let mut expected = base;
    for actual in dims {
        check_dims(expected, actual)?;
        expected = [halve_dimension(expected[0]), halve_dimension(expected[1])];
    }
    Ok(())
}

/// Build the Laplacian pyramid of `base` into `levels` (base level first).
///
/// The number of levels built is `levels.len()`. Geometry is validated before
/// anything is uploaded: `levels[0]` must be `base`'s size and every next view
/// the ceiling-half of the previous one.
pub fn build_into<B: PyramidBackend>(
    backend: &B,
    base: ImageView<'_>,
    levels: &mut [ImageViewMut<'_>],
) -> Result<()> {
    if !base.valid() {
        return Err(FusionError::InvalidDimensions { width: base.width(), height: base.height() });
    }
    check_level_geometry(base.dimensions(), levels.iter().map(|v| v.dimensions()))?;
    let Some(last) = levels.len().checked_sub(1) else {
        return Ok(());
    };

    debug!(width = base.width(), height = base.height(), levels = levels.len(), "building pyramid");
    let mut current = backend.upload(base)?;
    for (level, dst) in levels.iter_mut().enumerate() {
        if level == last {
            backend.read_into(&current, dst.reborrow())?;
            break;
        }
        let LevelPair { detail, next } = backend.next_level(&current)?;
        backend.read_into(&detail, dst.reborrow())?;
        debug!(level, width = dst.width(), height = dst.height(), "stored detail level");
        current = next;
    }
    Ok(())
}

/// Collapse `levels` (base level first) into `dest`.
///
/// A single-level pyramid is copied to `dest` unchanged.
///
/// # Errors
/// `InvalidDimensions` for an empty level list, `DimensionMismatch` if
/// `dest` is not the base size or the levels do not follow the halving chain.
pub fn collapse_into<B: PyramidBackend>(
    backend: &B,
    levels: &[ImageView<'_>],
    mut dest: ImageViewMut<'_>,
) -> Result<()> {
    let Some(base) = levels.first() else {
        return Err(FusionError::InvalidDimensions { width: 0, height: 0 });
    };
    check_dims(base.dimensions(), dest.dimensions())?;
    check_level_geometry(base.dimensions(), levels.iter().map(|v| v.dimensions()))?;

    if levels.len() == 1 {
        return dest.copy_from(base);
    }

    debug!(levels = levels.len(), width = base.width(), height = base.height(), "collapsing pyramid");
    let (smallest, rest) = levels.split_last().ok_or(FusionError::NoPyramids)?;
    let mut acc = backend.upload(*smallest)?;
    for upper in rest.iter().rev() {
        let upper = backend.upload(*upper)?;
        acc = backend.collapse_level(&acc, &upper)?;
    }
    backend.read_into(&acc, dest)
}

// ---------------------------------------------------------------------------
// Pyramid — a standalone, arena-owned pyramid
// ---------------------------------------------------------------------------

/// A Laplacian pyramid in its own contiguous arena.
///
/// `level(0)` is the base resolution; level `n` is the base halved `n` times
/// with ceiling division. All levels but the last hold detail (RGB) plus the
/// smoothed weight (alpha); the last holds the smoothed image itself.
pub struct Pyramid {
    arena: PyramidArena,
}

impl Pyramid {
    /// Allocate a zeroed pyramid of `num_levels` levels over `width × height`.
    pub fn new(width: usize, height: usize, num_levels: usize) -> Result<Self> {
        let arena = PyramidArena::new(PyramidLayout::new(width, height, num_levels, 1))?;
        Ok(Pyramid { arena })
    }

    /// A pyramid with no levels.
    pub fn empty() -> Self {
        Pyramid { arena: PyramidArena::empty() }
    }

    /// Build the pyramid of `base`.
    pub fn build<B: PyramidBackend>(backend: &B, base: ImageView<'_>, levels: LevelCount) -> Result<Self> {
        if !base.valid() {
            return Err(FusionError::InvalidDimensions { width: base.width(), height: base.height() });
        }
        let [w, h] = base.dimensions();
        let mut pyramid = Pyramid::new(w, h, levels.resolve(w, h))?;
        let mut views = pyramid.arena.pyramid_views_mut(0);
        build_into(backend, base, &mut views)?;
        Ok(pyramid)
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.arena.num_levels()
    }

    #[inline]
    pub fn base_dimensions(&self) -> [usize; 2] {
        self.arena.layout().base_dimensions()
    }

    #[inline]
    pub fn level(&self, level: usize) -> ImageView<'_> {
        self.arena.view_at(level, 0)
    }

    #[inline]
    pub fn level_mut(&mut self, level: usize) -> ImageViewMut<'_> {
        self.arena.view_at_mut(level, 0)
    }

    pub fn levels(&self) -> Vec<ImageView<'_>> {
        self.arena.pyramid_views(0)
    }

    /// Collapse into a base-resolution image, consuming the levels.
    ///
    /// A pyramid with no levels collapses to an empty image.
    pub fn collapse<B: PyramidBackend>(&mut self, backend: &B) -> Result<HostImage> {
        let arena = self.arena.take();
        if arena.num_levels() == 0 {
            return Ok(HostImage::empty());
        }
        let [w, h] = arena.layout().base_dimensions();
        if arena.num_levels() == 1 {
            return HostImage::from_pixels(w, h, arena.view_at(0, 0).as_slice());
        }
        let mut out = HostImage::new(w, h)?;
        collapse_into(backend, &arena.pyramid_views(0), out.view_mut())?;
        Ok(out)
    }

    /// Fuse separately built pyramids level by level.
    ///
    /// All pyramids must agree on level count and per-level size; this is
    /// checked before any upload. The fused levels overwrite the first
    /// pyramid's storage, which is returned.
    pub fn fuse<B: PyramidBackend>(backend: &B, pyramids: Vec<Pyramid>) -> Result<Pyramid> {
        let mut iter = pyramids.into_iter();
        let mut first = iter.next().ok_or(FusionError::NoPyramids)?;
        let rest: Vec<Pyramid> = iter.collect();

        let num_levels = first.num_levels();
        for (i, p) in rest.iter().enumerate() {
            if p.num_levels() != num_levels {
                return Err(FusionError::LevelMismatch {
                    index: i + 1,
                    expected: num_levels,
                    actual: p.num_levels(),
                });
            }
            for level in 0..num_levels {
                check_dims(first.level(level).dimensions(), p.level(level).dimensions())?;
            }
        }

        info!(pyramids = rest.len() + 1, levels = num_levels, "fusing pyramids");
        for level in 0..num_levels {
            let stack = {
                let mut layers = Vec::with_capacity(rest.len() + 1);
                layers.push(first.level(level));
                layers.extend(rest.iter().map(|p| p.level(level)));
                HostImageArray::from_layers(&layers)?
            };
            let uploaded = backend.upload_stack(stack.stack_view())?;
            let fused = backend.fuse_level(&uploaded)?;
            backend.read_into(&fused, first.level_mut(level))?;
            debug!(level, depth = stack.depth(), "fused level");
        }
        Ok(first)
    }

    /// Move the levels out, leaving an empty pyramid.
    pub fn take(&mut self) -> Pyramid {
        Pyramid { arena: self.arena.take() }
    }
}

impl std::fmt::Debug for Pyramid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [w, h] = self.base_dimensions();
        write!(f, "Pyramid {{ {w}×{h}, levels={} }}", self.num_levels())
    }
}
