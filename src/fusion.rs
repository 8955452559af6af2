// fusion.rs — FusionGroup: K exposures, one arena, one merge.
//
// A group owns a single `PyramidArena` laid out level-major:
//
//   ┌─────────── level 0 ───────────┬──── level 1 ────┬─ level 2 ─┬ …
//   │ img 0  │ img 1  │ … │ img K-1 │ 0 │ 1 │ … │ K-1 │ 0│1│…│K-1 │
//   └────────────────────────────────┴─────────────────┴───────────┴
//
// `add_image` builds exposure `i`'s pyramid straight into the column of
// slots for index `i`. At merge time every level's K images are already one
// contiguous run, so each level goes to the device as a single array upload.
// The fused level overwrites slot (level, 0) and the collapse then reads
// pyramid 0, so no second arena is needed.
//
// Group lifecycle:
//
//   new ──add_image×K──▶ full ──merge_into──▶ (reset) ──add_image…
//
// Every merge resets the group, whether it succeeded or not. The arena is
// kept and reused when the next batch has the same geometry.

use tracing::{debug, info};

use crate::arena::{PyramidArena, PyramidLayout};
use crate::config::{FusionConfig, LevelCount};
use crate::error::{FusionError, Result};
use crate::image::{check_dims, HostImage, ImageView, ImageViewMut};
use crate::pyramid::{build_into, collapse_into, PyramidBackend};

/// A batch of same-size exposures waiting to be fused.
pub struct FusionGroup<'b, B: PyramidBackend> {
    backend: &'b B,
    group_size: usize,
    levels: LevelCount,
    fixed: Option<[usize; 2]>,
    base: Option<[usize; 2]>,
    size: usize,
    arena: PyramidArena,
}

impl<'b, B: PyramidBackend> FusionGroup<'b, B> {
    /// An empty group of `group_size` exposures. The base dimensions are
    /// taken from the first image added.
    ///
    /// # Errors
    /// `EmptyGroup` if `group_size` is 0.
    pub fn new(backend: &'b B, group_size: usize) -> Result<Self> {
        if group_size == 0 {
            return Err(FusionError::EmptyGroup);
        }
        Ok(FusionGroup {
            backend,
            group_size,
            levels: LevelCount::Auto,
            fixed: None,
            base: None,
            size: 0,
            arena: PyramidArena::empty(),
        })
    }

    /// Use `levels` instead of the automatic level count.
    ///
    /// If the base dimensions are already fixed the arena is re-laid out
    /// for the new count.
    pub fn with_levels(mut self, levels: LevelCount) -> Result<Self> {
        self.levels = levels;
        if let Some([w, h]) = self.base {
            self.ensure_arena(w, h)?;
        }
        Ok(self)
    }

    /// Fix the base dimensions up front and allocate the arena now.
    pub fn with_dimensions(mut self, width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FusionError::InvalidDimensions { width, height });
        }
        self.fixed = Some([width, height]);
        self.base = Some([width, height]);
        self.ensure_arena(width, height)?;
        Ok(self)
    }

    /// Number of images added since the last merge.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.size == self.group_size
    }

    /// Base dimensions, once established.
    #[inline]
    pub fn base_dimensions(&self) -> Option<[usize; 2]> {
        self.base
    }

    /// Level count of the current batch (0 before the first image).
    pub fn num_levels(&self) -> usize {
        match self.base {
            Some(_) => self.arena.num_levels(),
            None => 0,
        }
    }

    fn ensure_arena(&mut self, width: usize, height: usize) -> Result<()> {
        let num_levels = self.levels.resolve(width, height);
        if !self.arena.layout().matches(width, height, num_levels, self.group_size) {
            debug!(width, height, num_levels, count = self.group_size, "allocating group arena");
            self.arena = PyramidArena::new(PyramidLayout::new(width, height, num_levels, self.group_size))?;
        }
        Ok(())
    }

    /// Build the pyramid of `view` into the next free slot.
    ///
    /// The quality mask is expected in `view`'s alpha channel already.
    ///
    /// # Errors
    /// `GroupFull`, `InvalidDimensions` for a zero-sized view,
    /// `DimensionMismatch` if `view` differs from the group's base. None of
    /// these leave anything enqueued.
    pub fn add_image(&mut self, view: ImageView<'_>) -> Result<()> {
        if self.is_full() {
            return Err(FusionError::GroupFull { capacity: self.group_size });
        }
        if !view.valid() {
            return Err(FusionError::InvalidDimensions { width: view.width(), height: view.height() });
        }
        let [w, h] = view.dimensions();
        match self.base {
            Some(base) => check_dims(base, [w, h])?,
            None => self.ensure_arena(w, h)?,
        }

        let index = self.size;
        let mut slots = self.arena.pyramid_views_mut(index);
        build_into(self.backend, view, &mut slots)?;
        // Only a successful build establishes the base.
        self.base = Some([w, h]);
        self.size += 1;
        debug!(index, width = w, height = h, "exposure added");
        Ok(())
    }

    /// Fuse the group's pyramids, collapse the result into `dest` and reset.
    ///
    /// # Errors
    /// `IncompleteGroup` unless exactly `group_size` images were added,
    /// `DimensionMismatch` if `dest` is not the base size.
    pub fn merge_into(&mut self, dest: ImageViewMut<'_>) -> Result<()> {
        let result = self.fuse_and_collapse(dest);
        self.reset();
        result
    }

    /// [`merge_into`](Self::merge_into) a newly allocated image.
    pub fn merge(&mut self) -> Result<HostImage> {
        let [w, h] = match self.base {
            Some(base) if self.is_full() => base,
            _ => {
                let actual = self.size;
                self.reset();
                return Err(FusionError::IncompleteGroup { expected: self.group_size, actual });
            }
        };
        let mut out = HostImage::new(w, h)?;
        self.merge_into(out.view_mut())?;
        Ok(out)
    }

    fn fuse_and_collapse(&mut self, dest: ImageViewMut<'_>) -> Result<()> {
        let base = match self.base {
            Some(base) if self.is_full() => base,
            _ => return Err(FusionError::IncompleteGroup { expected: self.group_size, actual: self.size }),
        };
        check_dims(base, dest.dimensions())?;

        let num_levels = self.arena.num_levels();
        info!(exposures = self.group_size, levels = num_levels, "fusing group");
        for level in 0..num_levels {
            let stack = self.backend.upload_stack(self.arena.level_stack(level))?;
            let fused = self.backend.fuse_level(&stack)?;
            self.backend.read_into(&fused, self.arena.view_at_mut(level, 0))?;
            debug!(level, depth = self.group_size, "fused level");
        }

        info!(width = base[0], height = base[1], "collapsing fused pyramid");
        collapse_into(self.backend, &self.arena.pyramid_views(0), dest)
    }

    /// Forget every added image. The arena is kept.
    pub fn reset(&mut self) {
        self.size = 0;
        if self.fixed.is_none() {
            self.base = None;
        }
    }
}

impl<B: PyramidBackend> std::fmt::Debug for FusionGroup<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionGroup")
            .field("size", &self.size)
            .field("group_size", &self.group_size)
            .field("base", &self.base)
            .field("levels", &self.levels)
            .finish()
    }
}

/// Fuse `images` in consecutive batches of `config.group_size`.
///
/// Each image gets its quality mask computed in place (alpha channel), so
/// `images` is modified. Returns one fused image per batch, in input order.
/// The quality parameters used are the backend's own; `config.quality` is
/// for constructing the backend.
///
/// # Errors
/// `EmptyGroup` for a zero group size, `IncompleteGroup` if the image count
/// is not a multiple of the group size (checked before any work), and
/// anything a group raises.
pub fn merge_exposures<B: PyramidBackend>(
    backend: &B,
    config: &FusionConfig,
    images: &mut [HostImage],
) -> Result<Vec<HostImage>> {
    let mut group = FusionGroup::new(backend, config.group_size)?.with_levels(config.levels)?;
    let leftover = images.len() % config.group_size;
    if leftover != 0 {
        return Err(FusionError::IncompleteGroup { expected: config.group_size, actual: leftover });
    }

    let mut merged = Vec::with_capacity(images.len() / config.group_size);
    for (batch, exposures) in images.chunks_mut(config.group_size).enumerate() {
        for image in exposures.iter_mut() {
            backend.compute_quality(image.view_mut())?;
            group.add_image(image.view())?;
        }
        merged.push(group.merge()?);
        info!(batch, exposures = config.group_size, "merge complete");
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{HostImageArray, Rgba, StackView};
    use crate::kernels::CpuBackend;
    use crate::pyramid::LevelPair;

    fn flat(w: usize, h: usize, v: f32, weight: f32) -> HostImage {
        HostImage::from_fn(w, h, |_, _| Rgba::new(v, v, v, weight)).unwrap()
    }

    /// Fails every downsample so no pyramid can be built past level 0.
    #[derive(Default)]
    struct BrokenDownsample(CpuBackend);

    impl PyramidBackend for BrokenDownsample {
        type Image = HostImage;
        type Stack = HostImageArray;

        fn upload(&self, view: ImageView<'_>) -> Result<HostImage> {
            self.0.upload(view)
        }

        fn upload_stack(&self, stack: StackView<'_>) -> Result<HostImageArray> {
            self.0.upload_stack(stack)
        }

        fn read_into(&self, image: &HostImage, dst: ImageViewMut<'_>) -> Result<()> {
            self.0.read_into(image, dst)
        }

        fn next_level(&self, _image: &HostImage) -> Result<LevelPair<HostImage>> {
            Err(FusionError::Allocation { bytes: 0 })
        }

        fn collapse_level(&self, lower: &HostImage, upper: &HostImage) -> Result<HostImage> {
            self.0.collapse_level(lower, upper)
        }

        fn fuse_level(&self, stack: &HostImageArray) -> Result<HostImage> {
            self.0.fuse_level(stack)
        }

        fn compute_quality(&self, image: ImageViewMut<'_>) -> Result<()> {
            self.0.compute_quality(image)
        }
    }

    #[test]
    fn test_zero_group_size_rejected() {
        let backend = CpuBackend::default();
        assert!(matches!(FusionGroup::new(&backend, 0), Err(FusionError::EmptyGroup)));
    }

    #[test]
    fn test_first_image_sets_base() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 2).unwrap();
        assert_eq!(group.base_dimensions(), None);
        assert_eq!(group.num_levels(), 0);
        group.add_image(flat(40, 24, 0.5, 1.0).view()).unwrap();
        assert_eq!(group.base_dimensions(), Some([40, 24]));
        assert_eq!(group.num_levels(), 3); // 24 → 12 → 6
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn test_failed_first_build_leaves_base_unset() {
        let backend = BrokenDownsample::default();
        let mut group = FusionGroup::new(&backend, 2).unwrap();
        assert!(group.add_image(flat(32, 32, 0.5, 1.0).view()).is_err());
        assert_eq!(group.base_dimensions(), None);
        assert_eq!(group.num_levels(), 0);
        assert_eq!(group.size(), 0);
        // A single-level image needs no downsample, and any size is accepted.
        let mut group = group.with_levels(LevelCount::Fixed(1)).unwrap();
        group.add_image(flat(8, 6, 0.5, 1.0).view()).unwrap();
        assert_eq!(group.base_dimensions(), Some([8, 6]));
    }

    #[test]
    fn test_levels_after_dimensions_relayout_arena() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 2)
            .unwrap()
            .with_dimensions(64, 64)
            .unwrap()
            .with_levels(LevelCount::Fixed(2))
            .unwrap();
        assert_eq!(group.num_levels(), 2);
        assert_eq!(group.arena.num_levels(), 2);
        group.add_image(flat(64, 64, 0.2, 1.0).view()).unwrap();
        group.add_image(flat(64, 64, 0.6, 1.0).view()).unwrap();
        let out = group.merge().unwrap();
        assert_eq!(out.dimensions(), [64, 64]);
        assert!(out.as_slice().iter().all(|px| (px.r - 0.4).abs() < 1e-5));
    }

    #[test]
    fn test_group_full() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 1).unwrap();
        let img = flat(16, 16, 0.5, 1.0);
        group.add_image(img.view()).unwrap();
        assert!(group.is_full());
        assert!(matches!(group.add_image(img.view()), Err(FusionError::GroupFull { capacity: 1 })));
    }

    #[test]
    fn test_empty_view_rejected() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 2).unwrap();
        let empty = HostImage::empty();
        assert!(matches!(
            group.add_image(empty.view()),
            Err(FusionError::InvalidDimensions { width: 0, height: 0 })
        ));
        assert_eq!(group.size(), 0);
    }

    #[test]
    fn test_merge_incomplete_resets() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 2).unwrap();
        group.add_image(flat(16, 16, 0.5, 1.0).view()).unwrap();
        assert!(matches!(
            group.merge(),
            Err(FusionError::IncompleteGroup { expected: 2, actual: 1 })
        ));
        assert_eq!(group.size(), 0);
        assert_eq!(group.base_dimensions(), None);
    }

    #[test]
    fn test_merge_dest_mismatch() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 1).unwrap();
        group.add_image(flat(16, 16, 0.5, 1.0).view()).unwrap();
        let mut dest = HostImage::new(8, 8).unwrap();
        assert!(matches!(group.merge_into(dest.view_mut()), Err(FusionError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_flat_exposures_blend_by_weight() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 2).unwrap();
        group.add_image(flat(32, 32, 0.2, 3.0).view()).unwrap();
        group.add_image(flat(32, 32, 0.6, 1.0).view()).unwrap();
        let out = group.merge().unwrap();
        // Weights are constant per exposure: every level blends 3:1.
        let expected = (0.2 * 3.0 + 0.6 * 1.0) / 4.0;
        for px in out.as_slice() {
            assert!((px.r - expected).abs() < 1e-5, "got {}", px.r);
        }
    }

    #[test]
    fn test_fixed_dimensions_survive_reset() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 1).unwrap().with_dimensions(20, 20).unwrap();
        assert!(matches!(
            group.add_image(flat(10, 10, 0.5, 1.0).view()),
            Err(FusionError::DimensionMismatch { .. })
        ));
        group.add_image(flat(20, 20, 0.5, 1.0).view()).unwrap();
        group.merge().unwrap();
        assert_eq!(group.base_dimensions(), Some([20, 20]));
    }

    #[test]
    fn test_group_reused_with_new_size() {
        let backend = CpuBackend::default();
        let mut group = FusionGroup::new(&backend, 1).unwrap();
        group.add_image(flat(20, 20, 0.5, 1.0).view()).unwrap();
        assert_eq!(group.merge().unwrap().dimensions(), [20, 20]);
        group.add_image(flat(33, 17, 0.5, 1.0).view()).unwrap();
        assert_eq!(group.merge().unwrap().dimensions(), [33, 17]);
    }

    #[test]
    fn test_merge_exposures_count_check() {
        let backend = CpuBackend::default();
        let mut images: Vec<HostImage> = (0..4).map(|_| flat(16, 16, 0.5, 1.0)).collect();
        let config = FusionConfig::default();
        assert!(matches!(
            merge_exposures(&backend, &config, &mut images),
            Err(FusionError::IncompleteGroup { expected: 3, actual: 1 })
        ));
        // Rejected before any quality mask was written.
        assert_eq!(images[0].get(0, 0).a, 1.0);
    }
}
