// gpu/pyramid.rs — the pyramid engine's GPU backend.
//
// `GpuBackend` implements `PyramidBackend` with `PendingImage`s: every step
// is a kernel launch chained on the previous one's events, and the only
// host stalls are the `read_into` calls the engine makes per stored level.
//
// One build step from image I (w × h), as launches:
//
//   rows = downsample_row(I)           → new ⌈w/2⌉ × h        grid: dst
//   next = downsample_col(rows)        → new ⌈w/2⌉ × ⌈h/2⌉    grid: dst
//   upc  = upsample_col(next)          → reuses rows' texture  grid: src
//   up   = upsample_row(upc)           → new w × h             grid: src
//   lap  = create_laplacian(I, up)     → new w × h             grid: src
//
// The kernel program is compiled once in `GpuBackend::new` and owned by the
// backend; the context is borrowed, so one context can serve several
// backends (e.g. with different quality parameters).

use tracing::info;

use crate::arena::halve_dimension;
use crate::config::QualityParams;
use crate::error::Result;
use crate::gpu::device::{DeviceError, GpuContext};
use crate::gpu::image::PendingImage;
use crate::gpu::kernel::{Kernel, KernelProgram, RangePolicy};
use crate::image::{ImageView, ImageViewMut, StackView};
use crate::pyramid::{LevelPair, PyramidBackend};

/// Entry points this backend launches and the grid each one runs over.
pub const KERNEL_RANGES: [(&str, RangePolicy); 8] = [
    ("downsample_row", RangePolicy::Destination),
    ("downsample_col", RangePolicy::Destination),
    ("upsample_col", RangePolicy::Source),
    ("upsample_row", RangePolicy::Source),
    ("create_laplacian", RangePolicy::Source),
    ("collapse_level", RangePolicy::Source),
    ("compute_quality", RangePolicy::Source),
    ("fuse_level", RangePolicy::Destination),
];

/// Launch range of the kernel `name`; only names in [`KERNEL_RANGES`] exist.
pub fn range_for(name: &str) -> std::result::Result<RangePolicy, DeviceError> {
    KERNEL_RANGES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, r)| r)
        .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))
}

/// Runs the pyramid engine on a wgpu device.
pub struct GpuBackend<'g> {
    gpu: &'g GpuContext,
    program: KernelProgram,
}

impl<'g> GpuBackend<'g> {
    /// Compile the kernel program for `gpu`. Blocks until compilation ends.
    pub fn new(gpu: &'g GpuContext, quality: &QualityParams) -> Result<Self> {
        let program = KernelProgram::new(gpu, quality)?;
        info!(%gpu, "GPU backend ready");
        Ok(GpuBackend { gpu, program })
    }

    #[inline]
    pub fn context(&self) -> &'g GpuContext {
        self.gpu
    }

    fn kernel(&self, name: &str) -> Result<Kernel<'_>> {
        Ok(self.program.kernel(name, range_for(name)?)?)
    }
}

impl<'g> PyramidBackend for GpuBackend<'g> {
    type Image = PendingImage<'g>;
    type Stack = PendingImage<'g>;

    fn upload(&self, view: ImageView<'_>) -> Result<PendingImage<'g>> {
        PendingImage::upload(self.gpu, view)
    }

    fn upload_stack(&self, stack: StackView<'_>) -> Result<PendingImage<'g>> {
        PendingImage::upload_stack(self.gpu, stack)
    }

    fn read_into(&self, image: &PendingImage<'g>, dst: ImageViewMut<'_>) -> Result<()> {
        image.read_into(dst)
    }

    fn next_level(&self, image: &PendingImage<'g>) -> Result<LevelPair<PendingImage<'g>>> {
        let [w, h] = image.dimensions();
        let (half_w, half_h) = (halve_dimension(w), halve_dimension(h));

        let rows = image.process(&self.kernel("downsample_row")?, Some([half_w, h]))?;
        let next = rows.process(&self.kernel("downsample_col")?, Some([half_w, half_h]))?;
        let up_cols = next.process_into(&self.kernel("upsample_col")?, rows)?;
        let up = up_cols.process(&self.kernel("upsample_row")?, Some([w, h]))?;
        let detail = image.process_with(&self.kernel("create_laplacian")?, &[&up], None)?;
        Ok(LevelPair { detail, next })
    }

    fn collapse_level(&self, lower: &PendingImage<'g>, upper: &PendingImage<'g>) -> Result<PendingImage<'g>> {
        let [w, h] = upper.dimensions();
        let [lower_w, _] = lower.dimensions();
        let up_cols = lower.process(&self.kernel("upsample_col")?, Some([lower_w, h]))?;
        let up = up_cols.process(&self.kernel("upsample_row")?, Some([w, h]))?;
        up.process_with(&self.kernel("collapse_level")?, &[upper], None)
    }

    fn fuse_level(&self, stack: &PendingImage<'g>) -> Result<PendingImage<'g>> {
        stack.process(&self.kernel("fuse_level")?, None)
    }

    fn compute_quality(&self, mut image: ImageViewMut<'_>) -> Result<()> {
        info!(width = image.width(), height = image.height(), "computing quality mask");
        let uploaded = PendingImage::upload(self.gpu, image.as_view())?;
        let weighted = uploaded.process(&self.kernel("compute_quality")?, None)?;
        weighted.read_into(image.reborrow())
    }
}
