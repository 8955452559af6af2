// gpu/mod.rs — wgpu acceleration layer.
//
// The CPU reference in `kernels` stays the authority: every kernel here is
// validated against it (see the subprocess tests in gpu::pyramid).
//
//   device   GpuContext: instance → adapter → device + queue, error scopes
//   kernel   KernelProgram: WGSL compiled once, one pipeline per entry point
//   image    DeviceImage textures and PendingImage, the async handle
//   pyramid  GpuBackend: PyramidBackend over PendingImage
//
// Host ↔ device traffic per fusion batch:
//
//   quality mask   upload, one kernel, read back in place
//   pyramid build  one upload, then one read back per level
//   fuse           one array upload per level (all K exposures), one read back
//   collapse       one upload per level, one final read back
//
// Everything between those transfers is chained on submission indices and
// never blocks the host.

pub mod device;
pub mod image;
pub mod kernel;
pub mod pyramid;

pub use device::{DeviceError, DeviceProfile, GpuContext, WorkgroupSize};
pub use image::{DeviceImage, PendingImage};
pub use kernel::{Kernel, KernelProgram, RangePolicy};
pub use pyramid::GpuBackend;
