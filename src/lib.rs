// expofuse: exposure fusion with Laplacian pyramids on wgpu.
//
// Bracketed exposures of one scene are merged into a single image by
// blending their Laplacian pyramids level by level, weighted by a
// per-pixel quality mask (contrast, saturation, well-exposedness).
//
// Reference: Mertens, Kautz, Van Reeth — "Exposure Fusion" (Pacific
// Graphics 2007)

pub mod arena;
pub mod config;
pub mod convert;
pub mod error;
pub mod fusion;
pub mod gpu;
pub mod image;
pub mod kernels;
pub mod pyramid;

pub use config::{FusionConfig, LevelCount, QualityParams};
pub use error::{FusionError, Result};
pub use fusion::{merge_exposures, FusionGroup};
pub use image::{HostImage, ImageView, ImageViewMut, Rgba};
pub use kernels::CpuBackend;
pub use pyramid::{Pyramid, PyramidBackend};
