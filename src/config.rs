// config.rs — run configuration.
//
// Plain structs with `Default`; there is no config file. The demo fills these
// from its command line, tests build them inline.

use crate::arena::calculate_num_levels;
use crate::gpu::device::DeviceProfile;

/// How many pyramid levels to build for a given base size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelCount {
    /// Halve until the shorter side is ≤ 8 (`calculate_num_levels`).
    #[default]
    Auto,
    /// A fixed count, clamped to `[1, calculate_num_levels(w, h)]`.
    Fixed(usize),
}

impl LevelCount {
    pub fn resolve(self, width: usize, height: usize) -> usize {
        let max = calculate_num_levels(width, height);
        match self {
            LevelCount::Auto => max,
            LevelCount::Fixed(n) => n.clamp(1, max),
        }
    }
}

/// Exponents and spread of the per-pixel quality measure.
///
/// weight = contrast^contrast · saturation^saturation · exposedness^exposedness
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityParams {
    pub contrast: f32,
    pub saturation: f32,
    pub exposedness: f32,
    /// Standard deviation of the well-exposedness Gaussian around 0.5.
    pub sigma: f32,
}

impl Default for QualityParams {
    fn default() -> Self {
        QualityParams { contrast: 1.0, saturation: 1.0, exposedness: 1.0, sigma: 0.2 }
    }
}

/// Everything a fusion run needs besides the images themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    /// Exposures per HDR stack. Inputs are grouped in this order.
    pub group_size: usize,
    pub levels: LevelCount,
    pub quality: QualityParams,
    pub profile: DeviceProfile,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            group_size: 3,
            levels: LevelCount::Auto,
            quality: QualityParams::default(),
            profile: DeviceProfile::Native,
        }
    }
}
