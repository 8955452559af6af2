// kernels.rs — CPU reference implementation of every fusion kernel.
//
// These are the formulas the WGSL kernels in shaders/ implement, written as
// plain loops over HostImages. They are slow and obviously correct; the GPU
// path is validated against them, and `CpuBackend` runs the whole pipeline
// on them when no device is wanted.
//
// All reads clamp at the image border.
//
//   downsample_*   taps [1 4 6 4 1] / 16, output extent ceil(n / 2)
//   upsample_*     source i writes 2i   = (s[i-1] + 6 s[i] + s[i+1]) / 8
//                             and 2i+1 = (s[i] + s[i+1]) / 2   if 2i+1 < H
//   create_laplacian   rgb = image − upsampled, a = image.a
//   collapse_level     rgb = upsampled + upper, a = upper.a
//   compute_quality    alpha = contrast^wc · saturation^ws · exposedness^we + ε
//   fuse_level         alpha-weighted mean of the stack, a = 1

use tracing::info;

use crate::arena::halve_dimension;
use crate::config::QualityParams;
use crate::error::{FusionError, Result};
use crate::image::{check_dims, HostImage, HostImageArray, ImageView, ImageViewMut, Rgba, StackView};
use crate::pyramid::{LevelPair, PyramidBackend};

/// Added to every quality weight so that no pixel has weight exactly zero.
pub const WEIGHT_EPSILON: f32 = 1e-12;

const TAPS: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Blur along x and keep every other column. Output is `ceil(w/2) × h`.
pub fn downsample_row(src: ImageView<'_>) -> Result<HostImage> {
    let (w, h) = (halve_dimension(src.width()), src.height());
    HostImage::from_fn(w, h, |x, y| {
        let cx = 2 * x as isize;
        TAPS.iter()
            .enumerate()
            .fold(Rgba::default(), |acc, (k, &t)| acc + src.get_clamped(cx + k as isize - 2, y as isize) * t)
    })
}

/// Blur along y and keep every other row. Output is `w × ceil(h/2)`.
pub fn downsample_col(src: ImageView<'_>) -> Result<HostImage> {
    let (w, h) = (src.width(), halve_dimension(src.height()));
    HostImage::from_fn(w, h, |x, y| {
        let cy = 2 * y as isize;
        TAPS.iter()
            .enumerate()
            .fold(Rgba::default(), |acc, (k, &t)| acc + src.get_clamped(x as isize, cy + k as isize - 2) * t)
    })
}

/// The two output samples source sample `i` is responsible for:
/// `(even, odd)` from the clamped neighbours `prev`, `here`, `next`.
#[inline]
fn upsample_pair(prev: Rgba, here: Rgba, next: Rgba) -> (Rgba, Rgba) {
    let even = (prev + here * 6.0 + next) * 0.125;
    let odd = (here + next) * 0.5;
    (even, odd)
}

/// Double the width to exactly `dst_width` (which must be `2w` or `2w − 1`).
pub fn upsample_row(src: ImageView<'_>, dst_width: usize) -> Result<HostImage> {
    if halve_dimension(dst_width) != src.width() {
        return Err(FusionError::DimensionMismatch {
            expected: (halve_dimension(dst_width), src.height()),
            actual: (src.width(), src.height()),
        });
    }
    let mut dst = HostImage::new(dst_width, src.height())?;
    for y in 0..src.height() {
        for i in 0..src.width() {
            let (iy, ii) = (y as isize, i as isize);
            let (even, odd) = upsample_pair(
                src.get_clamped(ii - 1, iy),
                src.get_clamped(ii, iy),
                src.get_clamped(ii + 1, iy),
            );
            dst.set(2 * i, y, even);
            if 2 * i + 1 < dst_width {
                dst.set(2 * i + 1, y, odd);
            }
        }
    }
    Ok(dst)
}

/// Double the height to exactly `dst_height` (which must be `2h` or `2h − 1`).
pub fn upsample_col(src: ImageView<'_>, dst_height: usize) -> Result<HostImage> {
    if halve_dimension(dst_height) != src.height() {
        return Err(FusionError::DimensionMismatch {
            expected: (src.width(), halve_dimension(dst_height)),
            actual: (src.width(), src.height()),
        });
    }
    let mut dst = HostImage::new(src.width(), dst_height)?;
    for i in 0..src.height() {
        for x in 0..src.width() {
            let (ix, ii) = (x as isize, i as isize);
            let (even, odd) = upsample_pair(
                src.get_clamped(ix, ii - 1),
                src.get_clamped(ix, ii),
                src.get_clamped(ix, ii + 1),
            );
            dst.set(x, 2 * i, even);
            if 2 * i + 1 < dst_height {
                dst.set(x, 2 * i + 1, odd);
            }
        }
    }
    Ok(dst)
}

// ---------------------------------------------------------------------------
// Pixelwise
// ---------------------------------------------------------------------------

/// `image − upsampled` on RGB; alpha taken from `image`.
pub fn create_laplacian(image: ImageView<'_>, upsampled: ImageView<'_>) -> Result<HostImage> {
    check_dims(image.dimensions(), upsampled.dimensions())?;
    let pixels: Vec<Rgba> = image
        .as_slice()
        .iter()
        .zip(upsampled.as_slice())
        .map(|(&i, &u)| (i - u).with_alpha(i.a))
        .collect();
    HostImage::from_pixels(image.width(), image.height(), &pixels)
}

/// `upsampled + upper` on RGB; alpha taken from `upper`.
pub fn collapse_level(upsampled: ImageView<'_>, upper: ImageView<'_>) -> Result<HostImage> {
    check_dims(upper.dimensions(), upsampled.dimensions())?;
    let pixels: Vec<Rgba> = upsampled
        .as_slice()
        .iter()
        .zip(upper.as_slice())
        .map(|(&u, &p)| (u + p).with_alpha(p.a))
        .collect();
    HostImage::from_pixels(upper.width(), upper.height(), &pixels)
}

// ---------------------------------------------------------------------------
// Quality and fusion
// ---------------------------------------------------------------------------

/// Mertens-style quality weight, written into alpha. RGB is left untouched.
pub fn compute_quality(mut image: ImageViewMut<'_>, params: &QualityParams) {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return;
    }
    let luma: Vec<f32> = image.as_slice().iter().map(|p| p.luminance()).collect();
    let at = |x: isize, y: isize| {
        let cx = x.clamp(0, w as isize - 1) as usize;
        let cy = y.clamp(0, h as isize - 1) as usize;
        luma[cy * w + cx]
    };
    let two_sigma_sq = 2.0 * params.sigma * params.sigma;

    for y in 0..h {
        for x in 0..w {
            let (ix, iy) = (x as isize, y as isize);
            let contrast =
                (4.0 * at(ix, iy) - at(ix - 1, iy) - at(ix + 1, iy) - at(ix, iy - 1) - at(ix, iy + 1)).abs();

            let px = image.get(x, y);
            let mean = (px.r + px.g + px.b) / 3.0;
            let saturation = (((px.r - mean).powi(2) + (px.g - mean).powi(2) + (px.b - mean).powi(2)) / 3.0).sqrt();

            let exposedness = [px.r, px.g, px.b]
                .iter()
                .map(|c| (-(c - 0.5).powi(2) / two_sigma_sq).exp())
                .product::<f32>();

            let weight = contrast.powf(params.contrast)
                * saturation.powf(params.saturation)
                * exposedness.powf(params.exposedness)
                + WEIGHT_EPSILON;
            image.set(x, y, px.with_alpha(weight));
        }
    }
}

/// Collapse a stack to one image: RGB averaged with each layer's alpha as
/// weight, plain mean if the weights sum to (near) zero. Output alpha is 1.
pub fn fuse_level(stack: StackView<'_>) -> Result<HostImage> {
    if !stack.valid() {
        return Err(FusionError::NoPyramids);
    }
    let [w, h, depth] = stack.dimensions();
    HostImage::from_fn(w, h, |x, y| {
        let mut sum = Rgba::default();
        let mut plain = Rgba::default();
        let mut total = 0.0f32;
        for k in 0..depth {
            let px = stack.layer(k).get(x, y);
            sum = sum + px * px.a;
            plain = plain + px;
            total += px.a;
        }
        let fused = if total > WEIGHT_EPSILON { sum * (1.0 / total) } else { plain * (1.0 / depth as f32) };
        fused.with_alpha(1.0)
    })
}

// ---------------------------------------------------------------------------
// CpuBackend
// ---------------------------------------------------------------------------

/// Runs the pyramid engine on the host with the reference kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend {
    pub quality: QualityParams,
}

impl CpuBackend {
    pub fn new(quality: QualityParams) -> Self {
        CpuBackend { quality }
    }
}

impl PyramidBackend for CpuBackend {
    type Image = HostImage;
    type Stack = HostImageArray;

    fn upload(&self, view: ImageView<'_>) -> Result<HostImage> {
        view.to_host_image()
    }

    fn upload_stack(&self, stack: StackView<'_>) -> Result<HostImageArray> {
        let layers: Vec<ImageView<'_>> = (0..stack.depth()).map(|i| stack.layer(i)).collect();
        HostImageArray::from_layers(&layers)
    }

    fn read_into(&self, image: &HostImage, mut dst: ImageViewMut<'_>) -> Result<()> {
        dst.copy_from(&image.view())
    }

    fn next_level(&self, image: &HostImage) -> Result<LevelPair<HostImage>> {
        let [w, h] = image.dimensions();
        let rows = downsample_row(image.view())?;
        let next = downsample_col(rows.view())?;
        let up_cols = upsample_col(next.view(), h)?;
        let up = upsample_row(up_cols.view(), w)?;
        let detail = create_laplacian(image.view(), up.view())?;
        Ok(LevelPair { detail, next })
    }

    fn collapse_level(&self, lower: &HostImage, upper: &HostImage) -> Result<HostImage> {
        let [w, h] = upper.dimensions();
        let up_cols = upsample_col(lower.view(), h)?;
        let up = upsample_row(up_cols.view(), w)?;
        collapse_level(up.view(), upper.view())
    }

    fn fuse_level(&self, stack: &HostImageArray) -> Result<HostImage> {
        fuse_level(stack.stack_view())
    }

    fn compute_quality(&self, image: ImageViewMut<'_>) -> Result<()> {
        info!(width = image.width(), height = image.height(), "computing quality mask");
        compute_quality(image, &self.quality);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(w: usize, h: usize, v: f32) -> HostImage {
        HostImage::from_fn(w, h, |_, _| Rgba::splat_rgb(v, 1.0)).unwrap()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_downsample_dimensions_round_up() {
        let img = constant(9, 5, 0.5);
        let rows = downsample_row(img.view()).unwrap();
        assert_eq!(rows.dimensions(), [5, 5]);
        let cols = downsample_col(rows.view()).unwrap();
        assert_eq!(cols.dimensions(), [5, 3]);
    }

    #[test]
    fn test_resampling_preserves_constants() {
        let img = constant(7, 7, 0.3);
        let down = downsample_col(downsample_row(img.view()).unwrap().view()).unwrap();
        assert!(down.as_slice().iter().all(|p| close(p.r, 0.3) && close(p.a, 1.0)));
        let up = upsample_row(upsample_col(down.view(), 7).unwrap().view(), 7).unwrap();
        assert_eq!(up.dimensions(), [7, 7]);
        assert!(up.as_slice().iter().all(|p| close(p.g, 0.3)));
    }

    #[test]
    fn test_upsample_odd_extent() {
        // 3 samples -> 5: even outputs blur, odd outputs interpolate.
        let src = HostImage::from_pixels(
            3,
            1,
            &[Rgba::splat_rgb(0.0, 1.0), Rgba::splat_rgb(8.0, 1.0), Rgba::splat_rgb(16.0, 1.0)],
        )
        .unwrap();
        let up = upsample_row(src.view(), 5).unwrap();
        let r: Vec<f32> = up.as_slice().iter().map(|p| p.r).collect();
        assert_eq!(r, vec![1.0, 4.0, 8.0, 12.0, 15.0]);
    }

    #[test]
    fn test_upsample_rejects_wrong_extent() {
        let src = constant(3, 2, 1.0);
        assert!(upsample_row(src.view(), 7).is_err());
        assert!(upsample_col(src.view(), 3).is_ok());
        assert!(upsample_col(src.view(), 4).is_ok());
        assert!(upsample_col(src.view(), 5).is_err());
    }

    #[test]
    fn test_laplacian_keeps_image_alpha() {
        let a = HostImage::from_fn(2, 2, |_, _| Rgba::new(0.5, 0.5, 0.5, 0.7)).unwrap();
        let b = HostImage::from_fn(2, 2, |_, _| Rgba::new(0.25, 0.0, 1.0, 0.1)).unwrap();
        let l = create_laplacian(a.view(), b.view()).unwrap();
        assert_eq!(l.get(1, 1), Rgba::new(0.25, 0.5, -0.5, 0.7));
        let c = collapse_level(b.view(), l.view()).unwrap();
        assert_eq!(c.get(0, 0), Rgba::new(0.5, 0.5, 0.5, 0.7));
    }

    #[test]
    fn test_quality_prefers_mid_tones() {
        let checker = |x: usize, y: usize| ((x + y) % 2) as f32;
        let mut dark = HostImage::from_fn(4, 4, |x, y| Rgba::new(0.02 * checker(x, y), 0.0, 0.01, 1.0)).unwrap();
        let mut mid = HostImage::from_fn(4, 4, |x, y| Rgba::new(0.4 + 0.1 * checker(x, y), 0.5, 0.6, 1.0)).unwrap();
        let params = QualityParams::default();
        compute_quality(dark.view_mut(), &params);
        compute_quality(mid.view_mut(), &params);
        assert!(mid.get(1, 1).a > dark.get(1, 1).a);
        // RGB untouched.
        assert_eq!(mid.get(2, 0).g, 0.5);
    }

    #[test]
    fn test_quality_of_flat_grey_is_epsilon() {
        let mut img = constant(3, 3, 0.5);
        compute_quality(img.view_mut(), &QualityParams::default());
        // Zero contrast and zero saturation.
        assert!(img.as_slice().iter().all(|p| p.a == WEIGHT_EPSILON));
    }

    #[test]
    fn test_fuse_weighted_mean() {
        let a = HostImage::from_fn(1, 1, |_, _| Rgba::new(1.0, 0.0, 0.0, 3.0)).unwrap();
        let b = HostImage::from_fn(1, 1, |_, _| Rgba::new(0.0, 1.0, 0.0, 1.0)).unwrap();
        let stack = HostImageArray::from_layers(&[a.view(), b.view()]).unwrap();
        let f = fuse_level(stack.stack_view()).unwrap();
        let p = f.get(0, 0);
        assert!(close(p.r, 0.75) && close(p.g, 0.25) && p.a == 1.0);
    }

    #[test]
    fn test_fuse_zero_weights_is_plain_mean() {
        let a = HostImage::from_fn(1, 1, |_, _| Rgba::new(1.0, 0.0, 0.0, 0.0)).unwrap();
        let b = HostImage::from_fn(1, 1, |_, _| Rgba::new(0.0, 1.0, 0.0, 0.0)).unwrap();
        let stack = HostImageArray::from_layers(&[a.view(), b.view()]).unwrap();
        let p = fuse_level(stack.stack_view()).unwrap().get(0, 0);
        assert!(close(p.r, 0.5) && close(p.g, 0.5));
    }
}
