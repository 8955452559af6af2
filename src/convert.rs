// convert.rs — Pixel conversions between 8/16-bit interleaved buffers and
// the float RGBA layout the fusion pipeline works in.
//
// Input side (decoded files → HostImage):
//   u8 RGB   → f32 RGBA, components / 255, alpha = 1
//   u8 RGBA  → f32 RGBA, components / 255, alpha = 1 (source alpha dropped)
//
// Output side (fused HostImage → encoder):
//   f32 RGBA → u16 RGB, clamped to [0, 1], scaled to 65535, rounded
//   f32 RGBA → u8  RGB, clamped to [0, 1], scaled to 255, rounded
//
// Alpha is overwritten on input because the pipeline reuses it as the
// quality weight. No gamma handling: values pass through in whatever
// transfer curve the caller decoded them in.

use crate::error::{FusionError, Result};
use crate::image::{HostImage, ImageView, Rgba};

fn interleaved_to_float(width: usize, height: usize, src: &[u8], channels: usize) -> Result<HostImage> {
    let expected = width * height;
    if src.len() != expected * channels {
        return Err(FusionError::BufferSize { expected, actual: src.len() / channels });
    }
    let mut dst = HostImage::new(width, height)?;
    for (px, chunk) in dst.as_mut_slice().iter_mut().zip(src.chunks_exact(channels)) {
        *px = Rgba::new(
            chunk[0] as f32 / 255.0,
            chunk[1] as f32 / 255.0,
            chunk[2] as f32 / 255.0,
            1.0,
        );
    }
    Ok(dst)
}

/// Convert interleaved 8-bit RGB (`width * height * 3` bytes) to float RGBA.
pub fn rgb8_to_float(width: usize, height: usize, src: &[u8]) -> Result<HostImage> {
    interleaved_to_float(width, height, src, 3)
}

/// Convert interleaved 8-bit RGBA to float RGBA. The source alpha is
/// discarded; every output alpha is 1.
pub fn rgba8_to_float(width: usize, height: usize, src: &[u8]) -> Result<HostImage> {
    interleaved_to_float(width, height, src, 4)
}

/// Convert to interleaved 16-bit RGB (`width * height * 3` samples).
pub fn float_to_rgb16(src: &ImageView<'_>) -> Vec<u16> {
    let mut dst = Vec::with_capacity(src.len() * 3);
    for px in src.as_slice() {
        for c in [px.r, px.g, px.b] {
            dst.push((c.clamp(0.0, 1.0) * 65535.0).round() as u16);
        }
    }
    dst
}

/// Convert to interleaved 8-bit RGB.
pub fn float_to_rgb8(src: &ImageView<'_>) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() * 3);
    for px in src.as_slice() {
        for c in [px.r, px.g, px.b] {
            dst.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb8_normalised_alpha_one() {
        let img = rgb8_to_float(2, 1, &[0, 51, 255, 255, 0, 102]).unwrap();
        assert_eq!(img.get(0, 0), Rgba::new(0.0, 0.2, 1.0, 1.0));
        assert_eq!(img.get(1, 0), Rgba::new(1.0, 0.0, 0.4, 1.0));
    }

    #[test]
    fn test_rgba8_drops_source_alpha() {
        let img = rgba8_to_float(1, 1, &[255, 255, 255, 0]).unwrap();
        assert_eq!(img.get(0, 0).a, 1.0);
    }

    #[test]
    fn test_rgb8_wrong_length() {
        let err = rgb8_to_float(2, 2, &[0; 9]).unwrap_err();
        assert!(matches!(err, FusionError::BufferSize { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_float_to_rgb16_clamps_and_rounds() {
        let img = HostImage::from_pixels(
            2,
            1,
            &[Rgba::new(-0.5, 0.5, 1.5, 0.0), Rgba::new(1.0, 0.0, 0.25, 7.0)],
        )
        .unwrap();
        assert_eq!(float_to_rgb16(&img.view()), vec![0, 32768, 65535, 65535, 0, 16384]);
    }

    #[test]
    fn test_rgb8_float_rgb8_is_lossless() {
        let src: Vec<u8> = (0..=255u8).flat_map(|v| [v, 255 - v, v / 2]).collect();
        let img = rgb8_to_float(256, 1, &src).unwrap();
        assert_eq!(float_to_rgb8(&img.view()), src);
    }
}
