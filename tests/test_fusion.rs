// tests/test_fusion.rs — Integration tests for FusionGroup and the batch
// driver, on the CPU reference backend.

use expofuse::config::{FusionConfig, LevelCount};
use expofuse::error::FusionError;
use expofuse::fusion::{merge_exposures, FusionGroup};
use expofuse::image::{HostImage, Rgba};
use expofuse::kernels::CpuBackend;
use expofuse::pyramid::PyramidBackend;

/// One scene at three exposure scales: a smooth pattern multiplied by
/// `gain` and clamped, like an under/normal/over bracket.
fn exposure(w: usize, h: usize, gain: f32) -> HostImage {
    HostImage::from_fn(w, h, |x, y| {
        let fx = x as f32 / w as f32;
        let fy = y as f32 / h as f32;
        let r = 0.2 + 0.6 * fx;
        let g = 0.3 + 0.5 * (5.0 * fy).sin().abs();
        let b = 0.5 * (fx + fy);
        Rgba::new((r * gain).min(1.0), (g * gain).min(1.0), (b * gain).min(1.0), 1.0)
    })
    .unwrap()
}

fn with_weight(mut img: HostImage, weight: f32) -> HostImage {
    for px in img.as_mut_slice() {
        px.a = weight;
    }
    img
}

// ===== add_image =====

#[test]
fn add_image_rejects_other_dimensions() {
    let backend = CpuBackend::default();
    let mut group = FusionGroup::new(&backend, 3).unwrap();
    group.add_image(exposure(100, 100, 1.0).view()).unwrap();
    group.add_image(exposure(100, 100, 0.5).view()).unwrap();
    let err = group.add_image(exposure(64, 64, 2.0).view()).unwrap_err();
    assert!(matches!(
        err,
        FusionError::DimensionMismatch { expected: (100, 100), actual: (64, 64) }
    ));
    assert_eq!(group.size(), 2);
}

// ===== merge =====

#[test]
fn three_exposures_fuse_within_convex_hull() {
    let backend = CpuBackend::default();
    // Constant weight per exposure: the blend is a fixed convex combination
    // at every level, so the collapse stays inside the per-pixel hull.
    let inputs = [
        with_weight(exposure(256, 256, 0.5), 1.0),
        with_weight(exposure(256, 256, 1.0), 2.0),
        with_weight(exposure(256, 256, 1.6), 0.5),
    ];

    let mut group = FusionGroup::new(&backend, 3).unwrap();
    for img in &inputs {
        group.add_image(img.view()).unwrap();
    }
    assert_eq!(group.num_levels(), 6);
    let out = group.merge().unwrap();
    assert_eq!(out.dimensions(), [256, 256]);
    assert_eq!(group.size(), 0);

    let tol = 1e-4;
    for y in 0..256 {
        for x in 0..256 {
            let got = out.get(x, y).to_array();
            for c in 0..3 {
                let values = inputs.iter().map(|img| img.get(x, y).to_array()[c]);
                let lo = values.clone().fold(f32::INFINITY, f32::min);
                let hi = values.fold(f32::NEG_INFINITY, f32::max);
                assert!(
                    got[c] >= lo - tol && got[c] <= hi + tol,
                    "({x},{y}) channel {c}: {} outside [{lo}, {hi}]",
                    got[c]
                );
            }
        }
    }
}

#[test]
fn quality_weighted_fusion_stays_near_convex_hull() {
    let backend = CpuBackend::default();
    let mut inputs = [exposure(256, 256, 0.5), exposure(256, 256, 1.0), exposure(256, 256, 1.6)];
    for img in &mut inputs {
        backend.compute_quality(img.view_mut()).unwrap();
    }

    let mut group = FusionGroup::new(&backend, 3).unwrap();
    for img in &inputs {
        group.add_image(img.view()).unwrap();
    }
    let out = group.merge().unwrap();

    // Spatially varying weights let the band-pass levels ring slightly past
    // the inputs at weight edges, never by more than a few hundredths.
    let tol = 0.02;
    for y in 0..256 {
        for x in 0..256 {
            let got = out.get(x, y).to_array();
            for c in 0..3 {
                let values = inputs.iter().map(|img| img.get(x, y).to_array()[c]);
                let lo = values.clone().fold(f32::INFINITY, f32::min);
                let hi = values.fold(f32::NEG_INFINITY, f32::max);
                assert!(
                    got[c] >= lo - tol && got[c] <= hi + tol,
                    "({x},{y}) channel {c}: {} outside [{lo}, {hi}]",
                    got[c]
                );
            }
        }
    }
}

#[test]
fn quality_weighted_merge_produces_finite_image() {
    let backend = CpuBackend::default();
    let mut group = FusionGroup::new(&backend, 3).unwrap();
    for gain in [0.4, 1.0, 2.5] {
        let mut img = exposure(120, 90, gain);
        backend.compute_quality(img.view_mut()).unwrap();
        group.add_image(img.view()).unwrap();
    }
    let out = group.merge().unwrap();
    assert!(out.as_slice().iter().all(|p| p.to_array().iter().all(|c| c.is_finite())));
    assert!(out.as_slice().iter().all(|p| p.a == 1.0));
}

#[test]
fn merge_into_caller_buffer() {
    let backend = CpuBackend::default();
    let mut group = FusionGroup::new(&backend, 2).unwrap().with_levels(LevelCount::Fixed(3)).unwrap();
    group.add_image(exposure(50, 40, 1.0).view()).unwrap();
    group.add_image(exposure(50, 40, 1.0).view()).unwrap();
    let mut dest = HostImage::new(50, 40).unwrap();
    group.merge_into(dest.view_mut()).unwrap();
    // Two identical exposures fuse to the exposure itself.
    let reference = exposure(50, 40, 1.0);
    for (p, q) in dest.as_slice().iter().zip(reference.as_slice()) {
        assert!((p.g - q.g).abs() < 1e-5);
    }
}

// ===== merge_exposures =====

#[test]
fn merge_exposures_one_output_per_batch() {
    let backend = CpuBackend::default();
    let config = FusionConfig { group_size: 2, ..FusionConfig::default() };
    let mut images = vec![
        exposure(48, 32, 0.5),
        exposure(48, 32, 1.5),
        exposure(24, 24, 0.5),
        exposure(24, 24, 1.5),
    ];
    let merged = merge_exposures(&backend, &config, &mut images).unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].dimensions(), [48, 32]);
    assert_eq!(merged[1].dimensions(), [24, 24]);
    // Quality masks were written in place.
    assert!(images.iter().any(|img| img.as_slice().iter().any(|p| p.a != 1.0)));
}

#[test]
fn merge_exposures_rejects_partial_batch() {
    let backend = CpuBackend::default();
    let mut images = vec![exposure(16, 16, 1.0), exposure(16, 16, 0.5)];
    let err = merge_exposures(&backend, &FusionConfig::default(), &mut images).unwrap_err();
    assert!(matches!(err, FusionError::IncompleteGroup { expected: 3, actual: 2 }));
}

#[test]
fn merge_exposures_rejects_zero_group_size() {
    let backend = CpuBackend::default();
    let config = FusionConfig { group_size: 0, ..FusionConfig::default() };
    let err = merge_exposures(&backend, &config, &mut []).unwrap_err();
    assert!(matches!(err, FusionError::EmptyGroup));
}
