// benches/benchmarks.rs -- Per-stage and full-merge benchmarks on the CPU
// reference backend.
//
//   cargo bench --bench benchmarks
//
// Sizes cover a small preview (640×480) and a 12 MP-class frame scaled down
// to keep a single iteration under a second (1536×1024).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use expofuse::config::{FusionConfig, LevelCount};
use expofuse::fusion::{merge_exposures, FusionGroup};
use expofuse::image::{HostImage, Rgba};
use expofuse::kernels::CpuBackend;
use expofuse::pyramid::{Pyramid, PyramidBackend};

// ============================================================
// Helpers
// ============================================================

/// Synthetic bracketed exposure: gradients plus bright rectangles, scaled by
/// `gain` and clipped the way a sensor would.
fn make_exposure(w: usize, h: usize, gain: f32) -> HostImage {
    HostImage::from_fn(w, h, |x, y| {
        let mut v = (x as f32 / w as f32) * 0.7 + (y as f32 / h as f32) * 0.2;
        for rect in 0..6 {
            let rx = (50 + rect * 100) % w;
            let ry = (40 + (rect % 3) * 120) % h;
            if (rx..rx + 80).contains(&x) && (ry..ry + 60).contains(&y) {
                v = 0.7 + rect as f32 * 0.04;
            }
        }
        let c = |k: f32| (v * k * gain).min(1.0);
        Rgba::new(c(1.0), c(0.9), c(0.75), 1.0)
    })
    .unwrap()
}

const SIZES: [(usize, usize); 2] = [(640, 480), (1536, 1024)];

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_quality(c: &mut Criterion) {
    let backend = CpuBackend::default();
    let mut group = c.benchmark_group("quality");
    for (w, h) in SIZES {
        let mut img = make_exposure(w, h, 1.0);
        group.bench_with_input(BenchmarkId::new("cpu", format!("{w}x{h}")), &(w, h), |b, _| {
            b.iter(|| backend.compute_quality(img.view_mut()).unwrap())
        });
    }
    group.finish();
}

fn bench_pyramid(c: &mut Criterion) {
    let backend = CpuBackend::default();
    let mut group = c.benchmark_group("pyramid");
    for (w, h) in SIZES {
        let img = make_exposure(w, h, 1.0);
        group.bench_with_input(BenchmarkId::new("build", format!("{w}x{h}")), &(w, h), |b, _| {
            b.iter(|| Pyramid::build(&backend, img.view(), LevelCount::Auto).unwrap())
        });
        let pyr = Pyramid::build(&backend, img.view(), LevelCount::Auto).unwrap();
        let levels = pyr.levels();
        let mut out = HostImage::new(w, h).unwrap();
        group.bench_with_input(BenchmarkId::new("collapse", format!("{w}x{h}")), &(w, h), |b, _| {
            b.iter(|| expofuse::pyramid::collapse_into(&backend, &levels, out.view_mut()).unwrap())
        });
    }
    group.finish();
}

// ============================================================
// Full merge
// ============================================================

fn bench_merge(c: &mut Criterion) {
    let backend = CpuBackend::default();
    let mut group = c.benchmark_group("merge");
    group.sample_size(10);

    for (w, h) in SIZES {
        let exposures: Vec<HostImage> = [0.4, 1.0, 2.2].iter().map(|&g| make_exposure(w, h, g)).collect();

        // Pyramids + fuse + collapse, quality masks already in place.
        let mut fusion = FusionGroup::new(&backend, 3).unwrap();
        group.bench_with_input(BenchmarkId::new("group_3", format!("{w}x{h}")), &(w, h), |b, _| {
            b.iter(|| {
                for img in &exposures {
                    fusion.add_image(img.view()).unwrap();
                }
                fusion.merge().unwrap()
            })
        });

        // The whole batch driver, quality masks included.
        let config = FusionConfig::default();
        group.bench_with_input(BenchmarkId::new("merge_exposures_3", format!("{w}x{h}")), &(w, h), |b, _| {
            b.iter_batched(
                || exposures.iter().map(|img| img.try_clone().unwrap()).collect::<Vec<_>>(),
                |mut images| merge_exposures(&backend, &config, &mut images).unwrap(),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_quality, bench_pyramid, bench_merge);
criterion_main!(benches);
