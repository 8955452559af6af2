// benches/gpu_benchmarks.rs — GPU pipeline benchmarks.
//
// Mirrors benchmarks.rs. Each CPU stage has a GPU benchmark in the same
// group for direct comparison.
//
//   cargo bench --bench gpu_benchmarks
//
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time including CPU overhead (staging writes, bind
// group creation, submit, poll). Shader execution lands in the blocking
// read_into calls. That is the right metric here: a merge is not done until
// the fused image is back on the host.
//
// The first iterations pay pipeline creation on drivers that compile
// lazily, so warm_up_time is set explicitly.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use expofuse::config::{LevelCount, QualityParams};
use expofuse::fusion::FusionGroup;
use expofuse::gpu::{GpuBackend, GpuContext};
use expofuse::image::{HostImage, Rgba};
use expofuse::kernels::CpuBackend;
use expofuse::pyramid::{Pyramid, PyramidBackend};

// ============================================================
// Shared helpers
// ============================================================

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

const W: usize = 1536;
const H: usize = 1024;

// ============================================================
// Pyramid: CPU vs GPU
// ============================================================

fn bench_pyramid(c: &mut Criterion) {
    let img = make_exposure(W, H, 1.0);
    let gpu = GpuContext::new().expect("no GPU adapter");
    let gpu_backend = GpuBackend::new(&gpu, &QualityParams::default()).expect("kernel build failed");
    let cpu_backend = CpuBackend::default();

    let mut group = c.benchmark_group("pyramid");
    group.warm_up_time(Duration::from_secs(2));
    let id = format!("{W}x{H}");

    group.bench_function(BenchmarkId::new("cpu_build", &id), |b| {
        b.iter(|| Pyramid::build(&cpu_backend, img.view(), LevelCount::Auto).unwrap())
    });
    group.bench_function(BenchmarkId::new("gpu_build", &id), |b| {
        b.iter(|| Pyramid::build(&gpu_backend, img.view(), LevelCount::Auto).unwrap())
    });

    group.finish();
}

// ============================================================
// Quality mask: CPU vs GPU
// ============================================================

fn bench_quality(c: &mut Criterion) {
    let mut img = make_exposure(W, H, 1.0);
    let gpu = GpuContext::new().expect("no GPU adapter");
    let gpu_backend = GpuBackend::new(&gpu, &QualityParams::default()).expect("kernel build failed");
    let cpu_backend = CpuBackend::default();

    let mut group = c.benchmark_group("quality");
    group.warm_up_time(Duration::from_secs(2));
    let id = format!("{W}x{H}");

    group.bench_function(BenchmarkId::new("cpu", &id), |b| {
        b.iter(|| cpu_backend.compute_quality(img.view_mut()).unwrap())
    });
    group.bench_function(BenchmarkId::new("gpu", &id), |b| {
        b.iter(|| gpu_backend.compute_quality(img.view_mut()).unwrap())
    });

    group.finish();
}

// ============================================================
// Three-exposure merge: CPU vs GPU
// ============================================================

fn bench_merge(c: &mut Criterion) {
    let exposures: Vec<HostImage> = [0.4, 1.0, 2.2].iter().map(|&g| make_exposure(W, H, g)).collect();
    let gpu = GpuContext::new().expect("no GPU adapter");
    let gpu_backend = GpuBackend::new(&gpu, &QualityParams::default()).expect("kernel build failed");
    let cpu_backend = CpuBackend::default();

    let mut group = c.benchmark_group("merge");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(2));
    let id = format!("{W}x{H}");

    let mut cpu_group = FusionGroup::new(&cpu_backend, 3).unwrap();
    group.bench_function(BenchmarkId::new("cpu_group_3", &id), |b| {
        b.iter(|| {
            for img in &exposures {
                cpu_group.add_image(img.view()).unwrap();
            }
            cpu_group.merge().unwrap()
        })
    });

    let mut gpu_group = FusionGroup::new(&gpu_backend, 3).unwrap();
    group.bench_function(BenchmarkId::new("gpu_group_3", &id), |b| {
        b.iter(|| {
            for img in &exposures {
                gpu_group.add_image(img.view()).unwrap();
            }
            gpu_group.merge().unwrap()
        })
    });

    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_pyramid, bench_quality, bench_merge);
criterion_main!(benches);
