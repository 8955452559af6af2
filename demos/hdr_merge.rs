// demos/hdr_merge.rs
//
// Fuse bracketed exposures into 16-bit PNGs.
//
// Usage:
//   cargo run --example hdr_merge --release -- [options] <output_prefix> <image>...
//
// Options:
//   --cpu            run the CPU reference backend instead of the GPU
//   --group N        exposures per HDR stack (default 3)
//   --levels N       fixed pyramid level count (default: automatic)
//   --constrained    request conservative device limits (GPU only)
//
// Inputs are grouped in command-line order: with --group 3, images 1-3 form
// the first stack, 4-6 the second, and so on. Stack k is written to
// <output_prefix>_<k>.png.
//
// Logging goes through tracing; set RUST_LOG=expofuse=info (or debug) to see
// stage and per-level output.

use expofuse::config::{FusionConfig, LevelCount};
use expofuse::convert;
use expofuse::fusion::merge_exposures;
use expofuse::gpu::{DeviceProfile, GpuBackend, GpuContext};
use expofuse::image::HostImage;
use expofuse::kernels::CpuBackend;
use expofuse::pyramid::PyramidBackend;

use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing_subscriber::EnvFilter;

struct Args {
    use_cpu: bool,
    config: FusionConfig,
    output_prefix: PathBuf,
    inputs: Vec<PathBuf>,
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} [--cpu] [--group N] [--levels N] [--constrained] <output_prefix> <image>...");
    eprintln!("  e.g.: {program} --group 3 out/hdr dark.jpg mid.jpg bright.jpg");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("hdr_merge");
    let mut use_cpu = false;
    let mut config = FusionConfig::default();
    let mut positional = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cpu" => use_cpu = true,
            "--constrained" => config.profile = DeviceProfile::Constrained,
            "--group" => {
                config.group_size = iter.next().and_then(|s| s.parse().ok()).unwrap_or_else(|| usage(program));
            }
            "--levels" => {
                let n = iter.next().and_then(|s| s.parse().ok()).unwrap_or_else(|| usage(program));
                config.levels = LevelCount::Fixed(n);
            }
            flag if flag.starts_with("--") => usage(program),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    if positional.len() < 2 {
        usage(program);
    }
    let output_prefix = positional.remove(0);
    Args { use_cpu, config, output_prefix, inputs: positional }
}

fn load(path: &Path) -> Result<HostImage, Box<dyn Error>> {
    let rgb = image::open(path)?.to_rgb8();
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    Ok(convert::rgb8_to_float(w, h, rgb.as_raw())?)
}

fn save(path: &Path, img: &HostImage) -> Result<(), Box<dyn Error>> {
    let samples = convert::float_to_rgb16(&img.view());
    let buffer = image::ImageBuffer::<image::Rgb<u16>, Vec<u16>>::from_raw(
        img.width() as u32,
        img.height() as u32,
        samples,
    )
    .ok_or("fused image does not fit its sample buffer")?;
    buffer.save(path)?;
    Ok(())
}

fn fuse<B: PyramidBackend>(
    backend: &B,
    config: &FusionConfig,
    images: &mut [HostImage],
) -> Result<Vec<HostImage>, Box<dyn Error>> {
    Ok(merge_exposures(backend, config, images)?)
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let load_start = Instant::now();
    let mut images = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        images.push(load(path)?);
    }
    println!("Loaded {} images in {:.1?}", images.len(), load_start.elapsed());

    let fuse_start = Instant::now();
    let merged = if args.use_cpu {
        println!("Backend: CPU reference");
        fuse(&CpuBackend::new(args.config.quality), &args.config, &mut images)?
    } else {
        let gpu = GpuContext::new_with_profile(args.config.profile)?;
        println!("Backend: {gpu}");
        let backend = GpuBackend::new(&gpu, &args.config.quality)?;
        fuse(&backend, &args.config, &mut images)?
    };
    println!("Fused {} stack(s) in {:.1?}", merged.len(), fuse_start.elapsed());

    let stem = args.output_prefix.to_string_lossy().into_owned();
    for (k, img) in merged.iter().enumerate() {
        let path = PathBuf::from(format!("{stem}_{k}.png"));
        save(&path, img)?;
        println!("  {} ({}×{})", path.display(), img.width(), img.height());
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(e) = run(parse_args()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
