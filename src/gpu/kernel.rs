// gpu/kernel.rs — compiled kernel program and kernel descriptors.
//
// The program is three WGSL modules (unary, binary, stack) that share a
// common prelude. Each module is compiled once per `KernelProgram`, and one
// compute pipeline is created per entry point up front, so enqueueing a
// kernel never compiles anything.
//
// Argument convention, fixed for every entry point:
//
//   binding 0 .. n-1   inputs   (texture_2d<f32> or texture_2d_array<f32>)
//   binding n          output   (texture_storage_2d<rgba32float, write>)
//
// A `Kernel` is a cheap value: program reference, entry-point name, range
// policy. `Kernel::enqueue` binds an ordered argument list, dispatches and
// submits, returning the submission index as the completion event.
//
// Bind group layouts are explicit, one per arity: Rgba32Float is not
// filterable, so every input is declared `Float { filterable: false }`.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::QualityParams;
use crate::gpu::device::{DeviceError, GpuContext};

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");
const UNARY_WGSL: &str = include_str!("../shaders/unary.wgsl");
const BINARY_WGSL: &str = include_str!("../shaders/binary.wgsl");
const STACK_WGSL: &str = include_str!("../shaders/stack.wgsl");

/// Which operand's dimensions size the work-item grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePolicy {
    /// One work item per source pixel (upsampling, pixelwise kernels).
    Source,
    /// One work item per destination pixel (downsampling, reductions).
    Destination,
}

impl RangePolicy {
    /// Pick the grid from `source` or `destination`.
    pub fn grid(self, source: [u32; 2], destination: [u32; 2]) -> [u32; 2] {
        match self {
            RangePolicy::Source => source,
            RangePolicy::Destination => destination,
        }
    }
}

/// Input signature of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    /// One 2D image.
    Unary,
    /// Two 2D images of the same size.
    Binary,
    /// One 2D array of images.
    Stack,
}

impl Arity {
    pub fn inputs(self) -> usize {
        match self {
            Arity::Unary | Arity::Stack => 1,
            Arity::Binary => 2,
        }
    }

    fn source(self) -> &'static str {
        match self {
            Arity::Unary => UNARY_WGSL,
            Arity::Binary => BINARY_WGSL,
            Arity::Stack => STACK_WGSL,
        }
    }

    fn entry_points(self) -> &'static [&'static str] {
        match self {
            Arity::Unary => &["downsample_row", "downsample_col", "upsample_row", "upsample_col", "compute_quality"],
            Arity::Binary => &["create_laplacian", "collapse_level"],
            Arity::Stack => &["fuse_level"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            Arity::Unary => "unary.wgsl",
            Arity::Binary => "binary.wgsl",
            Arity::Stack => "stack.wgsl",
        }
    }
}

struct EntryPoint {
    arity: Arity,
    pipeline: wgpu::ComputePipeline,
}

/// All fusion kernels, compiled for one context.
pub struct KernelProgram {
    entries: HashMap<&'static str, EntryPoint>,
    layouts: HashMap<Arity, wgpu::BindGroupLayout>,
}

impl KernelProgram {
    /// Compile every module and create one pipeline per entry point.
    ///
    /// Blocks until compilation finishes. A WGSL error is returned as
    /// `DeviceError::ProgramBuild` carrying the compiler log.
    pub fn new(gpu: &GpuContext, quality: &QualityParams) -> Result<Self, DeviceError> {
        let mut entries = HashMap::new();
        let mut layouts = HashMap::new();

        for arity in [Arity::Unary, Arity::Binary, Arity::Stack] {
            let source = program_source(arity, gpu, quality);
            let module = gpu
                .scoped(arity.label(), || {
                    gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                        label: Some(arity.label()),
                        source: wgpu::ShaderSource::Wgsl(source.into()),
                    })
                })
                .map_err(|e| match e {
                    DeviceError::Operation { label, message, .. } => DeviceError::ProgramBuild { label, log: message },
                    other => other,
                })?;

            let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(arity.label()),
                entries: &layout_entries(arity),
            });
            let pipeline_layout = gpu.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(arity.label()),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

            for &name in arity.entry_points() {
                let pipeline = gpu.scoped(name, || {
                    gpu.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(name),
                        layout: Some(&pipeline_layout),
                        module: &module,
                        entry_point: name,
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                        cache: None,
                    })
                })?;
                entries.insert(name, EntryPoint { arity, pipeline });
            }
            layouts.insert(arity, bgl);
            debug!(module = arity.label(), "compiled kernel module");
        }

        Ok(KernelProgram { entries, layouts })
    }

    /// Descriptor for entry point `name`.
    pub fn kernel(&self, name: &str, range: RangePolicy) -> Result<Kernel<'_>, DeviceError> {
        let (&entry_point, entry) = self
            .entries
            .get_key_value(name)
            .ok_or_else(|| DeviceError::UnknownKernel(name.to_string()))?;
        Ok(Kernel { program: self, entry_point, range, arity: entry.arity })
    }
}

/// Program source for one module: prelude + module, tokens replaced.
fn program_source(arity: Arity, gpu: &GpuContext, quality: &QualityParams) -> String {
    let mut src = String::with_capacity(COMMON_WGSL.len() + arity.source().len() + 1);
    src.push_str(COMMON_WGSL);
    src.push('\n');
    src.push_str(arity.source());
    bake_tokens(&src, gpu.workgroup_size.x, gpu.workgroup_size.y, quality)
}

/// Replace the `{{...}}` placeholders in WGSL text.
///
/// naga does not accept `override` expressions inside `@workgroup_size`, so
/// sizes (and the quality constants along with them) go into the text.
fn bake_tokens(src: &str, wg_x: u32, wg_y: u32, quality: &QualityParams) -> String {
    src.replace("{{WG_X}}", &wg_x.to_string())
        .replace("{{WG_Y}}", &wg_y.to_string())
        .replace("{{W_CONTRAST}}", &wgsl_float(quality.contrast))
        .replace("{{W_SATURATION}}", &wgsl_float(quality.saturation))
        .replace("{{W_EXPOSEDNESS}}", &wgsl_float(quality.exposedness))
        .replace("{{SIGMA}}", &wgsl_float(quality.sigma))
}

/// `f32` as a WGSL float literal. `Debug` always prints a decimal point or
/// an exponent, so `1` comes out as `1.0`, never as an integer literal.
fn wgsl_float(v: f32) -> String {
    format!("{v:?}")
}

fn layout_entries(arity: Arity) -> Vec<wgpu::BindGroupLayoutEntry> {
    let input = |binding: u32, view_dimension| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    };
    let output = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    };
    match arity {
        Arity::Unary => vec![input(0, wgpu::TextureViewDimension::D2), output(1)],
        Arity::Binary => vec![
            input(0, wgpu::TextureViewDimension::D2),
            input(1, wgpu::TextureViewDimension::D2),
            output(2),
        ],
        Arity::Stack => vec![input(0, wgpu::TextureViewDimension::D2Array), output(1)],
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// One entry point of a [`KernelProgram`] plus its range policy.
#[derive(Clone, Copy)]
pub struct Kernel<'p> {
    program: &'p KernelProgram,
    entry_point: &'static str,
    range: RangePolicy,
    arity: Arity,
}

impl<'p> Kernel<'p> {
    #[inline]
    pub fn entry_point(&self) -> &'static str {
        self.entry_point
    }

    #[inline]
    pub fn range(&self) -> RangePolicy {
        self.range
    }

    /// Bind `inputs` (in order) and `output`, dispatch over `grid`, submit.
    ///
    /// Returns immediately with the submission index; the work completes in
    /// queue order after everything submitted before it. `wait_list` is the
    /// set of events this launch depends on. The queue is in-order, so they
    /// are satisfied by construction; the list is kept for tracing.
    pub fn enqueue(
        &self,
        gpu: &GpuContext,
        inputs: &[&wgpu::TextureView],
        output: &wgpu::TextureView,
        grid: [u32; 2],
        wait_list: &[wgpu::SubmissionIndex],
    ) -> Result<wgpu::SubmissionIndex, DeviceError> {
        let expected = self.arity.inputs();
        if inputs.len() != expected {
            return Err(DeviceError::ArgumentCount { kernel: self.entry_point, expected, actual: inputs.len() });
        }
        let entry = self
            .program
            .entries
            .get(self.entry_point)
            .ok_or_else(|| DeviceError::UnknownKernel(self.entry_point.to_string()))?;
        let layout = self
            .program
            .layouts
            .get(&self.arity)
            .ok_or_else(|| DeviceError::UnknownKernel(self.entry_point.to_string()))?;

        let (dx, dy) = gpu.dispatch_size(grid[0], grid[1]);
        trace!(
            kernel = self.entry_point,
            grid_w = grid[0],
            grid_h = grid[1],
            workgroups_x = dx,
            workgroups_y = dy,
            waits = wait_list.len(),
            "enqueue"
        );

        gpu.scoped(self.entry_point, || {
            let mut entries: Vec<wgpu::BindGroupEntry<'_>> = inputs
                .iter()
                .enumerate()
                .map(|(i, view)| wgpu::BindGroupEntry {
                    binding: i as u32,
                    resource: wgpu::BindingResource::TextureView(*view),
                })
                .collect();
            entries.push(wgpu::BindGroupEntry {
                binding: inputs.len() as u32,
                resource: wgpu::BindingResource::TextureView(output),
            });
            let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.entry_point),
                layout,
                entries: &entries,
            });

            let mut encoder = gpu
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(self.entry_point) });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(self.entry_point),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&entry.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            gpu.queue.submit(std::iter::once(encoder.finish()))
        })
    }
}

impl std::fmt::Debug for Kernel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("entry_point", &self.entry_point)
            .field("range", &self.range)
            .field("arity", &self.arity)
            .finish()
    }
}
