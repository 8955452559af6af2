// gpu/device.rs — wgpu context shared by every pending image in a batch.
//
// Responsibilities:
//   - Enumerate adapters and pick one: a real GPU if there is one, anything
//     else (including a software rasteriser) otherwise.
//   - Expose a `DeviceProfile` that requests *lower* limits than the hardware
//     has, so limit violations show up on a development machine.
//   - Provide `WorkgroupSize` and `dispatch_size` for 2D compute grids.
//   - Turn wgpu validation / out-of-memory errors into `DeviceError` values
//     via error scopes instead of wgpu's default panic handler.
//
// The context is created once and then only read; everything downstream
// borrows it (`&GpuContext`). There is no global instance.
//
// ERROR SCOPES:
// wgpu reports most failures asynchronously. `push_error_scope` starts
// capturing errors of one kind, `pop_error_scope` returns the first captured
// one (a future, resolved here with pollster). `scoped()` wraps any closure in
// one Validation + one OutOfMemory scope and converts what comes back.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device/error-scope API is async because on WebGPU
//   it maps to JS Promises; natively we just block.
// - `#[derive(thiserror::Error)]` — generates `Display` and `Error::source`
//   from the `#[error(...)]` attributes instead of a hand-written match.

use std::fmt;

use thiserror::Error;
use tracing::info;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// The adapter's default limits.
    #[default]
    Native,
    /// Small-GPU limits: 256 invocations per workgroup, 4096² textures.
    /// wgpu rejects anything above them, so oversize dispatches fail here
    /// rather than on the target.
    Constrained,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Constrained => write!(f, "Constrained (reduced limits)"),
        }
    }
}

/// Workgroup size for 2D compute dispatches.
///
/// Baked into the WGSL text (`{{WG_X}}`, `{{WG_Y}}`) when the kernel program
/// is compiled, so changing it means recompiling the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Default for a profile: 16×8 = 128 invocations natively (4 warps /
    /// 2 wavefronts), 8×8 = 64 under the constrained profile.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::Constrained => WorkgroupSize { x: 8, y: 8 },
        }
    }

    /// Number of workgroups covering a `width × height` grid (ceiling
    /// division). Kernels guard against the overhang themselves.
    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(self.x), height.div_ceil(self.y))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// Adapter, device, queue and active profile.
///
/// # Field drop order
/// Fields drop top to bottom; `_instance` is last so the `wgpu::Instance`
/// outlives `device` and `queue`. Some Vulkan layers crash when the instance
/// goes first.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuContext {
    /// Context on the best adapter found, with `DeviceProfile::Native`.
    pub fn new() -> Result<Self, DeviceError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, DeviceError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, DeviceError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        // Tiered selection:
        //   1. DiscreteGpu / IntegratedGpu / VirtualGpu / Other
        //   2. anything left, software rasterisers included (CPU fallback)
        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        for a in &adapters {
            let info = a.get_info();
            info!(name = %info.name, backend = ?info.backend, device_type = ?info.device_type, "adapter found");
        }
        let mut fallback = None;
        let mut chosen = None;
        for a in adapters {
            if a.get_info().device_type == wgpu::DeviceType::Cpu {
                fallback.get_or_insert(a);
            } else {
                chosen = Some(a);
                break;
            }
        }
        let adapter = chosen.or(fallback).ok_or(DeviceError::NoSuitableAdapter)?;

        let raw = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw.name.clone(),
            device_type: raw.device_type,
            backend: raw.backend,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("expofuse"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        info!(adapter = %adapter_info, %profile, workgroup = %workgroup_size, "GPU context ready");

        Ok(GpuContext {
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validated against the profile.
    /// Affects kernel programs compiled afterwards.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), DeviceError> {
        let total = x * y;
        let max = limits_for_profile(self.profile).max_compute_invocations_per_workgroup;
        if total > max {
            return Err(DeviceError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y };
        Ok(())
    }

    pub fn dispatch_size(&self, width: u32, height: u32) -> (u32, u32) {
        self.workgroup_size.dispatch_size(width, height)
    }

    /// Run `f` inside a Validation and an OutOfMemory error scope.
    ///
    /// Anything wgpu reports while `f` runs comes back as
    /// `DeviceError::Operation` tagged with `label`.
    pub fn scoped<T>(&self, label: &str, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = oom {
            return Err(DeviceError::Operation {
                label: label.to_string(),
                kind: ErrorKind::OutOfMemory,
                message: err.to_string(),
            });
        }
        if let Some(err) = validation {
            return Err(DeviceError::Operation {
                label: label.to_string(),
                kind: ErrorKind::Validation,
                message: err.to_string(),
            });
        }
        Ok(value)
    }
}

impl fmt::Display for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuContext {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

// ============================================================
// Limits
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::Constrained => wgpu::Limits {
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_texture_dimension_2d: 4096,
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

// ============================================================
// Errors
// ============================================================

/// Which error scope caught a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    OutOfMemory,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Device-side failures. None of them is retried.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no GPU or software adapter available")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },

    /// The kernel program failed to compile. `log` is the compiler output.
    #[error("kernel program {label} failed to build:\n{log}")]
    ProgramBuild { label: String, log: String },

    #[error("kernel program has no entry point `{0}`")]
    UnknownKernel(String),

    #[error("kernel `{kernel}` takes {expected} input(s), got {actual}")]
    ArgumentCount { kernel: &'static str, expected: usize, actual: usize },

    /// The operation ran on a pending image that was moved from.
    #[error("operation on an empty pending image")]
    EmptyImage,

    #[error("{kind} error during {label}: {message}")]
    Operation { label: String, kind: ErrorKind, message: String },

    #[error("readback buffer map failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    #[error("readback callback was dropped before it fired")]
    ReadbackLost,
}
