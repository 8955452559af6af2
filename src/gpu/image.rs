// gpu/image.rs — device-resident images and the pending-image chain.
//
// RESPONSIBILITIES
// ─────────────────
// 1. `DeviceImage` — an Rgba32Float texture (2D, or 2D array for a stack of
//    same-size images) plus the view kernels bind.
//
// 2. `PendingImage` — a DeviceImage *as of some point in queue order*: the
//    texture plus the submission indices (events) whose completion makes its
//    contents valid. `process` enqueues a kernel and returns a new
//    PendingImage without blocking; `read_into` is the blocking end of the
//    chain.
//
//
// EVENTS AND ORDERING
// ───────────────────
// Every `queue.submit` returns a `wgpu::SubmissionIndex`; that is the
// completion event. A launch's wait list is the union of its inputs' event
// lists. wgpu has one in-order queue per device, so a submission cannot
// start before the ones it depends on; the wait list is carried along for
// `read_into` (which polls each event to completion) and for tracing.
//
//
// ROW ALIGNMENT
// ─────────────
// Buffer↔texture copies need `bytes_per_row` to be a multiple of
// `wgpu::COPY_BYTES_PER_ROW_ALIGNMENT` (256). An Rgba32Float pixel is 16
// bytes, so any width that is not a multiple of 16 gets padded rows in the
// staging buffer, and read-backs strip the padding again.
//
//
// NEW RUST CONCEPTS
// ──────────────────
// - `PendingImage<'g>` borrows the `GpuContext` for `'g`: a pending image
//   cannot outlive the device it was enqueued on.
// - `Option<DeviceImage>` + `std::mem::replace` for move-out: `take()`
//   leaves a well-defined empty value behind, like a moved-from handle.

use wgpu::util::DeviceExt;

use tracing::trace;

use crate::error::{FusionError, Result};
use crate::gpu::device::{DeviceError, GpuContext};
use crate::gpu::kernel::Kernel;
use crate::image::{check_dims, ImageView, ImageViewMut, Rgba, StackView};

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Rgba32Float: four 32-bit floats.
const BYTES_PER_PIXEL: u32 = std::mem::size_of::<Rgba>() as u32;

// ---------------------------------------------------------------------------
// DeviceImage
// ---------------------------------------------------------------------------

/// An Rgba32Float texture on the device.
///
/// Layered images (`depth` layers, viewed as `texture_2d_array`) are only
/// ever kernel inputs; 2D images can be inputs, outputs or read back.
pub struct DeviceImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layered: bool,
}

impl DeviceImage {
    /// Allocate an uninitialised `width × height` 2D image.
    pub fn new(gpu: &GpuContext, width: u32, height: u32, label: &str) -> std::result::Result<Self, DeviceError> {
        Self::create(gpu, width, height, 1, false, label)
    }

    /// Allocate an uninitialised stack of `depth` images.
    pub fn new_array(
        gpu: &GpuContext,
        width: u32,
        height: u32,
        depth: u32,
        label: &str,
    ) -> std::result::Result<Self, DeviceError> {
        Self::create(gpu, width, height, depth, true, label)
    }

    fn create(
        gpu: &GpuContext,
        width: u32,
        height: u32,
        depth: u32,
        layered: bool,
        label: &str,
    ) -> std::result::Result<Self, DeviceError> {
        gpu.scoped(label, || {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: depth },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba32Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            // A one-layer texture defaults to a D2 view, so arrays spell
            // the dimension out.
            let dimension = if layered {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            };
            let view = texture.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(dimension),
                ..Default::default()
            });
            DeviceImage { texture, view, width, height, depth, layered }
        })
    }

    #[inline]
    pub fn dimensions(&self) -> [u32; 2] {
        [self.width, self.height]
    }

    /// Copy `pixels` (all layers, row-major, no padding) into the texture.
    /// Returns the submission index of the copy.
    fn write(&self, gpu: &GpuContext, pixels: &[Rgba]) -> std::result::Result<wgpu::SubmissionIndex, DeviceError> {
        let (staging, bytes_per_row) =
            pack_rows(pixels, self.width as usize, (self.height * self.depth) as usize);
        gpu.scoped("upload", || {
            let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("DeviceImage staging"),
                contents: &staging,
                usage: wgpu::BufferUsages::COPY_SRC,
            });
            let mut encoder =
                gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("upload") });
            encoder.copy_buffer_to_texture(
                wgpu::ImageCopyBuffer {
                    buffer: &staging_buf,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(self.height),
                    },
                },
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: self.depth },
            );
            gpu.queue.submit(std::iter::once(encoder.finish()))
        })
    }

    /// Blocking copy of a 2D image into `dst` (`width * height` pixels).
    fn read(&self, gpu: &GpuContext, dst: &mut [Rgba]) -> std::result::Result<(), DeviceError> {
        let bytes_per_row = align_to(self.width * BYTES_PER_PIXEL, COPY_ALIGNMENT);
        let readback_buf = gpu.scoped("readback", || {
            let buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("DeviceImage readback"),
                size: (bytes_per_row * self.height) as u64,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder =
                gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
            encoder.copy_texture_to_buffer(
                wgpu::ImageCopyTexture {
                    texture: &self.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyBuffer {
                    buffer: &buf,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(self.height),
                    },
                },
                wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 },
            );
            gpu.queue.submit(std::iter::once(encoder.finish()));
            buf
        })?;

        let buf_slice = readback_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buf_slice.map_async(wgpu::MapMode::Read, move |r| {
            // The receiver only disappears if this function already returned.
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| DeviceError::ReadbackLost)??;

        {
            let mapped = buf_slice.get_mapped_range();
            unpack_rows(&mapped, bytes_per_row as usize, dst, self.width as usize);
        }
        readback_buf.unmap();
        Ok(())
    }
}

impl std::fmt::Debug for DeviceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceImage {{ {}×{}×{} }}", self.width, self.height, self.depth)
    }
}

// ---------------------------------------------------------------------------
// PendingImage
// ---------------------------------------------------------------------------

/// Where a launch writes.
enum Target<'g> {
    New([u32; 2]),
    Reuse(PendingImage<'g>),
}

/// A device image plus the events that must complete before it is valid.
///
/// Move-only. `take()` transfers the image and its events and leaves an
/// empty handle behind (`valid() == false`, zero dimensions, no events).
pub struct PendingImage<'g> {
    gpu: &'g GpuContext,
    image: Option<DeviceImage>,
    events: Vec<wgpu::SubmissionIndex>,
}

impl<'g> PendingImage<'g> {
    /// Enqueue a host→device copy of `view`.
    pub fn upload(gpu: &'g GpuContext, view: ImageView<'_>) -> Result<Self> {
        let [w, h] = to_u32_dims(view.dimensions())?;
        let image = DeviceImage::new(gpu, w, h, "PendingImage::upload")?;
        let event = image.write(gpu, view.as_slice())?;
        Ok(PendingImage { gpu, image: Some(image), events: vec![event] })
    }

    /// Enqueue a host→device copy of a whole stack as one array texture.
    pub fn upload_stack(gpu: &'g GpuContext, stack: StackView<'_>) -> Result<Self> {
        let [w, h, d] = stack.dimensions();
        if !stack.valid() {
            return Err(FusionError::InvalidDimensions { width: w, height: h });
        }
        let [w, h] = to_u32_dims([w, h])?;
        let depth = u32::try_from(d).map_err(|_| FusionError::InvalidDimensions { width: d, height: 1 })?;
        let image = DeviceImage::new_array(gpu, w, h, depth, "PendingImage::upload_stack")?;
        let event = image.write(gpu, stack.as_slice())?;
        Ok(PendingImage { gpu, image: Some(image), events: vec![event] })
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.image.is_some()
    }

    /// `[width, height]`, or `[0, 0]` for an empty handle.
    pub fn dimensions(&self) -> [usize; 2] {
        self.image.as_ref().map_or([0, 0], |i| [i.width as usize, i.height as usize])
    }

    /// Layer count; 0 for an empty handle.
    pub fn depth(&self) -> usize {
        self.image.as_ref().map_or(0, |i| i.depth as usize)
    }

    /// Events that must complete before the image contents are valid.
    #[inline]
    pub fn events(&self) -> &[wgpu::SubmissionIndex] {
        &self.events
    }

    /// Run `kernel` on this image into a new image of `output` size (this
    /// image's size if `None`). Does not block.
    pub fn process(&self, kernel: &Kernel<'_>, output: Option<[usize; 2]>) -> Result<PendingImage<'g>> {
        let dims = to_u32_dims(output.unwrap_or(self.dimensions()))?;
        self.launch(kernel, &[], Target::New(dims))
    }

    /// Run `kernel` on this image, writing into `target`'s texture.
    ///
    /// `target` is consumed; its pending events join the wait list so the
    /// overwrite is ordered after whatever last wrote it.
    pub fn process_into(&self, kernel: &Kernel<'_>, target: PendingImage<'g>) -> Result<PendingImage<'g>> {
        self.launch(kernel, &[], Target::Reuse(target))
    }

    /// Run a multi-input `kernel` with this image as input 0 and `others`
    /// as inputs 1.. (all the same size as this image).
    pub fn process_with(
        &self,
        kernel: &Kernel<'_>,
        others: &[&PendingImage<'g>],
        output: Option<[usize; 2]>,
    ) -> Result<PendingImage<'g>> {
        for other in others {
            check_dims(self.dimensions(), other.dimensions())?;
        }
        let dims = to_u32_dims(output.unwrap_or(self.dimensions()))?;
        self.launch(kernel, others, Target::New(dims))
    }

    fn launch(&self, kernel: &Kernel<'_>, others: &[&PendingImage<'g>], target: Target<'g>) -> Result<PendingImage<'g>> {
        let source = self.image.as_ref().ok_or(DeviceError::EmptyImage)?;
        let mut inputs = Vec::with_capacity(1 + others.len());
        inputs.push(&source.view);
        for other in others {
            inputs.push(&other.image.as_ref().ok_or(DeviceError::EmptyImage)?.view);
        }

        let mut wait_list: Vec<wgpu::SubmissionIndex> = self.events.clone();
        for other in others {
            wait_list.extend(other.events.iter().cloned());
        }
        let output = match target {
            Target::New([w, h]) => DeviceImage::new(self.gpu, w, h, kernel.entry_point())?,
            Target::Reuse(mut reused) => {
                wait_list.append(&mut reused.events);
                reused.image.take().ok_or(DeviceError::EmptyImage)?
            }
        };

        let grid = kernel.range().grid(source.dimensions(), output.dimensions());
        let event = kernel.enqueue(self.gpu, &inputs, &output.view, grid, &wait_list)?;
        trace!(kernel = kernel.entry_point(), waited_on = wait_list.len(), "pending image created");
        Ok(PendingImage { gpu: self.gpu, image: Some(output), events: vec![event] })
    }

    /// Wait for every event, then copy the image into `dst`. Blocking.
    ///
    /// # Errors
    /// `DimensionMismatch` if `dst` differs in size, `Device(EmptyImage)`
    /// for an empty handle, any device error from the transfer.
    pub fn read_into(&self, mut dst: ImageViewMut<'_>) -> Result<()> {
        let image = self.image.as_ref().ok_or(DeviceError::EmptyImage)?;
        if image.layered {
            return Err(FusionError::DimensionMismatch {
                expected: (dst.width(), dst.height()),
                actual: (image.width as usize, image.height as usize * image.depth as usize),
            });
        }
        check_dims(dst.dimensions(), self.dimensions())?;
        for event in &self.events {
            self.gpu.device.poll(wgpu::Maintain::WaitForSubmissionIndex(event.clone()));
        }
        image.read(self.gpu, dst.as_mut_slice())?;
        Ok(())
    }

    /// Move the image and events out, leaving this handle empty.
    pub fn take(&mut self) -> PendingImage<'g> {
        PendingImage {
            gpu: self.gpu,
            image: self.image.take(),
            events: std::mem::take(&mut self.events),
        }
    }
}

impl std::fmt::Debug for PendingImage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingImage")
            .field("image", &self.image)
            .field("events", &self.events.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_u32_dims([w, h]: [usize; 2]) -> Result<[u32; 2]> {
    match (u32::try_from(w), u32::try_from(h)) {
        (Ok(w32), Ok(h32)) if w32 > 0 && h32 > 0 => Ok([w32, h32]),
        _ => Err(FusionError::InvalidDimensions { width: w, height: h }),
    }
}

/// Round `value` up to the next multiple of `alignment`.
///
///   align_to(100, 256) = 256
///   align_to(256, 256) = 256
///   align_to(257, 256) = 512
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Lay `rows` rows of `width` pixels out with 256-byte aligned row pitch.
/// Returns the staging bytes and the pitch.
fn pack_rows(pixels: &[Rgba], width: usize, rows: usize) -> (Vec<u8>, u32) {
    let row_bytes = width * BYTES_PER_PIXEL as usize;
    let pitch = align_to(row_bytes as u32, COPY_ALIGNMENT);
    let mut staging = vec![0u8; pitch as usize * rows];
    for (y, row) in pixels.chunks_exact(width).take(rows).enumerate() {
        let start = y * pitch as usize;
        staging[start..start + row_bytes].copy_from_slice(bytemuck::cast_slice(row));
    }
    (staging, pitch)
}

/// Inverse of `pack_rows`: strip row padding from `bytes` into `dst`.
///
/// Copies bytes into the (always suitably aligned) destination instead of
/// casting the mapped range, whose start alignment wgpu does not promise.
fn unpack_rows(bytes: &[u8], pitch: usize, dst: &mut [Rgba], width: usize) {
    let row_bytes = width * BYTES_PER_PIXEL as usize;
    for (y, row) in dst.chunks_exact_mut(width).enumerate() {
        let start = y * pitch;
        let out: &mut [u8] = bytemuck::cast_slice_mut(row);
        out.copy_from_slice(&bytes[start..start + row_bytes]);
    }
}
