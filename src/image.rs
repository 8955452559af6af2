// image.rs — RGBA float pixels, borrowed views and owned host images.
//
// Every image in the fusion pipeline is 2D RGBA with 32-bit float
// components, laid out row-major with no row padding (stride == width).
// That is exactly the layout of an `Rgba32Float` texture row, so a host
// buffer can be handed to the device without repacking.
//
// OWNERSHIP MODEL
// ───────────────
//   ImageArena (arena.rs)   owns one aligned allocation
//   HostImage / HostImageArray   own an arena plus its dimensions
//   ImageView<'a> / ImageViewMut<'a> / StackView<'a>   borrow a region
//
// The lifetime on a view ties it to the borrow of its owner, so a view can
// never outlive (or observe a move of) the arena it points into. The
// compiler enforces what a raw pointer + dims pair could only document.
//
// The alpha channel is not opacity: during fusion it carries the per-pixel
// quality weight of an exposure.

use std::fmt;
use std::ops::{Add, Mul, Sub};

use bytemuck::{Pod, Zeroable};

use crate::arena::{pixel_count, ImageArena};
use crate::error::{FusionError, Result};

// ---------------------------------------------------------------------------
// Rgba
// ---------------------------------------------------------------------------

/// One pixel: four packed `f32` components.
///
/// `#[repr(C)]` + `Pod` guarantee the in-memory layout is `[r, g, b, a]`
/// with no padding (16 bytes), matching `Rgba32Float` on the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    #[inline]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Rgba { r, g, b, a }
    }

    /// Opaque grey with all colour channels set to `v`.
    #[inline]
    pub const fn splat_rgb(v: f32, a: f32) -> Self {
        Rgba { r: v, g: v, b: v, a }
    }

    /// Replace the alpha (weight) channel.
    #[inline]
    pub const fn with_alpha(self, a: f32) -> Self {
        Rgba { a, ..self }
    }

    #[inline]
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Rec. 709 luminance of the colour channels.
    #[inline]
    pub fn luminance(self) -> f32 {
        0.2126 * self.r + 0.7152 * self.g + 0.0722 * self.b
    }
}

impl Add for Rgba {
    type Output = Rgba;

    #[inline]
    fn add(self, o: Rgba) -> Rgba {
        Rgba::new(self.r + o.r, self.g + o.g, self.b + o.b, self.a + o.a)
    }
}

impl Sub for Rgba {
    type Output = Rgba;

    #[inline]
    fn sub(self, o: Rgba) -> Rgba {
        Rgba::new(self.r - o.r, self.g - o.g, self.b - o.b, self.a - o.a)
    }
}

impl Mul<f32> for Rgba {
    type Output = Rgba;

    #[inline]
    fn mul(self, s: f32) -> Rgba {
        Rgba::new(self.r * s, self.g * s, self.b * s, self.a * s)
    }
}

// ---------------------------------------------------------------------------
// ImageView<'a> — read-only 2D view
// ---------------------------------------------------------------------------

/// A borrowed, read-only 2D image.
///
/// A view with a zero axis is representable (it is what an empty image
/// hands out) but not *valid*; see [`ImageView::valid`].
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [Rgba],
    width: usize,
    height: usize,
}

impl<'a> ImageView<'a> {
    /// Unchecked constructor for callers that derived `data` from the
    /// same dimensions.
    #[inline]
    pub(crate) fn from_parts(width: usize, height: usize, data: &'a [Rgba]) -> Self {
        debug_assert_eq!(data.len(), width * height);
        ImageView { data, width, height }
    }

    /// Wrap `data` as a `width × height` image.
    ///
    /// # Errors
    /// `BufferSize` if `data.len() != width * height`.
    pub fn new(width: usize, height: usize, data: &'a [Rgba]) -> Result<Self> {
        check_len(width.saturating_mul(height), data.len())?;
        Ok(ImageView { data, width, height })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn dimensions(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    /// Total number of pixels.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when both axes are non-zero.
    #[inline]
    pub fn valid(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [Rgba] {
        self.data
    }

    /// Pixel at column `x`, row `y`.
    ///
    /// # Panics
    /// Panics if `(x, y)` is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Rgba {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for view {}×{}",
            self.width,
            self.height,
        );
        self.data[y * self.width + x]
    }

    /// Pixel at `(x, y)` with coordinates clamped into the image.
    /// This is the border rule every reference kernel uses.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> Rgba {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    #[inline]
    pub fn row(&self, y: usize) -> &'a [Rgba] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Deep-copy into a freshly allocated [`HostImage`].
    pub fn to_host_image(&self) -> Result<HostImage> {
        HostImage::from_pixels(self.width, self.height, self.data)
    }
}

impl fmt::Debug for ImageView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageView {{ {}×{} }}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// ImageViewMut<'a> — writable 2D view
// ---------------------------------------------------------------------------

/// A borrowed, writable 2D image. Device read-backs land in one of these.
pub struct ImageViewMut<'a> {
    data: &'a mut [Rgba],
    width: usize,
    height: usize,
}

impl<'a> ImageViewMut<'a> {
    #[inline]
    pub(crate) fn from_parts(width: usize, height: usize, data: &'a mut [Rgba]) -> Self {
        debug_assert_eq!(data.len(), width * height);
        ImageViewMut { data, width, height }
    }

    /// Wrap `data` as a writable `width × height` image.
    ///
    /// # Errors
    /// `BufferSize` if `data.len() != width * height`.
    pub fn new(width: usize, height: usize, data: &'a mut [Rgba]) -> Result<Self> {
        check_len(width.saturating_mul(height), data.len())?;
        Ok(ImageViewMut { data, width, height })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn dimensions(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[Rgba] {
        self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Rgba] {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Rgba {
        self.as_view().get(x, y)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: Rgba) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for view {}×{}",
            self.width,
            self.height,
        );
        self.data[y * self.width + x] = value;
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [Rgba] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let w = self.width;
        &mut self.data[y * w..(y + 1) * w]
    }

    /// Read-only view of the same region.
    #[inline]
    pub fn as_view(&self) -> ImageView<'_> {
        ImageView { data: self.data, width: self.width, height: self.height }
    }

    /// Shorter-lived mutable view of the same region, so the original can
    /// be used again afterwards.
    #[inline]
    pub fn reborrow(&mut self) -> ImageViewMut<'_> {
        ImageViewMut { data: self.data, width: self.width, height: self.height }
    }

    /// Copy `src` into this view.
    ///
    /// # Errors
    /// `DimensionMismatch` if the two images differ in size.
    pub fn copy_from(&mut self, src: &ImageView<'_>) -> Result<()> {
        check_dims(self.dimensions(), src.dimensions())?;
        self.data.copy_from_slice(src.as_slice());
        Ok(())
    }
}

impl fmt::Debug for ImageViewMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageViewMut {{ {}×{} }}", self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// StackView<'a> — depth-indexed stack of same-size images
// ---------------------------------------------------------------------------

/// A contiguous stack of `depth` images of identical size: the host side of
/// a 2D array texture upload. Layer `i` starts at pixel `i * width * height`.
#[derive(Clone, Copy)]
pub struct StackView<'a> {
    data: &'a [Rgba],
    width: usize,
    height: usize,
    depth: usize,
}

impl<'a> StackView<'a> {
    #[inline]
    pub(crate) fn from_parts(width: usize, height: usize, depth: usize, data: &'a [Rgba]) -> Self {
        debug_assert_eq!(data.len(), width * height * depth);
        StackView { data, width, height, depth }
    }

    pub fn new(width: usize, height: usize, depth: usize, data: &'a [Rgba]) -> Result<Self> {
        check_len(width.saturating_mul(height).saturating_mul(depth), data.len())?;
        Ok(StackView { data, width, height, depth })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn dimensions(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.width != 0 && self.height != 0 && self.depth != 0
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [Rgba] {
        self.data
    }

    /// One layer of the stack as a 2D view.
    pub fn layer(&self, index: usize) -> ImageView<'a> {
        assert!(index < self.depth, "layer {index} out of bounds (depth {})", self.depth);
        let area = self.width * self.height;
        ImageView {
            data: &self.data[index * area..(index + 1) * area],
            width: self.width,
            height: self.height,
        }
    }
}

impl fmt::Debug for StackView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackView {{ {}×{}×{} }}", self.width, self.height, self.depth)
    }
}

// ---------------------------------------------------------------------------
// HostImage — owned Image2D
// ---------------------------------------------------------------------------

/// An owned 2D RGBA float image backed by its own aligned arena.
///
/// Not `Clone`: a copy of a full-resolution float image is expensive, so it
/// has to be spelled out with [`HostImage::try_clone`].
pub struct HostImage {
    arena: ImageArena,
    width: usize,
    height: usize,
}

impl HostImage {
    /// Zero-initialised image.
    ///
    /// # Errors
    /// `Allocation` if the arena cannot be allocated.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Ok(HostImage { arena: ImageArena::new(pixel_count(&[width, height])?)?, width, height })
    }

    /// Image with no pixels and zero dimensions.
    pub fn empty() -> Self {
        HostImage { arena: ImageArena::empty(), width: 0, height: 0 }
    }

    /// Copy `pixels` (row-major, `width * height` long) into a new image.
    pub fn from_pixels(width: usize, height: usize, pixels: &[Rgba]) -> Result<Self> {
        check_len(width.saturating_mul(height), pixels.len())?;
        let mut img = HostImage::new(width, height)?;
        img.as_mut_slice().copy_from_slice(pixels);
        Ok(img)
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> Rgba) -> Result<Self> {
        let mut img = HostImage::new(width, height)?;
        for (i, px) in img.as_mut_slice().iter_mut().enumerate() {
            *px = f(i % width, i / width);
        }
        Ok(img)
    }

    pub fn try_clone(&self) -> Result<Self> {
        HostImage::from_pixels(self.width, self.height, self.as_slice())
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn dimensions(&self) -> [usize; 2] {
        [self.width, self.height]
    }

    /// False for an empty or moved-from image.
    #[inline]
    pub fn valid(&self) -> bool {
        self.width != 0 && self.height != 0 && self.arena.valid()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Rgba] {
        self.arena.as_slice()
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Rgba] {
        self.arena.as_mut_slice()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Rgba {
        self.view().get(x, y)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: Rgba) {
        self.view_mut().set(x, y, value);
    }

    #[inline]
    pub fn view(&self) -> ImageView<'_> {
        ImageView { data: self.arena.as_slice(), width: self.width, height: self.height }
    }

    #[inline]
    pub fn view_mut(&mut self) -> ImageViewMut<'_> {
        let (width, height) = (self.width, self.height);
        ImageViewMut { data: self.arena.as_mut_slice(), width, height }
    }

    /// Move the pixels out, leaving `self` empty (`valid() == false`,
    /// zero dimensions).
    pub fn take(&mut self) -> HostImage {
        std::mem::replace(self, HostImage::empty())
    }
}

impl fmt::Debug for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostImage {{ {}×{}, valid={} }}", self.width, self.height, self.valid())
    }
}

// ---------------------------------------------------------------------------
// HostImageArray — owned Image2DArray
// ---------------------------------------------------------------------------

/// An owned stack of same-size 2D images in one contiguous arena.
pub struct HostImageArray {
    arena: ImageArena,
    width: usize,
    height: usize,
    depth: usize,
}

impl HostImageArray {
    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self> {
        Ok(HostImageArray {
            arena: ImageArena::new(pixel_count(&[width, height, depth])?)?,
            width,
            height,
            depth,
        })
    }

    /// Pack `layers` one after another into a single contiguous stack.
    ///
    /// # Errors
    /// `InvalidDimensions` for an empty list, `DimensionMismatch` if any
    /// layer differs in size from the first.
    pub fn from_layers(layers: &[ImageView<'_>]) -> Result<Self> {
        let first = layers
            .first()
            .ok_or(FusionError::InvalidDimensions { width: 0, height: 0 })?;
        let [w, h] = first.dimensions();
        for layer in layers {
            check_dims([w, h], layer.dimensions())?;
        }
        let mut array = HostImageArray::new(w, h, layers.len())?;
        let area = w * h;
        for (chunk, layer) in array.arena.as_mut_slice().chunks_exact_mut(area.max(1)).zip(layers) {
            chunk.copy_from_slice(layer.as_slice());
        }
        Ok(array)
    }

    #[inline]
    pub fn dimensions(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn stack_view(&self) -> StackView<'_> {
        StackView {
            data: self.arena.as_slice(),
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    #[inline]
    pub fn layer(&self, index: usize) -> ImageView<'_> {
        self.stack_view().layer(index)
    }
}

impl fmt::Debug for HostImageArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostImageArray {{ {}×{}×{} }}", self.width, self.height, self.depth)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[inline]
fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(FusionError::BufferSize { expected, actual });
    }
    Ok(())
}

/// `DimensionMismatch` unless `actual == expected`.
#[inline]
pub(crate) fn check_dims(expected: [usize; 2], actual: [usize; 2]) -> Result<()> {
    if expected != actual {
        return Err(FusionError::DimensionMismatch {
            expected: (expected[0], expected[1]),
            actual: (actual[0], actual[1]),
        });
    }
    Ok(())
}
