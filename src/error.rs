// error.rs — crate-level error type.
//
// Three families, none of which is retried anywhere in the crate:
//   - device errors (enqueue / build / transfer), wrapped from gpu::device;
//   - geometry errors (dimension or level-count mismatch), raised before any
//     device work is enqueued;
//   - resource exhaustion (host arena allocation).

use thiserror::Error;

use crate::gpu::device::DeviceError;

/// Errors raised by the pyramid engine, the arenas and the fusion group.
#[derive(Debug, Error)]
pub enum FusionError {
    /// An image does not have the dimensions the operation requires.
    #[error(
        "dimension mismatch: expected {}×{}, got {}×{}",
        expected.0, expected.1, actual.0, actual.1
    )]
    DimensionMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Pyramids handed to a fuse do not share the same level count.
    #[error("pyramid {index} has {actual} levels, expected {expected}")]
    LevelMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// A view or image with a zero-sized axis.
    #[error("invalid image dimensions {width}×{height}")]
    InvalidDimensions { width: usize, height: usize },

    /// Pixel slice length does not match the stated dimensions.
    #[error("pixel buffer holds {actual} pixels, dimensions need {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("fusion group size must be at least 1")]
    EmptyGroup,

    #[error("fusion group is full ({capacity} images)")]
    GroupFull { capacity: usize },

    #[error("fusion group needs {expected} images, holds {actual}")]
    IncompleteGroup { expected: usize, actual: usize },

    #[error("cannot fuse an empty set of pyramids")]
    NoPyramids,

    /// Host arena allocation failed.
    #[error("failed to allocate {bytes} bytes for an image arena")]
    Allocation { bytes: usize },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, FusionError>;
