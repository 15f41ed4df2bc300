//! Error types surfaced by buffer construction, layout derivation, and export.

use thiserror::Error;

use crate::engine::EngineError;
use crate::tensor::DType;

/// Errors raised synchronously by the tensor buffer and layout machinery.
#[derive(Debug, Error)]
pub enum MdarrayError {
    /// The itemsize/format pair does not map to a supported element type.
    #[error("unsupported data type: itemsize {itemsize} with format {format:?}")]
    UnsupportedDataType { itemsize: usize, format: String },
    /// The export request cannot be satisfied (Fortran order, missing destination).
    #[error("invalid view request: {0}")]
    InvalidViewRequest(String),
    /// The aligned allocator could not satisfy the request.
    #[error("failed to allocate {bytes} bytes aligned to {alignment}")]
    AllocationFailure { bytes: usize, alignment: usize },
    #[error("rank {ndim} exceeds the supported maximum of {max}", max = crate::tensor::MAX_NDIM)]
    TooManyDimensions { ndim: usize },
    #[error("shape element count overflows usize")]
    ShapeOverflow,
    /// External view length is inconsistent with its itemsize or shape.
    #[error("buffer length {len} is not consistent with itemsize {itemsize} and the declared shape")]
    LengthMismatch { len: usize, itemsize: usize },
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },
    /// Mutable access was requested while exported views still alias the storage.
    #[error("buffer has {views} outstanding exported view(s); release them before writing")]
    ExportsOutstanding { views: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl MdarrayError {
    pub(crate) fn unsupported(itemsize: usize, format: impl Into<String>) -> Self {
        MdarrayError::UnsupportedDataType {
            itemsize,
            format: format.into(),
        }
    }

    pub(crate) fn invalid_view(reason: impl Into<String>) -> Self {
        MdarrayError::InvalidViewRequest(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, MdarrayError>;
