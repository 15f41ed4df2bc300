//! Boundary between tensor buffers and the native compute engine.
//!
//! The engine owns numeric kernels and primitive construction. This module only defines what the
//! core consumes from it: a memory descriptor (rank, dims, dtype, format), a memory object that
//! binds a descriptor to a raw pointer, and an opaque primitive type that the
//! [`PrimitiveCache`](crate::cache::PrimitiveCache) memoizes.

use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::tensor::DType;

/// Engine-native memory format tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum EngineFormat {
    /// Let the engine pick; accepted for any rank.
    Any,
    /// Plain vector.
    X,
    /// Batch x channels.
    NC,
    /// Output x input features.
    OI,
    NCHW,
    NHWC,
    OIHW,
}

impl EngineFormat {
    /// Rank implied by the format tag, or `None` for [`EngineFormat::Any`].
    pub fn rank(self) -> Option<usize> {
        match self {
            EngineFormat::Any => None,
            EngineFormat::X => Some(1),
            EngineFormat::NC | EngineFormat::OI => Some(2),
            EngineFormat::NCHW | EngineFormat::NHWC | EngineFormat::OIHW => Some(4),
        }
    }

    /// Picks the canonical plain format for a rank, falling back to [`EngineFormat::Any`].
    pub fn plain_for_rank(rank: usize) -> Self {
        match rank {
            1 => EngineFormat::X,
            2 => EngineFormat::NC,
            4 => EngineFormat::NCHW,
            _ => EngineFormat::Any,
        }
    }
}

/// Descriptor of an engine memory region: dims, element type, and format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: SmallVec<[usize; 4]>,
    dtype: DType,
    format: EngineFormat,
}

impl MemoryDesc {
    pub fn new(dims: &[usize], dtype: DType, format: EngineFormat) -> Self {
        MemoryDesc {
            dims: SmallVec::from_slice(dims),
            dtype,
            format,
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn format(&self) -> EngineFormat {
        self.format
    }

    /// Product of dims, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Byte length of a dense region described by `self`, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[", self.dtype)?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]/{:?}", self.format)
    }
}

/// Engine memory object: a descriptor bound to a raw data pointer.
pub trait EngineMemory: Send + Sync {
    fn desc(&self) -> &MemoryDesc;
    fn data_ptr(&self) -> *mut u8;
}

/// Compute engine that binds memory descriptors to storage and builds primitives.
///
/// Primitive construction entry points are engine specific; the core only needs to store
/// whatever [`ComputeEngine::Primitive`] the engine hands back.
pub trait ComputeEngine: Send + Sync {
    type Memory: EngineMemory;
    type Primitive: Send + Sync + 'static;

    /// Returns a human-readable engine identifier (e.g., `"ref-cpu"`).
    fn engine_name(&self) -> &str;

    /// Builds a memory object over `data`.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads and writes of `desc.byte_len()` bytes for as long as the
    /// returned memory object is alive.
    unsafe fn create_memory(
        &self,
        desc: &MemoryDesc,
        data: NonNull<u8>,
    ) -> EngineResult<Self::Memory>;
}

/// Error surfaced by a compute engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("execution failed: {0}")]
    Execution(String),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidDescriptor(message.into())
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        EngineError::Execution(message.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_reports_counts_and_display() {
        let desc = MemoryDesc::new(&[2, 3, 4, 4], DType::F32, EngineFormat::NCHW);
        assert_eq!(desc.ndim(), 4);
        assert_eq!(desc.element_count(), Some(96));
        assert_eq!(desc.byte_len(), Some(384));
        assert_eq!(desc.to_string(), "F32[2x3x4x4]/NCHW");
    }

    #[test]
    fn overflowing_desc_has_no_byte_len() {
        let desc = MemoryDesc::new(&[usize::MAX, 2], DType::I32, EngineFormat::NC);
        assert_eq!(desc.element_count(), None);
        assert_eq!(desc.byte_len(), None);
    }

    #[test]
    fn plain_formats_match_rank() {
        for rank in [1usize, 2, 4] {
            assert_eq!(EngineFormat::plain_for_rank(rank).rank(), Some(rank));
        }
        assert_eq!(EngineFormat::plain_for_rank(3), EngineFormat::Any);
    }
}
