//! Enumerates the scalar element types the compute engine accepts.

use serde::{Deserialize, Serialize};

use crate::error::{MdarrayError, Result};

/// Logical dtype identifier shared between layouts, buffers, and engine descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer.
    I32,
}

impl DType {
    /// All dtypes with a dedicated primitive cache.
    pub const ALL: [DType; 2] = [DType::F32, DType::I32];

    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
        }
    }

    /// Returns the single-character type code used by the export contract.
    pub fn format_code(self) -> &'static str {
        match self {
            DType::F32 => "f",
            DType::I32 => "i",
        }
    }

    /// Resolves the dtype of an external buffer from its itemsize and format string.
    ///
    /// Only 4-byte items are accepted. The format string is searched for `'f'` before `'i'`,
    /// so byte-order prefixes such as `"<f"` or `"=i"` resolve the same way as the bare code.
    pub fn from_format(format: &str, itemsize: usize) -> Result<Self> {
        if itemsize != 4 {
            return Err(MdarrayError::unsupported(itemsize, format));
        }
        if format.contains('f') {
            Ok(DType::F32)
        } else if format.contains('i') {
            Ok(DType::I32)
        } else {
            Err(MdarrayError::unsupported(itemsize, format))
        }
    }

    /// Produces a stable tag used when crossing the engine boundary.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::I32 => 1,
        }
    }

    /// Reconstructs a `DType` from its tag representation.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::I32),
            _ => None,
        }
    }
}

/// Scalar types that can be viewed inside a tensor buffer.
///
/// # Safety
///
/// Implementors must be plain-old-data with no padding and no invalid bit patterns, so that
/// any 4-byte aligned region of initialised bytes may be reinterpreted as `Self`.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

unsafe impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

unsafe impl Element for i32 {
    const DTYPE: DType = DType::I32;
}
