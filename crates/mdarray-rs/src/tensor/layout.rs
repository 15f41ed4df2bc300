//! Row-major layout metadata shared by engine descriptors and exported views.
//!
//! A [`MemoryLayout`] is the reverse of an engine [`MemoryDesc`]: it carries the byte strides
//! and format code an external consumer needs, derived strictly backward from the last axis.
//! Only C-contiguous layouts exist; there is no way to build a transposed or Fortran-order one.

use smallvec::SmallVec;

use crate::engine::MemoryDesc;
use crate::error::{MdarrayError, Result};

use super::DType;

/// Hard cap on tensor rank.
pub const MAX_NDIM: usize = 12;

pub type Dims = SmallVec<[usize; MAX_NDIM]>;

/// Row-major shape/stride/dtype description of a contiguous memory region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryLayout {
    shape: Dims,
    strides: Dims,
    dtype: DType,
}

impl MemoryLayout {
    /// Computes row-major byte strides for `shape`.
    pub fn from_shape(shape: &[usize], dtype: DType) -> Result<Self> {
        if shape.len() > MAX_NDIM {
            return Err(MdarrayError::TooManyDimensions { ndim: shape.len() });
        }
        checked_element_count(shape)?
            .checked_mul(dtype.size_in_bytes())
            .ok_or(MdarrayError::ShapeOverflow)?;
        let strides = contiguous_byte_strides(shape, dtype.size_in_bytes())?;
        Ok(MemoryLayout {
            shape: Dims::from_slice(shape),
            strides,
            dtype,
        })
    }

    /// Derives a layout from external buffer metadata, resolving the dtype from its format.
    pub fn from_format(shape: &[usize], itemsize: usize, format: &str) -> Result<Self> {
        let dtype = DType::from_format(format, itemsize)?;
        Self::from_shape(shape, dtype)
    }

    /// Reads rank, dims, and dtype from an engine-produced descriptor.
    pub fn from_engine_descriptor(desc: &MemoryDesc) -> Result<Self> {
        Self::from_shape(desc.dims(), desc.dtype())
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Per-axis byte offsets.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn itemsize(&self) -> usize {
        self.dtype.size_in_bytes()
    }

    pub fn format(&self) -> &'static str {
        self.dtype.format_code()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.itemsize()
    }

    /// Checks the row-major stride recurrence. Always true for layouts built by this module;
    /// exposed so consumers can validate layouts rebuilt from foreign metadata.
    pub fn is_c_contiguous(&self) -> bool {
        let mut expected = self.itemsize();
        for axis in (0..self.ndim()).rev() {
            if self.strides[axis] != expected {
                return false;
            }
            expected = expected.saturating_mul(self.shape[axis]);
        }
        true
    }

    pub(crate) fn from_parts(shape: &[usize], strides: &[usize], dtype: DType) -> Self {
        MemoryLayout {
            shape: Dims::from_slice(shape),
            strides: Dims::from_slice(strides),
            dtype,
        }
    }
}

/// Computes `product(dims)` with overflow checking.
pub(crate) fn checked_element_count(dims: &[usize]) -> Result<usize> {
    dims.iter().try_fold(1usize, |count, dim| {
        count.checked_mul(*dim).ok_or(MdarrayError::ShapeOverflow)
    })
}

fn contiguous_byte_strides(dims: &[usize], itemsize: usize) -> Result<Dims> {
    let mut strides = Dims::from_elem(0, dims.len());
    let mut stride = itemsize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride = stride
            .checked_mul(dims[axis])
            .ok_or(MdarrayError::ShapeOverflow)?;
    }
    Ok(strides)
}
