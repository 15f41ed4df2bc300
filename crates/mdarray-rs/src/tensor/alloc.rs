//! Aligned heap allocation for buffers handed to vectorized engine kernels.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{MdarrayError, Result};

/// Alignment required by the engine's vectorized kernels.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Returns `true` when `ptr` sits on an `alignment`-byte boundary.
pub fn is_aligned(ptr: *const u8, alignment: usize) -> bool {
    alignment != 0 && (ptr as usize) % alignment == 0
}

/// Exclusively owned, zero-initialised heap block with a fixed alignment.
///
/// Dropping the buffer releases the block. Zero-length buffers never touch the allocator and
/// hold a dangling pointer that is still aligned.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
}

// The block is uniquely owned; shared access only hands out raw pointers and `&[u8]`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `bytes` zeroed bytes at [`DEFAULT_ALIGNMENT`].
    pub fn allocate(bytes: usize) -> Result<Self> {
        Self::allocate_aligned(bytes, DEFAULT_ALIGNMENT)
    }

    /// Allocates `bytes` zeroed bytes at `alignment`, which must be a power of two.
    pub fn allocate_aligned(bytes: usize, alignment: usize) -> Result<Self> {
        let failure = || MdarrayError::AllocationFailure { bytes, alignment };
        let layout = Layout::from_size_align(bytes, alignment).map_err(|_| failure())?;
        if bytes == 0 {
            // SAFETY: `alignment` is a non-zero power of two, checked by `Layout`.
            let dangling = unsafe { NonNull::new_unchecked(alignment as *mut u8) };
            return Ok(AlignedBuffer {
                ptr: dangling,
                len: 0,
                alignment,
            });
        }
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(failure)?;
        Ok(AlignedBuffer {
            ptr,
            len: bytes,
            alignment,
        })
    }

    /// Allocates an aligned block and copies `src` into it.
    pub fn copy_from_slice(src: &[u8]) -> Result<Self> {
        let buffer = Self::allocate(src.len())?;
        // SAFETY: destination is freshly allocated with `src.len()` bytes and cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), buffer.ptr.as_ptr(), src.len()) };
        Ok(buffer)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialised bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: unique borrow of an owned block.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        // SAFETY: the layout matches the one used in `allocate_aligned`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, self.alignment);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .finish()
    }
}
