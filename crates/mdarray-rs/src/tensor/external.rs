//! Views over memory owned by an external buffer producer.

use std::fmt;
use std::ptr::NonNull;

use super::alloc::AlignedBuffer;
use super::layout::Dims;
use super::Element;

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Raw description of an externally owned buffer: pointer, length, item metadata, and shape.
///
/// The view keeps its producer's memory alive until it is dropped, at which point the release
/// hook runs exactly once. A [`TensorBuffer`](super::TensorBuffer) that adopts the view without
/// copying holds it (and therefore the producer's memory) for as long as the buffer or any of
/// its exports live; it never frees the memory itself.
pub struct ExternalView {
    buf: NonNull<u8>,
    len: usize,
    itemsize: usize,
    format: String,
    shape: Dims,
    release: Option<ReleaseHook>,
}

// The producer guarantees the region stays valid until `release` runs; access goes through
// raw pointers owned by whoever adopts the view.
unsafe impl Send for ExternalView {}
unsafe impl Sync for ExternalView {}

impl ExternalView {
    /// Wraps a foreign buffer.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads and writes of `len` bytes until `release` is called, and
    /// nothing else may free it before then.
    pub unsafe fn from_raw_parts<F>(
        buf: NonNull<u8>,
        len: usize,
        itemsize: usize,
        format: impl Into<String>,
        shape: &[usize],
        release: F,
    ) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        ExternalView {
            buf,
            len,
            itemsize,
            format: format.into(),
            shape: Dims::from_slice(shape),
            release: Some(Box::new(release)),
        }
    }

    /// Exposes a host vector as an external buffer. The vector is dropped on release.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Self {
        let data = data.into_boxed_slice();
        let len = std::mem::size_of_val(&*data);
        let allocation = HostAllocation::new(data);
        let buf = allocation.0.cast::<u8>();
        // SAFETY: the allocation is only reclaimed when the hook drops it.
        unsafe {
            Self::from_raw_parts(
                buf,
                len,
                std::mem::size_of::<T>(),
                T::DTYPE.format_code(),
                shape,
                move || drop(allocation),
            )
        }
    }

    /// Exposes an aligned block as an external buffer with explicit item metadata.
    pub fn from_aligned(
        buffer: AlignedBuffer,
        itemsize: usize,
        format: impl Into<String>,
        shape: &[usize],
    ) -> Self {
        let buf = NonNull::new(buffer.as_ptr()).unwrap_or(NonNull::dangling());
        let len = buffer.len();
        // SAFETY: the block moves into the hook and is freed only on release.
        unsafe { Self::from_raw_parts(buf, len, itemsize, format, shape, move || drop(buffer)) }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the producer guarantees `len` valid bytes at `buf` until release.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.len) }
    }
}

impl Drop for ExternalView {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ExternalView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalView")
            .field("buf", &self.buf)
            .field("len", &self.len)
            .field("itemsize", &self.itemsize)
            .field("format", &self.format)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Host slice released through its raw pointer, so the exposed address is never re-derived
/// from a moved `Box`.
struct HostAllocation<T>(NonNull<[T]>);

impl<T> HostAllocation<T> {
    fn new(data: Box<[T]>) -> Self {
        // SAFETY: `Box::into_raw` never returns null.
        HostAllocation(unsafe { NonNull::new_unchecked(Box::into_raw(data)) })
    }
}

// Uniquely owns the slice, like the `Box` it came from.
unsafe impl<T: Send> Send for HostAllocation<T> {}
unsafe impl<T: Sync> Sync for HostAllocation<T> {}

impl<T> Drop for HostAllocation<T> {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `Box::into_raw` and is reclaimed exactly once.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}
