//! Engine-bound tensor buffers over owned or adopted memory.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, trace};
use once_cell::sync::OnceCell;

use crate::engine::{ComputeEngine, EngineFormat, EngineMemory, MemoryDesc};
use crate::error::{MdarrayError, Result};

use super::alloc::{is_aligned, AlignedBuffer, DEFAULT_ALIGNMENT};
use super::export::{validate_request, ExportFlags, ExportedView};
use super::external::ExternalView;
use super::layout::{checked_element_count, MemoryLayout, MAX_NDIM};
use super::{DType, Element};

/// Backing memory of a tensor buffer, shared with every outstanding export.
pub(crate) enum Storage {
    /// 64-byte aligned block allocated and freed by this crate.
    Owned(AlignedBuffer),
    /// Adopted external memory; freeing it is the producer's job, triggered on release.
    Borrowed(ExternalView),
}

impl Storage {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Storage::Owned(buffer) => buffer.as_ptr(),
            Storage::Borrowed(view) => view.as_ptr(),
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Storage::Owned(buffer) => buffer.len(),
            Storage::Borrowed(view) => view.len(),
        }
    }
}

/// Memory region bound to an engine memory object, exportable to shape-aware consumers.
///
/// The storage is reference counted: every [`ExportedView`] holds a strong reference, so the
/// memory outlives the buffer until the last view is released.
pub struct TensorBuffer<E: ComputeEngine> {
    size: usize,
    memory: E::Memory,
    storage: Arc<Storage>,
    layout: OnceCell<MemoryLayout>,
    recompute_layout: bool,
}

impl<E: ComputeEngine> TensorBuffer<E> {
    /// Allocates zeroed, owned storage for `dims` and binds an engine memory object to it.
    pub fn new(engine: &E, dims: &[usize], dtype: DType, format: EngineFormat) -> Result<Self> {
        let desc = MemoryDesc::new(dims, dtype, format);
        let (size, bytes) = dense_extent(&desc)?;
        let buffer = AlignedBuffer::allocate(bytes)?;
        trace!("allocated {bytes} bytes for {desc} on {}", engine.engine_name());
        Self::bind(engine, &desc, size, Storage::Owned(buffer))
    }

    /// Allocates destination storage matching an engine-produced descriptor.
    ///
    /// The buffer receives the output of a later compute; no data is copied in.
    pub fn from_descriptor(engine: &E, desc: &MemoryDesc) -> Result<Self> {
        let (size, bytes) = dense_extent(desc)?;
        let buffer = AlignedBuffer::allocate(bytes)?;
        trace!("allocated {bytes} bytes for engine descriptor {desc}");
        Self::bind(engine, desc, size, Storage::Owned(buffer))
    }

    /// Wraps an external buffer, adopting it in place when it is 64-byte aligned and copying it
    /// into owned storage otherwise.
    ///
    /// When a copy is made the view is released before this returns.
    pub fn from_external(engine: &E, view: ExternalView, format: EngineFormat) -> Result<Self> {
        let dtype = DType::from_format(view.format(), view.itemsize())?;
        let itemsize = view.itemsize();
        if view.len() % itemsize != 0 {
            return Err(MdarrayError::LengthMismatch {
                len: view.len(),
                itemsize,
            });
        }
        let size = view.len() / itemsize;
        let desc = MemoryDesc::new(view.shape(), dtype, format);
        if dense_extent(&desc)?.0 != size {
            return Err(MdarrayError::LengthMismatch {
                len: view.len(),
                itemsize,
            });
        }

        let storage = if is_aligned(view.as_ptr(), DEFAULT_ALIGNMENT) {
            debug!(
                "adopting aligned external buffer {:p} ({} bytes) without copy",
                view.as_ptr(),
                view.len()
            );
            Storage::Borrowed(view)
        } else {
            let buffer = AlignedBuffer::copy_from_slice(view.as_bytes())?;
            debug!(
                "copied misaligned external buffer {:p} ({} bytes) into owned storage",
                view.as_ptr(),
                view.len()
            );
            drop(view);
            Storage::Owned(buffer)
        };
        Self::bind(engine, &desc, size, storage)
    }

    fn bind(engine: &E, desc: &MemoryDesc, size: usize, storage: Storage) -> Result<Self> {
        debug_assert!(storage.byte_len() >= size * desc.dtype().size_in_bytes());
        let ptr = NonNull::new(storage.as_ptr()).unwrap_or(NonNull::dangling());
        // SAFETY: `storage` provides `desc.byte_len()` bytes and is moved into the buffer next to
        // the memory object, so it outlives it. On error the storage is dropped here and nothing
        // refers to it.
        let memory = unsafe { engine.create_memory(desc, ptr)? };
        Ok(TensorBuffer {
            size,
            memory,
            storage: Arc::new(storage),
            layout: OnceCell::new(),
            recompute_layout: crate::env::layout_recompute_enabled(),
        })
    }

    /// Forces layout recomputation on every export instead of reusing the cached one.
    pub fn with_layout_recompute(mut self, enabled: bool) -> Self {
        self.recompute_layout = enabled;
        self
    }

    /// Active data pointer: the adopted external pointer or the owned allocation.
    pub fn data(&self) -> *mut u8 {
        self.storage.as_ptr()
    }

    /// Element count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Rank as reported by the engine memory object.
    pub fn ndim(&self) -> usize {
        self.memory.desc().ndim()
    }

    pub fn dtype(&self) -> DType {
        self.memory.desc().dtype()
    }

    pub fn desc(&self) -> &MemoryDesc {
        self.memory.desc()
    }

    pub fn memory(&self) -> &E::Memory {
        &self.memory
    }

    /// `true` when the buffer references adopted external memory.
    pub fn is_borrowed(&self) -> bool {
        matches!(*self.storage, Storage::Borrowed(_))
    }

    /// Number of exported views still holding this buffer's storage.
    pub fn export_count(&self) -> usize {
        Arc::strong_count(&self.storage) - 1
    }

    /// Layout derived from the engine descriptor, computed on first use and cached.
    pub fn layout(&self) -> Result<&MemoryLayout> {
        self.layout
            .get_or_try_init(|| MemoryLayout::from_engine_descriptor(self.memory.desc()))
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        // SAFETY: storage is 4-byte aligned at minimum (64 when owned, checked when adopted),
        // holds `size` initialised elements of `T`'s dtype, and lives as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.data().cast::<T>(), self.size) })
    }

    /// Typed mutable access.
    ///
    /// Refused with [`MdarrayError::ExportsOutstanding`] while any exported view is alive, since
    /// every view aliases this memory.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        let views = self.export_count();
        if views > 0 {
            return Err(MdarrayError::ExportsOutstanding { views });
        }
        // SAFETY: as in `as_slice`. `&mut self` rules out other borrows of the buffer and no
        // exported view holds the storage, so this slice is the only reference to the memory.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data().cast::<T>(), self.size) })
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype() {
            return Err(MdarrayError::DTypeMismatch {
                expected: self.dtype(),
                actual: T::DTYPE,
            });
        }
        Ok(())
    }

    /// Exports the buffer, populating the fields selected by `flags`.
    pub fn export(&self, flags: ExportFlags) -> Result<ExportedView> {
        validate_request(flags)?;
        let view = if self.recompute_layout {
            let layout = MemoryLayout::from_engine_descriptor(self.memory.desc())?;
            ExportedView::populate(Arc::clone(&self.storage), self.size, &layout, flags)
        } else {
            ExportedView::populate(Arc::clone(&self.storage), self.size, self.layout()?, flags)
        };
        trace!(
            "exported {} ({} outstanding views)",
            self.memory.desc(),
            self.export_count()
        );
        Ok(view)
    }

    /// Exports into a caller-provided slot. A missing slot is rejected.
    pub fn export_into(
        &self,
        slot: Option<&mut Option<ExportedView>>,
        flags: ExportFlags,
    ) -> Result<()> {
        validate_request(flags)?;
        let Some(slot) = slot else {
            return Err(MdarrayError::invalid_view("null view in export"));
        };
        *slot = Some(self.export(flags)?);
        Ok(())
    }
}

impl<E: ComputeEngine> fmt::Debug for TensorBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("desc", self.memory.desc())
            .field("size", &self.size)
            .field("data", &self.data())
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// Validates rank and overflow for a dense region, returning `(elements, bytes)`.
fn dense_extent(desc: &MemoryDesc) -> Result<(usize, usize)> {
    if desc.ndim() > MAX_NDIM {
        return Err(MdarrayError::TooManyDimensions { ndim: desc.ndim() });
    }
    let size = checked_element_count(desc.dims())?;
    let bytes = size
        .checked_mul(desc.dtype().size_in_bytes())
        .ok_or(MdarrayError::ShapeOverflow)?;
    Ok((size, bytes))
}
