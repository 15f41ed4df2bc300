//! Zero-copy export contract for shape-aware buffer consumers.
//!
//! Request flags use the PEP 3118 bit values so a host bridge can forward its consumer's flags
//! unchanged. A flag is honoured only when all of its bits are present, which means `STRIDES`
//! implies `ND` and every contiguity request implies `STRIDES`.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{MdarrayError, Result};

use super::buffer::Storage;
use super::layout::{Dims, MemoryLayout};
use super::DType;

/// Bitmask selecting which fields an export populates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExportFlags(u32);

impl ExportFlags {
    pub const SIMPLE: ExportFlags = ExportFlags(0);
    pub const WRITABLE: ExportFlags = ExportFlags(0x0001);
    pub const FORMAT: ExportFlags = ExportFlags(0x0004);
    pub const ND: ExportFlags = ExportFlags(0x0008);
    pub const STRIDES: ExportFlags = ExportFlags(0x0010 | Self::ND.0);
    pub const C_CONTIGUOUS: ExportFlags = ExportFlags(0x0020 | Self::STRIDES.0);
    pub const F_CONTIGUOUS: ExportFlags = ExportFlags(0x0040 | Self::STRIDES.0);
    pub const ANY_CONTIGUOUS: ExportFlags = ExportFlags(0x0080 | Self::STRIDES.0);
    pub const INDIRECT: ExportFlags = ExportFlags(0x0100 | Self::STRIDES.0);
    pub const RECORDS: ExportFlags =
        ExportFlags(Self::STRIDES.0 | Self::WRITABLE.0 | Self::FORMAT.0);
    pub const FULL: ExportFlags = ExportFlags(Self::INDIRECT.0 | Self::WRITABLE.0 | Self::FORMAT.0);

    pub const fn from_bits(bits: u32) -> Self {
        ExportFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` when every bit of `other` is set.
    pub const fn contains(self, other: ExportFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExportFlags {
    type Output = ExportFlags;

    fn bitor(self, rhs: ExportFlags) -> ExportFlags {
        ExportFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExportFlags {
    fn bitor_assign(&mut self, rhs: ExportFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ExportFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportFlags({:#06x})", self.0)
    }
}

/// Rejects requests the buffer can never satisfy. Only C-contiguous memory is produced.
pub(crate) fn validate_request(flags: ExportFlags) -> Result<()> {
    if flags.contains(ExportFlags::F_CONTIGUOUS) {
        return Err(MdarrayError::invalid_view(
            "tensor buffer is not Fortran contiguous",
        ));
    }
    Ok(())
}

/// A populated export: pointer, item metadata, and an owner reference on the storage.
///
/// Holding the view keeps the exporting buffer's memory alive even if the
/// [`TensorBuffer`](super::TensorBuffer) itself is dropped. Call [`ExportedView::release`] (or
/// drop the view) once the memory is no longer needed.
pub struct ExportedView {
    buf: NonNull<u8>,
    len: usize,
    itemsize: usize,
    format: Option<&'static str>,
    ndim: usize,
    shape: Option<Dims>,
    strides: Option<Dims>,
    owner: Arc<Storage>,
}

// Exports hand out raw pointers; synchronising writes through them is the consumer's job.
unsafe impl Send for ExportedView {}
unsafe impl Sync for ExportedView {}

impl ExportedView {
    pub(crate) fn populate(
        owner: Arc<Storage>,
        size: usize,
        layout: &MemoryLayout,
        flags: ExportFlags,
    ) -> Self {
        let buf = NonNull::new(owner.as_ptr()).unwrap_or(NonNull::dangling());
        let (ndim, shape) = if flags.contains(ExportFlags::ND) {
            (layout.ndim(), Some(Dims::from_slice(layout.shape())))
        } else {
            (0, None)
        };
        let strides = flags
            .contains(ExportFlags::STRIDES)
            .then(|| Dims::from_slice(layout.strides()));
        ExportedView {
            buf,
            len: size * layout.itemsize(),
            itemsize: layout.itemsize(),
            format: flags
                .contains(ExportFlags::FORMAT)
                .then(|| layout.format()),
            ndim,
            shape,
            strides,
            owner,
        }
    }

    pub fn buf(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Total byte length (`size * itemsize`).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    /// Exports are always writable.
    pub fn readonly(&self) -> bool {
        false
    }

    pub fn format(&self) -> Option<&'static str> {
        self.format
    }

    /// Rank, or `0` when `ND` was not requested.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn strides(&self) -> Option<&[usize]> {
        self.strides.as_deref()
    }

    /// Always `None`: only contiguous layouts are exported.
    pub fn suboffsets(&self) -> Option<&[isize]> {
        None
    }

    /// Strong references currently held on the exported storage, including the owning buffer.
    pub fn owner_refcount(&self) -> usize {
        Arc::strong_count(&self.owner)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the owner reference keeps `len` bytes alive at `buf`.
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.len) }
    }

    /// Re-derives the layout described by a view exported with format, shape, and strides.
    pub fn to_layout(&self) -> Result<MemoryLayout> {
        let (Some(format), Some(shape), Some(strides)) =
            (self.format, self.shape.as_deref(), self.strides.as_deref())
        else {
            return Err(MdarrayError::invalid_view(
                "layout requires format, shape and strides to be exported",
            ));
        };
        let dtype = DType::from_format(format, self.itemsize)?;
        Ok(MemoryLayout::from_parts(shape, strides, dtype))
    }

    /// Drops the owner reference taken at export time.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ExportedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedView")
            .field("buf", &self.buf)
            .field("len", &self.len)
            .field("itemsize", &self.itemsize)
            .field("format", &self.format)
            .field("ndim", &self.ndim)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_flags_contain_their_components() {
        assert!(ExportFlags::STRIDES.contains(ExportFlags::ND));
        assert!(ExportFlags::RECORDS.contains(ExportFlags::FORMAT));
        assert!(ExportFlags::FULL.contains(ExportFlags::STRIDES));
        assert!(!ExportFlags::FULL.contains(ExportFlags::F_CONTIGUOUS));
        assert!(!ExportFlags::ND.contains(ExportFlags::STRIDES));
        assert!(ExportFlags::SIMPLE.contains(ExportFlags::SIMPLE));
    }

    #[test]
    fn fortran_requests_are_rejected() {
        assert!(validate_request(ExportFlags::C_CONTIGUOUS).is_ok());
        assert!(validate_request(ExportFlags::ANY_CONTIGUOUS | ExportFlags::FORMAT).is_ok());
        let err = validate_request(ExportFlags::F_CONTIGUOUS).unwrap_err();
        assert!(matches!(err, MdarrayError::InvalidViewRequest(_)));
    }

    #[test]
    fn flag_bits_round_trip() {
        let mut flags = ExportFlags::FORMAT;
        flags |= ExportFlags::ND;
        assert_eq!(ExportFlags::from_bits(flags.bits()), flags);
        assert_eq!(flags.bits(), 0x000c);
    }
}
