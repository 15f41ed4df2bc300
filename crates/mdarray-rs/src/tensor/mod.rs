//! Tensor memory: aligned allocation, row-major layouts, engine-bound buffers, and the export
//! contract that hands those buffers to external consumers without copying.

pub mod alloc;
mod buffer;
pub mod dtype;
pub mod export;
pub mod external;
pub mod layout;

pub use alloc::{AlignedBuffer, DEFAULT_ALIGNMENT};
pub use buffer::TensorBuffer;
pub use dtype::{DType, Element};
pub use export::{ExportFlags, ExportedView};
pub use external::ExternalView;
pub use layout::{MemoryLayout, MAX_NDIM};
