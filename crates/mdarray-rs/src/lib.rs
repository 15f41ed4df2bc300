//! Tensor buffers bridging a native compute engine and shape-aware buffer consumers, plus a
//! signature-keyed cache that lets callers reuse expensive engine primitives.

pub mod cache;
pub mod engine;
mod env;
pub mod error;
pub mod profiling;
pub mod tensor;

pub use cache::{CacheConfig, CacheContext, EvictionPolicy, PrimitiveCache, PrimitiveSignature};
pub use engine::{ComputeEngine, EngineFormat, EngineMemory, MemoryDesc};
pub use error::{MdarrayError, Result};
pub use tensor::{DType, ExportFlags, ExportedView, ExternalView, MemoryLayout, TensorBuffer};
