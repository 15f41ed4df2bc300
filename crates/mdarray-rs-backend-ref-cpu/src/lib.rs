//! Reference CPU implementation of the mdarray-rs compute-engine boundary.
//!
//! Builds validated primitives for every cached operation family and runs naive forward kernels
//! for activation and pooling. Intended for tests and as a template for real engine bindings.

pub mod cpu;

pub use cpu::{CpuEngine, CpuMemory, CpuPrimitive};
