#![allow(dead_code)]

use std::ptr::NonNull;

use mdarray_rs::engine::{ComputeEngine, EngineError, EngineMemory, EngineResult, MemoryDesc};

/// Minimal engine that binds descriptors to pointers and can be told to reject everything.
#[derive(Default)]
pub struct HostEngine {
    pub reject_memory: bool,
}

pub struct HostMemory {
    desc: MemoryDesc,
    ptr: NonNull<u8>,
}

unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl EngineMemory for HostMemory {
    fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    fn data_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl ComputeEngine for HostEngine {
    type Memory = HostMemory;
    type Primitive = String;

    fn engine_name(&self) -> &str {
        "host-test"
    }

    unsafe fn create_memory(
        &self,
        desc: &MemoryDesc,
        data: NonNull<u8>,
    ) -> EngineResult<Self::Memory> {
        if self.reject_memory {
            return Err(EngineError::invalid(format!("rejected {desc}")));
        }
        Ok(HostMemory {
            desc: desc.clone(),
            ptr: data,
        })
    }
}

pub fn rejecting() -> HostEngine {
    HostEngine {
        reject_memory: true,
    }
}
