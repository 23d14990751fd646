//! GPU vendor backends
//!
//! The engine talks to a vendor runtime only through [`GpuBackend`].
//! Completions come back asynchronously through the
//! [`CompletionHandler`](crate::process::CompletionHandler) the backend was
//! built with, on a thread the backend owns.

pub mod cupti;
pub mod opencl;
pub mod sim;

use crate::activity::{CopyKind, MemoryKind};
use crate::error::GpuError;
use stride_shared::{ContextHandle, CorrelationId, IpNormalized};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub correlation_id: CorrelationId,
    pub context: ContextHandle,
    pub stream: u32,
    /// Normalized address of the kernel entry point
    pub function: IpNormalized,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_memory: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub correlation_id: CorrelationId,
    pub context: ContextHandle,
    pub stream: u32,
    pub kind: CopyKind,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRequest {
    pub correlation_id: CorrelationId,
    pub context: ContextHandle,
    pub kind: MemoryKind,
    pub bytes: u64,
}

/// One GPU vendor runtime
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn submit_kernel(&self, launch: &KernelLaunch) -> Result<(), GpuError>;

    fn submit_copy(&self, copy: &CopyRequest) -> Result<(), GpuError>;

    fn submit_alloc(&self, alloc: &AllocRequest) -> Result<(), GpuError>;

    fn supports_pc_sampling(&self) -> bool {
        false
    }

    /// Configure PC sampling for a context; called once per context
    fn pc_sampling_enable(&self, _context: ContextHandle) -> Result<(), GpuError> {
        Err(GpuError::NotSupported {
            backend: self.name(),
            what: "pc sampling",
        })
    }

    fn pc_sampling_start(&self, _context: ContextHandle) -> Result<(), GpuError> {
        Err(GpuError::NotSupported {
            backend: self.name(),
            what: "pc sampling",
        })
    }

    fn pc_sampling_stop(&self, _context: ContextHandle) -> Result<(), GpuError> {
        Err(GpuError::NotSupported {
            backend: self.name(),
            what: "pc sampling",
        })
    }

    /// Deliver the samples gathered since the last collect through the
    /// completion handler; returns how many sample records were delivered.
    fn pc_sampling_collect(&self, _context: ContextHandle) -> Result<usize, GpuError> {
        Err(GpuError::NotSupported {
            backend: self.name(),
            what: "pc sampling",
        })
    }

    /// Deliver every outstanding completion before returning
    fn flush(&self) -> Result<(), GpuError>;
}
