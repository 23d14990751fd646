//! Host-side GPU operations
//!
//! [`GpuOperations`] is the submission path: it allocates the correlation id,
//! builds the placeholder nodes the completions will be attributed to,
//! records the pending host op and hands the request to the backend. Kernel
//! launches are bracketed by the range coordinator; copies and allocations
//! are not.

use crate::activity::{CopyKind, MemoryKind};
use crate::backend::{AllocRequest, CopyRequest, GpuBackend, KernelLaunch};
use crate::cct::CallingContextTree;
use crate::context_map::ContextMap;
use crate::correlation::{HostCorrelationMap, HostOpEntry, Placeholder, Placeholders};
use crate::error::GpuError;
use crate::range::{LaunchSite, RangeCoordinator, RangeThread};
use std::sync::Arc;
use stride_shared::utils::time::monotonic_nanos;
use stride_shared::{CctNodeId, ContextHandle, CorrelationId, IpNormalized, RangeId};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub context: ContextHandle,
    pub stream: u32,
    pub function: IpNormalized,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_memory: u32,
}

impl KernelSpec {
    pub fn new(context: ContextHandle, function: IpNormalized) -> Self {
        Self {
            context,
            stream: 0,
            function,
            grid: (1, 1, 1),
            block: (1, 1, 1),
            shared_memory: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub context: ContextHandle,
    pub stream: u32,
    pub kind: CopyKind,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocSpec {
    pub context: ContextHandle,
    pub kind: MemoryKind,
    pub bytes: u64,
}

/// What a kernel launch was assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub correlation_id: CorrelationId,
    pub range_id: RangeId,
    /// Placeholder the kernel record is attributed to
    pub kernel_node: CctNodeId,
    pub begins_range: bool,
    /// The exit collected the samples of a closed range
    pub flushed: bool,
}

pub struct GpuOperations {
    coordinator: Arc<RangeCoordinator>,
    backend: Arc<dyn GpuBackend>,
    contexts: Arc<ContextMap>,
    host: Arc<HostCorrelationMap>,
    cct: Arc<dyn CallingContextTree>,
}

impl GpuOperations {
    pub fn new(
        coordinator: Arc<RangeCoordinator>,
        backend: Arc<dyn GpuBackend>,
        contexts: Arc<ContextMap>,
        host: Arc<HostCorrelationMap>,
        cct: Arc<dyn CallingContextTree>,
    ) -> Self {
        Self {
            coordinator,
            backend,
            contexts,
            host,
            cct,
        }
    }

    pub fn coordinator(&self) -> &Arc<RangeCoordinator> {
        &self.coordinator
    }

    pub fn host_map(&self) -> &Arc<HostCorrelationMap> {
        &self.host
    }

    /// Launch a kernel from `api_node`, the calling context of the API call.
    ///
    /// The range bracket is closed even when the backend rejects the launch.
    pub fn launch_kernel(
        &self,
        thread: &mut RangeThread,
        api_node: CctNodeId,
        spec: &KernelSpec,
    ) -> Result<LaunchOutcome, GpuError> {
        let context = self.contexts.init(spec.context);
        let site = LaunchSite {
            api_node,
            context,
            handle: spec.context,
            kernel: spec.function,
        };
        let enter = thread.range_enter(site)?;

        let context_node = self.cct.insert_context(api_node, context);
        let range_node = self.cct.insert_range(context_node, enter.range_id);
        let kernel_node = self.cct.insert_ip_norm(range_node, spec.function, true);

        let entry = HostOpEntry::new(
            Placeholders::new().with(Placeholder::Kernel, kernel_node),
            thread.channel().clone(),
            monotonic_nanos(),
        )
        .with_pc_samples(enter.begins_range);
        self.host.insert(enter.correlation_id, entry);

        let launch = KernelLaunch {
            correlation_id: enter.correlation_id,
            context: spec.context,
            stream: spec.stream,
            function: spec.function,
            grid: spec.grid,
            block: spec.block,
            shared_memory: spec.shared_memory,
        };
        if let Err(e) = self.backend.submit_kernel(&launch) {
            warn!("kernel {} rejected by {}: {}", enter.correlation_id, self.backend.name(), e);
            self.host.delete(enter.correlation_id);
            thread.range_exit();
            return Err(e);
        }

        let flushed = thread.range_exit();
        debug!(
            "kernel {} launched in range {}{}",
            enter.correlation_id,
            enter.range_id,
            if enter.begins_range { " (new)" } else { "" }
        );
        Ok(LaunchOutcome {
            correlation_id: enter.correlation_id,
            range_id: enter.range_id,
            kernel_node,
            begins_range: enter.begins_range,
            flushed,
        })
    }

    pub fn memcpy(&self, thread: &RangeThread, api_node: CctNodeId, spec: &CopySpec) -> Result<CorrelationId, GpuError> {
        let slot = match spec.kind {
            CopyKind::HostToDevice => Placeholder::CopyIn,
            CopyKind::DeviceToHost => Placeholder::CopyOut,
            _ => Placeholder::Copy,
        };
        let node = self.cct.insert_context(api_node, self.contexts.init(spec.context));
        let correlation_id = self.submit_untracked(
            thread,
            Placeholders::new().with(slot, node).with(Placeholder::Copy, node),
            |correlation_id| {
                self.backend.submit_copy(&CopyRequest {
                    correlation_id,
                    context: spec.context,
                    stream: spec.stream,
                    kind: spec.kind,
                    bytes: spec.bytes,
                })
            },
        )?;
        Ok(correlation_id)
    }

    pub fn alloc(&self, thread: &RangeThread, api_node: CctNodeId, spec: &AllocSpec) -> Result<CorrelationId, GpuError> {
        let node = self.cct.insert_context(api_node, self.contexts.init(spec.context));
        self.submit_untracked(thread, Placeholders::new().with(Placeholder::Alloc, node), |correlation_id| {
            self.backend.submit_alloc(&AllocRequest {
                correlation_id,
                context: spec.context,
                kind: spec.kind,
                bytes: spec.bytes,
            })
        })
    }

    /// Submit an op outside any range bracket
    fn submit_untracked(
        &self,
        thread: &RangeThread,
        placeholders: Placeholders,
        submit: impl FnOnce(CorrelationId) -> Result<(), GpuError>,
    ) -> Result<CorrelationId, GpuError> {
        let correlation_id = self.coordinator.next_correlation_id();
        let entry = HostOpEntry::new(placeholders, thread.channel().clone(), monotonic_nanos());
        self.host.insert(correlation_id, entry);
        if let Err(e) = submit(correlation_id) {
            warn!("op {} rejected by {}: {}", correlation_id, self.backend.name(), e);
            self.host.delete(correlation_id);
            return Err(e);
        }
        Ok(correlation_id)
    }
}
