//! OpenCL adapter
//!
//! OpenCL has no activity API. Every enqueue returns an event; once the event
//! completes its profiling info (queued, submit, start, end) becomes the
//! completion record. The event handle doubles as the native correlation id,
//! so each completion is preceded by a synthesized external-correlation
//! record. There is no PC sampling; range profiling resolves to NONE.

use super::{AllocRequest, CopyRequest, GpuBackend, KernelLaunch};
use crate::activity::{
    ActivityDetails, CopyKind, GpuActivity, Interval, KernelActivity, MemcpyActivity, MemoryAllocActivity,
};
use crate::context_map::ContextMap;
use crate::error::GpuError;
use crate::process::CompletionHandler;
use crate::splay::SharedSplayMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use stride_shared::{ContextId, CorrelationId};
use tracing::{error, trace};

const BACKEND: &str = "opencl";

pub type ClInt = i32;

pub const CL_SUCCESS: ClInt = 0;
pub const CL_OUT_OF_RESOURCES: ClInt = -5;
pub const CL_PROFILING_INFO_NOT_AVAILABLE: ClInt = -7;

/// Opaque `cl_event`
pub type ClEvent = u64;

/// `clGetEventProfilingInfo`, in device nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventProfilingInfo {
    pub queued: u64,
    pub submit: u64,
    pub start: u64,
    pub end: u64,
}

impl EventProfilingInfo {
    /// Time spent waiting in the queue before execution
    pub fn queue_delay_ns(&self) -> u64 {
        self.start.saturating_sub(self.queued)
    }
}

fn code(raw: ClInt) -> u32 {
    raw.unsigned_abs()
}

/// The enqueue entry points. A successful enqueue returns the event whose
/// completion callback will later call [`OpenClBackend::event_completed`].
pub trait OpenClRuntime: Send + Sync {
    fn enqueue_nd_range_kernel(&self, launch: &KernelLaunch) -> Result<ClEvent, ClInt>;

    fn enqueue_copy_buffer(&self, copy: &CopyRequest) -> Result<ClEvent, ClInt>;

    /// `clCreateBuffer`; synchronous
    fn create_buffer(&self, alloc: &AllocRequest) -> ClInt;

    /// `clFinish` on every queue
    fn finish(&self) -> ClInt;
}

#[derive(Debug, Clone, Copy)]
enum PendingOp {
    Kernel {
        correlation_id: CorrelationId,
        context: ContextId,
        stream: u32,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_memory: u32,
    },
    Copy {
        correlation_id: CorrelationId,
        context: ContextId,
        stream: u32,
        kind: CopyKind,
        bytes: u64,
    },
}

pub struct OpenClBackend<R: OpenClRuntime> {
    runtime: R,
    contexts: Arc<ContextMap>,
    handler: Arc<dyn CompletionHandler>,
    pending: SharedSplayMap<ClEvent, PendingOp>,
    /// Native ids for allocations, which have no event; kept clear of
    /// event handles by counting down from the top
    next_alloc_id: spin::Mutex<u64>,
}

impl<R: OpenClRuntime> OpenClBackend<R> {
    pub fn new(runtime: R, contexts: Arc<ContextMap>, handler: Arc<dyn CompletionHandler>) -> Self {
        Self {
            runtime,
            contexts,
            handler,
            pending: SharedSplayMap::new(),
            next_alloc_id: spin::Mutex::new(u64::MAX),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Events enqueued but not yet completed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Event-completion callback body
    pub fn event_completed(&self, event: ClEvent, info: Result<EventProfilingInfo, ClInt>) {
        let Some(op) = self.pending.delete(&event) else {
            trace!("completion for unknown event {:#x}", event);
            return;
        };
        let info = match info {
            Ok(info) => info,
            Err(raw) => {
                trace!(
                    "{}",
                    GpuError::vendor(BACKEND, "get_event_profiling_info", code(raw))
                );
                EventProfilingInfo::default()
            }
        };
        let interval = Interval::new(info.start, info.end);
        let (correlation_id, record) = match op {
            PendingOp::Kernel {
                correlation_id,
                context,
                stream,
                grid,
                block,
                shared_memory,
            } => (
                correlation_id,
                GpuActivity::new(
                    event,
                    context,
                    ActivityDetails::Kernel(KernelActivity {
                        stream_id: stream,
                        interval,
                        grid,
                        block,
                        static_shared_memory: shared_memory,
                        ..KernelActivity::default()
                    }),
                ),
            ),
            PendingOp::Copy {
                correlation_id,
                context,
                stream,
                kind,
                bytes,
            } => (
                correlation_id,
                GpuActivity::new(
                    event,
                    context,
                    ActivityDetails::Memcpy(MemcpyActivity {
                        kind,
                        bytes,
                        device_id: 0,
                        stream_id: stream,
                        interval,
                    }),
                ),
            ),
        };
        self.deliver(event, correlation_id, record);
    }

    fn deliver(&self, native: ClEvent, correlation_id: CorrelationId, record: GpuActivity) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.handler
                .on_activity(GpuActivity::external_correlation(native, correlation_id));
            self.handler.on_activity(record);
        }));
        if outcome.is_err() {
            error!(
                "{}",
                GpuError::CallbackPanicked(format!("opencl event {:#x}", native))
            );
        }
    }
}

impl<R: OpenClRuntime> GpuBackend for OpenClBackend<R> {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn submit_kernel(&self, launch: &KernelLaunch) -> Result<(), GpuError> {
        let context = self.contexts.init(launch.context);
        let event = self
            .runtime
            .enqueue_nd_range_kernel(launch)
            .map_err(|raw| GpuError::vendor(BACKEND, "enqueue_nd_range_kernel", code(raw)))?;
        self.pending.insert(
            event,
            PendingOp::Kernel {
                correlation_id: launch.correlation_id,
                context,
                stream: launch.stream,
                grid: launch.grid,
                block: launch.block,
                shared_memory: launch.shared_memory,
            },
        );
        Ok(())
    }

    fn submit_copy(&self, copy: &CopyRequest) -> Result<(), GpuError> {
        let context = self.contexts.init(copy.context);
        let event = self
            .runtime
            .enqueue_copy_buffer(copy)
            .map_err(|raw| GpuError::vendor(BACKEND, "enqueue_copy_buffer", code(raw)))?;
        self.pending.insert(
            event,
            PendingOp::Copy {
                correlation_id: copy.correlation_id,
                context,
                stream: copy.stream,
                kind: copy.kind,
                bytes: copy.bytes,
            },
        );
        Ok(())
    }

    fn submit_alloc(&self, alloc: &AllocRequest) -> Result<(), GpuError> {
        let context = self.contexts.init(alloc.context);
        let raw = self.runtime.create_buffer(alloc);
        if raw != CL_SUCCESS {
            return Err(GpuError::vendor(BACKEND, "create_buffer", code(raw)));
        }
        let native = {
            let mut next = self.next_alloc_id.lock();
            let id = *next;
            *next -= 1;
            id
        };
        self.deliver(
            native,
            alloc.correlation_id,
            GpuActivity::new(
                native,
                context,
                ActivityDetails::MemoryAlloc(MemoryAllocActivity {
                    kind: alloc.kind,
                    bytes: alloc.bytes,
                    device_id: 0,
                    interval: Interval::default(),
                }),
            ),
        );
        Ok(())
    }

    fn flush(&self) -> Result<(), GpuError> {
        let raw = self.runtime.finish();
        if raw != CL_SUCCESS {
            return Err(GpuError::vendor(BACKEND, "finish", code(raw)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityKind, MemoryKind};
    use crate::config::{RangeConfig, RangeMode};
    use stride_shared::{ContextHandle, IpNormalized};

    #[derive(Default)]
    struct FakeOpenCl {
        next_event: spin::Mutex<ClEvent>,
        fail_copies: bool,
    }

    impl OpenClRuntime for FakeOpenCl {
        fn enqueue_nd_range_kernel(&self, _launch: &KernelLaunch) -> Result<ClEvent, ClInt> {
            let mut next = self.next_event.lock();
            *next += 1;
            Ok(0x100 + *next)
        }

        fn enqueue_copy_buffer(&self, _copy: &CopyRequest) -> Result<ClEvent, ClInt> {
            if self.fail_copies {
                return Err(CL_OUT_OF_RESOURCES);
            }
            let mut next = self.next_event.lock();
            *next += 1;
            Ok(0x100 + *next)
        }

        fn create_buffer(&self, _alloc: &AllocRequest) -> ClInt {
            CL_SUCCESS
        }

        fn finish(&self) -> ClInt {
            CL_SUCCESS
        }
    }

    #[derive(Default)]
    struct Recorder {
        records: spin::Mutex<Vec<GpuActivity>>,
    }

    impl CompletionHandler for Recorder {
        fn on_activity(&self, activity: GpuActivity) {
            self.records.lock().push(activity);
        }
    }

    fn launch() -> KernelLaunch {
        KernelLaunch {
            correlation_id: CorrelationId(21),
            context: ContextHandle(0xc1),
            stream: 2,
            function: IpNormalized::new(1, 0),
            grid: (64, 1, 1),
            block: (64, 1, 1),
            shared_memory: 512,
        }
    }

    #[test]
    fn test_event_profiling_becomes_kernel_record() {
        let recorder = Arc::new(Recorder::default());
        let backend = OpenClBackend::new(FakeOpenCl::default(), Arc::new(ContextMap::new()), recorder.clone());
        backend.submit_kernel(&launch()).unwrap();
        assert_eq!(backend.pending(), 1);

        let info = EventProfilingInfo {
            queued: 10,
            submit: 20,
            start: 50,
            end: 90,
        };
        assert_eq!(info.queue_delay_ns(), 40);
        backend.event_completed(0x101, Ok(info));
        assert_eq!(backend.pending(), 0);

        let records = recorder.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind(), ActivityKind::ExternalCorrelation);
        assert_eq!(records[1].native_correlation_id, 0x101);
        match &records[1].details {
            ActivityDetails::Kernel(k) => {
                assert_eq!(k.interval.duration_ns(), 40);
                assert_eq!(k.static_shared_memory, 512);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_and_failed_enqueue() {
        let recorder = Arc::new(Recorder::default());
        let runtime = FakeOpenCl {
            fail_copies: true,
            ..FakeOpenCl::default()
        };
        let backend = OpenClBackend::new(runtime, Arc::new(ContextMap::new()), recorder.clone());
        backend.event_completed(0xdead, Ok(EventProfilingInfo::default()));
        assert!(recorder.records.lock().is_empty());

        let copy = CopyRequest {
            correlation_id: CorrelationId(4),
            context: ContextHandle(1),
            stream: 0,
            kind: CopyKind::HostToDevice,
            bytes: 8,
        };
        assert_eq!(
            backend.submit_copy(&copy),
            Err(GpuError::vendor("opencl", "enqueue_copy_buffer", 5))
        );
        assert_eq!(backend.pending(), 0);
    }

    #[test]
    fn test_alloc_completes_immediately() {
        let recorder = Arc::new(Recorder::default());
        let backend = OpenClBackend::new(FakeOpenCl::default(), Arc::new(ContextMap::new()), recorder.clone());
        backend
            .submit_alloc(&AllocRequest {
                correlation_id: CorrelationId(8),
                context: ContextHandle(1),
                kind: MemoryKind::Device,
                bytes: 1024,
            })
            .unwrap();
        let records = recorder.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind(), ActivityKind::MemoryAlloc);
        assert_eq!(records[1].native_correlation_id, u64::MAX);
    }

    #[test]
    fn test_range_modes_fall_back_without_pc_sampling() {
        let backend = OpenClBackend::new(
            FakeOpenCl::default(),
            Arc::new(ContextMap::new()),
            Arc::new(Recorder::default()),
        );
        assert!(!backend.supports_pc_sampling());
        assert!(backend.pc_sampling_start(ContextHandle(1)).is_err());
        let config = RangeConfig::with_mode(RangeMode::Trie);
        assert_eq!(config.resolve(backend.supports_pc_sampling()), RangeMode::None);
    }
}
