//! CUDA adapter
//!
//! [`CuptiRuntime`] is the slice of the driver and CUPTI surface the engine
//! calls, expressed with raw result codes. [`CuptiBackend`] maps those codes
//! to [`GpuError`], brackets every launch with an external-correlation push
//! and pop so CUPTI tags its records with our correlation id, and turns the
//! raw records of a completed activity buffer into [`GpuActivity`] values.
//!
//! CUPTI invokes the buffer-completed callback on its own thread; nothing in
//! [`CuptiBackend::buffer_completed`] may unwind into it.

use super::{AllocRequest, CopyRequest, GpuBackend, KernelLaunch};
use crate::activity::{
    ActivityDetails, CopyKind, GpuActivity, Interval, KernelActivity, MemcpyActivity, MemoryAllocActivity,
    MemoryKind, PcSampleActivity, PcSamplingInfoActivity,
};
use crate::error::GpuError;
use crate::process::CompletionHandler;
use crate::splay::SharedSplayMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use stride_shared::{ContextHandle, ContextId, CorrelationId, IpNormalized, NativeCorrelationId};
use tracing::{error, trace, warn};

const BACKEND: &str = "cupti";

pub type CuptiResult = u32;

pub const CUPTI_SUCCESS: CuptiResult = 0;
pub const CUPTI_ERROR_INVALID_PARAMETER: CuptiResult = 1;
pub const CUPTI_ERROR_NOT_INITIALIZED: CuptiResult = 15;
pub const CUPTI_ERROR_NOT_SUPPORTED: CuptiResult = 27;

/// `CUpti_ExternalCorrelationKind` used for our ids
pub const EXTERNAL_KIND_CUSTOM0: u32 = 3;

fn check(op: &'static str, code: CuptiResult) -> Result<(), GpuError> {
    if code == CUPTI_SUCCESS {
        Ok(())
    } else {
        Err(GpuError::vendor(BACKEND, op, code))
    }
}

/// Driver and CUPTI entry points
pub trait CuptiRuntime: Send + Sync {
    fn launch_kernel(&self, launch: &KernelLaunch) -> CuptiResult;

    fn memcpy(&self, copy: &CopyRequest) -> CuptiResult;

    fn mem_alloc(&self, alloc: &AllocRequest) -> CuptiResult;

    fn push_external_correlation_id(&self, kind: u32, id: u64) -> CuptiResult;

    /// Returns the popped id
    fn pop_external_correlation_id(&self, kind: u32) -> Result<u64, CuptiResult>;

    fn pc_sampling_enable(&self, context: ContextHandle) -> CuptiResult;

    fn pc_sampling_start(&self, context: ContextHandle) -> CuptiResult;

    fn pc_sampling_stop(&self, context: ContextHandle) -> CuptiResult;

    /// Drain the context's PC-sampling buffer
    fn pc_sampling_get_data(&self, context: ContextHandle) -> Result<Vec<RawRecord>, CuptiResult>;

    /// `cuptiActivityFlushAll`; completed buffers are handed back through
    /// [`CuptiBackend::buffer_completed`] before it returns
    fn activity_flush_all(&self) -> CuptiResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKernel {
    pub correlation_id: u32,
    pub context_id: u32,
    pub device_id: u32,
    pub stream_id: u32,
    pub start: u64,
    pub end: u64,
    pub grid: (i32, i32, i32),
    pub block: (i32, i32, i32),
    pub static_shared_memory: i32,
    pub dynamic_shared_memory: i32,
    pub local_memory_total: u32,
    pub registers_per_thread: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMemcpy {
    pub correlation_id: u32,
    pub context_id: u32,
    pub device_id: u32,
    pub stream_id: u32,
    /// `CUpti_ActivityMemcpyKind`
    pub copy_kind: u8,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMemory {
    pub correlation_id: u32,
    pub context_id: u32,
    pub device_id: u32,
    /// `CUpti_ActivityMemoryKind`
    pub memory_kind: u8,
    pub bytes: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPcSampling {
    pub correlation_id: u32,
    pub function_id: u32,
    pub pc_offset: u32,
    pub stall_reason: u32,
    pub samples: u32,
    pub latency_samples: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPcSamplingInfo {
    pub correlation_id: u32,
    pub total_samples: u64,
    pub dropped_samples: u64,
    pub full_sm_samples: u64,
    pub sampling_period_in_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExternalCorrelation {
    pub external_kind: u32,
    pub external_id: u64,
    pub correlation_id: u32,
}

/// Load location of a function, from the FUNCTION activity kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFunction {
    pub id: u32,
    pub context_id: u32,
    /// Load-module id the module registry assigned to the cubin
    pub module: u16,
    /// Offset of the function entry in the cubin
    pub offset: u64,
}

/// One record of a CUPTI activity buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Kernel(RawKernel),
    Memcpy(RawMemcpy),
    Memory(RawMemory),
    PcSampling(RawPcSampling),
    PcSamplingRecordInfo(RawPcSamplingInfo),
    ExternalCorrelation(RawExternalCorrelation),
    Function(RawFunction),
    /// Kinds the engine does not consume
    Other(u32),
}

fn copy_kind(raw: u8) -> CopyKind {
    match raw {
        1 => CopyKind::HostToDevice,
        2 => CopyKind::DeviceToHost,
        8 => CopyKind::DeviceToDevice,
        9 => CopyKind::HostToHost,
        _ => CopyKind::Unknown,
    }
}

fn memory_kind(raw: u8) -> MemoryKind {
    match raw {
        1 => MemoryKind::Pageable,
        2 => MemoryKind::Pinned,
        3 | 6 => MemoryKind::Device,
        5 | 7 => MemoryKind::Managed,
        _ => MemoryKind::Unknown,
    }
}

fn dim3((x, y, z): (i32, i32, i32)) -> (u32, u32, u32) {
    (x.max(0) as u32, y.max(0) as u32, z.max(0) as u32)
}

/// Raw records to activity records. Keeps the function table PC samples
/// are resolved against.
#[derive(Debug, Default)]
pub struct Translator {
    functions: SharedSplayMap<u32, IpNormalized>,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for records with nothing to attribute
    pub fn translate(&self, record: RawRecord) -> Option<GpuActivity> {
        let activity = match record {
            RawRecord::Kernel(k) => GpuActivity::new(
                NativeCorrelationId::from(k.correlation_id),
                ContextId(k.context_id),
                ActivityDetails::Kernel(KernelActivity {
                    device_id: k.device_id,
                    stream_id: k.stream_id,
                    interval: Interval::new(k.start, k.end),
                    grid: dim3(k.grid),
                    block: dim3(k.block),
                    static_shared_memory: k.static_shared_memory.max(0) as u32,
                    dynamic_shared_memory: k.dynamic_shared_memory.max(0) as u32,
                    local_memory_total: k.local_memory_total,
                    registers_per_thread: k.registers_per_thread,
                }),
            ),
            RawRecord::Memcpy(m) => GpuActivity::new(
                NativeCorrelationId::from(m.correlation_id),
                ContextId(m.context_id),
                ActivityDetails::Memcpy(MemcpyActivity {
                    kind: copy_kind(m.copy_kind),
                    bytes: m.bytes,
                    device_id: m.device_id,
                    stream_id: m.stream_id,
                    interval: Interval::new(m.start, m.end),
                }),
            ),
            RawRecord::Memory(m) => GpuActivity::new(
                NativeCorrelationId::from(m.correlation_id),
                ContextId(m.context_id),
                ActivityDetails::MemoryAlloc(MemoryAllocActivity {
                    kind: memory_kind(m.memory_kind),
                    bytes: m.bytes,
                    device_id: m.device_id,
                    interval: Interval::new(m.timestamp, m.timestamp),
                }),
            ),
            RawRecord::PcSampling(s) => {
                let Some(function) = self.functions.lookup_with(&s.function_id, |ip| *ip) else {
                    trace!("pc sample in unknown function {}", s.function_id);
                    return None;
                };
                GpuActivity::new(
                    NativeCorrelationId::from(s.correlation_id),
                    ContextId(0),
                    ActivityDetails::PcSample(PcSampleActivity {
                        pc: function.displaced(u64::from(s.pc_offset)),
                        stall_reason: Some(s.stall_reason),
                        samples: s.samples,
                        latency_samples: s.latency_samples,
                    }),
                )
            }
            RawRecord::PcSamplingRecordInfo(info) => GpuActivity::new(
                NativeCorrelationId::from(info.correlation_id),
                ContextId(0),
                ActivityDetails::PcSamplingInfo(PcSamplingInfoActivity {
                    total_samples: info.total_samples,
                    dropped_samples: info.dropped_samples,
                    full_sm_samples: info.full_sm_samples,
                    sample_period: info.sampling_period_in_cycles,
                }),
            ),
            RawRecord::ExternalCorrelation(ext) => {
                if ext.external_kind != EXTERNAL_KIND_CUSTOM0 {
                    return None;
                }
                GpuActivity::external_correlation(
                    NativeCorrelationId::from(ext.correlation_id),
                    CorrelationId(ext.external_id),
                )
            }
            RawRecord::Function(f) => {
                let entry = IpNormalized::new(f.module, f.offset);
                self.functions.upsert_with(f.id, || entry, |ip| *ip = entry);
                return None;
            }
            RawRecord::Other(kind) => {
                trace!("ignoring CUPTI activity kind {}", kind);
                return None;
            }
        };
        Some(activity)
    }
}

pub struct CuptiBackend<R: CuptiRuntime> {
    runtime: R,
    translator: Translator,
    handler: Arc<dyn CompletionHandler>,
}

impl<R: CuptiRuntime> CuptiBackend<R> {
    pub fn new(runtime: R, handler: Arc<dyn CompletionHandler>) -> Self {
        Self {
            runtime,
            translator: Translator::new(),
            handler,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Buffer-completed callback body. Returns how many PC sample records
    /// were handed on.
    pub fn buffer_completed(&self, records: Vec<RawRecord>) -> usize {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut samples = 0;
            for record in records {
                if let Some(activity) = self.translator.translate(record) {
                    if matches!(activity.details, ActivityDetails::PcSample(_)) {
                        samples += 1;
                    }
                    self.handler.on_activity(activity);
                }
            }
            samples
        }));
        match outcome {
            Ok(samples) => samples,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!("activity buffer abandoned: {}", GpuError::CallbackPanicked(message));
                0
            }
        }
    }

    /// Run `submit` with `id` pushed as the external correlation id
    fn correlated(&self, op: &'static str, id: CorrelationId, submit: impl FnOnce() -> CuptiResult) -> Result<(), GpuError> {
        check(
            "push_external_correlation_id",
            self.runtime
                .push_external_correlation_id(EXTERNAL_KIND_CUSTOM0, id.get()),
        )?;
        let result = check(op, submit());
        match self.runtime.pop_external_correlation_id(EXTERNAL_KIND_CUSTOM0) {
            Ok(popped) if popped != id.get() => {
                warn!("external correlation stack out of sync: pushed {}, popped {}", id, popped);
            }
            Ok(_) => {}
            Err(code) => warn!("{}", GpuError::vendor(BACKEND, "pop_external_correlation_id", code)),
        }
        result
    }
}

impl<R: CuptiRuntime> GpuBackend for CuptiBackend<R> {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn submit_kernel(&self, launch: &KernelLaunch) -> Result<(), GpuError> {
        self.correlated("launch_kernel", launch.correlation_id, || self.runtime.launch_kernel(launch))
    }

    fn submit_copy(&self, copy: &CopyRequest) -> Result<(), GpuError> {
        self.correlated("memcpy", copy.correlation_id, || self.runtime.memcpy(copy))
    }

    fn submit_alloc(&self, alloc: &AllocRequest) -> Result<(), GpuError> {
        self.correlated("mem_alloc", alloc.correlation_id, || self.runtime.mem_alloc(alloc))
    }

    fn supports_pc_sampling(&self) -> bool {
        true
    }

    fn pc_sampling_enable(&self, context: ContextHandle) -> Result<(), GpuError> {
        check("pc_sampling_enable", self.runtime.pc_sampling_enable(context))
    }

    fn pc_sampling_start(&self, context: ContextHandle) -> Result<(), GpuError> {
        check("pc_sampling_start", self.runtime.pc_sampling_start(context))
    }

    fn pc_sampling_stop(&self, context: ContextHandle) -> Result<(), GpuError> {
        check("pc_sampling_stop", self.runtime.pc_sampling_stop(context))
    }

    fn pc_sampling_collect(&self, context: ContextHandle) -> Result<usize, GpuError> {
        let records = self
            .runtime
            .pc_sampling_get_data(context)
            .map_err(|code| GpuError::vendor(BACKEND, "pc_sampling_get_data", code))?;
        Ok(self.buffer_completed(records))
    }

    fn flush(&self) -> Result<(), GpuError> {
        check("activity_flush_all", self.runtime.activity_flush_all())
    }
}
