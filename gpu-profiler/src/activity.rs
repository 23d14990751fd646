//! GPU activity records
//!
//! A [`GpuActivity`] is what travels from the completion callback to the
//! multiplexer. The kind-specific payload is an enum so that every dispatch
//! site is checked for exhaustiveness.

use crate::latch::SpinWait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stride_shared::{CctNodeId, ContextId, CorrelationId, IpNormalized, NativeCorrelationId, RangeId};

/// Device-clock interval, in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Zero for inverted intervals (clock skew between engines happens)
    pub fn duration_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    HostToHost,
    Unknown,
}

impl CopyKind {
    pub const ALL: [CopyKind; 5] = [
        CopyKind::HostToDevice,
        CopyKind::DeviceToHost,
        CopyKind::DeviceToDevice,
        CopyKind::HostToHost,
        CopyKind::Unknown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CopyKind::HostToDevice => "htod",
            CopyKind::DeviceToHost => "dtoh",
            CopyKind::DeviceToDevice => "dtod",
            CopyKind::HostToHost => "htoh",
            CopyKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Device,
    Pinned,
    Managed,
    Pageable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelActivity {
    pub device_id: u32,
    pub stream_id: u32,
    pub interval: Interval,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub static_shared_memory: u32,
    pub dynamic_shared_memory: u32,
    pub local_memory_total: u32,
    pub registers_per_thread: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcpyActivity {
    pub kind: CopyKind,
    pub bytes: u64,
    pub device_id: u32,
    pub stream_id: u32,
    pub interval: Interval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAllocActivity {
    pub kind: MemoryKind,
    pub bytes: u64,
    pub device_id: u32,
    pub interval: Interval,
}

/// One aggregated PC sample: `samples` hits at `pc`, of which
/// `latency_samples` were stalled for `stall_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcSampleActivity {
    pub pc: IpNormalized,
    pub stall_reason: Option<u32>,
    pub samples: u32,
    pub latency_samples: u32,
}

/// Per-kernel PC-sampling summary; the last record for a kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcSamplingInfoActivity {
    pub total_samples: u64,
    pub dropped_samples: u64,
    pub full_sm_samples: u64,
    pub sample_period: u32,
}

/// Binds a native correlation id to the host correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalCorrelationActivity {
    pub host_correlation_id: CorrelationId,
}

/// Completion flag carried by a flush record.
///
/// The multiplexer sets it once every record pushed before the flush has been
/// attributed.
#[derive(Debug, Clone, Default)]
pub struct FlushToken(Arc<AtomicBool>);

impl FlushToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn wait(&self, spin: &SpinWait) {
        spin.wait_until("activity flush", || self.is_complete());
    }
}

#[derive(Debug, Clone)]
pub enum ActivityDetails {
    Kernel(KernelActivity),
    Memcpy(MemcpyActivity),
    MemoryAlloc(MemoryAllocActivity),
    PcSample(PcSampleActivity),
    PcSamplingInfo(PcSamplingInfoActivity),
    ExternalCorrelation(ExternalCorrelationActivity),
    Flush(FlushToken),
}

/// Payload-free discriminant, for logging and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Kernel,
    Memcpy,
    MemoryAlloc,
    PcSample,
    PcSamplingInfo,
    ExternalCorrelation,
    Flush,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Kernel => "kernel",
            ActivityKind::Memcpy => "memcpy",
            ActivityKind::MemoryAlloc => "memory_alloc",
            ActivityKind::PcSample => "pc_sample",
            ActivityKind::PcSamplingInfo => "pc_sampling_info",
            ActivityKind::ExternalCorrelation => "external_correlation",
            ActivityKind::Flush => "flush",
        }
    }
}

/// A completed GPU operation (or a control record)
#[derive(Debug, Clone)]
pub struct GpuActivity {
    /// Id assigned by the vendor runtime
    pub native_correlation_id: NativeCorrelationId,
    /// Host id, filled in once the native id is resolved
    pub correlation_id: CorrelationId,
    pub context_id: ContextId,
    pub range_id: RangeId,
    /// Calling-context leaf to attribute into; set by the processor
    pub cct_node: Option<CctNodeId>,
    pub details: ActivityDetails,
}

impl GpuActivity {
    pub fn new(native_correlation_id: NativeCorrelationId, context_id: ContextId, details: ActivityDetails) -> Self {
        Self {
            native_correlation_id,
            correlation_id: CorrelationId::NONE,
            context_id,
            range_id: RangeId::DEFAULT,
            cct_node: None,
            details,
        }
    }

    pub fn external_correlation(native: NativeCorrelationId, host: CorrelationId) -> Self {
        Self::new(
            native,
            ContextId(0),
            ActivityDetails::ExternalCorrelation(ExternalCorrelationActivity {
                host_correlation_id: host,
            }),
        )
    }

    /// A flush record and the token the producer waits on
    pub fn flush() -> (Self, FlushToken) {
        let token = FlushToken::new();
        let record = Self::new(0, ContextId(0), ActivityDetails::Flush(token.clone()));
        (record, token)
    }

    pub fn kind(&self) -> ActivityKind {
        match &self.details {
            ActivityDetails::Kernel(_) => ActivityKind::Kernel,
            ActivityDetails::Memcpy(_) => ActivityKind::Memcpy,
            ActivityDetails::MemoryAlloc(_) => ActivityKind::MemoryAlloc,
            ActivityDetails::PcSample(_) => ActivityKind::PcSample,
            ActivityDetails::PcSamplingInfo(_) => ActivityKind::PcSamplingInfo,
            ActivityDetails::ExternalCorrelation(_) => ActivityKind::ExternalCorrelation,
            ActivityDetails::Flush(_) => ActivityKind::Flush,
        }
    }
}
