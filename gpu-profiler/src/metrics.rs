//! Per-node GPU metrics
//!
//! [`MetricStore`] is the attribution sink the multiplexer feeds: every
//! completed record lands on the calling-context node the processor resolved
//! for it.

use crate::activity::{ActivityDetails, CopyKind, GpuActivity};
use serde::Serialize;
use std::collections::BTreeMap;
use stride_shared::CctNodeId;
use tracing::trace;

/// Receives completed records from the multiplexer
pub trait AttributionSink: Send + Sync {
    fn attribute(&self, activity: &GpuActivity);
}

/// Accumulated metrics of one calling-context node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub kernel_count: u64,
    pub kernel_time_ns: u64,
    pub copy_count: u64,
    /// Indexed by [`CopyKind::index`]
    pub copy_bytes: [u64; 5],
    pub copy_time_ns: [u64; 5],
    pub alloc_count: u64,
    pub alloc_bytes: u64,
    /// Instruction samples scaled by the sampling period
    pub pc_samples: u64,
    /// Stall reason index -> latency samples
    pub stall_samples: BTreeMap<u32, u64>,
    pub latency_samples: u64,
    pub sampling_total: u64,
    pub sampling_dropped: u64,
    pub sampling_full_sm: u64,
}

impl NodeMetrics {
    pub fn copy_bytes_total(&self) -> u64 {
        self.copy_bytes.iter().sum()
    }

    pub fn gpu_time_ns(&self) -> u64 {
        self.kernel_time_ns + self.copy_time_ns.iter().sum::<u64>()
    }

    /// Samples the hardware reported minus the ones it dropped
    pub fn sampling_expected(&self) -> u64 {
        self.sampling_total.saturating_sub(self.sampling_dropped)
    }
}

/// Aggregate GPU metrics, keyed by calling-context node
#[derive(Debug)]
pub struct MetricStore {
    nodes: spin::Mutex<BTreeMap<CctNodeId, NodeMetrics>>,
    sample_period: u64,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::with_sample_period(1)
    }

    /// Scale each PC sample by `sample_period` instructions
    pub fn with_sample_period(sample_period: u64) -> Self {
        Self {
            nodes: spin::Mutex::new(BTreeMap::new()),
            sample_period: sample_period.max(1),
        }
    }

    pub fn node(&self, node: CctNodeId) -> Option<NodeMetrics> {
        self.nodes.lock().get(&node).cloned()
    }

    /// Every node with at least one attribution, in node order
    pub fn snapshot(&self) -> Vec<(CctNodeId, NodeMetrics)> {
        self.nodes
            .lock()
            .iter()
            .map(|(node, metrics)| (*node, metrics.clone()))
            .collect()
    }

    /// Get total GPU time
    pub fn total_gpu_time_ns(&self) -> u64 {
        self.nodes.lock().values().map(NodeMetrics::gpu_time_ns).sum()
    }

    /// Get kernel execution count
    pub fn kernel_count(&self) -> u64 {
        self.nodes.lock().values().map(|m| m.kernel_count).sum()
    }

    pub fn copy_count(&self) -> u64 {
        self.nodes.lock().values().map(|m| m.copy_count).sum()
    }

    pub fn pc_samples(&self) -> u64 {
        self.nodes.lock().values().map(|m| m.pc_samples).sum()
    }

    /// Total bytes moved per copy direction
    pub fn copy_bytes_by_kind(&self) -> Vec<(CopyKind, u64)> {
        let nodes = self.nodes.lock();
        CopyKind::ALL
            .iter()
            .map(|kind| {
                let bytes = nodes.values().map(|m| m.copy_bytes[kind.index()]).sum();
                (*kind, bytes)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributionSink for MetricStore {
    fn attribute(&self, activity: &GpuActivity) {
        let Some(node) = activity.cct_node else {
            trace!("unattributed {} record dropped", activity.kind().as_str());
            return;
        };
        let mut nodes = self.nodes.lock();
        let metrics = nodes.entry(node).or_default();
        match &activity.details {
            ActivityDetails::Kernel(kernel) => {
                metrics.kernel_count += 1;
                metrics.kernel_time_ns += kernel.interval.duration_ns();
            }
            ActivityDetails::Memcpy(copy) => {
                metrics.copy_count += 1;
                metrics.copy_bytes[copy.kind.index()] += copy.bytes;
                metrics.copy_time_ns[copy.kind.index()] += copy.interval.duration_ns();
            }
            ActivityDetails::MemoryAlloc(alloc) => {
                metrics.alloc_count += 1;
                metrics.alloc_bytes += alloc.bytes;
            }
            ActivityDetails::PcSample(sample) => {
                metrics.pc_samples += u64::from(sample.samples) * self.sample_period;
                if let Some(reason) = sample.stall_reason {
                    *metrics.stall_samples.entry(reason).or_default() += u64::from(sample.latency_samples);
                }
                metrics.latency_samples += u64::from(sample.latency_samples);
            }
            ActivityDetails::PcSamplingInfo(info) => {
                metrics.sampling_total += info.total_samples;
                metrics.sampling_dropped += info.dropped_samples;
                metrics.sampling_full_sm += info.full_sm_samples;
            }
            ActivityDetails::ExternalCorrelation(_) | ActivityDetails::Flush(_) => {}
        }
    }
}
