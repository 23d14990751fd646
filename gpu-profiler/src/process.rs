//! Completion-side processing
//!
//! Backends hand every vendor record to a [`CompletionHandler`] on their own
//! runtime thread. [`ActivityProcessor`] resolves the record to the host
//! operation it belongs to, picks the calling-context node it is attributed
//! into and pushes it onto the submitting thread's channel.
//!
//! A record whose ids were never submitted is dropped quietly.

use crate::activity::{ActivityDetails, CopyKind, GpuActivity};
use crate::cct::CallingContextTree;
use crate::correlation::{CorrelationIdMap, HostCorrelationMap, Placeholder};
use crate::telemetry;
use std::sync::Arc;
use stride_shared::{CorrelationId, NativeCorrelationId};
use tracing::{trace, warn};

/// Receives completed vendor records; runs on the backend's callback thread
pub trait CompletionHandler: Send + Sync {
    fn on_activity(&self, activity: GpuActivity);
}

pub struct ActivityProcessor {
    native: CorrelationIdMap,
    host: Arc<HostCorrelationMap>,
    cct: Arc<dyn CallingContextTree>,
}

impl ActivityProcessor {
    pub fn new(host: Arc<HostCorrelationMap>, cct: Arc<dyn CallingContextTree>) -> Self {
        Self {
            native: CorrelationIdMap::new(),
            host,
            cct,
        }
    }

    pub fn host_map(&self) -> &Arc<HostCorrelationMap> {
        &self.host
    }

    /// Native ids still waiting for completion records
    pub fn pending_native(&self) -> usize {
        self.native.len()
    }

    pub fn process(&self, mut activity: GpuActivity) {
        let native = activity.native_correlation_id;
        match &activity.details {
            ActivityDetails::ExternalCorrelation(ext) => {
                self.native.insert_or_replace(native, ext.host_correlation_id);
            }
            ActivityDetails::Kernel(_) => {
                let Some(host) = self.resolve(native) else { return };
                if self.deliver(activity, host, Placeholder::Kernel) {
                    if let Some(true) = self.host.complete_kernel(host) {
                        self.retire(native, host);
                    }
                }
            }
            ActivityDetails::Memcpy(copy) => {
                let Some(host) = self.resolve(native) else { return };
                let slot = match copy.kind {
                    CopyKind::HostToDevice => Placeholder::CopyIn,
                    CopyKind::DeviceToHost => Placeholder::CopyOut,
                    _ => Placeholder::Copy,
                };
                self.deliver(activity, host, slot);
                self.retire(native, host);
            }
            ActivityDetails::MemoryAlloc(_) => {
                let Some(host) = self.resolve(native) else { return };
                self.deliver(activity, host, Placeholder::Alloc);
                self.retire(native, host);
            }
            ActivityDetails::PcSample(sample) => {
                let Some(host) = self.resolve(native) else { return };
                let Some((channel, Some(kernel))) = self.host.route(host, Placeholder::Kernel) else {
                    trace!("pc sample for {} without kernel placeholder", host);
                    return;
                };
                let samples = u64::from(sample.samples);
                activity.correlation_id = host;
                activity.cct_node = Some(self.cct.insert_ip_norm(kernel, sample.pc, false));
                channel.produce(activity);
                if let Some(true) = self.host.record_pc_samples(host, samples) {
                    self.retire(native, host);
                }
            }
            ActivityDetails::PcSamplingInfo(info) => {
                let Some(host) = self.resolve(native) else { return };
                let expected = info.total_samples.saturating_sub(info.dropped_samples);
                if self.deliver(activity, host, Placeholder::Kernel) {
                    if let Some(true) = self.host.set_samples_expected(host, expected) {
                        self.retire(native, host);
                    }
                }
            }
            ActivityDetails::Flush(_) => {
                warn!("flush record arrived from a backend; ignored");
            }
        }
    }

    fn resolve(&self, native: NativeCorrelationId) -> Option<CorrelationId> {
        let host = self.native.lookup(native);
        if host.is_none() {
            trace!("no host correlation for native id {}", native);
            telemetry::CORRELATION_MISSES.inc();
        }
        host
    }

    /// Attach the placeholder and push onto the owner's channel. A missing
    /// placeholder falls back to the generic copy slot.
    fn deliver(&self, mut activity: GpuActivity, host: CorrelationId, slot: Placeholder) -> bool {
        let Some((channel, node)) = self.host.route(host, slot) else {
            trace!("host correlation {} not registered", host);
            telemetry::CORRELATION_MISSES.inc();
            return false;
        };
        let node = match node {
            Some(node) => Some(node),
            None => self.host.route(host, Placeholder::Copy).and_then(|(_, n)| n),
        };
        activity.correlation_id = host;
        activity.cct_node = node;
        channel.produce(activity);
        true
    }

    fn retire(&self, native: NativeCorrelationId, host: CorrelationId) {
        self.native.delete(native);
        self.host.delete(host);
        trace!("retired host correlation {} (native {})", host, native);
    }
}

impl CompletionHandler for ActivityProcessor {
    fn on_activity(&self, activity: GpuActivity) {
        self.process(activity);
    }
}
