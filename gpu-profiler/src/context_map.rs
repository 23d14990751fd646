//! GPU context map
//!
//! Maps an opaque vendor context handle to the per-context state the PC
//! sampling machinery needs. Context creation and PC-sampling configuration
//! are rare next to kernel launches, so one spinlock covers the whole map.

use crate::splay::SharedSplayMap;
use std::sync::atomic::{AtomicU32, Ordering};
use stride_shared::{ContextHandle, ContextId};
use tracing::{debug, trace};

/// One stall reason as reported by the vendor runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReason {
    pub index: u32,
    pub name: String,
}

/// PC-sampling configuration of one context
#[derive(Debug, Clone, Default)]
pub struct PcSamplingConfig {
    pub enabled: bool,
    pub stall_reasons: Vec<StallReason>,
    /// Capacity of the sampling-data buffer, in PC records
    pub buffer_capacity: usize,
    /// Hardware sampling period exponent
    pub sample_period: u32,
}

impl PcSamplingConfig {
    pub fn stall_reason_name(&self, index: u32) -> Option<&str> {
        self.stall_reasons
            .iter()
            .find(|r| r.index == index)
            .map(|r| r.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub id: ContextId,
    pub handle: ContextHandle,
    pub pc_sampling: PcSamplingConfig,
}

/// Context handle -> context state
#[derive(Debug)]
pub struct ContextMap {
    entries: SharedSplayMap<ContextHandle, ContextEntry>,
    next_id: AtomicU32,
}

impl ContextMap {
    pub fn new() -> Self {
        Self {
            entries: SharedSplayMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Register `handle` if it is new and return its normalized id.
    pub fn init(&self, handle: ContextHandle) -> ContextId {
        self.entries.upsert_with(
            handle,
            || {
                let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
                debug!("context {:#x}: registered as {}", handle.0, id);
                ContextEntry {
                    id,
                    handle,
                    pc_sampling: PcSamplingConfig::default(),
                }
            },
            |entry| entry.id,
        )
    }

    pub fn lookup(&self, handle: ContextHandle) -> Option<ContextEntry> {
        let found = self.entries.lookup_with(&handle, |entry| entry.clone());
        trace!("context map lookup: {:#x} -> {:?}", handle.0, found.as_ref().map(|e| e.id));
        found
    }

    pub fn context_id(&self, handle: ContextHandle) -> Option<ContextId> {
        self.entries.lookup_with(&handle, |entry| entry.id)
    }

    pub fn stall_reasons_update(&self, handle: ContextHandle, reasons: Vec<StallReason>) -> bool {
        self.entries
            .lookup_with(&handle, |entry| entry.pc_sampling.stall_reasons = reasons)
            .is_some()
    }

    pub fn buffer_update(&self, handle: ContextHandle, capacity: usize, sample_period: u32) -> bool {
        self.entries
            .lookup_with(&handle, |entry| {
                entry.pc_sampling.buffer_capacity = capacity;
                entry.pc_sampling.sample_period = sample_period;
            })
            .is_some()
    }

    pub fn pc_sampling_enabled_update(&self, handle: ContextHandle, enabled: bool) -> bool {
        self.entries
            .lookup_with(&handle, |entry| entry.pc_sampling.enabled = enabled)
            .is_some()
    }

    pub fn pc_sampling(&self, handle: ContextHandle) -> Option<PcSamplingConfig> {
        self.entries
            .lookup_with(&handle, |entry| entry.pc_sampling.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ContextMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let map = ContextMap::new();
        let a = map.init(ContextHandle(0x7f00));
        let b = map.init(ContextHandle(0x7e00));
        assert_ne!(a, b);
        assert_eq!(map.init(ContextHandle(0x7f00)), a);
        assert_eq!(map.len(), 2);
        assert_eq!(map.context_id(ContextHandle(0x7e00)), Some(b));
    }

    #[test]
    fn test_updates_require_registered_context() {
        let map = ContextMap::new();
        let handle = ContextHandle(1);
        assert!(!map.pc_sampling_enabled_update(handle, true));
        assert!(map.lookup(handle).is_none());

        map.init(handle);
        assert!(map.pc_sampling_enabled_update(handle, true));
        assert!(map.buffer_update(handle, 4096, 5));
        assert!(map.stall_reasons_update(
            handle,
            vec![
                StallReason { index: 0, name: "none".into() },
                StallReason { index: 7, name: "memory_dependency".into() },
            ],
        ));

        let cfg = map.pc_sampling(handle).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.buffer_capacity, 4096);
        assert_eq!(cfg.stall_reason_name(7), Some("memory_dependency"));
        assert_eq!(cfg.stall_reason_name(3), None);
    }
}
