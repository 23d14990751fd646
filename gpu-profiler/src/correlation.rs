//! Correlation ids and the maps that join completions back to submissions
//!
//! Two levels: the vendor runtime numbers its own operations (native id);
//! an external-correlation record binds that to the host [`CorrelationId`]
//! handed out at submission; the host id keys the [`HostOpEntry`] holding the
//! calling-context placeholders the completion is attributed into.

use crate::channel::ActivityChannel;
use crate::splay::SharedSplayMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stride_shared::{CctNodeId, CorrelationId, NativeCorrelationId};
use tracing::trace;

/// Process-wide correlation id source. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ids handed out so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Calling-context slots a host operation can attribute into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    Kernel,
    Copy,
    CopyIn,
    CopyOut,
    Alloc,
}

impl Placeholder {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placeholders([Option<CctNodeId>; Placeholder::COUNT]);

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: Placeholder, node: CctNodeId) -> Self {
        self.set(slot, node);
        self
    }

    pub fn set(&mut self, slot: Placeholder, node: CctNodeId) {
        self.0[slot.index()] = Some(node);
    }

    pub fn get(&self, slot: Placeholder) -> Option<CctNodeId> {
        self.0[slot.index()]
    }
}

/// Submission-side state of one host operation
#[derive(Debug, Clone)]
pub struct HostOpEntry {
    pub placeholders: Placeholders,
    /// Channel of the submitting thread; completions for this op go there
    pub channel: Arc<ActivityChannel>,
    pub cpu_submit_time: u64,
    /// PC sampling was active when the op was launched
    pub expects_pc_samples: bool,
    pub kernel_done: bool,
    pub samples_seen: u64,
    /// Set by the PC-sampling summary record
    pub samples_expected: Option<u64>,
}

impl HostOpEntry {
    pub fn new(placeholders: Placeholders, channel: Arc<ActivityChannel>, cpu_submit_time: u64) -> Self {
        Self {
            placeholders,
            channel,
            cpu_submit_time,
            expects_pc_samples: false,
            kernel_done: false,
            samples_seen: 0,
            samples_expected: None,
        }
    }

    pub fn with_pc_samples(mut self, expects: bool) -> Self {
        self.expects_pc_samples = expects;
        self
    }

    /// All PC samples announced by the summary have arrived
    pub fn samples_complete(&self) -> bool {
        matches!(self.samples_expected, Some(expected) if self.samples_seen >= expected)
    }

    /// Nothing further will arrive for this op
    pub fn is_retirable(&self) -> bool {
        self.kernel_done && (!self.expects_pc_samples || self.samples_complete())
    }
}

/// Native id -> host id
#[derive(Debug, Default)]
pub struct CorrelationIdMap {
    map: SharedSplayMap<NativeCorrelationId, CorrelationId>,
}

impl CorrelationIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `native` to `host`, replacing an earlier binding
    pub fn insert_or_replace(&self, native: NativeCorrelationId, host: CorrelationId) {
        self.map.upsert_with(native, || host, |bound| *bound = host);
        trace!("correlation bind: native {} -> host {}", native, host);
    }

    pub fn lookup(&self, native: NativeCorrelationId) -> Option<CorrelationId> {
        self.map.lookup_with(&native, |host| *host)
    }

    pub fn delete(&self, native: NativeCorrelationId) -> Option<CorrelationId> {
        self.map.delete(&native)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Host id -> host operation
#[derive(Debug, Default)]
pub struct HostCorrelationMap {
    map: SharedSplayMap<CorrelationId, HostOpEntry>,
}

impl HostCorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a submission. Returns false if the id was already present.
    pub fn insert(&self, id: CorrelationId, entry: HostOpEntry) -> bool {
        self.map.insert(id, entry)
    }

    /// Target channel and placeholder node for a completion of `id`
    pub fn route(&self, id: CorrelationId, slot: Placeholder) -> Option<(Arc<ActivityChannel>, Option<CctNodeId>)> {
        self.map
            .lookup_with(&id, |entry| (entry.channel.clone(), entry.placeholders.get(slot)))
    }

    pub fn lookup_with<R>(&self, id: CorrelationId, f: impl FnOnce(&mut HostOpEntry) -> R) -> Option<R> {
        self.map.lookup_with(&id, f)
    }

    /// Mark the kernel record as seen; returns whether the op can be retired.
    pub fn complete_kernel(&self, id: CorrelationId) -> Option<bool> {
        self.map.lookup_with(&id, |entry| {
            entry.kernel_done = true;
            entry.is_retirable()
        })
    }

    /// Count `samples` PC samples; returns whether the op can be retired.
    pub fn record_pc_samples(&self, id: CorrelationId, samples: u64) -> Option<bool> {
        self.map.lookup_with(&id, |entry| {
            entry.samples_seen += samples;
            entry.is_retirable()
        })
    }

    /// Store the sample count announced by the summary record; returns
    /// whether the op can be retired.
    pub fn set_samples_expected(&self, id: CorrelationId, expected: u64) -> Option<bool> {
        self.map.lookup_with(&id, |entry| {
            entry.samples_expected = Some(expected);
            entry.is_retirable()
        })
    }

    pub fn delete(&self, id: CorrelationId) -> Option<HostOpEntry> {
        self.map.delete(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
