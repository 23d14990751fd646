//! Activity channels
//!
//! Each application thread owns one outbound channel. Completion callbacks
//! for operations that thread submitted push finished records onto it; the
//! multiplexer drains it. Records of one channel come out in push order.
//!
//! A channel is two queues: the producer appends to `pending`, the consumer
//! swaps `pending` with its private `draining` queue and works through that
//! without holding the producer lock. Both queues keep their storage, so once
//! a channel has seen its peak number of in-flight records it stops
//! allocating.

use crate::activity::GpuActivity;
use crate::latch::SpinWait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

static NEXT_CHANNEL_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub struct ActivityChannel {
    id: usize,
    /// OS thread id of the owning application thread
    owner: i64,
    pending: spin::Mutex<VecDeque<GpuActivity>>,
    draining: spin::Mutex<VecDeque<GpuActivity>>,
    produced: AtomicU64,
    consumed: AtomicU64,
}

impl ActivityChannel {
    pub fn new(owner: i64) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            pending: spin::Mutex::new(VecDeque::new()),
            draining: spin::Mutex::new(VecDeque::new()),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn owner(&self) -> i64 {
        self.owner
    }

    /// Append a completed record. Called from completion-callback threads.
    pub fn produce(&self, activity: GpuActivity) {
        trace!("channel {}: produce {}", self.id, activity.kind().as_str());
        self.pending.lock().push_back(activity);
        self.produced.fetch_add(1, Ordering::Release);
    }

    /// Hand every queued record to `f`, oldest first. Returns the count.
    pub fn consume(&self, mut f: impl FnMut(GpuActivity)) -> usize {
        let mut batch = self.draining.lock();
        std::mem::swap(&mut *self.pending.lock(), &mut *batch);
        let count = batch.len();
        while let Some(activity) = batch.pop_front() {
            f(activity);
            self.consumed.fetch_add(1, Ordering::Release);
        }
        count
    }

    /// Push a flush record and spin until the multiplexer has processed it.
    ///
    /// Everything this channel carried before the call is attributed when
    /// this returns. Requires a multiplexer running on another thread.
    pub fn flush_and_wait(&self, spin: &SpinWait) {
        let (record, token) = GpuActivity::flush();
        debug!("channel {}: flush requested", self.id);
        self.produce(record);
        token.wait(spin);
        debug!("channel {}: flush complete", self.id);
    }

    /// Records waiting for the multiplexer
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }
}

/// All live channels, in registration order
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: spin::Mutex<Vec<Arc<ActivityChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: i64) -> Arc<ActivityChannel> {
        let channel = Arc::new(ActivityChannel::new(owner));
        debug!("channel {} registered for thread {}", channel.id(), owner);
        self.channels.lock().push(channel.clone());
        channel
    }

    /// Remove a channel. Records still queued on it are left to the caller.
    pub fn unregister(&self, channel: &Arc<ActivityChannel>) -> bool {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|c| !Arc::ptr_eq(c, channel));
        before != channels.len()
    }

    /// Copy the current channel list into `out` (reusing its storage)
    pub fn snapshot_into(&self, out: &mut Vec<Arc<ActivityChannel>>) {
        out.clear();
        out.extend(self.channels.lock().iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
