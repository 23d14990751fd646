//! Range coordinator
//!
//! Every kernel launch is bracketed by [`RangeThread::range_enter`] and
//! [`RangeThread::range_exit`]. Between them the installed policy decides
//! which range the launch belongs to and whether PC sampling has to be
//! started, stopped or collected around it.
//!
//! Range transitions are driven by a single lead thread. A thread that wants
//! to lead claims `lead_correlation_id` by swapping in its own correlation id
//! once the slot is empty; it releases the slot at the end of its exit.
//! Threads that entered while a lead was active wait in their exit until
//! that lead is gone, so none of them leaves its bracket in the middle of a
//! transition.
//!
//! `count_lock` covers only the enter count and the lead claim. Policy
//! callbacks, and the vendor PC-sampling calls they make, run outside it, so
//! a slow collect holds up the next lead but not plain launches.
//!
//! The generic bracket knows nothing about modes: backends plug a mode in
//! through the four callback registration points (see [`policy::install`]).

pub mod policy;
pub mod thread_list;

pub use thread_list::{RangeNotification, RangeThreadEntry, RangeThreadList};

use crate::channel::{ActivityChannel, ChannelRegistry};
use crate::config::{RangeConfig, RangeMode};
use crate::correlation::CorrelationIdGenerator;
use crate::error::GpuError;
use crate::ip_norm_map::{GlobalIpNormMap, IpNormKey, IpNormMap};
use crate::latch::SpinWait;
use crate::telemetry;
use crate::trie::RangeTrie;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use stride_shared::utils::thread::os_thread_id;
use stride_shared::{CctNodeId, ContextHandle, ContextId, CorrelationId, IpNormalized, RangeId};
use tracing::{debug, info, trace};

/// Where a kernel is launched from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSite {
    /// Calling-context node of the launching API call
    pub api_node: CctNodeId,
    pub context: ContextId,
    pub handle: ContextHandle,
    /// Kernel entry point
    pub kernel: IpNormalized,
}

impl LaunchSite {
    pub fn key(&self) -> IpNormKey {
        IpNormKey::new(self.kernel, self.api_node)
    }
}

/// Hand-off between a policy's pre-enter and post-enter callbacks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnterScratch {
    /// The launch opens a new range
    pub open_range: bool,
    /// Range to attribute the launch to instead of the current one
    pub adopt: Option<RangeId>,
    /// Record the launch's range on the trie step just appended
    pub stamp: bool,
    /// This is the thread's first launch
    pub first: bool,
}

/// Per-thread state the policies work on. Only the owning thread touches it.
#[derive(Debug)]
pub struct ThreadRangeState {
    pub trie: RangeTrie,
    pub ip_norm: IpNormMap,
    /// The last trie step was created (not replayed) by this thread
    pub extending_new: bool,
    pub last_context: Option<ContextId>,
    /// Range boundaries this thread has crossed
    pub boundaries: u64,
    /// No launch of this thread has been placed in a range yet
    pub first_range: bool,
    pub scratch: EnterScratch,
}

impl ThreadRangeState {
    fn new(config: &RangeConfig) -> Self {
        Self {
            trie: RangeTrie::new(config.trie_compress_threshold),
            ip_norm: IpNormMap::new(),
            extending_new: false,
            last_context: None,
            boundaries: 0,
            first_range: true,
            scratch: EnterScratch::default(),
        }
    }

    /// Close the current path and forget the launch sites seen on it
    pub fn boundary(&mut self, context: ContextId, active: bool) -> RangeId {
        self.boundaries += 1;
        self.extending_new = false;
        self.ip_norm.clear();
        self.trie.flush(context, active, false)
    }
}

/// What a callback sees of the launch being bracketed
pub struct RangeCallContext<'a> {
    pub coordinator: &'a RangeCoordinator,
    pub thread: ThreadId,
    pub state: &'a mut ThreadRangeState,
    pub correlation_id: CorrelationId,
    /// 1-based position of this launch among all range enters
    pub ordinal: u64,
    pub site: LaunchSite,
    pub is_lead: bool,
    /// Range the launch is attributed to; post-enter callbacks may change it
    pub range_id: RangeId,
}

/// Pre-enter returns "wants to lead"; post-enter returns "begins a range";
/// post-exit returns "flush PC samples now".
pub type EnterCallback = Box<dyn Fn(&mut RangeCallContext<'_>) -> bool + Send + Sync>;
pub type ExitCallback = Box<dyn Fn(&mut RangeCallContext<'_>) + Send + Sync>;
pub type LastCallback = Box<dyn Fn(&RangeCoordinator) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    pre_enter: Option<EnterCallback>,
    post_enter: Option<EnterCallback>,
    pre_exit: Option<ExitCallback>,
    post_exit: Option<EnterCallback>,
    last: Option<LastCallback>,
}

pub struct RangeCoordinator {
    config: RangeConfig,
    mode: RangeMode,
    correlation: CorrelationIdGenerator,
    channels: Arc<ChannelRegistry>,
    count_lock: spin::Mutex<()>,
    enters: AtomicU64,
    range_id: AtomicU32,
    first_range: AtomicBool,
    ranges_opened: AtomicU64,
    lead_correlation_id: AtomicU64,
    spin: SpinWait,
    threads: RangeThreadList,
    global_ip_norm: GlobalIpNormMap,
    callbacks: spin::RwLock<Callbacks>,
    rng: spin::Mutex<StdRng>,
    finished: AtomicBool,
}

impl RangeCoordinator {
    /// `mode` is the resolved mode (see [`RangeConfig::resolve`])
    pub fn new(config: RangeConfig, mode: RangeMode, channels: Arc<ChannelRegistry>) -> Arc<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let spin = SpinWait::new(Duration::from_millis(config.lead_wait_warn_ms));
        info!("range profiling: mode {}", mode);
        Arc::new(Self {
            config,
            mode,
            correlation: CorrelationIdGenerator::new(),
            channels,
            count_lock: spin::Mutex::new(()),
            enters: AtomicU64::new(0),
            range_id: AtomicU32::new(RangeId::DEFAULT.get()),
            first_range: AtomicBool::new(true),
            ranges_opened: AtomicU64::new(0),
            lead_correlation_id: AtomicU64::new(0),
            spin,
            threads: RangeThreadList::new(),
            global_ip_norm: GlobalIpNormMap::new(),
            callbacks: spin::RwLock::new(Callbacks::default()),
            rng: spin::Mutex::new(rng),
            finished: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    pub fn mode(&self) -> RangeMode {
        self.mode
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn threads(&self) -> &RangeThreadList {
        &self.threads
    }

    pub fn global_ip_norm(&self) -> &GlobalIpNormMap {
        &self.global_ip_norm
    }

    pub fn spin(&self) -> &SpinWait {
        &self.spin
    }

    /// Correlation id for an operation submitted outside a range bracket
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.correlation.next()
    }

    pub fn correlation_ids_issued(&self) -> u64 {
        self.correlation.issued()
    }

    pub fn range_id(&self) -> RangeId {
        RangeId(self.range_id.load(Ordering::Acquire))
    }

    /// Ranges opened by leads so far
    pub fn ranges_opened(&self) -> u64 {
        self.ranges_opened.load(Ordering::Relaxed)
    }

    /// Correlation id of the current lead, if any
    pub fn lead(&self) -> Option<CorrelationId> {
        match self.lead_correlation_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(CorrelationId(id)),
        }
    }

    /// Open the next range. The first range of the process keeps
    /// [`RangeId::DEFAULT`]. Lead only.
    pub fn advance_range(&self) -> RangeId {
        let range = if self.first_range.swap(false, Ordering::AcqRel) {
            self.range_id()
        } else {
            RangeId(self.range_id.fetch_add(1, Ordering::AcqRel) + 1)
        };
        self.opened(range);
        range
    }

    /// Open the next range without the first-range exemption. Lead only.
    pub fn next_range(&self) -> RangeId {
        self.first_range.store(false, Ordering::Release);
        let range = RangeId(self.range_id.fetch_add(1, Ordering::AcqRel) + 1);
        self.opened(range);
        range
    }

    fn opened(&self, range: RangeId) {
        self.ranges_opened.fetch_add(1, Ordering::Relaxed);
        telemetry::RANGES_OPENED
            .with_label_values(&[self.mode.as_str()])
            .inc();
        debug!("range {} opened", range);
    }

    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rng.lock())
    }

    pub fn pre_enter_callback_register(&self, callback: EnterCallback) {
        self.callbacks.write().pre_enter = Some(callback);
    }

    pub fn post_enter_callback_register(&self, callback: EnterCallback) {
        self.callbacks.write().post_enter = Some(callback);
    }

    pub fn pre_exit_callback_register(&self, callback: ExitCallback) {
        self.callbacks.write().pre_exit = Some(callback);
    }

    pub fn post_exit_callback_register(&self, callback: EnterCallback) {
        self.callbacks.write().post_exit = Some(callback);
    }

    pub fn last_callback_register(&self, callback: LastCallback) {
        self.callbacks.write().last = Some(callback);
    }

    /// Join the calling thread to range profiling
    pub fn register_thread(self: &Arc<Self>) -> RangeThread {
        let thread = std::thread::current().id();
        let entry = self.threads.add(thread);
        let channel = self.channels.register(os_thread_id());
        RangeThread {
            coordinator: self.clone(),
            thread,
            entry,
            channel,
            state: ThreadRangeState::new(&self.config),
            open: None,
            range_id: self.range_id(),
            is_lead: false,
        }
    }

    /// Close out the final range. Runs once; later calls do nothing.
    pub fn last(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = self.callbacks.read();
        if let Some(last) = callbacks.last.as_ref() {
            last(self);
        }
        info!(
            "range profiling finished: {} ranges, {} correlation ids",
            self.ranges_opened(),
            self.correlation_ids_issued()
        );
    }

    /// [`RangeCoordinator::last`], then forget every thread
    pub fn shutdown(&self) {
        self.last();
        self.threads.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenBracket {
    correlation_id: CorrelationId,
    ordinal: u64,
    site: LaunchSite,
    is_lead: bool,
    /// Lead slot as seen at the end of enter
    observed_lead: u64,
}

/// Result of [`RangeThread::range_enter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEnter {
    pub correlation_id: CorrelationId,
    /// Start device PC sampling before this launch
    pub begins_range: bool,
    pub range_id: RangeId,
    pub is_lead: bool,
}

/// One application thread's view of range profiling
pub struct RangeThread {
    coordinator: Arc<RangeCoordinator>,
    thread: ThreadId,
    entry: Arc<RangeThreadEntry>,
    channel: Arc<ActivityChannel>,
    state: ThreadRangeState,
    open: Option<OpenBracket>,
    range_id: RangeId,
    is_lead: bool,
}

impl RangeThread {
    pub fn coordinator(&self) -> &Arc<RangeCoordinator> {
        &self.coordinator
    }

    /// Outbound channel for completions of this thread's operations
    pub fn channel(&self) -> &Arc<ActivityChannel> {
        &self.channel
    }

    pub fn state(&self) -> &ThreadRangeState {
        &self.state
    }

    pub fn is_lead(&self) -> bool {
        self.is_lead
    }

    /// Range of the most recent launch
    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// Range-close notice waiting for this thread's next enter
    pub fn pending_notice(&self) -> Option<RangeNotification> {
        self.entry.pending()
    }

    pub fn in_bracket(&self) -> bool {
        self.open.is_some()
    }

    /// Open the bracket around a kernel launch.
    pub fn range_enter(&mut self, site: LaunchSite) -> Result<RangeEnter, GpuError> {
        if let Some(open) = &self.open {
            return Err(GpuError::NestedRange(open.correlation_id.get()));
        }
        let coordinator = &*self.coordinator;
        let (correlation_id, ordinal) = {
            let _count = coordinator.count_lock.lock();
            (
                coordinator.correlation.next(),
                coordinator.enters.fetch_add(1, Ordering::AcqRel) + 1,
            )
        };

        if let Some(notice) = coordinator.threads.notification_clear(&self.entry) {
            trace!("thread {:?}: range {} closed elsewhere", self.thread, notice.range);
            if notice.logic {
                self.state.trie.flush(notice.context, notice.active, true);
            } else {
                self.state.boundary(notice.context, notice.active);
            }
        }

        self.state.scratch = EnterScratch::default();
        let mut cx = RangeCallContext {
            coordinator,
            thread: self.thread,
            state: &mut self.state,
            correlation_id,
            ordinal,
            site,
            is_lead: false,
            range_id: coordinator.range_id(),
        };

        let callbacks = coordinator.callbacks.read();
        let wants_lead = callbacks.pre_enter.as_ref().is_some_and(|pre| pre(&mut cx));
        if wants_lead {
            let waited = coordinator.spin.wait_until("range lead", || {
                let _count = coordinator.count_lock.lock();
                coordinator
                    .lead_correlation_id
                    .compare_exchange(0, correlation_id.get(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            });
            telemetry::LEAD_WAIT.observe(waited.as_secs_f64());
            cx.is_lead = true;
            cx.range_id = coordinator.range_id();
        }
        let begins_range = callbacks.post_enter.as_ref().is_some_and(|post| post(&mut cx));
        let range_id = cx.range_id;
        let is_lead = cx.is_lead;
        drop(callbacks);

        let observed_lead = if is_lead {
            correlation_id.get()
        } else {
            coordinator.lead_correlation_id.load(Ordering::Acquire)
        };
        trace!(
            "range enter {} (#{}) lead={} begin={} range={}",
            correlation_id,
            ordinal,
            is_lead,
            begins_range,
            range_id
        );
        self.open = Some(OpenBracket {
            correlation_id,
            ordinal,
            site,
            is_lead,
            observed_lead,
        });
        self.range_id = range_id;
        self.is_lead = is_lead;
        Ok(RangeEnter {
            correlation_id,
            begins_range,
            range_id,
            is_lead,
        })
    }

    /// Close the bracket. Returns true when PC samples should be flushed now.
    pub fn range_exit(&mut self) -> bool {
        let Some(open) = self.open.take() else {
            trace!("range exit without enter on {:?}", self.thread);
            return false;
        };
        let coordinator = &*self.coordinator;
        let mut cx = RangeCallContext {
            coordinator,
            thread: self.thread,
            state: &mut self.state,
            correlation_id: open.correlation_id,
            ordinal: open.ordinal,
            site: open.site,
            is_lead: open.is_lead,
            range_id: self.range_id,
        };

        let callbacks = coordinator.callbacks.read();
        if let Some(pre) = callbacks.pre_exit.as_ref() {
            pre(&mut cx);
        }
        let flush = if open.is_lead {
            let flush = callbacks.post_exit.as_ref().is_some_and(|post| post(&mut cx));
            coordinator.lead_correlation_id.store(0, Ordering::Release);
            flush
        } else {
            if open.observed_lead != 0 {
                coordinator.spin.wait_until("range lead exit", || {
                    coordinator.lead_correlation_id.load(Ordering::Acquire) != open.observed_lead
                });
            }
            false
        };
        drop(callbacks);
        self.is_lead = false;
        trace!("range exit {} flush={}", open.correlation_id, flush);
        flush
    }

    /// Flush this thread's channel, release its trie and leave the thread
    /// list. A multiplexer must be running to answer the flush.
    pub fn finish(mut self) {
        if self.open.is_some() {
            self.range_exit();
        }
        let coordinator = self.coordinator.clone();
        self.channel.flush_and_wait(coordinator.spin());
        self.state.trie.cleanup();
        self.state.ip_norm.clear();
        coordinator.threads.remove(self.thread);
        coordinator.channels.unregister(&self.channel);
        debug!("range thread {:?} finished", self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(mode: RangeMode) -> Arc<RangeCoordinator> {
        let mut config = RangeConfig::with_mode(mode);
        config.seed = Some(1);
        RangeCoordinator::new(config, mode, Arc::new(ChannelRegistry::new()))
    }

    fn site(node: u64) -> LaunchSite {
        LaunchSite {
            api_node: CctNodeId(node),
            context: ContextId(0),
            handle: ContextHandle(0x1000),
            kernel: IpNormalized::new(1, node * 0x10),
        }
    }

    #[test]
    fn test_bracket_without_callbacks() {
        let coordinator = coordinator(RangeMode::None);
        let mut thread = coordinator.register_thread();
        let enter = thread.range_enter(site(1)).unwrap();
        assert_eq!(enter.correlation_id, CorrelationId(1));
        assert!(!enter.begins_range);
        assert!(!enter.is_lead);
        assert!(thread.in_bracket());
        assert!(!thread.range_exit());
        assert!(!thread.in_bracket());
        assert!(!thread.range_exit());
    }

    #[test]
    fn test_nested_enter_is_rejected() {
        let coordinator = coordinator(RangeMode::None);
        let mut thread = coordinator.register_thread();
        thread.range_enter(site(1)).unwrap();
        assert_eq!(thread.range_enter(site(2)), Err(GpuError::NestedRange(1)));
        thread.range_exit();
        assert!(thread.range_enter(site(2)).is_ok());
    }

    #[test]
    fn test_first_range_keeps_default() {
        let coordinator = coordinator(RangeMode::Even);
        assert_eq!(coordinator.advance_range(), RangeId::DEFAULT);
        assert_eq!(coordinator.advance_range(), RangeId(1));
        assert_eq!(coordinator.next_range(), RangeId(2));
        assert_eq!(coordinator.ranges_opened(), 3);
    }

    #[test]
    fn test_next_range_skips_exemption() {
        let coordinator = coordinator(RangeMode::Serial);
        assert_eq!(coordinator.next_range(), RangeId(1));
        assert_eq!(coordinator.advance_range(), RangeId(2));
    }

    #[test]
    fn test_lead_slot_claimed_and_released() {
        let coordinator = coordinator(RangeMode::None);
        coordinator.pre_enter_callback_register(Box::new(|_: &mut RangeCallContext<'_>| true));
        coordinator.post_enter_callback_register(Box::new(|cx: &mut RangeCallContext<'_>| {
            cx.range_id = cx.coordinator.advance_range();
            cx.is_lead
        }));
        let mut thread = coordinator.register_thread();
        let enter = thread.range_enter(site(1)).unwrap();
        assert!(enter.is_lead);
        assert!(enter.begins_range);
        assert_eq!(coordinator.lead(), Some(enter.correlation_id));
        thread.range_exit();
        assert_eq!(coordinator.lead(), None);
    }

    #[test]
    fn test_notification_consumed_on_next_enter() {
        let coordinator = coordinator(RangeMode::None);
        let mut thread = coordinator.register_thread();
        thread.range_enter(site(1)).unwrap();
        thread.range_exit();

        let entry = coordinator.threads().add(std::thread::current().id());
        coordinator.threads().notification_update(
            &entry,
            RangeNotification {
                context: ContextId(0),
                range: RangeId(3),
                active: true,
                logic: false,
            },
        );
        thread.range_enter(site(2)).unwrap();
        assert!(entry.pending().is_none());
        assert_eq!(thread.state().boundaries, 1);
        assert_eq!(thread.state().trie.last_flush().map(|f| f.active), Some(true));
        thread.range_exit();
    }

    #[test]
    fn test_lead_callbacks_run_outside_count_lock() {
        let coordinator = coordinator(RangeMode::None);
        let in_post = Arc::new(AtomicBool::new(false));
        let other_entered = Arc::new(AtomicBool::new(false));
        coordinator.pre_enter_callback_register(Box::new(|cx: &mut RangeCallContext<'_>| cx.site.api_node == CctNodeId(1)));
        {
            let in_post = in_post.clone();
            let other_entered = other_entered.clone();
            coordinator.post_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
                if cx.is_lead {
                    // stands in for a slow PC-sampling collect
                    in_post.store(true, Ordering::SeqCst);
                    let start = std::time::Instant::now();
                    while !other_entered.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
                        std::thread::yield_now();
                    }
                }
                false
            }));
        }

        let saw_other = std::thread::scope(|s| {
            let other = {
                let coordinator = coordinator.clone();
                let in_post = in_post.clone();
                let other_entered = other_entered.clone();
                s.spawn(move || {
                    let mut thread = coordinator.register_thread();
                    while !in_post.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    let enter = thread.range_enter(site(2)).unwrap();
                    other_entered.store(true, Ordering::SeqCst);
                    thread.range_exit();
                    enter.is_lead
                })
            };
            let mut lead = coordinator.register_thread();
            let enter = lead.range_enter(site(1)).unwrap();
            let saw_other = other_entered.load(Ordering::SeqCst);
            lead.range_exit();
            assert!(enter.is_lead);
            assert!(!other.join().unwrap());
            saw_other
        });
        assert!(saw_other);
    }

    #[test]
    fn test_last_runs_once() {
        let coordinator = coordinator(RangeMode::None);
        let calls = Arc::new(AtomicU64::new(0));
        {
            let calls = calls.clone();
            coordinator.last_callback_register(Box::new(move |_: &RangeCoordinator| {
                calls.fetch_add(1, Ordering::Relaxed);
            }));
        }
        coordinator.last();
        coordinator.shutdown();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(coordinator.threads().is_empty());
    }
}
