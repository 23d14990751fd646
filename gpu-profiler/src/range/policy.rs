//! Range policies
//!
//! Each mode is a set of callbacks on the generic enter/exit bracket. The
//! callbacks share one [`Sampling`] record: the range PC sampling is running
//! for (if any) and the range that was stopped but not yet collected. Only a
//! lead touches either, so the record's lock is never contended.
//!
//! | mode              | wants lead                        | opens a range when            |
//! |-------------------|-----------------------------------|-------------------------------|
//! | SERIAL            | always                            | every launch                  |
//! | EVEN              | every `interval`-th enter         | it leads                      |
//! | TRIE              | path diverges, or replays while sampling | the path diverges      |
//!
//! In TRIE mode a thread's first launch never counts as a divergence: it
//! joins the range already running, and only the first thread of the process
//! opens one. A site another thread launched from in the current range is
//! treated like a replay.
//! | CONTEXT_SENSITIVE | the launch site is sampled        | it is sampled                 |

use super::{RangeCallContext, RangeCoordinator, RangeNotification};
use crate::backend::GpuBackend;
use crate::config::{RangeConfig, RangeMode, VendorFailurePolicy};
use crate::context_map::ContextMap;
use crate::error::GpuError;
use crate::ip_norm_map::{CallSiteStats, IpNormStatus};
use crate::telemetry;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stride_shared::{ContextHandle, ContextId, RangeId};
use tracing::{debug, error, warn};

/// Issues the vendor PC-sampling calls and applies the failure policy.
pub struct PcSamplingDriver {
    backend: Arc<dyn GpuBackend>,
    contexts: Arc<ContextMap>,
    policy: VendorFailurePolicy,
    failures: AtomicU64,
    samples_collected: AtomicU64,
}

impl PcSamplingDriver {
    pub fn new(backend: Arc<dyn GpuBackend>, contexts: Arc<ContextMap>, policy: VendorFailurePolicy) -> Self {
        Self {
            backend,
            contexts,
            policy,
            failures: AtomicU64::new(0),
            samples_collected: AtomicU64::new(0),
        }
    }

    /// Vendor calls that failed so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// PC sample records delivered by collects
    pub fn samples_collected(&self) -> u64 {
        self.samples_collected.load(Ordering::Relaxed)
    }

    fn check<T>(&self, op: &'static str, result: Result<T, GpuError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                telemetry::VENDOR_FAILURES.with_label_values(&[op]).inc();
                match self.policy {
                    VendorFailurePolicy::LogAndContinue => {
                        warn!("{}: {}; continuing without PC samples", op, e);
                        None
                    }
                    VendorFailurePolicy::Abort => {
                        error!("{}: {}; aborting", op, e);
                        std::process::abort();
                    }
                }
            }
        }
    }

    /// Configure sampling on `context` the first time it is used
    pub fn ensure_enabled(&self, context: ContextHandle) -> bool {
        if self
            .contexts
            .pc_sampling(context)
            .is_some_and(|config| config.enabled)
        {
            return true;
        }
        self.contexts.init(context);
        if self
            .check("pc_sampling_enable", self.backend.pc_sampling_enable(context))
            .is_none()
        {
            return false;
        }
        self.contexts.pc_sampling_enabled_update(context, true);
        debug!("context {:#x}: PC sampling enabled", context.0);
        true
    }

    pub fn start(&self, context: ContextHandle) -> bool {
        self.ensure_enabled(context)
            && self
                .check("pc_sampling_start", self.backend.pc_sampling_start(context))
                .is_some()
    }

    pub fn stop(&self, context: ContextHandle) -> bool {
        self.check("pc_sampling_stop", self.backend.pc_sampling_stop(context))
            .is_some()
    }

    pub fn collect(&self, context: ContextHandle) -> usize {
        let delivered = self
            .check("pc_sampling_collect", self.backend.pc_sampling_collect(context))
            .unwrap_or(0);
        self.samples_collected
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenRange {
    handle: ContextHandle,
    context: ContextId,
    range: RangeId,
    started: Instant,
}

#[derive(Debug, Default)]
struct Sampling {
    /// PC sampling is running for this range
    active: Option<OpenRange>,
    /// Stopped; samples still to be collected
    pending: Option<OpenRange>,
}

type SharedSampling = Arc<spin::Mutex<Sampling>>;

impl Sampling {
    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn open(&mut self, driver: &PcSamplingDriver, cx: &RangeCallContext<'_>, range: RangeId) {
        if driver.start(cx.site.handle) {
            self.active = Some(OpenRange {
                handle: cx.site.handle,
                context: cx.site.context,
                range,
                started: Instant::now(),
            });
        }
    }

    /// Stop the active range; its samples are collected by [`Sampling::drain`]
    fn close(&mut self, driver: &PcSamplingDriver) -> Option<OpenRange> {
        let closed = self.active.take()?;
        driver.stop(closed.handle);
        debug!(
            "range {} closed after {:?}",
            closed.range,
            closed.started.elapsed()
        );
        if let Some(previous) = self.pending.replace(closed) {
            driver.collect(previous.handle);
        }
        Some(closed)
    }

    /// Collect the stopped range. Returns false if there was none.
    fn drain(&mut self, driver: &PcSamplingDriver) -> bool {
        match self.pending.take() {
            Some(closed) => {
                driver.collect(closed.handle);
                true
            }
            None => false,
        }
    }
}

/// Probability of sampling a launch from a site with `stats`.
///
/// Sites under the target ratio are always sampled. Above it the probability
/// falls linearly with the ratio and never drops below `sampling_epsilon`.
pub fn sampling_probability(stats: &CallSiteStats, config: &RangeConfig) -> f64 {
    let target = config.target_ratio();
    if target >= 1.0 || stats.count == 0 {
        return 1.0;
    }
    let ratio = stats.ratio();
    if ratio < target {
        return 1.0;
    }
    let decay = target * (1.0 - config.sampling_slope * (ratio - target) / (1.0 - target));
    decay.max(config.sampling_epsilon).min(1.0)
}

/// Decide whether to sample this launch from a site with `stats`
pub fn should_sample(coordinator: &RangeCoordinator, stats: &CallSiteStats) -> bool {
    let config = coordinator.config();
    if config.dynamic_period {
        let p = sampling_probability(stats, config);
        p >= 1.0 || coordinator.with_rng(|rng| rng.gen::<f64>() < p)
    } else {
        coordinator.with_rng(|rng| rng.gen_range(0..config.sampling_period.max(1)) == 0)
    }
}

/// Register the callbacks of the coordinator's mode.
///
/// [`RangeMode::None`] registers nothing: no launch leads and the range id
/// never moves.
pub fn install(
    coordinator: &Arc<RangeCoordinator>,
    backend: Arc<dyn GpuBackend>,
    contexts: Arc<ContextMap>,
) -> Arc<PcSamplingDriver> {
    let driver = Arc::new(PcSamplingDriver::new(
        backend,
        contexts,
        coordinator.config().failure_policy,
    ));
    let sampling: SharedSampling = Arc::new(spin::Mutex::new(Sampling::default()));
    match coordinator.mode() {
        RangeMode::None => {}
        RangeMode::Serial => install_serial(coordinator, &driver, &sampling),
        RangeMode::Even => install_even(coordinator, &driver, &sampling),
        RangeMode::Trie => install_trie(coordinator, &driver, &sampling),
        RangeMode::ContextSensitive => install_context_sensitive(coordinator, &driver, &sampling),
    }
    if coordinator.mode() != RangeMode::None {
        install_last(coordinator, &driver, &sampling);
    }
    driver
}

/// Stop-and-collect after the lead's launch
fn register_close_on_exit(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    let driver = driver.clone();
    let sampling = sampling.clone();
    coordinator.post_exit_callback_register(Box::new(move |_cx: &mut RangeCallContext<'_>| {
        let mut sampling = sampling.lock();
        sampling.close(&driver);
        sampling.drain(&driver)
    }));
}

/// Collect a range stopped during enter, after the lead's launch
fn register_drain_on_exit(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    let driver = driver.clone();
    let sampling = sampling.clone();
    coordinator.post_exit_callback_register(Box::new(move |_cx: &mut RangeCallContext<'_>| sampling.lock().drain(&driver)));
}

fn install_last(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    let driver = driver.clone();
    let sampling = sampling.clone();
    coordinator.last_callback_register(Box::new(move |_coordinator: &RangeCoordinator| {
        let mut sampling = sampling.lock();
        sampling.close(&driver);
        sampling.drain(&driver);
    }));
}

fn install_serial(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    coordinator.pre_enter_callback_register(Box::new(|_cx: &mut RangeCallContext<'_>| true));
    {
        let driver = driver.clone();
        let sampling = sampling.clone();
        coordinator.post_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
            let range = cx.coordinator.next_range();
            cx.range_id = range;
            let mut sampling = sampling.lock();
            sampling.open(&driver, cx, range);
            sampling.is_active()
        }));
    }
    register_close_on_exit(coordinator, driver, sampling);
}

fn install_even(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    let interval = u64::from(coordinator.config().interval.max(1));
    coordinator.pre_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| (cx.ordinal - 1) % interval == 0));
    {
        let driver = driver.clone();
        let sampling = sampling.clone();
        coordinator.post_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
            if !cx.is_lead {
                return false;
            }
            let mut sampling = sampling.lock();
            sampling.close(&driver);
            let range = cx.coordinator.advance_range();
            cx.range_id = range;
            sampling.open(&driver, cx, range);
            sampling.is_active()
        }));
    }
    register_drain_on_exit(coordinator, driver, sampling);
}

fn install_trie(coordinator: &RangeCoordinator, driver: &Arc<PcSamplingDriver>, sampling: &SharedSampling) {
    {
        let sampling = sampling.clone();
        coordinator.pre_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
            let active = sampling.lock().is_active();
            let key = cx.site.key();
            if cx.state.ip_norm.insert(key) == IpNormStatus::Duplicate {
                cx.state.boundary(cx.site.context, active);
                cx.state.ip_norm.insert(key);
            }
            let elsewhere = cx.coordinator.global_ip_norm().claim(key, cx.thread) == IpNormStatus::Duplicate;

            if cx.state.first_range {
                cx.state.first_range = false;
                cx.state.scratch.first = true;
                if cx.coordinator.ranges_opened() > 0 {
                    join_current(cx);
                    return false;
                }
                cx.state.scratch.open_range = true;
                return true;
            }
            if cx.state.trie.is_repeat(cx.site.api_node) {
                cx.state.extending_new = false;
                return active;
            }
            if cx.state.extending_new {
                cx.state.scratch.stamp = true;
                return false;
            }
            if elsewhere {
                // another thread already launched from here in this range
                cx.state.scratch.stamp = true;
                return active;
            }
            if !cx.state.trie.at_root() {
                cx.state.trie.flush(cx.site.context, active, true);
            }
            cx.state.scratch.open_range = true;
            true
        }));
    }
    {
        let driver = driver.clone();
        let sampling = sampling.clone();
        coordinator.post_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
            let mut begins = false;
            let mut opened = false;
            // two threads' first launches can both ask to lead
            if cx.is_lead && cx.state.scratch.first && cx.coordinator.ranges_opened() > 0 {
                cx.state.scratch.open_range = false;
                join_current(cx);
            } else if cx.is_lead {
                let mut sampling = sampling.lock();
                if let Some(closed) = sampling.close(&driver) {
                    broadcast_close(cx, closed);
                    range_flush(cx);
                }
                if cx.state.scratch.open_range {
                    let range = cx.coordinator.advance_range();
                    cx.range_id = range;
                    range_flush(cx);
                    sampling.open(&driver, cx, range);
                    cx.state.extending_new = true;
                    opened = true;
                    begins = sampling.is_active();
                }
            }

            let repeated = cx.state.trie.append(cx.range_id, cx.site.api_node);
            if repeated {
                if let Some(range) = cx.state.trie.current_range() {
                    cx.state.scratch.adopt = Some(range);
                    cx.range_id = range;
                }
            } else if cx.state.scratch.stamp || opened {
                cx.state.trie.stamp(cx.range_id);
            }
            begins
        }));
    }
    register_drain_on_exit(coordinator, driver, sampling);
}

/// A thread's first path belongs to the range already running
fn join_current(cx: &mut RangeCallContext<'_>) {
    cx.state.extending_new = true;
    cx.state.scratch.stamp = true;
    cx.range_id = cx.coordinator.range_id();
}

/// Forget which sites the closed range saw; the lead's own launch counts
/// toward the next one.
fn range_flush(cx: &RangeCallContext<'_>) {
    let global = cx.coordinator.global_ip_norm();
    global.clear();
    global.claim(cx.site.key(), cx.thread);
}

/// Tell every other thread that the range it may have launched into closed
fn broadcast_close(cx: &RangeCallContext<'_>, closed: OpenRange) {
    let notice = RangeNotification {
        context: closed.context,
        range: closed.range,
        active: true,
        logic: false,
    };
    let threads = cx.coordinator.threads();
    threads.apply_from(cx.thread, |entry| {
        if entry.thread() != cx.thread {
            threads.notification_update(entry, notice);
        }
    });
}

fn install_context_sensitive(
    coordinator: &RangeCoordinator,
    driver: &Arc<PcSamplingDriver>,
    sampling: &SharedSampling,
) {
    coordinator.pre_enter_callback_register(Box::new(|cx: &mut RangeCallContext<'_>| {
        let key = cx.site.key();
        let context = cx.site.context;
        if cx.state.last_context.is_some_and(|last| last != context) {
            cx.state.boundary(context, false);
        }
        cx.state.last_context = Some(context);
        if cx.state.ip_norm.insert(key) == IpNormStatus::Duplicate {
            cx.state.boundary(context, false);
            cx.state.ip_norm.insert(key);
        }

        let (_, before) = cx.coordinator.global_ip_norm().observe(key);
        if should_sample(cx.coordinator, &before) {
            cx.state.scratch.open_range = true;
            true
        } else {
            cx.state.scratch.adopt = before.last_range;
            false
        }
    }));
    {
        let driver = driver.clone();
        let sampling = sampling.clone();
        coordinator.post_enter_callback_register(Box::new(move |cx: &mut RangeCallContext<'_>| {
            if cx.is_lead && cx.state.scratch.open_range {
                let range = cx.coordinator.advance_range();
                cx.range_id = range;
                cx.coordinator.global_ip_norm().mark_sampled(&cx.site.key(), range);
                let mut sampling = sampling.lock();
                sampling.open(&driver, cx, range);
                return sampling.is_active();
            }
            if let Some(range) = cx.state.scratch.adopt {
                cx.range_id = range;
            }
            false
        }));
    }
    register_close_on_exit(coordinator, driver, sampling);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AllocRequest, CopyRequest, KernelLaunch};
    use crate::channel::ChannelRegistry;
    use crate::range::LaunchSite;
    use std::sync::atomic::AtomicUsize;
    use stride_shared::{CctNodeId, IpNormalized};

    /// Counts PC-sampling calls; submissions are ignored
    #[derive(Default)]
    struct CountingBackend {
        starts: AtomicUsize,
        stops: AtomicUsize,
        collects: AtomicUsize,
        fail_start: bool,
    }

    impl GpuBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn submit_kernel(&self, _launch: &KernelLaunch) -> Result<(), GpuError> {
            Ok(())
        }

        fn submit_copy(&self, _copy: &CopyRequest) -> Result<(), GpuError> {
            Ok(())
        }

        fn submit_alloc(&self, _alloc: &AllocRequest) -> Result<(), GpuError> {
            Ok(())
        }

        fn supports_pc_sampling(&self) -> bool {
            true
        }

        fn pc_sampling_enable(&self, _context: ContextHandle) -> Result<(), GpuError> {
            Ok(())
        }

        fn pc_sampling_start(&self, _context: ContextHandle) -> Result<(), GpuError> {
            self.starts.fetch_add(1, Ordering::Relaxed);
            if self.fail_start {
                return Err(GpuError::vendor("counting", "pc_sampling_start", 7));
            }
            Ok(())
        }

        fn pc_sampling_stop(&self, _context: ContextHandle) -> Result<(), GpuError> {
            self.stops.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn pc_sampling_collect(&self, _context: ContextHandle) -> Result<usize, GpuError> {
            self.collects.fetch_add(1, Ordering::Relaxed);
            Ok(0)
        }

        fn flush(&self) -> Result<(), GpuError> {
            Ok(())
        }
    }

    fn setup(mode: RangeMode, tweak: impl FnOnce(&mut RangeConfig)) -> (Arc<RangeCoordinator>, Arc<CountingBackend>, Arc<PcSamplingDriver>) {
        let mut config = RangeConfig::with_mode(mode);
        config.seed = Some(7);
        tweak(&mut config);
        let coordinator = RangeCoordinator::new(config, mode, Arc::new(ChannelRegistry::new()));
        let backend = Arc::new(CountingBackend::default());
        let driver = install(&coordinator, backend.clone(), Arc::new(ContextMap::new()));
        (coordinator, backend, driver)
    }

    fn site(node: u64) -> LaunchSite {
        LaunchSite {
            api_node: CctNodeId(node),
            context: ContextId(0),
            handle: ContextHandle(0xc0),
            kernel: IpNormalized::new(2, node * 0x100),
        }
    }

    #[test]
    fn test_probability_shape() {
        let mut config = RangeConfig::with_mode(RangeMode::ContextSensitive);
        config.sampling_period = 4;
        config.sampling_epsilon = 0.05;
        let fresh = CallSiteStats::default();
        assert_eq!(sampling_probability(&fresh, &config), 1.0);

        let under = CallSiteStats { count: 10, sampled: 1, last_range: None };
        assert_eq!(sampling_probability(&under, &config), 1.0);

        let at = CallSiteStats { count: 8, sampled: 2, last_range: None };
        assert!((sampling_probability(&at, &config) - 0.25).abs() < 1e-9);

        let over = CallSiteStats { count: 10, sampled: 5, last_range: None };
        let p_over = sampling_probability(&over, &config);
        assert!(p_over < 0.25 && p_over > 0.05);

        let saturated = CallSiteStats { count: 10, sampled: 10, last_range: None };
        assert_eq!(sampling_probability(&saturated, &config), 0.05);
    }

    #[test]
    fn test_period_one_always_samples() {
        let mut config = RangeConfig::with_mode(RangeMode::ContextSensitive);
        config.sampling_period = 1;
        let stats = CallSiteStats { count: 100, sampled: 100, last_range: None };
        assert_eq!(sampling_probability(&stats, &config), 1.0);
    }

    #[test]
    fn test_serial_samples_every_launch() {
        let (coordinator, backend, _driver) = setup(RangeMode::Serial, |_| {});
        let mut thread = coordinator.register_thread();
        for i in 1..=3u32 {
            let enter = thread.range_enter(site(1)).unwrap();
            assert!(enter.is_lead);
            assert!(enter.begins_range);
            assert_eq!(enter.range_id, RangeId(i));
            assert!(thread.range_exit());
        }
        assert_eq!(backend.starts.load(Ordering::Relaxed), 3);
        assert_eq!(backend.stops.load(Ordering::Relaxed), 3);
        assert_eq!(backend.collects.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_even_closes_previous_range() {
        let (coordinator, backend, _driver) = setup(RangeMode::Even, |c| c.interval = 2);
        let mut thread = coordinator.register_thread();
        let mut begins = Vec::new();
        for _ in 0..5 {
            begins.push(thread.range_enter(site(1)).unwrap().begins_range);
            thread.range_exit();
        }
        assert_eq!(begins, vec![true, false, true, false, true]);
        assert_eq!(coordinator.range_id(), RangeId(2));
        assert_eq!(backend.starts.load(Ordering::Relaxed), 3);
        assert_eq!(backend.stops.load(Ordering::Relaxed), 2);

        coordinator.last();
        assert_eq!(backend.stops.load(Ordering::Relaxed), 3);
        assert_eq!(backend.collects.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_trie_replay_adopts_recorded_range() {
        let (coordinator, backend, _driver) = setup(RangeMode::Trie, |_| {});
        let mut thread = coordinator.register_thread();

        let mut first = Vec::new();
        for node in [1, 2, 3] {
            let enter = thread.range_enter(site(node)).unwrap();
            first.push((enter.begins_range, enter.range_id));
            thread.range_exit();
        }
        assert_eq!(
            first,
            vec![
                (true, RangeId::DEFAULT),
                (false, RangeId::DEFAULT),
                (false, RangeId::DEFAULT)
            ]
        );

        for node in [1, 2, 3] {
            let enter = thread.range_enter(site(node)).unwrap();
            assert!(!enter.begins_range);
            assert_eq!(enter.range_id, RangeId::DEFAULT);
            thread.range_exit();
        }
        assert_eq!(backend.starts.load(Ordering::Relaxed), 1);
        assert_eq!(backend.stops.load(Ordering::Relaxed), 1);

        let enter = thread.range_enter(site(4)).unwrap();
        assert!(enter.begins_range);
        assert_eq!(enter.range_id, RangeId(1));
        thread.range_exit();
        assert_eq!(thread.state().trie.last_flush().map(|f| f.logic), Some(true));
    }

    #[test]
    fn test_trie_site_seen_on_another_thread_is_not_divergent() {
        let mut config = RangeConfig::with_mode(RangeMode::Trie);
        config.seed = Some(3);
        let coordinator = RangeCoordinator::new(config, RangeMode::Trie, Arc::new(ChannelRegistry::new()));
        // sampling never starts, so replays never close the range
        let backend = Arc::new(CountingBackend {
            fail_start: true,
            ..CountingBackend::default()
        });
        install(&coordinator, backend, Arc::new(ContextMap::new()));
        let mut a = coordinator.register_thread();
        let mut b = std::thread::scope(|s| s.spawn(|| coordinator.register_thread()).join().unwrap());

        a.range_enter(site(1)).unwrap();
        a.range_exit();
        for _ in 0..2 {
            let enter = b.range_enter(site(5)).unwrap();
            assert_eq!(enter.range_id, RangeId::DEFAULT);
            b.range_exit();
        }

        let enter = b.range_enter(site(1)).unwrap();
        assert!(!enter.is_lead);
        assert_eq!(enter.range_id, RangeId::DEFAULT);
        b.range_exit();
        assert_eq!(coordinator.ranges_opened(), 1);

        let enter = b.range_enter(site(7)).unwrap();
        assert!(enter.is_lead);
        assert_eq!(enter.range_id, RangeId(1));
        b.range_exit();
        assert_eq!(coordinator.ranges_opened(), 2);
        assert_eq!(coordinator.global_ip_norm().claimed(), 1);
    }

    #[test]
    fn test_context_sensitive_first_launch_sampled() {
        let (coordinator, backend, _driver) = setup(RangeMode::ContextSensitive, |c| {
            c.dynamic_period = true;
            c.sampling_period = 1_000;
        });
        let mut thread = coordinator.register_thread();
        let enter = thread.range_enter(site(9)).unwrap();
        assert!(enter.begins_range);
        assert_eq!(enter.range_id, RangeId::DEFAULT);
        assert!(thread.range_exit());
        assert_eq!(backend.starts.load(Ordering::Relaxed), 1);
        let stats = coordinator.global_ip_norm().stats(&site(9).key()).unwrap();
        assert_eq!((stats.count, stats.sampled), (1, 1));
    }

    #[test]
    fn test_failed_start_is_counted_and_skipped() {
        let mut config = RangeConfig::with_mode(RangeMode::Serial);
        config.seed = Some(1);
        let coordinator = RangeCoordinator::new(config, RangeMode::Serial, Arc::new(ChannelRegistry::new()));
        let backend = Arc::new(CountingBackend {
            fail_start: true,
            ..CountingBackend::default()
        });
        let driver = install(&coordinator, backend.clone(), Arc::new(ContextMap::new()));
        let mut thread = coordinator.register_thread();
        let enter = thread.range_enter(site(1)).unwrap();
        assert!(!enter.begins_range);
        assert!(!thread.range_exit());
        assert_eq!(driver.failures(), 1);
        assert_eq!(backend.stops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_none_installs_nothing() {
        let (coordinator, backend, _driver) = setup(RangeMode::None, |_| {});
        let mut thread = coordinator.register_thread();
        for node in 1..=4 {
            let enter = thread.range_enter(site(node)).unwrap();
            assert!(!enter.begins_range);
            assert!(!enter.is_lead);
            thread.range_exit();
        }
        coordinator.last();
        assert_eq!(coordinator.range_id(), RangeId::DEFAULT);
        assert_eq!(backend.starts.load(Ordering::Relaxed), 0);
    }
}
