use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use stride_gpu::activity::CopyKind;
use stride_gpu::backend::sim::{SimConfig, SimulatedBackend};
use stride_gpu::ip_norm_map::IpNormKey;
use stride_gpu::operation::{CopySpec, KernelSpec};
use stride_gpu::range::{LaunchSite, RangeNotification};
use stride_gpu::{GpuSession, RangeConfig, RangeMode, RangeThread};
use stride_shared::{CctNodeId, ContextHandle, ContextId, CorrelationId, IpNormalized, RangeId};

const CONTEXT: ContextHandle = ContextHandle(0x7f00);

fn start(config: RangeConfig) -> Result<GpuSession<SimulatedBackend>> {
    let session = GpuSession::start(config, 1, |contexts, handler| {
        SimulatedBackend::new(SimConfig::default(), contexts, handler)
    })?;
    Ok(session)
}

fn seeded(mode: RangeMode) -> RangeConfig {
    let mut config = RangeConfig::with_mode(mode);
    config.seed = Some(17);
    config
}

fn kernel(offset: u64) -> KernelSpec {
    KernelSpec::new(CONTEXT, IpNormalized::new(4, offset))
}

fn trie_site(node: u64) -> LaunchSite {
    LaunchSite {
        api_node: CctNodeId(node),
        context: ContextId(0),
        handle: CONTEXT,
        kernel: IpNormalized::new(4, node * 0x10),
    }
}

/// Register from a fresh OS thread so the range thread has its own identity
fn register_elsewhere(session: &GpuSession<SimulatedBackend>) -> RangeThread {
    std::thread::scope(|s| s.spawn(|| session.register_thread()).join().unwrap())
}

#[test]
fn test_correlation_ids_unique_across_threads() -> Result<()> {
    let session = start(seeded(RangeMode::None))?;

    let (threads, ids): (Vec<RangeThread>, Vec<Vec<CorrelationId>>) = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let session = &session;
                s.spawn(move || {
                    let ops = session.operations();
                    let mut thread = session.register_thread();
                    let mut ids = Vec::new();
                    for i in 0..100u64 {
                        let outcome = ops.launch_kernel(&mut thread, CctNodeId(0), &kernel(i % 7)).unwrap();
                        ids.push(outcome.correlation_id);
                        if i % 2 == 0 {
                            let copy = CopySpec {
                                context: CONTEXT,
                                stream: 0,
                                kind: CopyKind::DeviceToHost,
                                bytes: 256,
                            };
                            ids.push(ops.memcpy(&thread, CctNodeId(0), &copy).unwrap());
                        }
                    }
                    (thread, ids)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).unzip()
    });

    let mut all = HashSet::new();
    for per_thread in &ids {
        assert!(per_thread.windows(2).all(|w| w[0] < w[1]));
        all.extend(per_thread.iter().copied());
    }
    assert_eq!(all.len(), 4 * 150);
    assert!(!all.contains(&CorrelationId::NONE));

    let summary = session.finish(threads)?;
    assert_eq!(summary.correlation_ids, 600);
    assert_eq!(summary.kernels, 400);
    assert_eq!(summary.copies, 200);
    Ok(())
}

#[test]
fn test_one_lead_per_range_transition() -> Result<()> {
    let mut config = seeded(RangeMode::Even);
    config.interval = 3;
    let session = start(config)?;
    let inside = AtomicUsize::new(0);

    let (threads, entries): (Vec<RangeThread>, Vec<Vec<(bool, RangeId)>>) = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let session = &session;
                let inside = &inside;
                s.spawn(move || {
                    let mut thread = session.register_thread();
                    let mut seen = Vec::new();
                    for i in 0..30u64 {
                        let site = LaunchSite {
                            api_node: CctNodeId(t * 100 + i),
                            context: ContextId(0),
                            handle: CONTEXT,
                            kernel: IpNormalized::new(4, i),
                        };
                        let enter = thread.range_enter(site).unwrap();
                        if enter.is_lead {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                        seen.push((enter.is_lead, enter.range_id));
                        thread.range_exit();
                    }
                    (thread, seen)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).unzip()
    });

    let entries: Vec<(bool, RangeId)> = entries.into_iter().flatten().collect();
    let lead_ranges: Vec<RangeId> = entries.iter().filter(|(lead, _)| *lead).map(|(_, r)| *r).collect();
    // ordinals 1, 4, ..., 118
    assert_eq!(lead_ranges.len(), 40);
    let distinct: HashSet<RangeId> = lead_ranges.iter().copied().collect();
    assert_eq!(distinct.len(), 40);
    for (_, range) in entries.iter().filter(|(lead, _)| !*lead) {
        assert!(distinct.contains(range));
    }
    assert_eq!(session.coordinator().ranges_opened(), 40);

    session.finish(threads)?;
    Ok(())
}

#[test]
fn test_even_interval_spacing() -> Result<()> {
    let mut config = seeded(RangeMode::Even);
    config.interval = 5;
    let session = start(config)?;
    let mut thread = session.register_thread();

    let mut begins = Vec::new();
    for i in 0..12u64 {
        let outcome = session.operations().launch_kernel(&mut thread, CctNodeId(0), &kernel(i))?;
        if outcome.begins_range {
            begins.push(i + 1);
        }
    }
    assert_eq!(begins, vec![1, 6, 11]);

    let summary = session.finish(vec![thread])?;
    assert_eq!(summary.ranges_opened, 3);
    assert_eq!(summary.unretired, 0);
    Ok(())
}

#[test]
fn test_first_launch_stays_in_default_range() -> Result<()> {
    for mode in [RangeMode::None, RangeMode::Even, RangeMode::Trie, RangeMode::ContextSensitive] {
        let session = start(seeded(mode))?;
        let mut thread = session.register_thread();
        let outcome = session.operations().launch_kernel(&mut thread, CctNodeId(0), &kernel(1))?;
        assert_eq!(outcome.range_id, RangeId::DEFAULT, "mode {}", mode);
        assert_eq!(session.coordinator().range_id(), RangeId::DEFAULT, "mode {}", mode);
        session.finish(vec![thread])?;
    }

    // serial numbers every launch, the first included
    let session = start(seeded(RangeMode::Serial))?;
    let mut thread = session.register_thread();
    let outcome = session.operations().launch_kernel(&mut thread, CctNodeId(0), &kernel(1))?;
    assert_eq!(outcome.range_id, RangeId(1));
    session.finish(vec![thread])?;
    Ok(())
}

fn sampled_ratio(config: RangeConfig, launches: u64) -> Result<(u64, u64)> {
    let session = start(config)?;
    let mut thread = session.register_thread();
    let spec = kernel(0x900);
    for _ in 0..launches {
        session.operations().launch_kernel(&mut thread, CctNodeId(0), &spec)?;
    }
    let stats = session
        .coordinator()
        .global_ip_norm()
        .stats(&IpNormKey::new(spec.function, CctNodeId(0)))
        .unwrap_or_default();
    session.finish(vec![thread])?;
    Ok((stats.sampled, stats.count))
}

#[test]
fn test_context_sensitive_fixed_period() -> Result<()> {
    let mut config = seeded(RangeMode::ContextSensitive);
    config.sampling_period = 10;
    let (sampled, count) = sampled_ratio(config, 2000)?;
    assert_eq!(count, 2000);
    assert!((150..=250).contains(&sampled), "sampled {} of {}", sampled, count);
    Ok(())
}

#[test]
fn test_context_sensitive_dynamic_period_tracks_target() -> Result<()> {
    let mut config = seeded(RangeMode::ContextSensitive);
    config.sampling_period = 10;
    config.dynamic_period = true;
    let (sampled, count) = sampled_ratio(config, 2000)?;
    let ratio = sampled as f64 / count as f64;
    assert!((0.08..=0.13).contains(&ratio), "ratio {}", ratio);
    Ok(())
}

#[test]
fn test_later_threads_join_the_running_range() -> Result<()> {
    let session = start(seeded(RangeMode::Trie))?;
    let mut first = session.register_thread();
    let mut second = register_elsewhere(&session);

    let enter = first.range_enter(trie_site(11))?;
    assert!(enter.is_lead);
    assert!(enter.begins_range);
    assert_eq!(enter.range_id, RangeId::DEFAULT);
    first.range_exit();

    for node in [22, 23] {
        let enter = second.range_enter(trie_site(node))?;
        assert!(!enter.is_lead);
        assert!(!enter.begins_range);
        assert_eq!(enter.range_id, RangeId::DEFAULT);
        second.range_exit();
    }
    assert_eq!(session.coordinator().range_id(), RangeId::DEFAULT);
    assert_eq!(session.coordinator().ranges_opened(), 1);

    session.finish(vec![first, second])?;
    Ok(())
}

#[test]
fn test_concurrent_first_launches_open_one_range() -> Result<()> {
    let session = start(seeded(RangeMode::Trie))?;

    let (threads, entries): (Vec<RangeThread>, Vec<(bool, RangeId)>) = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let session = &session;
                s.spawn(move || {
                    let mut thread = session.register_thread();
                    let enter = thread.range_enter(trie_site(100 + t)).unwrap();
                    thread.range_exit();
                    (thread, (enter.begins_range, enter.range_id))
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).unzip()
    });

    assert_eq!(entries.iter().filter(|(begins, _)| *begins).count(), 1);
    assert!(entries.iter().all(|(_, range)| *range == RangeId::DEFAULT));
    assert_eq!(session.coordinator().ranges_opened(), 1);

    session.finish(threads)?;
    Ok(())
}

#[test]
fn test_range_close_notice_reaches_other_threads() -> Result<()> {
    let session = start(seeded(RangeMode::Trie))?;
    let mut first = session.register_thread();
    let mut second = register_elsewhere(&session);
    let idle = register_elsewhere(&session);

    first.range_enter(trie_site(1))?;
    first.range_exit();
    second.range_enter(trie_site(2))?;
    second.range_exit();

    // replaying while sampling runs closes the range
    let enter = second.range_enter(trie_site(2))?;
    assert!(enter.is_lead);
    assert!(!enter.begins_range);
    assert!(second.range_exit());

    let closed = RangeNotification {
        context: ContextId(0),
        range: RangeId::DEFAULT,
        active: true,
        logic: false,
    };
    assert_eq!(first.pending_notice(), Some(closed));
    assert_eq!(idle.pending_notice(), Some(closed));
    assert_eq!(second.pending_notice(), None);

    let enter = second.range_enter(trie_site(3))?;
    assert!(enter.begins_range);
    assert_eq!(enter.range_id, RangeId(1));
    second.range_exit();
    let enter = second.range_enter(trie_site(2))?;
    assert!(enter.is_lead);
    second.range_exit();

    // range 1 closed too, but unread notices are not overwritten
    assert_eq!(first.pending_notice(), Some(closed));
    assert_eq!(idle.pending_notice(), Some(closed));

    let boundaries = first.state().boundaries;
    let enter = first.range_enter(trie_site(1))?;
    assert!(!enter.begins_range);
    assert_eq!(enter.range_id, RangeId::DEFAULT);
    first.range_exit();
    assert_eq!(first.pending_notice(), None);
    assert_eq!(first.state().boundaries, boundaries + 1);
    assert_eq!(first.state().trie.last_flush().map(|f| f.active), Some(true));
    assert_eq!(idle.pending_notice(), Some(closed));

    session.finish(vec![first, second, idle])?;
    Ok(())
}
