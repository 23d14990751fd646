//! Simulate command implementation

use super::RangeArgs;
use crate::output;
use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use stride_gpu::activity::{CopyKind, MemoryKind};
use stride_gpu::backend::sim::{SimConfig, SimulatedBackend};
use stride_gpu::operation::{AllocSpec, CopySpec, KernelSpec};
use stride_gpu::{CallingContextTree, GpuSession, RangeThread, SessionSummary};
use stride_shared::{CctNodeId, ContextHandle, IpNormalized};

const CONTEXT: ContextHandle = ContextHandle(0x5712_0000);

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    /// Application threads launching kernels
    #[arg(short, long, default_value = "4")]
    pub threads: usize,

    /// Passes over the launch pattern per thread
    #[arg(short, long, default_value = "50")]
    pub iterations: usize,

    /// Launch sites in order, comma separated; repeated names relaunch
    /// the same site
    #[arg(short, long, default_value = "init,step,step,reduce")]
    pub pattern: String,

    /// Host-to-device copy and device allocation after every pass
    #[arg(long)]
    pub copies: bool,

    /// Completions the simulated device may reorder
    #[arg(long, default_value = "0")]
    pub reorder_window: usize,

    /// Hottest calling contexts to list
    #[arg(long, default_value = "5")]
    pub top: usize,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Also print the engine's own counters in Prometheus text format
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Debug, Serialize)]
struct HotContext {
    path: String,
    kernels: u64,
    gpu_time_ns: u64,
    pc_samples: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    #[serde(flatten)]
    summary: SessionSummary,
    hottest: Vec<HotContext>,
}

/// Site names to indices, in first-seen order
fn parse_pattern(pattern: &str) -> Result<(Vec<String>, Vec<usize>)> {
    let mut names: Vec<String> = Vec::new();
    let mut order = Vec::new();
    for name in pattern.split(',').map(str::trim) {
        if name.is_empty() {
            bail!("Empty launch site in pattern '{}'", pattern);
        }
        let index = match names.iter().position(|n| n == name) {
            Some(index) => index,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        order.push(index);
    }
    Ok((names, order))
}

pub fn run(args: SimulateArgs) -> Result<()> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let config = args.range.load()?;
    let (names, order) = parse_pattern(&args.pattern)?;
    let sim = SimConfig {
        reorder_window: args.reorder_window,
        seed: config.seed.unwrap_or(0),
        ..SimConfig::default()
    };
    let sample_period = u64::from(sim.sample_period);
    let session = GpuSession::start(config, sample_period, |contexts, handler| {
        SimulatedBackend::new(sim, contexts, handler)
    })
    .context("Failed to start session")?;
    if !args.json {
        output::info(&format!(
            "{} threads x {} passes over {} sites, mode {}",
            args.threads,
            args.iterations,
            names.len(),
            session.mode()
        ));
    }

    let total = (args.threads * args.iterations * order.len()) as u64;
    let progress = ProgressBar::new(total);
    if args.json {
        progress.set_draw_target(ProgressDrawTarget::hidden());
    }
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} launches")
            .context("Invalid progress template")?,
    );

    let threads: Vec<RangeThread> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..args.threads)
            .map(|t| {
                let session = &session;
                let names = &names;
                let order = &order;
                let progress = &progress;
                let copies = args.copies;
                let iterations = args.iterations;
                s.spawn(move || -> Result<RangeThread> {
                    let cct = session.cct();
                    let ops = session.operations();
                    // one call path per site, distinct per thread
                    let sites: Vec<CctNodeId> = (0..names.len())
                        .map(|k| {
                            let caller = IpNormalized::new(1, 0x10_0000 * (t as u64 + 1) + 0x10 * k as u64);
                            cct.insert_ip_norm(cct.root(), caller, false)
                        })
                        .collect();
                    let mut thread = session.register_thread();
                    for _ in 0..iterations {
                        for &k in order {
                            let spec = KernelSpec {
                                grid: (128, 1, 1),
                                block: (256, 1, 1),
                                ..KernelSpec::new(CONTEXT, IpNormalized::new(2, 0x1000 * (k as u64 + 1)))
                            };
                            ops.launch_kernel(&mut thread, sites[k], &spec)?;
                            progress.inc(1);
                        }
                        if copies {
                            let copy = CopySpec {
                                context: CONTEXT,
                                stream: 0,
                                kind: CopyKind::HostToDevice,
                                bytes: 1 << 20,
                            };
                            ops.memcpy(&thread, sites[0], &copy)?;
                            let alloc = AllocSpec {
                                context: CONTEXT,
                                kind: MemoryKind::Device,
                                bytes: 1 << 20,
                            };
                            ops.alloc(&thread, sites[0], &alloc)?;
                        }
                    }
                    Ok(thread)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| match w.join() {
                Ok(result) => result,
                Err(_) => bail!("Launch thread panicked"),
            })
            .collect::<Result<Vec<_>>>()
    })?;
    progress.finish_and_clear();

    let cct = session.cct().clone();
    let metrics = session.metrics().clone();
    let summary = session.finish(threads).context("Failed to finish session")?;

    let mut nodes: Vec<_> = metrics
        .snapshot()
        .into_iter()
        .filter(|(_, m)| m.kernel_count > 0)
        .collect();
    nodes.sort_by(|a, b| b.1.gpu_time_ns().cmp(&a.1.gpu_time_ns()));
    let hottest = nodes
        .into_iter()
        .take(args.top)
        .map(|(node, m)| HotContext {
            path: cct
                .path(node)
                .iter()
                .map(|addr| addr.to_string())
                .collect::<Vec<_>>()
                .join(" > "),
            kernels: m.kernel_count,
            gpu_time_ns: m.gpu_time_ns(),
            // samples land on the kernel's PC children
            pc_samples: m.pc_samples
                + cct
                    .children(node)
                    .into_iter()
                    .filter_map(|child| metrics.node(child))
                    .map(|child| child.pc_samples)
                    .sum::<u64>(),
        })
        .collect();
    let report = Report { summary, hottest };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_report(&report.summary);
        for hot in &report.hottest {
            output::hot_context(&hot.path, hot.kernels, hot.gpu_time_ns, hot.pc_samples);
        }
    }
    if args.metrics {
        print!("{}", stride_gpu::telemetry::encode_metrics());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_reuses_names() {
        let (names, order) = parse_pattern("a, b,a,c").unwrap();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(order, vec![0, 1, 0, 2]);
    }

    #[test]
    fn test_empty_site_rejected() {
        assert!(parse_pattern("a,,b").is_err());
    }
}
