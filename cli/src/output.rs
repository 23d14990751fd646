//! Output formatting utilities for CLI commands

use colored::Colorize;
use stride_gpu::SessionSummary;
use stride_shared::utils::format_bytes;

/// Print info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

fn row(label: &str, value: impl std::fmt::Display) {
    println!("  {:<18} {}", label.dimmed(), value);
}

fn millis(ns: u64) -> String {
    format!("{:.3} ms", ns as f64 / 1e6)
}

pub fn print_report(summary: &SessionSummary) {
    println!(
        "{} {} session, range mode {}",
        "✓".green(),
        summary.backend.bold(),
        summary.mode.cyan()
    );
    row("ranges", summary.ranges_opened);
    row("kernels", summary.kernels);
    row("copies", format!("{} ({})", summary.copies, format_bytes(summary.copy_bytes)));
    row("allocations", format!("{} ({})", summary.allocs, format_bytes(summary.alloc_bytes)));
    row("pc samples", summary.pc_samples);
    row("gpu time", millis(summary.gpu_time_ns));
    row("records", summary.attributed);
    row("cct nodes", summary.cct_nodes);
    if summary.vendor_failures > 0 {
        warning(&format!("{} PC sampling calls failed", summary.vendor_failures));
    }
    if summary.unretired > 0 {
        warning(&format!("{} operations never completed", summary.unretired));
    }
}

pub fn hot_context(path: &str, kernels: u64, gpu_time_ns: u64, pc_samples: u64) {
    println!(
        "  {} {} ({} kernels, {} samples)",
        millis(gpu_time_ns).yellow(),
        path,
        kernels,
        pc_samples
    );
}
