//! Prometheus counters describing the engine itself

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

// ── Attribution ──────────────────────────────────────────────────────────────

pub static ACTIVITIES_ATTRIBUTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "stride_gpu_activities_attributed_total",
        "Activity records handed to the attribution sink",
        &["kind"]
    )
    .unwrap()
});

pub static CORRELATION_MISSES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stride_gpu_correlation_misses_total",
        "Completion records whose correlation id was never submitted"
    )
    .unwrap()
});

pub static FLUSHES_COMPLETED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stride_gpu_flushes_completed_total",
        "Channel flush handshakes completed by the multiplexer"
    )
    .unwrap()
});

// ── Ranges ───────────────────────────────────────────────────────────────────

pub static RANGES_OPENED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "stride_gpu_ranges_opened_total",
        "Ranges opened by a lead thread",
        &["mode"]
    )
    .unwrap()
});

pub static LEAD_WAIT: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "stride_gpu_lead_wait_seconds",
        "Time spent spinning on the range lead slot",
        vec![0.000_001, 0.000_01, 0.000_1, 0.001, 0.01, 0.1, 1.0]
    )
    .unwrap()
});

pub static TRIE_COMPRESSIONS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "stride_gpu_trie_compressions_total",
        "Range tries compressed after exceeding the depth threshold"
    )
    .unwrap()
});

// ── Vendor ───────────────────────────────────────────────────────────────────

pub static VENDOR_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "stride_gpu_vendor_failures_total",
        "Vendor API calls that returned an error",
        &["op"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
