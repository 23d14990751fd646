//! Time-related utilities

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
///
/// Used to stamp CPU-side submission times; never goes backwards.
pub fn monotonic_nanos() -> u64 {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
