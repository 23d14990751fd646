//! Spin-waiting
//!
//! The range lead election and the channel flush handshake both wait by
//! spinning rather than parking: the waits are short by construction (until
//! the lead thread finishes its range transition, or until the multiplexer
//! reaches a flush record) and OS wake-up latency would dominate them.
//!
//! Every such wait goes through [`SpinWait`], so there is exactly one place
//! that decides what happens when a wait runs long. Today that is a single
//! warning per wait; a vendor call that never returns will keep the waiter
//! spinning.

use std::time::{Duration, Instant};
use tracing::warn;

/// Spins before falling back to `yield_now`
const SPINS_BEFORE_YIELD: u32 = 128;

/// How often (in iterations) the clock is consulted
const CLOCK_CHECK_INTERVAL: u32 = 1024;

#[derive(Debug, Clone, Copy)]
pub struct SpinWait {
    /// Longest wait considered normal; exceeding it is logged once
    max_expected: Duration,
}

impl SpinWait {
    pub const DEFAULT_MAX_EXPECTED: Duration = Duration::from_millis(250);

    pub fn new(max_expected: Duration) -> Self {
        Self { max_expected }
    }

    pub fn max_expected(&self) -> Duration {
        self.max_expected
    }

    /// Spin until `ready` returns true; returns how long the wait took.
    ///
    /// The fast path (already ready) does not read the clock.
    pub fn wait_until(&self, what: &str, mut ready: impl FnMut() -> bool) -> Duration {
        if ready() {
            return Duration::ZERO;
        }
        let start = Instant::now();
        let mut spins: u32 = 0;
        let mut warned = false;
        while !ready() {
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            spins = spins.wrapping_add(1);
            if !warned && spins % CLOCK_CHECK_INTERVAL == 0 && start.elapsed() > self.max_expected {
                warn!(
                    "{} wait exceeded {:?}; still spinning",
                    what, self.max_expected
                );
                warned = true;
            }
        }
        start.elapsed()
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_EXPECTED)
    }
}
