//! Measurement primitives: clock, cache maintenance, performance counters.

pub mod cache;
pub mod clock;
pub mod counters;

pub use cache::{poison_cache, CacheProbe, FlushStrategy};
pub use clock::{Clock, ClockSource, HardwareClock};
pub use counters::{CounterKind, CounterSnapshot, CounterSource, CounterState, PerfCounters};

use crate::config::LOOP_ITERATIONS;

/// The fixed CPU-bound workload timed by the baseline and the timing detector.
///
/// Each step goes through `black_box` so the loop survives optimisation and
/// keeps a constant instruction count.
#[inline(never)]
pub fn reference_loop() -> u64 {
    let mut acc: u64 = 0;
    for i in 0..LOOP_ITERATIONS {
        acc = std::hint::black_box(acc.wrapping_add(i));
    }
    std::hint::black_box(acc)
}
