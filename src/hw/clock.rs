//! High-resolution timestamps.
//!
//! The counter is picked once, when the clock is built. On x86_64 this is the
//! TSC, on aarch64 the virtual count register, both read through the routines
//! in `asm/`. Anywhere else, or if the counter turns out not to advance, the
//! clock reports nanoseconds from the OS monotonic clock instead.

use std::time::Instant;

/// Anything that can hand out monotonic timestamps.
///
/// Units are whatever the underlying source ticks in; only ratios between
/// readings from the same source are meaningful.
pub trait Clock {
    fn now(&self) -> u64;

    /// Elapsed ticks while running `f`.
    fn time<R>(&self, f: impl FnOnce() -> R) -> (u64, R) {
        let start = self.now();
        let out = f();
        let end = self.now();
        (end.saturating_sub(start), out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Architecture cycle/virtual counter read in user mode.
    CycleCounter,
    /// OS monotonic clock, nanoseconds.
    Monotonic,
}

#[derive(Debug, Clone)]
pub struct HardwareClock {
    source: ClockSource,
    origin: Instant,
}

impl HardwareClock {
    /// Probes the fast counter and falls back to the monotonic clock if it is
    /// missing or frozen.
    pub fn detect() -> Self {
        let source = if cycle_counter_advances() {
            ClockSource::CycleCounter
        } else {
            ClockSource::Monotonic
        };
        log::debug!("[CLOCK] using {:?}", source);
        Self { source, origin: Instant::now() }
    }

    /// Monotonic clock regardless of hardware.
    pub fn monotonic() -> Self {
        Self { source: ClockSource::Monotonic, origin: Instant::now() }
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }
}

impl Clock for HardwareClock {
    #[inline]
    fn now(&self) -> u64 {
        match self.source {
            ClockSource::CycleCounter => read_cycle_counter().unwrap_or_else(|| monotonic_ns(self.origin)),
            ClockSource::Monotonic => monotonic_ns(self.origin),
        }
    }
}

#[inline]
fn monotonic_ns(origin: Instant) -> u64 {
    origin.elapsed().as_nanos() as u64
}

#[cfg(hvprobe_asm)]
#[inline]
fn read_cycle_counter() -> Option<u64> {
    // SAFETY: the routine reads a user-accessible counter register and
    // touches no memory.
    Some(unsafe { crate::ffi::hvprobe_read_counter() })
}

#[cfg(not(hvprobe_asm))]
#[inline]
fn read_cycle_counter() -> Option<u64> {
    None
}

/// The counter must move forward across a short busy loop. A hypervisor that
/// freezes or zeroes it would otherwise make every latency 0.
fn cycle_counter_advances() -> bool {
    let Some(first) = read_cycle_counter() else {
        return false;
    };
    let mut acc: u64 = 0;
    for i in 0..10_000u64 {
        acc = std::hint::black_box(acc.wrapping_add(i));
    }
    std::hint::black_box(acc);
    matches!(read_cycle_counter(), Some(second) if second > first)
}
