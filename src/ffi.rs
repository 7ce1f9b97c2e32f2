//! Assembly routines linked in by `build.rs`.
//!
//! Only present when the build script emitted `cfg(hvprobe_asm)`; every caller
//! must keep a portable path for the other targets.

#[cfg(hvprobe_asm)]
extern "C" {
    /// Returns the raw CPU counter.
    /// x86_64: RDTSC behind LFENCE. aarch64: CNTVCT_EL0 behind ISB.
    pub fn hvprobe_read_counter() -> u64;

    /// Evicts `[start, start + len)` from every cache level, one 64-byte line
    /// at a time, and finishes with a full barrier.
    pub fn hvprobe_flush_range(start: *const u8, len: usize);
}
