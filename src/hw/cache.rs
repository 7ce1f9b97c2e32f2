//! Cache eviction and reload primitives.

use rand::Rng;

use crate::config::CACHE_LINE;
use crate::error::{scratch_buffer, Result};

/// How `flush` evicts lines on this target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    /// `dc civac` / `clflush` per line, then a full barrier.
    LineEvict,
    /// No user-mode eviction instruction; flush only issues a fence.
    /// Detectors lose sensitivity but keep working.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheProbe {
    strategy: FlushStrategy,
}

impl CacheProbe {
    pub fn detect() -> Self {
        let strategy = detect_flush_strategy();
        if strategy == FlushStrategy::Unsupported {
            log::info!("[CACHE] no user-mode cache eviction on this target, flush is a fence only");
        }
        Self { strategy }
    }

    pub fn strategy(&self) -> FlushStrategy {
        self.strategy
    }

    /// Evicts `region` from all cache levels.
    pub fn flush(&self, region: &[u8]) {
        match self.strategy {
            FlushStrategy::LineEvict => flush_lines(region),
            FlushStrategy::Unsupported => std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// Reads one byte from every cache line the region overlaps, so evicted
    /// lines are pulled back in.
    pub fn probe(&self, region: &[u8]) {
        let mut acc: u8 = 0;
        for offset in line_offsets(region.as_ptr() as usize, region.len()) {
            // SAFETY: offset < region.len(), so the pointer is in bounds.
            let byte = unsafe { std::ptr::read_volatile(region.as_ptr().add(offset)) };
            acc = acc.wrapping_add(byte);
        }
        std::hint::black_box(acc);
    }
}

/// Offsets into a region at `addr` of length `len`, one per overlapped cache
/// line: the region start, then each later line boundary.
fn line_offsets(addr: usize, len: usize) -> impl Iterator<Item = usize> {
    let first_line = addr & !(CACHE_LINE - 1);
    let end = if len == 0 { first_line } else { addr + len };
    (first_line..end)
        .step_by(CACHE_LINE)
        .map(move |line| line.max(addr) - addr)
}

impl Default for CacheProbe {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(all(hvprobe_asm, target_arch = "x86_64"))]
fn detect_flush_strategy() -> FlushStrategy {
    if std::is_x86_feature_detected!("sse2") {
        FlushStrategy::LineEvict
    } else {
        FlushStrategy::Unsupported
    }
}

#[cfg(all(hvprobe_asm, not(target_arch = "x86_64")))]
fn detect_flush_strategy() -> FlushStrategy {
    FlushStrategy::LineEvict
}

#[cfg(not(hvprobe_asm))]
fn detect_flush_strategy() -> FlushStrategy {
    FlushStrategy::Unsupported
}

#[cfg(hvprobe_asm)]
fn flush_lines(region: &[u8]) {
    // SAFETY: the routine only issues cache maintenance on addresses inside
    // `region`, which is a live borrow.
    unsafe { crate::ffi::hvprobe_flush_range(region.as_ptr(), region.len()) }
}

#[cfg(not(hvprobe_asm))]
fn flush_lines(_region: &[u8]) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Cache-noise helper: allocates up to 1 MiB (`intensity_percent` of it) and
/// reads random lines from it, displacing whatever was cached.
///
/// Returns the number of lines touched. Intensity is clamped to 0..=100.
pub fn poison_cache(intensity_percent: u32) -> Result<usize> {
    let intensity = intensity_percent.min(100) as usize;
    let size = (1024 * 1024 * intensity) / 100;
    if size < CACHE_LINE {
        return Ok(0);
    }
    let buffer = scratch_buffer("cache poisoning", size, 0)?;
    let accesses = intensity * 100;
    let mut rng = rand::thread_rng();
    let mut acc: u8 = 0;
    for _ in 0..accesses {
        let offset = rng.gen_range(0..=size - CACHE_LINE);
        // SAFETY: offset <= size - CACHE_LINE < buffer.len().
        acc = acc.wrapping_add(unsafe { std::ptr::read_volatile(buffer.as_ptr().add(offset)) });
    }
    std::hint::black_box(acc);
    log::debug!("[CACHE] poisoned with intensity {}%", intensity);
    Ok(accesses)
}
