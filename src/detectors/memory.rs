//! Memory access variance.
//!
//! Touches the first byte of many freshly written pages. On bare metal the
//! latencies are tight; stage-2 translation faults and other VM exits show up
//! as a few very slow accesses, which drives the max/avg ratio up and pushes
//! individual pages past a multiple of the baseline cache latency.

use crate::config::{MemoryConfig, PAGE_SIZE};
use crate::engine::baseline::Baseline;
use crate::error::{scratch_buffer, DetectorError, Result};
use crate::hw::Clock;

/// Summary of one sweep over the pages.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccessStats {
    pub total: u64,
    pub max: u64,
    pub avg: f64,
    /// Pages slower than `stall_factor` x baseline cache latency.
    pub stalls: usize,
    pub samples: usize,
    pub variance_ratio: f64,
}

impl AccessStats {
    pub fn from_samples(latencies: &[u64], stall_limit: u64) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        let total = latencies.iter().fold(0u64, |acc, &l| acc.saturating_add(l));
        let max = latencies.iter().copied().max().unwrap_or(0);
        let avg = total as f64 / latencies.len() as f64;
        let stalls = latencies.iter().filter(|&&l| l > stall_limit).count();
        let variance_ratio = if avg > 0.0 { max as f64 / avg } else { 0.0 };
        Self { total, max, avg, stalls, samples: latencies.len(), variance_ratio }
    }
}

/// Allocates `pages` pages, page `i` filled with `i as u8`, and times one
/// first-byte read of each.
pub fn measure<K: Clock>(clock: &K, pages: usize) -> Result<Vec<u64>> {
    let mut buffers = Vec::new();
    buffers
        .try_reserve_exact(pages)
        .map_err(|_| DetectorError::MeasurementUnavailable {
            what: "memory detector page table",
            bytes: pages.saturating_mul(std::mem::size_of::<Vec<u8>>()),
        })?;
    for i in 0..pages {
        buffers.push(scratch_buffer("memory detector page", PAGE_SIZE, (i & 0xFF) as u8)?);
    }

    let latencies = buffers
        .iter()
        .map(|page| {
            clock
                .time(|| {
                    // SAFETY: every page holds PAGE_SIZE initialised bytes.
                    std::hint::black_box(unsafe { std::ptr::read_volatile(page.as_ptr()) })
                })
                .0
        })
        .collect();
    Ok(latencies)
}

pub fn score(stats: &AccessStats, config: &MemoryConfig) -> f32 {
    let mut confidence = 0.0f32;
    if stats.variance_ratio > config.variance_ratio_threshold {
        confidence = config.variance_score;
    }
    if stats.stalls as f64 > stats.samples as f64 * config.stall_fraction {
        confidence += config.stall_score;
    }
    confidence.clamp(0.0, 1.0)
}

pub fn detect<K: Clock>(clock: &K, baseline: &Baseline, config: &MemoryConfig) -> Result<f32> {
    let latencies = measure(clock, config.pages)?;
    let stall_limit = baseline.avg_cache_latency.saturating_mul(config.stall_factor);
    let stats = AccessStats::from_samples(&latencies, stall_limit);
    log::debug!(
        "[MEMORY] avg={:.1}, max={}, ratio={:.2}, stalls={}/{}",
        stats.avg,
        stats.max,
        stats.variance_ratio,
        stats.stalls,
        stats.samples
    );
    let confidence = score(&stats, config);
    if confidence > 0.3 {
        log::warn!("[MEMORY] access variance anomaly: ratio={:.2}, stalls={}", stats.variance_ratio, stats.stalls);
    }
    Ok(confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::clock::testing::{ScriptClock, StepClock};

    fn baseline(cache: u64) -> Baseline {
        Baseline { avg_cache_latency: cache, established: true, ..Default::default() }
    }

    #[test]
    fn uniform_access_is_clean() {
        let confidence = detect(&StepClock::new(40), &baseline(1_000), &MemoryConfig::default()).unwrap();
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn one_huge_outlier_trips_variance_only() {
        let mut script = vec![10u64; 100];
        script[42] = 10_000;
        let confidence = detect(&ScriptClock::new(script), &baseline(1_000_000), &MemoryConfig::default()).unwrap();
        assert!((confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn many_stalls_add_stall_score() {
        // 11 of 100 pages over 10x a baseline of 5, ratio stays low.
        let mut script = vec![40u64; 100];
        for l in script.iter_mut().take(11) {
            *l = 60;
        }
        let confidence = detect(&ScriptClock::new(script), &baseline(5), &MemoryConfig::default()).unwrap();
        assert!((confidence - 0.3).abs() < 1e-6);
    }

    #[test]
    fn ten_percent_stalls_is_not_enough() {
        let mut latencies = vec![40u64; 100];
        for l in latencies.iter_mut().take(10) {
            *l = 60;
        }
        let stats = AccessStats::from_samples(&latencies, 50);
        assert_eq!(stats.stalls, 10);
        assert_eq!(score(&stats, &MemoryConfig::default()), 0.0);
    }

    #[test]
    fn both_signals_combine() {
        let mut latencies = vec![1u64; 100];
        for l in latencies.iter_mut().take(20) {
            *l = 100;
        }
        latencies[99] = 100_000;
        let stats = AccessStats::from_samples(&latencies, 50);
        assert!(stats.variance_ratio > 20.0);
        assert!((score(&stats, &MemoryConfig::default()) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn all_zero_latencies_have_no_ratio() {
        let stats = AccessStats::from_samples(&[0; 100], 0);
        assert_eq!(stats.variance_ratio, 0.0);
        assert_eq!(score(&stats, &MemoryConfig::default()), 0.0);
    }
}
