//! Flush-and-reload latency anomalies.
//!
//! Cache partitioning or contention introduced by a hypervisor inflates the
//! cost of reloading an evicted region more consistently than it inflates
//! raw instruction timing, hence the lower 2.0x bar.

use crate::config::CacheConfig;
use crate::engine::baseline::Baseline;
use crate::error::{scratch_buffer, Result};
use crate::hw::{CacheProbe, Clock};

/// Flushes the region and times a probe of it, `trials` times.
pub fn measure<K: Clock>(clock: &K, cache: &CacheProbe, region: &[u8], trials: usize) -> Vec<u64> {
    (0..trials)
        .map(|_| {
            cache.flush(region);
            clock.time(|| cache.probe(region)).0
        })
        .collect()
}

pub fn score(latencies: &[u64], baseline: &Baseline, config: &CacheConfig) -> f32 {
    if !baseline.established || latencies.is_empty() {
        return 0.0;
    }
    let reference = baseline.avg_cache_latency.max(1) as f64;
    let anomalous = latencies
        .iter()
        .filter(|&&latency| latency as f64 / reference > config.deviation_threshold)
        .count();
    anomalous as f32 / latencies.len() as f32
}

pub fn detect<K: Clock>(clock: &K, cache: &CacheProbe, baseline: &Baseline, config: &CacheConfig) -> Result<f32> {
    if !baseline.established {
        return Ok(0.0);
    }
    let region = scratch_buffer("cache detector region", config.region_bytes, config.fill_byte)?;
    let latencies = measure(clock, cache, &region, config.trials);
    let confidence = score(&latencies, baseline, config);
    if confidence > 0.3 {
        log::warn!("[CACHE] anomalies in {:.1}% of trials", confidence * 100.0);
    }
    log::debug!("[CACHE] latencies={:?} baseline={}", latencies, baseline.avg_cache_latency);
    Ok(confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectorError;
    use crate::hw::clock::testing::{ScriptClock, StepClock};

    fn baseline(cache: u64) -> Baseline {
        Baseline { avg_cache_latency: cache, established: true, ..Default::default() }
    }

    #[test]
    fn threshold_is_strict() {
        let b = baseline(1_000);
        assert_eq!(score(&[2_000; 10], &b, &CacheConfig::default()), 0.0);
        assert!((score(&[2_001; 10], &b, &CacheConfig::default()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn detect_counts_slow_reloads() {
        let clock = ScriptClock::new([100, 100, 500, 100, 100, 100, 100, 201, 100, 100]);
        let confidence = detect(&clock, &CacheProbe::detect(), &baseline(100), &CacheConfig::default()).unwrap();
        assert!((confidence - 0.2).abs() < 1e-6);
    }

    #[test]
    fn zero_baseline_does_not_divide_by_zero() {
        let b = baseline(0);
        assert_eq!(score(&[1; 10], &b, &CacheConfig::default()), 0.0);
    }

    #[test]
    fn region_is_probed_in_full() {
        let region = vec![0xBBu8; 8 * 1024];
        let latencies = measure(&StepClock::new(7), &CacheProbe::detect(), &region, 3);
        assert_eq!(latencies, vec![7, 7, 7]);
    }

    #[test]
    fn oversized_region_reports_unavailable() {
        let config = CacheConfig { region_bytes: usize::MAX, ..CacheConfig::default() };
        let err = detect(&StepClock::new(1), &CacheProbe::detect(), &baseline(1), &config).unwrap_err();
        assert!(matches!(err, DetectorError::MeasurementUnavailable { .. }));
    }
}
