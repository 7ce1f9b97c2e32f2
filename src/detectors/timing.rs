//! Instruction timing anomalies.
//!
//! Trap and world-switch overhead shows up on a tight CPU loop as an outsized
//! multiplicative slowdown. Ordinary scheduling jitter rarely pushes a single
//! trial past 2.5x the baseline, so each trial is judged on its own and the
//! confidence is the fraction of trials that crossed the line.

use crate::config::TimingConfig;
use crate::engine::baseline::Baseline;
use crate::hw::{reference_loop, Clock};

/// Times `trials` runs of the reference loop.
pub fn measure<K: Clock>(clock: &K, trials: usize) -> Vec<u64> {
    (0..trials).map(|_| clock.time(reference_loop).0).collect()
}

/// Fraction of trials whose latency is strictly above
/// `deviation_threshold` times the baseline loop latency.
pub fn score(latencies: &[u64], baseline: &Baseline, config: &TimingConfig) -> f32 {
    if !baseline.established || latencies.is_empty() {
        return 0.0;
    }
    let reference = baseline.avg_instruction_latency.max(1) as f64;
    let anomalous = latencies
        .iter()
        .filter(|&&latency| latency as f64 / reference > config.deviation_threshold)
        .count();
    anomalous as f32 / latencies.len() as f32
}

pub fn detect<K: Clock>(clock: &K, baseline: &Baseline, config: &TimingConfig) -> f32 {
    if !baseline.established {
        return 0.0;
    }
    let latencies = measure(clock, config.trials);
    let confidence = score(&latencies, baseline, config);
    if confidence > 0.3 {
        log::warn!("[TIMING] anomalies in {:.1}% of trials", confidence * 100.0);
    }
    log::debug!("[TIMING] latencies={:?} baseline={}", latencies, baseline.avg_instruction_latency);
    confidence
}
