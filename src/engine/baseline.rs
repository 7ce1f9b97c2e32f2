//! Per-device reference measurements.
//!
//! Every detector is a ratio against these numbers, so they are collected on
//! the device itself before any analysis runs, with the same primitives the
//! detectors use.

use serde::Serialize;

use crate::config::BaselineConfig;
use crate::error::{scratch_buffer, Result};
use crate::hw::{reference_loop, CacheProbe, Clock, CounterSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Baseline {
    /// Mean flush+probe latency of the baseline region, in clock ticks.
    pub avg_cache_latency: u64,
    /// Mean latency of one `reference_loop`, in clock ticks.
    pub avg_instruction_latency: u64,
    pub avg_cycles_per_instruction: f64,
    pub avg_cache_miss_rate: f64,
    pub established: bool,
}

/// Runs the sampling rounds and returns an established baseline.
///
/// Missing counters only cost the CPI and miss-rate samples, which fall back
/// to the configured defaults. The only failure is being unable to allocate
/// the scratch region.
pub fn establish<K: Clock>(
    clock: &K,
    cache: &CacheProbe,
    counters: &dyn CounterSource,
    config: &BaselineConfig,
) -> Result<Baseline> {
    log::debug!("[BASELINE] establishing over {} rounds", config.rounds);

    let region = scratch_buffer("baseline cache region", config.region_bytes, config.fill_byte)?;
    let use_counters = counters.accessible();
    if !use_counters {
        log::info!("[BASELINE] counters not accessible, CPI and miss rate use defaults");
    }

    let mut total_cache: u64 = 0;
    let mut total_instr: u64 = 0;
    let mut cpi_samples = Vec::with_capacity(if use_counters { config.rounds } else { 0 });
    let mut miss_samples = Vec::with_capacity(if use_counters { config.rounds } else { 0 });

    for _ in 0..config.rounds {
        cache.flush(&region);
        let (latency, _) = clock.time(|| cache.probe(&region));
        total_cache = total_cache.saturating_add(latency);

        let (latency, _) = clock.time(reference_loop);
        total_instr = total_instr.saturating_add(latency);

        if use_counters {
            match counters.read() {
                Ok(snapshot) => {
                    if let Some(cpi) = snapshot.cpi() {
                        cpi_samples.push(cpi);
                    }
                    if let Some(rate) = snapshot.miss_rate() {
                        miss_samples.push(rate);
                    }
                }
                Err(e) => log::debug!("[BASELINE] counter read skipped: {}", e),
            }
        }
    }

    let rounds = config.rounds.max(1) as u64;
    let baseline = Baseline {
        avg_cache_latency: total_cache / rounds,
        avg_instruction_latency: total_instr / rounds,
        avg_cycles_per_instruction: mean(&cpi_samples).unwrap_or(config.default_cpi),
        avg_cache_miss_rate: mean(&miss_samples).unwrap_or(config.default_miss_rate),
        established: true,
    };

    log::info!(
        "[BASELINE] cache_latency={}, instr_latency={}, cpi={:.2}, miss_rate={:.4}",
        baseline.avg_cache_latency,
        baseline.avg_instruction_latency,
        baseline.avg_cycles_per_instruction,
        baseline.avg_cache_miss_rate
    );
    Ok(baseline)
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}
