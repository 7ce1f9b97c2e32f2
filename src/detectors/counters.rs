//! Performance counter blocking.
//!
//! Restrictive hypervisors hide the PMU from guests or hand out emulated
//! counters. This detector does not sample anything itself; it grades what
//! the battery opened at initialisation and how plausible one reading is.

use crate::config::CounterConfig;
use crate::engine::baseline::Baseline;
use crate::hw::CounterSource;

/// `counters` is `None` when the battery was never opened. A battery that
/// was opened but refused every counter is graded as blocked.
pub fn detect(counters: Option<&dyn CounterSource>, baseline: &Baseline, config: &CounterConfig) -> f32 {
    let Some(counters) = counters else {
        return config.absent_score;
    };

    if !counters.accessible() {
        log::warn!("[PERF] counters blocked or restricted ({} of 8 open)", counters.open_count());
        return config.blocked_score;
    }

    let snapshot = match counters.read() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::warn!("[PERF] counters open but unreadable: {}", e);
            return config.blocked_score;
        }
    };

    if snapshot.instructions > config.min_instructions {
        let cpi = snapshot.cycles as f64 / snapshot.instructions as f64;

        if cpi < config.cpi_min || cpi > config.cpi_max {
            log::warn!("[PERF] implausible CPI {:.2}", cpi);
            return config.implausible_cpi_score;
        }

        let expected = baseline.avg_cycles_per_instruction;
        if expected > 0.0 && (cpi - expected).abs() / expected > config.cpi_tolerance {
            log::info!("[PERF] CPI {:.2} drifted from baseline {:.2}", cpi, expected);
            return config.cpi_drift_score;
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::counters::testing::ScriptedCounters;
    use crate::hw::CounterSnapshot;

    fn baseline(cpi: f64) -> Baseline {
        Baseline { avg_cycles_per_instruction: cpi, established: true, ..Default::default() }
    }

    fn snapshot(cycles: u64, instructions: u64) -> CounterSnapshot {
        CounterSnapshot { cycles, instructions, ..Default::default() }
    }

    #[test]
    fn absent_source_is_mildly_suspicious() {
        assert_eq!(detect(None, &baseline(1.5), &CounterConfig::default()), 0.5);
    }

    #[test]
    fn five_of_eight_is_blocked() {
        let c = ScriptedCounters::opened(5, snapshot(3_000_000, 2_000_000));
        assert!(!c.accessible());
        assert_eq!(detect(Some(&c), &baseline(1.5), &CounterConfig::default()), 0.9);
    }

    #[test]
    fn six_of_eight_within_tolerance_is_clean() {
        let c = ScriptedCounters::opened(6, snapshot(3_000_000, 2_000_000));
        assert!(c.accessible());
        assert_eq!(detect(Some(&c), &baseline(1.5), &CounterConfig::default()), 0.0);
    }

    #[test]
    fn implausible_cpi_is_flagged() {
        let high = ScriptedCounters::opened(8, snapshot(40_000_000, 2_000_000));
        assert_eq!(detect(Some(&high), &baseline(1.5), &CounterConfig::default()), 0.6);
        let low = ScriptedCounters::opened(8, snapshot(100_000, 2_000_000));
        assert_eq!(detect(Some(&low), &baseline(1.5), &CounterConfig::default()), 0.6);
    }

    #[test]
    fn cpi_drift_over_half_is_flagged() {
        // CPI 2.4 against 1.5 is a 60% drift.
        let c = ScriptedCounters::opened(8, snapshot(4_800_000, 2_000_000));
        assert_eq!(detect(Some(&c), &baseline(1.5), &CounterConfig::default()), 0.5);
        // CPI 2.0 against 1.5 is 33%.
        let c = ScriptedCounters::opened(8, snapshot(4_000_000, 2_000_000));
        assert_eq!(detect(Some(&c), &baseline(1.5), &CounterConfig::default()), 0.0);
    }

    #[test]
    fn small_samples_are_not_judged() {
        let c = ScriptedCounters::opened(8, snapshot(50_000_000, 1_000_000));
        assert_eq!(detect(Some(&c), &baseline(1.5), &CounterConfig::default()), 0.0);
    }
}
