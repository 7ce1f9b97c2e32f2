//! The detection engine: baseline, detectors, fusion, and the state that ties
//! repeated analyses together.

pub mod baseline;
pub mod environment;
pub mod fusion;
pub mod monitor;
pub mod policy;

use crate::config::DetectorConfig;
use crate::detectors;
use crate::error::Result;
use crate::hw::{CacheProbe, Clock, CounterSource, HardwareClock, PerfCounters};

use baseline::Baseline;
use environment::{try_pin_to_cpu, EnvironmentState};
use fusion::{DetectorState, SignalScores, ThreatAnalysis};

/// A caller-owned detector instance.
///
/// Owns the counter battery for its whole lifetime; counters are opened by
/// [`initialize`](Self::initialize) and released when the detector drops.
/// All measurement runs on the calling thread, and `&mut self` on
/// [`analyze`](Self::analyze) keeps passes from overlapping.
pub struct HypervisorDetector<C: CounterSource = PerfCounters, K: Clock = HardwareClock> {
    config: DetectorConfig,
    clock: K,
    cache: CacheProbe,
    counters: C,
    /// Set once `initialize` has tried the battery, whatever it got.
    counters_probed: bool,
    baseline: Baseline,
    state: DetectorState,
    environment: Option<EnvironmentState>,
}

impl HypervisorDetector {
    /// Hardware clock, perf counters, defaults (see [`DetectorConfig::from_env`]).
    pub fn new() -> Self {
        Self::with_config(DetectorConfig::from_env())
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self::with_parts(config, HardwareClock::detect(), PerfCounters::new())
    }
}

impl Default for HypervisorDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CounterSource, K: Clock> HypervisorDetector<C, K> {
    pub fn with_parts(config: DetectorConfig, clock: K, counters: C) -> Self {
        Self {
            config,
            clock,
            cache: CacheProbe::detect(),
            counters,
            counters_probed: false,
            baseline: Baseline::default(),
            state: DetectorState::default(),
            environment: None,
        }
    }

    /// Acquires the counter battery (best effort) and records the host
    /// environment. Returns false only if the configuration is unusable.
    ///
    /// The baseline is deferred to the first [`analyze`](Self::analyze) so
    /// this stays fast.
    pub fn initialize(&mut self) -> bool {
        log::debug!("[ENGINE] initializing");
        if let Err(e) = self.config.validate() {
            log::error!("[ENGINE] {}", e);
            return false;
        }

        let mut environment = EnvironmentState::detect();
        if self.config.pin_cpu {
            environment.pinned = try_pin_to_cpu(0);
            if !environment.pinned {
                log::warn!("[ENGINE] could not pin to CPU 0, results may vary");
            }
        }
        environment.log_summary();

        let opened = self.counters.open();
        self.counters_probed = true;
        if !self.counters.accessible() {
            if environment.counters_restricted_by_kernel() {
                log::warn!("[ENGINE] counters restricted by kernel policy, limited detection capability");
            } else {
                log::warn!("[ENGINE] performance counters not accessible, limited detection capability");
            }
        }
        self.environment = Some(environment);

        log::info!("[ENGINE] ready ({} of 8 counters)", opened);
        true
    }

    /// One full pass: baseline if needed, all four detectors, fusion.
    pub fn analyze(&mut self) -> Result<ThreatAnalysis> {
        let timestamp = self.clock.now();

        if !self.baseline.established {
            self.baseline = baseline::establish(&self.clock, &self.cache, &self.counters, &self.config.baseline)?;
        }

        let counters: Option<&dyn CounterSource> = if self.counters_probed { Some(&self.counters) } else { None };

        let scores = SignalScores {
            timing: detectors::timing::detect(&self.clock, &self.baseline, &self.config.timing),
            cache: detectors::cache::detect(&self.clock, &self.cache, &self.baseline, &self.config.cache)?,
            counter: detectors::counters::detect(counters, &self.baseline, &self.config.counters),
            memory: detectors::memory::detect(&self.clock, &self.baseline, &self.config.memory)?,
        };

        let analysis = fusion::fuse(scores, &mut self.state, timestamp, &self.config.fusion);

        log::info!(
            "[ENGINE] threat_level={:.2}, hypervisor_confidence={:.2}",
            analysis.threat_level,
            analysis.hypervisor_confidence
        );
        log::debug!(
            "[ENGINE]   timing={:.2}, cache={:.2}, perf={:.2}, memory={:.2}",
            scores.timing,
            scores.cache,
            scores.counter,
            scores.memory
        );
        Ok(analysis)
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn counters(&self) -> &C {
        &self.counters
    }

    pub fn counters_accessible(&self) -> bool {
        self.counters.accessible()
    }

    /// Host diagnostics gathered by `initialize`.
    pub fn environment(&self) -> Option<&EnvironmentState> {
        self.environment.as_ref()
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }
}

impl<C: CounterSource, K: Clock> Drop for HypervisorDetector<C, K> {
    fn drop(&mut self) {
        self.counters.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::clock::testing::StepClock;
    use crate::hw::counters::testing::ScriptedCounters;
    use crate::hw::CounterSnapshot;

    fn quiet_config() -> DetectorConfig {
        let mut config = DetectorConfig::default();
        config.baseline.rounds = 5;
        config.baseline.region_bytes = 16 * 1024;
        config
    }

    fn snapshot(cycles: u64, instructions: u64) -> CounterSnapshot {
        CounterSnapshot { cycles, instructions, cache_references: 100, cache_misses: 5, ..Default::default() }
    }

    #[test]
    fn uninitialized_detector_scores_absent_counters() {
        let counters = ScriptedCounters::new(8, snapshot(3_000_000, 2_000_000));
        let mut detector = HypervisorDetector::with_parts(quiet_config(), StepClock::new(100), counters);
        let a = detector.analyze().unwrap();
        assert!(detector.baseline().established);
        assert_eq!(a.scores.counter, 0.5);
        assert!(!a.counter_blocked);
    }

    #[test]
    fn steady_host_is_clean() {
        let counters = ScriptedCounters::new(8, snapshot(3_000_000, 2_000_000));
        let mut detector = HypervisorDetector::with_parts(quiet_config(), StepClock::new(100), counters);
        assert!(detector.initialize());
        let a = detector.analyze().unwrap();
        assert_eq!(a.scores, SignalScores::default());
        assert_eq!(a.hypervisor_confidence, 0.0);
        assert_eq!(detector.state().consecutive_detections, 0);
        assert_eq!(detector.state().last_analysis_time, a.timestamp);
        assert!((detector.baseline().avg_cycles_per_instruction - 1.5).abs() < 1e-12);
    }

    #[test]
    fn partial_battery_reports_blocking() {
        let counters = ScriptedCounters::new(4, snapshot(3_000_000, 2_000_000));
        let mut detector = HypervisorDetector::with_parts(quiet_config(), StepClock::new(100), counters);
        detector.initialize();
        let a = detector.analyze().unwrap();
        assert_eq!(a.scores.counter, 0.9);
        assert!(a.counter_blocked);
        assert!((a.hypervisor_confidence - 0.27).abs() < 1e-6);
    }

    #[test]
    fn baseline_is_established_once() {
        let counters = ScriptedCounters::new(0, CounterSnapshot::default());
        let mut detector = HypervisorDetector::with_parts(quiet_config(), StepClock::new(10), counters);
        detector.initialize();
        detector.analyze().unwrap();
        let first = *detector.baseline();
        detector.analyze().unwrap();
        assert_eq!(*detector.baseline(), first);
    }

    #[test]
    fn hidden_pmu_is_blocking_not_absent() {
        let counters = ScriptedCounters::new(0, CounterSnapshot::default());
        let mut detector = HypervisorDetector::with_parts(quiet_config(), StepClock::new(100), counters);
        assert!(detector.initialize());
        let a = detector.analyze().unwrap();
        assert_eq!(a.scores.counter, 0.9);
        assert!(a.counter_blocked);
        assert!((a.hypervisor_confidence - 0.27).abs() < 1e-6);
    }

    #[test]
    fn invalid_config_fails_initialization() {
        let mut config = quiet_config();
        config.fusion.timing_weight = 0.9;
        let counters = ScriptedCounters::new(8, CounterSnapshot::default());
        let mut detector = HypervisorDetector::with_parts(config, StepClock::new(1), counters);
        assert!(!detector.initialize());
    }
}
