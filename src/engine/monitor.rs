//! Periodic re-analysis driven from the caller's thread.

use std::thread;
use std::time::Duration;

use crate::engine::fusion::ThreatAnalysis;
use crate::engine::policy::ThreatCategory;
use crate::engine::HypervisorDetector;
use crate::error::{DetectorError, Result};
use crate::hw::{poison_cache, Clock, CounterSource};

pub struct Monitor<C: CounterSource, K: Clock> {
    detector: HypervisorDetector<C, K>,
    latest: Option<ThreatAnalysis>,
    countermeasures: bool,
}

impl<C: CounterSource, K: Clock> Monitor<C, K> {
    /// `detector` should already be initialized.
    pub fn new(detector: HypervisorDetector<C, K>, countermeasures: bool) -> Self {
        Self { detector, latest: None, countermeasures }
    }

    pub fn latest(&self) -> Option<&ThreatAnalysis> {
        self.latest.as_ref()
    }

    pub fn detector(&self) -> &HypervisorDetector<C, K> {
        &self.detector
    }

    pub fn into_detector(self) -> HypervisorDetector<C, K> {
        self.detector
    }

    /// One analysis. Returns it with a flag telling whether its category
    /// differs from the previous one.
    pub fn step(&mut self) -> Result<(ThreatAnalysis, bool)> {
        let analysis = self.detector.analyze()?;
        let previous = self.latest.as_ref().map(ThreatAnalysis::category);
        let category = analysis.category();
        let changed = previous != Some(category);
        self.latest = Some(analysis);

        if changed {
            log::info!("[MONITOR] category {:?} -> {:?} ({}%)", previous, category, analysis.percentage());
        }
        if self.countermeasures && category.cache_poisoning() {
            self.poison(category);
        }
        Ok((analysis, changed))
    }

    fn poison(&self, category: ThreatCategory) {
        let intensity = category.poison_intensity();
        match poison_cache(intensity) {
            Ok(accesses) => log::debug!("[MONITOR] cache poisoned at {}% ({} accesses)", intensity, accesses),
            Err(e) => log::warn!("[MONITOR] cache poisoning skipped: {}", e),
        }
    }

    /// Runs `iterations` analyses, sleeping `interval` between them, and
    /// calls `on_change` for the first analysis and every category change.
    ///
    /// Returns the number of analyses that succeeded. A failed analysis is
    /// logged and skipped, except an allocation failure, which stops the loop.
    pub fn run<F>(&mut self, iterations: usize, interval: Duration, mut on_change: F) -> Result<usize>
    where
        F: FnMut(&ThreatAnalysis),
    {
        let mut completed = 0;
        for i in 0..iterations {
            match self.step() {
                Ok((analysis, changed)) => {
                    completed += 1;
                    if changed {
                        on_change(&analysis);
                    }
                }
                Err(e @ DetectorError::MeasurementUnavailable { .. }) => return Err(e),
                Err(e) => log::error!("[MONITOR] analysis failed: {}", e),
            }

            if i + 1 < iterations && !interval.is_zero() {
                thread::sleep(interval);
            }
        }
        Ok(completed)
    }
}
