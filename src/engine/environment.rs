//! Environment Detection Module
//!
//! Host settings that degrade measurement quality without being evidence of a
//! hypervisor. They are reported alongside the results so a noisy verdict can
//! be read in context.
//!
//! # Factors Considered
//!
//! - **CPU Governor**: frequency scaling skews every latency ratio
//! - **SMT**: sibling thread activity adds cache and timing noise
//! - **perf_event_paranoid**: at 3 or above unprivileged counters are refused,
//!   so counter blocking is the kernel's doing, not a hypervisor's

use serde::Serialize;
use std::fs;

const GOVERNOR_PATH: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";
const SMT_PATH: &str = "/sys/devices/system/cpu/smt/active";
const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentState {
    pub cpu_governor: Option<String>,
    pub smt_active: Option<bool>,
    pub perf_event_paranoid: Option<i32>,
    /// Whether the measuring thread is pinned to one CPU.
    pub pinned: bool,
    pub warnings: Vec<String>,
}

impl EnvironmentState {
    pub fn detect() -> Self {
        let mut state = Self {
            cpu_governor: read_first_line(GOVERNOR_PATH),
            smt_active: read_first_line(SMT_PATH).map(|v| v == "1"),
            perf_event_paranoid: read_first_line(PARANOID_PATH).and_then(|v| v.parse().ok()),
            ..Self::default()
        };
        state.collect_warnings();
        state
    }

    fn collect_warnings(&mut self) {
        match self.cpu_governor.as_deref() {
            Some("performance") | None => {}
            Some(gov @ ("schedutil" | "ondemand" | "conservative" | "powersave")) => self.warnings.push(format!(
                "CPU governor '{}' scales frequency, latency ratios will be noisy",
                gov
            )),
            Some(gov) => self.warnings.push(format!("unrecognised CPU governor '{}'", gov)),
        }

        if self.smt_active == Some(true) {
            self.warnings.push("SMT active, sibling threads add timing noise".to_string());
        }

        if let Some(level) = self.perf_event_paranoid {
            if level >= 3 {
                self.warnings.push(format!(
                    "perf_event_paranoid={} refuses unprivileged counters, counter blocking is kernel policy",
                    level
                ));
            }
        }
    }

    /// True when a counter refusal can be pinned on the kernel rather than a hypervisor.
    pub fn counters_restricted_by_kernel(&self) -> bool {
        matches!(self.perf_event_paranoid, Some(level) if level >= 3)
    }

    pub fn log_summary(&self) {
        log::info!("[ENV] CPU governor: {}", self.cpu_governor.as_deref().unwrap_or("unknown"));
        log::info!(
            "[ENV] SMT active: {}",
            self.smt_active.map_or("unknown".to_string(), |v| v.to_string())
        );
        log::info!(
            "[ENV] perf_event_paranoid: {}",
            self.perf_event_paranoid.map_or("unknown".to_string(), |v| v.to_string())
        );
        log::info!("[ENV] pinned to CPU 0: {}", self.pinned);
        for warning in &self.warnings {
            log::warn!("[ENV] {}", warning);
        }
    }
}

fn read_first_line(path: &str) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().next().map(|line| line.trim().to_string())
}

/// Pins the calling thread to `cpu`. Core migration mid-sample adds hundreds
/// of cycles of noise and can cross counters with different offsets.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn try_pin_to_cpu(cpu: usize) -> bool {
    // SAFETY: cpu_set_t is plain data; zeroed is its empty state and
    // sched_setaffinity only reads it.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn try_pin_to_cpu(_cpu: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        // Contents depend on the host; detection must simply not panic.
        let state = EnvironmentState::detect();
        state.log_summary();
    }

    #[test]
    fn paranoid_three_blames_kernel() {
        let mut state = EnvironmentState { perf_event_paranoid: Some(3), ..Default::default() };
        state.collect_warnings();
        assert!(state.counters_restricted_by_kernel());
        assert_eq!(state.warnings.len(), 1);
    }

    #[test]
    fn noisy_governor_and_smt_warn() {
        let mut state = EnvironmentState {
            cpu_governor: Some("powersave".into()),
            smt_active: Some(true),
            perf_event_paranoid: Some(2),
            ..Default::default()
        };
        state.collect_warnings();
        assert_eq!(state.warnings.len(), 2);
        assert!(!state.counters_restricted_by_kernel());
    }

    #[test]
    fn performance_governor_is_quiet() {
        let mut state = EnvironmentState { cpu_governor: Some("performance".into()), ..Default::default() };
        state.collect_warnings();
        assert!(state.warnings.is_empty());
    }
}
