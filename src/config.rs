//! Tuning surface for the detector.
//!
//! Every threshold here is a heuristic carried over unchanged from the field
//! deployment. `Default` reproduces those literal values; a JSON file may
//! override any subset of them.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DetectorError, Result};

/// Cache line stride used by flush/probe and the cache-noise helper.
pub const CACHE_LINE: usize = 64;

/// Page size used by the memory-access detector.
pub const PAGE_SIZE: usize = 4096;

/// Iterations of the CPU-bound reference loop.
pub const LOOP_ITERATIONS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub rounds: usize,
    pub region_bytes: usize,
    pub fill_byte: u8,
    /// Used when no CPI sample could be taken.
    pub default_cpi: f64,
    /// Used when no miss-rate sample could be taken.
    pub default_miss_rate: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            rounds: 100,
            region_bytes: 256 * 1024,
            fill_byte: 0xAA,
            default_cpi: 1.5,
            default_miss_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub trials: usize,
    /// A trial is anomalous when latency / baseline is strictly above this.
    pub deviation_threshold: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { trials: 10, deviation_threshold: 2.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub trials: usize,
    pub region_bytes: usize,
    pub fill_byte: u8,
    pub deviation_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            region_bytes: 128 * 1024,
            fill_byte: 0xBB,
            deviation_threshold: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Snapshots with fewer retired instructions are too small to judge CPI.
    pub min_instructions: u64,
    pub cpi_min: f64,
    pub cpi_max: f64,
    /// Relative CPI deviation from baseline tolerated before flagging.
    pub cpi_tolerance: f64,
    pub absent_score: f32,
    pub blocked_score: f32,
    pub implausible_cpi_score: f32,
    pub cpi_drift_score: f32,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            min_instructions: 1_000_000,
            cpi_min: 0.1,
            cpi_max: 10.0,
            cpi_tolerance: 0.5,
            absent_score: 0.5,
            blocked_score: 0.9,
            implausible_cpi_score: 0.6,
            cpi_drift_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pages: usize,
    /// Pages slower than this multiple of the baseline cache latency count as stalls.
    pub stall_factor: u64,
    pub variance_ratio_threshold: f64,
    /// Fraction of stalled pages above which the stall score is added.
    pub stall_fraction: f64,
    pub variance_score: f32,
    pub stall_score: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pages: 100,
            stall_factor: 10,
            variance_ratio_threshold: 20.0,
            stall_fraction: 0.10,
            variance_score: 0.4,
            stall_score: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub timing_weight: f32,
    pub cache_weight: f32,
    pub counter_weight: f32,
    pub memory_weight: f32,
    /// Per-signal flag threshold for timing, cache and memory.
    pub anomaly_threshold: f32,
    /// Flag threshold for counter blocking, which reports coarse values.
    pub counter_threshold: f32,
    /// Fused confidence above which an analysis counts toward the streak.
    pub detection_threshold: f32,
    pub escalation_streak: u32,
    pub escalation_factor: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            timing_weight: 0.30,
            cache_weight: 0.25,
            counter_weight: 0.30,
            memory_weight: 0.15,
            anomaly_threshold: 0.4,
            counter_threshold: 0.7,
            detection_threshold: 0.5,
            escalation_streak: 3,
            escalation_factor: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub baseline: BaselineConfig,
    pub timing: TimingConfig,
    pub cache: CacheConfig,
    pub counters: CounterConfig,
    pub memory: MemoryConfig,
    pub fusion: FusionConfig,
    /// Pin the measuring thread to CPU 0 before sampling.
    pub pin_cpu: bool,
}

impl DetectorConfig {
    /// Defaults, with `HVPROBE_NO_PIN` turning off CPU pinning.
    pub fn from_env() -> Self {
        let mut config = Self { pin_cpu: true, ..Self::default() };
        if std::env::var_os("HVPROBE_NO_PIN").is_some() {
            config.pin_cpu = false;
        }
        config
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| DetectorError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.fusion;
        let sum = f.timing_weight + f.cache_weight + f.counter_weight + f.memory_weight;
        if (sum - 1.0).abs() > 1e-3 {
            return Err(DetectorError::Config(format!("fusion weights sum to {sum}, expected 1.0")));
        }
        if [f.timing_weight, f.cache_weight, f.counter_weight, f.memory_weight]
            .iter()
            .any(|w| *w < 0.0)
        {
            return Err(DetectorError::Config("fusion weights must be non-negative".into()));
        }
        if self.baseline.rounds == 0
            || self.timing.trials == 0
            || self.cache.trials == 0
            || self.memory.pages == 0
        {
            return Err(DetectorError::Config("sample counts must be non-zero".into()));
        }
        if self.baseline.region_bytes == 0 || self.cache.region_bytes == 0 {
            return Err(DetectorError::Config("scratch regions must be non-empty".into()));
        }
        if self.timing.deviation_threshold <= 0.0
            || self.cache.deviation_threshold <= 0.0
            || self.memory.variance_ratio_threshold <= 0.0
            || self.counters.cpi_tolerance <= 0.0
        {
            return Err(DetectorError::Config("thresholds must be positive".into()));
        }
        if f.escalation_streak == 0 {
            return Err(DetectorError::Config("escalation_streak must be at least 1".into()));
        }
        if f.escalation_factor < 1.0 {
            return Err(DetectorError::Config("escalation_factor must be >= 1.0".into()));
        }
        Ok(())
    }
}
