//! User-space detection of a hypervisor running beneath the current process.
//!
//! Four independent signals are compared against a per-device baseline:
//! instruction timing, cache flush/reload latency, performance-counter
//! availability and plausibility, and page-access latency. Their
//! confidences are fused into a single threat level, escalated when
//! detections repeat.
//!
//! ```no_run
//! use hypervisor_probe::HypervisorDetector;
//!
//! let mut detector = HypervisorDetector::new();
//! detector.initialize();
//! let analysis = detector.analyze()?;
//! println!("{:?} ({}%)", analysis.category(), analysis.percentage());
//! # Ok::<(), hypervisor_probe::DetectorError>(())
//! ```

pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
mod ffi;
pub mod hw;

pub use config::DetectorConfig;
pub use engine::baseline::Baseline;
pub use engine::environment::EnvironmentState;
pub use engine::fusion::{DetectorState, SignalScores, ThreatAnalysis};
pub use engine::monitor::Monitor;
pub use engine::policy::ThreatCategory;
pub use engine::HypervisorDetector;
pub use error::{DetectorError, Result};
pub use hw::{CounterKind, CounterSnapshot, CounterSource, CounterState};
