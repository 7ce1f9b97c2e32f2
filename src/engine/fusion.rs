//! Weighted fusion of detector confidences with escalation on repeat hits.

use serde::Serialize;

use crate::config::FusionConfig;
use crate::engine::policy::ThreatCategory;

/// Raw confidence from each detector, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SignalScores {
    pub timing: f32,
    pub cache: f32,
    pub counter: f32,
    pub memory: f32,
}

/// Result of one analysis pass. Built once and never modified.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThreatAnalysis {
    pub threat_level: f32,
    pub hypervisor_confidence: f32,
    pub timing_anomaly: bool,
    pub cache_anomaly: bool,
    pub counter_blocked: bool,
    pub memory_anomaly: bool,
    pub timestamp: u64,
    pub scores: SignalScores,
}

impl ThreatAnalysis {
    pub fn category(&self) -> ThreatCategory {
        ThreatCategory::from_level(self.threat_level)
    }

    /// Threat level as a whole percentage, truncated.
    pub fn percentage(&self) -> u32 {
        (self.threat_level * 100.0) as u32
    }
}

/// Cross-call memory of the fusion step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectorState {
    pub last_analysis_time: u64,
    pub consecutive_detections: u32,
}

/// Weighted sum of the four scores.
pub fn fused_confidence(scores: &SignalScores, config: &FusionConfig) -> f32 {
    scores.timing * config.timing_weight
        + scores.cache * config.cache_weight
        + scores.counter * config.counter_weight
        + scores.memory * config.memory_weight
}

/// Combines one pass of detector scores into an analysis and advances the
/// detection streak in `state`.
pub fn fuse(scores: SignalScores, state: &mut DetectorState, timestamp: u64, config: &FusionConfig) -> ThreatAnalysis {
    let hypervisor_confidence = fused_confidence(&scores, config);
    let mut threat_level = hypervisor_confidence;

    if hypervisor_confidence > config.detection_threshold {
        state.consecutive_detections = state.consecutive_detections.saturating_add(1);
    } else {
        state.consecutive_detections = 0;
    }

    if state.consecutive_detections >= config.escalation_streak {
        threat_level = (threat_level * config.escalation_factor).min(1.0);
        log::warn!(
            "[FUSION] {} consecutive detections, threat escalated to {:.2}",
            state.consecutive_detections,
            threat_level
        );
    }

    state.last_analysis_time = timestamp;

    ThreatAnalysis {
        threat_level,
        hypervisor_confidence,
        timing_anomaly: scores.timing > config.anomaly_threshold,
        cache_anomaly: scores.cache > config.anomaly_threshold,
        counter_blocked: scores.counter > config.counter_threshold,
        memory_anomaly: scores.memory > config.anomaly_threshold,
        timestamp,
        scores,
    }
}
