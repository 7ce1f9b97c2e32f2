use serde::Serialize;

/// Coarse threat bands derived from `threat_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ThreatCategory {
    Low,
    Medium,
    High,
    Critical,
    /// Near-certain virtualization, corroborated across passes.
    Nuclear,
}

/// Threat percentage at which a client should surface an indicator.
pub const INDICATOR_PERCENT: u32 = 35;

impl ThreatCategory {
    /// Bands:
    /// - `< 0.35`: Low
    /// - `< 0.65`: Medium
    /// - `< 0.85`: High
    /// - `< 0.95`: Critical
    /// - otherwise Nuclear
    pub fn from_level(level: f32) -> Self {
        if level < 0.35 {
            ThreatCategory::Low
        } else if level < 0.65 {
            ThreatCategory::Medium
        } else if level < 0.85 {
            ThreatCategory::High
        } else if level < 0.95 {
            ThreatCategory::Critical
        } else {
            ThreatCategory::Nuclear
        }
    }

    /// Intensity (percent) for timing/cache noise countermeasures.
    pub fn chaos_intensity(self) -> u32 {
        match self {
            ThreatCategory::Low => 10,
            ThreatCategory::Medium => 60,
            ThreatCategory::High => 100,
            ThreatCategory::Critical => 150,
            ThreatCategory::Nuclear => 200,
        }
    }

    /// Percentage of decoy traffic/patterns to mix in.
    pub fn decoy_ratio(self) -> u32 {
        match self {
            ThreatCategory::Low => 10,
            ThreatCategory::Medium => 30,
            ThreatCategory::High => 50,
            ThreatCategory::Critical => 70,
            ThreatCategory::Nuclear => 90,
        }
    }

    pub fn memory_protection(self) -> bool {
        self >= ThreatCategory::Medium
    }

    pub fn cache_poisoning(self) -> bool {
        self >= ThreatCategory::High
    }

    pub fn network_obfuscation(self) -> bool {
        self >= ThreatCategory::Critical
    }

    /// Cache-poisoning intensity: half the chaos intensity, kept within 10..=100.
    pub fn poison_intensity(self) -> u32 {
        (self.chaos_intensity() / 2).clamp(10, 100)
    }
}

/// Whether a threat percentage warrants showing an indicator.
pub fn indicator_visible(percentage: u32) -> bool {
    percentage >= INDICATOR_PERCENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_match_field_calibration() {
        let cases = [
            (0.10, ThreatCategory::Low, 10, 10),
            (0.20, ThreatCategory::Low, 10, 10),
            (0.50, ThreatCategory::Medium, 60, 30),
            (0.75, ThreatCategory::High, 100, 50),
            (0.90, ThreatCategory::Critical, 150, 70),
            (0.98, ThreatCategory::Nuclear, 200, 90),
        ];
        for (level, category, chaos, decoy) in cases {
            let c = ThreatCategory::from_level(level);
            assert_eq!(c, category, "level {level}");
            assert_eq!(c.chaos_intensity(), chaos, "level {level}");
            assert_eq!(c.decoy_ratio(), decoy, "level {level}");
        }
    }

    #[test]
    fn countermeasures_unlock_by_band() {
        let medium = ThreatCategory::from_level(0.50);
        assert!(medium.memory_protection());
        assert!(!medium.cache_poisoning());
        assert!(!medium.network_obfuscation());

        let high = ThreatCategory::from_level(0.75);
        assert!(high.memory_protection());
        assert!(high.cache_poisoning());
        assert!(!high.network_obfuscation());

        assert!(ThreatCategory::Critical.network_obfuscation());
        assert!(!ThreatCategory::Low.memory_protection());
    }

    #[test]
    fn band_edges_are_inclusive_upward() {
        assert_eq!(ThreatCategory::from_level(0.35), ThreatCategory::Medium);
        assert_eq!(ThreatCategory::from_level(0.95), ThreatCategory::Nuclear);
        assert_eq!(ThreatCategory::from_level(1.0), ThreatCategory::Nuclear);
    }

    #[test]
    fn poison_intensity_is_clamped() {
        assert_eq!(ThreatCategory::Low.poison_intensity(), 10);
        assert_eq!(ThreatCategory::High.poison_intensity(), 50);
        assert_eq!(ThreatCategory::Nuclear.poison_intensity(), 100);
    }

    #[test]
    fn indicator_threshold() {
        assert!(!indicator_visible(34));
        assert!(indicator_visible(35));
    }
}
