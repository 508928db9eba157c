use serde::Serialize;
use std::time::Duration;
use tabscope_core::config::MemoryConfig;

/// Minimum time between two pressure changes that relax the buffers.
pub const PRESSURE_COOLDOWN: Duration = Duration::from_secs(1);
/// How long the estimate must stay under the soft limit before hard mode ends.
pub const HARD_RECOVERY_AFTER: Duration = Duration::from_secs(30);

/// Capture fidelity level derived from the estimated buffer footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Soft,
    Hard,
}

impl MemoryPressure {
    pub fn classify(estimated_bytes: usize, limits: &MemoryConfig) -> Self {
        if estimated_bytes >= limits.hard_limit_bytes {
            MemoryPressure::Hard
        } else if estimated_bytes >= limits.soft_limit_bytes {
            MemoryPressure::Soft
        } else {
            MemoryPressure::Normal
        }
    }

    /// Level to hold after a fresh `classified` reading.
    ///
    /// Escalation is immediate. Relaxing waits out [`PRESSURE_COOLDOWN`] since the
    /// last change, and hard mode only ends after the estimate has stayed below
    /// the soft limit for [`HARD_RECOVERY_AFTER`] (`calm_for`).
    pub fn next(self, classified: Self, since_change: Duration, calm_for: Option<Duration>) -> Self {
        if classified >= self {
            return classified;
        }
        if since_change < PRESSURE_COOLDOWN {
            return self;
        }
        match self {
            MemoryPressure::Hard => match (classified, calm_for) {
                (MemoryPressure::Normal, Some(calm)) if calm >= HARD_RECOVERY_AFTER => MemoryPressure::Normal,
                _ => MemoryPressure::Hard,
            },
            _ => classified,
        }
    }

    /// Effective capacity for a buffer whose configured capacity is `base`.
    pub fn scale(self, base: usize) -> usize {
        match self {
            MemoryPressure::Normal => base,
            MemoryPressure::Soft => (base / 2).max(1),
            MemoryPressure::Hard => (base / 4).max(1),
        }
    }

    pub fn network_bodies_enabled(self) -> bool {
        self != MemoryPressure::Hard
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryPressure::Normal => "normal",
            MemoryPressure::Soft => "soft",
            MemoryPressure::Hard => "hard",
        }
    }
}

pub const ACTION_ESTIMATED_BYTES: usize = 500;

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MemoryConfig {
        MemoryConfig {
            soft_limit_bytes: 100,
            hard_limit_bytes: 200,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(MemoryPressure::classify(99, &limits()), MemoryPressure::Normal);
        assert_eq!(MemoryPressure::classify(100, &limits()), MemoryPressure::Soft);
        assert_eq!(MemoryPressure::classify(250, &limits()), MemoryPressure::Hard);
    }

    #[test]
    fn test_scale() {
        assert_eq!(MemoryPressure::Normal.scale(1000), 1000);
        assert_eq!(MemoryPressure::Soft.scale(1000), 500);
        assert_eq!(MemoryPressure::Hard.scale(1000), 250);
        assert_eq!(MemoryPressure::Hard.scale(2), 1);
        assert!(!MemoryPressure::Hard.network_bodies_enabled());
    }

    #[test]
    fn test_escalation_is_immediate() {
        let zero = Duration::ZERO;
        assert_eq!(MemoryPressure::Normal.next(MemoryPressure::Hard, zero, None), MemoryPressure::Hard);
        assert_eq!(MemoryPressure::Soft.next(MemoryPressure::Hard, zero, None), MemoryPressure::Hard);
        assert_eq!(MemoryPressure::Normal.next(MemoryPressure::Soft, zero, None), MemoryPressure::Soft);
    }

    #[test]
    fn test_relaxing_waits_for_cooldown() {
        let soon = Duration::from_millis(200);
        let later = Duration::from_secs(2);
        assert_eq!(MemoryPressure::Soft.next(MemoryPressure::Normal, soon, None), MemoryPressure::Soft);
        assert_eq!(MemoryPressure::Soft.next(MemoryPressure::Normal, later, None), MemoryPressure::Normal);
    }

    #[test]
    fn test_hard_mode_is_sticky() {
        let later = Duration::from_secs(60);
        // Dropping to soft levels never leaves hard mode.
        assert_eq!(MemoryPressure::Hard.next(MemoryPressure::Soft, later, None), MemoryPressure::Hard);
        // Below soft, but not for long enough.
        let brief = Some(Duration::from_secs(5));
        assert_eq!(MemoryPressure::Hard.next(MemoryPressure::Normal, later, brief), MemoryPressure::Hard);
        assert_eq!(MemoryPressure::Hard.next(MemoryPressure::Normal, later, None), MemoryPressure::Hard);
        let sustained = Some(HARD_RECOVERY_AFTER);
        assert_eq!(MemoryPressure::Hard.next(MemoryPressure::Normal, later, sustained), MemoryPressure::Normal);
    }
}
