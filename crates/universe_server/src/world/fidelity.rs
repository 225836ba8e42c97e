//! Adaptive simulation fidelity.
//!
//! Each tick reports the fraction of its budget left unused. The governor
//! accumulates a hysteresis score from that signal and moves one level at a
//! time, at most once per measurement window, resetting the score on every
//! change.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Ordinal simulation detail level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Fidelity {
    Minimum,
    Low,
    Medium,
    High,
}

impl Fidelity {
    pub fn lower(self) -> Option<Fidelity> {
        match self {
            Fidelity::Minimum => None,
            Fidelity::Low => Some(Fidelity::Minimum),
            Fidelity::Medium => Some(Fidelity::Low),
            Fidelity::High => Some(Fidelity::Medium),
        }
    }

    pub fn higher(self) -> Option<Fidelity> {
        match self {
            Fidelity::Minimum => Some(Fidelity::Low),
            Fidelity::Low => Some(Fidelity::Medium),
            Fidelity::Medium => Some(Fidelity::High),
            Fidelity::High => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Fidelity::Minimum => 0,
            Fidelity::Low => 1,
            Fidelity::Medium => 2,
            Fidelity::High => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Fidelity {
        match value {
            0 => Fidelity::Minimum,
            1 => Fidelity::Low,
            2 => Fidelity::Medium,
            _ => Fidelity::High,
        }
    }
}

/// Hysteresis parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FidelitySettings {
    /// Score at or below which fidelity drops one level
    pub decrement_score: f64,
    /// Score at or above which fidelity rises one level
    pub increment_score: f64,
    /// Minimum time between two level changes
    pub measurement_window: Duration,
    pub initial: Fidelity,
}

impl Default for FidelitySettings {
    fn default() -> Self {
        Self {
            decrement_score: -15.0,
            increment_score: 30.0,
            measurement_window: Duration::from_secs(2),
            initial: Fidelity::High,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FidelityGovernor {
    settings: FidelitySettings,
    current: Fidelity,
    locked: Option<Fidelity>,
    score: f64,
    window_start: Instant,
}

impl FidelityGovernor {
    pub fn new(settings: FidelitySettings, now: Instant) -> Self {
        Self {
            current: settings.initial,
            settings,
            locked: None,
            score: 0.0,
            window_start: now,
        }
    }

    /// Effective fidelity, honoring a locked override.
    pub fn fidelity(&self) -> Fidelity {
        self.locked.unwrap_or(self.current)
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn set_locked(&mut self, locked: Option<Fidelity>) {
        self.locked = locked;
    }

    pub fn locked(&self) -> Option<Fidelity> {
        self.locked
    }

    /// Feeds one tick's spare fraction (`0.0` = fully overloaded, `1.0` = idle).
    ///
    /// Returns the new adaptive level when it changed.
    pub fn observe(&mut self, now: Instant, spare_fraction: f64) -> Option<Fidelity> {
        let spare = if spare_fraction.is_finite() {
            spare_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.score = (self.score + spare * 2.0 - 1.0)
            .clamp(self.settings.decrement_score, self.settings.increment_score);

        if now.saturating_duration_since(self.window_start) < self.settings.measurement_window {
            return None;
        }

        let next = if self.score <= self.settings.decrement_score {
            self.current.lower()
        } else if self.score >= self.settings.increment_score {
            self.current.higher()
        } else {
            None
        }?;

        self.current = next;
        self.score = 0.0;
        self.window_start = now;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FidelitySettings {
        FidelitySettings {
            decrement_score: -5.0,
            increment_score: 5.0,
            measurement_window: Duration::from_millis(100),
            initial: Fidelity::Medium,
        }
    }

    #[test]
    fn test_sustained_overload_lowers_fidelity() {
        let start = Instant::now();
        let mut governor = FidelityGovernor::new(settings(), start);

        let mut changes = Vec::new();
        for tick in 0..200u64 {
            let now = start + Duration::from_millis(tick * 10);
            if let Some(level) = governor.observe(now, 0.0) {
                changes.push((tick, level));
            }
        }

        assert_eq!(changes, vec![(10, Fidelity::Low), (20, Fidelity::Minimum)]);
        assert_eq!(governor.fidelity(), Fidelity::Minimum);
    }

    #[test]
    fn test_single_spike_does_not_change_level() {
        let start = Instant::now();
        let mut governor = FidelityGovernor::new(settings(), start);
        for tick in 0..50u64 {
            let spare = if tick == 25 { 0.0 } else { 0.5 };
            let now = start + Duration::from_millis(tick * 10);
            assert_eq!(governor.observe(now, spare), None);
        }
        assert_eq!(governor.fidelity(), Fidelity::Medium);
    }

    #[test]
    fn test_oscillation_at_thresholds_is_bounded_per_window() {
        let start = Instant::now();
        let window = settings().measurement_window;
        let mut governor = FidelityGovernor::new(settings(), start);

        let mut change_times = Vec::new();
        for tick in 0..2_000u64 {
            let now = start + Duration::from_millis(tick);
            // Swing the score between the two thresholds as fast as possible.
            let spare = if (tick / 5) % 2 == 0 { 1.0 } else { 0.0 };
            if governor.observe(now, spare).is_some() {
                change_times.push(now);
            }
        }

        assert!(!change_times.is_empty());
        for pair in change_times.windows(2) {
            assert!(pair[1] - pair[0] >= window);
        }
    }

    #[test]
    fn test_locked_override() {
        let start = Instant::now();
        let mut governor = FidelityGovernor::new(settings(), start);
        governor.set_locked(Some(Fidelity::High));
        assert_eq!(governor.fidelity(), Fidelity::High);

        governor.observe(start + Duration::from_secs(1), 0.0);
        assert_eq!(governor.fidelity(), Fidelity::High);

        governor.set_locked(None);
        assert_eq!(governor.fidelity(), Fidelity::Medium);
    }

    #[test]
    fn test_levels_saturate() {
        assert_eq!(Fidelity::High.higher(), None);
        assert_eq!(Fidelity::Minimum.lower(), None);
        assert!(Fidelity::Minimum < Fidelity::Low && Fidelity::Low < Fidelity::High);
        for level in [Fidelity::Minimum, Fidelity::Low, Fidelity::Medium, Fidelity::High] {
            assert_eq!(Fidelity::from_u8(level.to_u8()), level);
        }
    }
}
