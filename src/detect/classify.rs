//! Severity classification of scores.

use serde::{Deserialize, Serialize};

use crate::detect::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// `|score|` at or above this is a warning.
    pub warning_score: f64,
    /// `|score|` at or above this is critical.
    pub critical_score: f64,
    /// Below this confidence nothing is raised.
    pub min_confidence: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_score: 3.0,
            critical_score: 5.0,
            min_confidence: 0.8,
        }
    }
}

/// Map a score to a severity tier, or `None` when nothing should be raised.
///
/// Threshold boundaries belong to the higher tier.
pub fn classify(score: f64, confidence: f64, thresholds: &Thresholds) -> Option<Severity> {
    if confidence < thresholds.min_confidence {
        return None;
    }
    let magnitude = score.abs();
    if magnitude >= thresholds.critical_score {
        Some(Severity::Critical)
    } else if magnitude >= thresholds.warning_score {
        Some(Severity::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_are_inclusive() {
        let th = Thresholds::default();
        assert_eq!(classify(5.0, 1.0, &th), Some(Severity::Critical));
        assert_eq!(classify(-5.0, 1.0, &th), Some(Severity::Critical));
        assert_eq!(classify(3.0, 1.0, &th), Some(Severity::Warning));
        assert_eq!(classify(4.999, 1.0, &th), Some(Severity::Warning));
        assert_eq!(classify(2.999, 1.0, &th), None);
    }

    #[test]
    fn test_low_confidence_suppresses() {
        let th = Thresholds::default();
        assert_eq!(classify(1e9, 0.79, &th), None);
        assert_eq!(classify(1e9, 0.8, &th), Some(Severity::Critical));
        assert_eq!(classify(0.0, 0.0, &th), None);
    }

    #[test]
    fn test_deterministic_over_grid() {
        let th = Thresholds {
            warning_score: 2.0,
            critical_score: 4.0,
            min_confidence: 0.5,
        };
        for si in -60..=60 {
            let score = si as f64 / 10.0;
            for ci in 0..=10 {
                let confidence = ci as f64 / 10.0;
                let a = classify(score, confidence, &th);
                assert_eq!(a, classify(score, confidence, &th));
                if confidence < th.min_confidence {
                    assert_eq!(a, None);
                }
            }
        }
    }

    #[test]
    fn test_equal_thresholds_go_critical() {
        let th = Thresholds {
            warning_score: 3.0,
            critical_score: 3.0,
            min_confidence: 0.0,
        };
        assert_eq!(classify(3.0, 0.0, &th), Some(Severity::Critical));
    }
}
