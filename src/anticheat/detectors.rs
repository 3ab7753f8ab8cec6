//! Statistical detectors.
//!
//! Each detector is a pure function of the telemetry and the thresholds and
//! yields at most one `Detection`. Confidence is in `[0, 1]`.

use crate::collaborators::FingerprintCheck;
use crate::config::AntiCheatThresholds;
use crate::types::{BehaviorTelemetry, ViolationKind};

/// Confidence for a fixed-delay reaction pattern (fast and too regular)
const FIXED_DELAY_CONFIDENCE: f64 = 0.75;
/// Confidence for suspiciously uniform accuracy
const CONSISTENT_ACCURACY_CONFIDENCE: f64 = 0.6;
/// Confidence for near-zero action interval variance at macro speed
const MACRO_TIMING_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: ViolationKind,
    pub confidence: f64,
    pub evidence: String,
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn variance(samples: &[f64]) -> f64 {
    let m = mean(samples);
    samples.iter().map(|s| (s - m).powi(2)).sum::<f64>() / samples.len() as f64
}

pub fn reaction_time(telemetry: &BehaviorTelemetry, t: &AntiCheatThresholds) -> Option<Detection> {
    let samples = &telemetry.reaction_times_ms;
    if samples.is_empty() {
        return None;
    }

    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    if min < t.min_reaction_ms {
        let span = (t.min_reaction_ms - t.reaction_floor_ms).max(f64::EPSILON);
        let confidence = ((t.min_reaction_ms - min) / span).clamp(0.0, 1.0);
        return Some(Detection {
            kind: ViolationKind::ReactionTime,
            confidence,
            evidence: format!("minimum reaction {:.0}ms below {:.0}ms", min, t.min_reaction_ms),
        });
    }

    if samples.len() >= t.min_samples {
        let (m, var) = (mean(samples), variance(samples));
        if var < t.reaction_variance_ms2 && m < t.fast_mean_reaction_ms {
            return Some(Detection {
                kind: ViolationKind::ReactionTime,
                confidence: FIXED_DELAY_CONFIDENCE,
                evidence: format!("mean reaction {:.0}ms with variance {:.1}ms²", m, var),
            });
        }
    }
    None
}

pub fn accuracy(telemetry: &BehaviorTelemetry, t: &AntiCheatThresholds) -> Option<Detection> {
    let samples = &telemetry.accuracy_samples;
    let latest = *samples.last()?;

    if latest > t.max_accuracy {
        let span = (1.0 - t.max_accuracy).max(f64::EPSILON);
        let confidence = ((latest - t.max_accuracy) / span).clamp(0.0, 1.0);
        return Some(Detection {
            kind: ViolationKind::Accuracy,
            confidence,
            evidence: format!("latest accuracy {:.3} above {:.2}", latest, t.max_accuracy),
        });
    }

    if samples.len() >= t.min_samples {
        let m = mean(samples);
        if m > 0.0 {
            let consistency = 1.0 - variance(samples) / (m * m);
            if consistency > t.accuracy_consistency && m > t.consistent_mean_accuracy {
                return Some(Detection {
                    kind: ViolationKind::Accuracy,
                    confidence: CONSISTENT_ACCURACY_CONFIDENCE,
                    evidence: format!("accuracy {:.3} with consistency {:.3}", m, consistency),
                });
            }
        }
    }
    None
}

pub fn action_speed(telemetry: &BehaviorTelemetry, t: &AntiCheatThresholds) -> Option<Detection> {
    let stamps = &telemetry.action_timestamps_ms;
    if stamps.len() < 2 || telemetry.session_duration_ms == 0 {
        return None;
    }

    let seconds = (telemetry.session_duration_ms as f64 / 1000.0).max(1.0);
    let per_second = stamps.len() as f64 / seconds;
    if per_second > t.max_actions_per_second {
        let confidence = ((per_second - t.max_actions_per_second) / t.max_actions_per_second).clamp(0.0, 1.0);
        return Some(Detection {
            kind: ViolationKind::ActionSpeed,
            confidence,
            evidence: format!(
                "{:.1} actions/s above ceiling {:.0}",
                per_second, t.max_actions_per_second
            ),
        });
    }

    let intervals: Vec<f64> = stamps
        .windows(2)
        .map(|w| w[1].saturating_sub(w[0]) as f64)
        .collect();
    if per_second > t.macro_actions_per_second && intervals.len() >= t.min_samples {
        let var = variance(&intervals);
        if var < t.macro_interval_variance_ms2 {
            return Some(Detection {
                kind: ViolationKind::ActionSpeed,
                confidence: MACRO_TIMING_CONFIDENCE,
                evidence: format!(
                    "{:.1} actions/s with interval variance {:.2}ms²",
                    per_second, var
                ),
            });
        }
    }
    None
}

/// A fingerprint the verifier rejected. `None` check means unknown or unreachable.
pub fn hardware(check: Option<&FingerprintCheck>, t: &AntiCheatThresholds) -> Option<Detection> {
    let check = check?;
    if check.is_valid {
        return None;
    }
    Some(Detection {
        kind: ViolationKind::HardwareMismatch,
        confidence: t.hardware_mismatch_confidence,
        evidence: check
            .reason
            .clone()
            .unwrap_or_else(|| "fingerprint mismatch".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry() -> BehaviorTelemetry {
        BehaviorTelemetry {
            game_id: "g".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_reaction_confidence_scales_to_floor() {
        let t = AntiCheatThresholds::default();
        let mut tel = telemetry();

        tel.reaction_times_ms = vec![40.0, 42.0, 41.0, 43.0];
        assert_eq!(reaction_time(&tel, &t).unwrap().confidence, 1.0);

        tel.reaction_times_ms = vec![75.0, 300.0, 280.0];
        let d = reaction_time(&tel, &t).unwrap();
        assert!((d.confidence - 0.5).abs() < 1e-9);

        tel.reaction_times_ms = vec![180.0, 260.0, 320.0, 410.0];
        assert!(reaction_time(&tel, &t).is_none());
    }

    #[test]
    fn test_fixed_delay_macro() {
        let t = AntiCheatThresholds::default();
        let mut tel = telemetry();
        tel.reaction_times_ms = vec![150.0, 151.0, 149.0, 150.0, 152.0];
        let d = reaction_time(&tel, &t).unwrap();
        assert_eq!(d.confidence, FIXED_DELAY_CONFIDENCE);
    }

    #[test]
    fn test_accuracy_thresholds() {
        let t = AntiCheatThresholds::default();
        let mut tel = telemetry();

        tel.accuracy_samples = vec![0.7, 0.99];
        let d = accuracy(&tel, &t).unwrap();
        assert!((d.confidence - 0.5).abs() < 1e-6);

        tel.accuracy_samples = vec![0.95, 0.95, 0.96, 0.95];
        assert_eq!(accuracy(&tel, &t).unwrap().confidence, CONSISTENT_ACCURACY_CONFIDENCE);

        tel.accuracy_samples = vec![0.4, 0.9, 0.6, 0.7];
        assert!(accuracy(&tel, &t).is_none());
    }

    #[test]
    fn test_action_speed_ceiling_and_macro() {
        let t = AntiCheatThresholds::default();
        let mut tel = telemetry();

        // 300 actions in 10s
        tel.session_duration_ms = 10_000;
        tel.action_timestamps_ms = (0..300).map(|i| i * 33).collect();
        let d = action_speed(&tel, &t).unwrap();
        assert_eq!(d.confidence, 1.0);

        // 10/s with perfectly regular spacing
        tel.action_timestamps_ms = (0..100).map(|i| i * 100).collect();
        assert_eq!(action_speed(&tel, &t).unwrap().confidence, MACRO_TIMING_CONFIDENCE);

        // 5/s is below macro speed
        tel.action_timestamps_ms = (0..50).map(|i| i * 200).collect();
        assert!(action_speed(&tel, &t).is_none());
    }

    #[test]
    fn test_hardware_mismatch_uses_fixed_confidence() {
        let t = AntiCheatThresholds::default();
        let bad = FingerprintCheck {
            is_valid: false,
            reason: Some("new device".into()),
        };
        assert_eq!(hardware(Some(&bad), &t).unwrap().confidence, 0.8);
        assert!(hardware(None, &t).is_none());
    }
}
