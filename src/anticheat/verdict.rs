//! Verdict policy: detections → violations → recommended action

use super::detectors::Detection;
use crate::config::AntiCheatThresholds;
use crate::types::{EnforcementAction, PlayerId, PlayerRiskProfile, Severity, Violation, ViolationKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub player_id: PlayerId,
    pub is_cheating: bool,
    /// Sum of detector confidences, capped at 1.0
    pub confidence: f64,
    pub violations: Vec<Violation>,
    pub action: EnforcementAction,
    pub pattern_detected: bool,
    pub reason: String,
}

impl Verdict {
    /// 0-100 reading merged into the session's suspicion score
    pub fn suspicion_score(&self) -> u8 {
        (self.confidence * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

pub fn severity_for(detection: &Detection) -> Severity {
    if detection.kind == ViolationKind::HardwareMismatch || detection.confidence > 0.8 {
        Severity::High
    } else if detection.confidence < 0.3 {
        Severity::Low
    } else {
        Severity::Medium
    }
}

/// Per-session action from violation counts and aggregate confidence
pub fn session_action(violations: &[Violation], aggregate: f64) -> EnforcementAction {
    let count = |severity| violations.iter().filter(|v| v.severity == severity).count();
    if count(Severity::High) >= 1 {
        EnforcementAction::Ban
    } else if count(Severity::Medium) >= 2 {
        EnforcementAction::Kick
    } else if count(Severity::Low) >= 3 || aggregate > 0.8 {
        EnforcementAction::Warn
    } else {
        EnforcementAction::None
    }
}

/// Combine detections with the stored history into a verdict
pub fn decide(
    player_id: &str,
    detections: Vec<Detection>,
    profile: &PlayerRiskProfile,
    thresholds: &AntiCheatThresholds,
    now: u64,
) -> Verdict {
    let aggregate = detections.iter().map(|d| d.confidence).sum::<f64>().min(1.0);
    let mut violations: Vec<Violation> = detections
        .into_iter()
        .map(|d| Violation {
            kind: d.kind,
            severity: severity_for(&d),
            confidence: d.confidence,
            detected_at: now,
            evidence: d.evidence,
        })
        .collect();

    let mut action = session_action(&violations, aggregate);

    // Pattern markers are not counted themselves, so they cannot compound
    let since = now.saturating_sub(thresholds.pattern_window_ms);
    let recent = profile
        .violations
        .iter()
        .filter(|v| v.detected_at >= since && v.kind != ViolationKind::RepeatedViolations)
        .count()
        + violations.len();

    let pattern_detected = !violations.is_empty() && recent > thresholds.pattern_violation_count;
    if pattern_detected {
        let escalate = recent > thresholds.ban_violation_count;
        action = action.max(if escalate {
            EnforcementAction::Ban
        } else {
            EnforcementAction::Warn
        });
        violations.push(Violation {
            kind: ViolationKind::RepeatedViolations,
            severity: if escalate { Severity::High } else { Severity::Medium },
            confidence: aggregate,
            detected_at: now,
            evidence: format!(
                "{} violations in the last {}h",
                recent,
                thresholds.pattern_window_ms / 3_600_000
            ),
        });
    }

    let reason = if violations.is_empty() {
        "no violations".to_string()
    } else {
        violations
            .iter()
            .map(|v| format!("{} ({:?}, {:.2}): {}", v.kind, v.severity, v.confidence, v.evidence))
            .collect::<Vec<_>>()
            .join("; ")
    };

    Verdict {
        player_id: player_id.to_string(),
        is_cheating: action != EnforcementAction::None,
        confidence: aggregate,
        violations,
        action,
        pattern_detected,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(kind: ViolationKind, confidence: f64) -> Detection {
        Detection {
            kind,
            confidence,
            evidence: "test".into(),
        }
    }

    fn past(n: usize, at: u64) -> PlayerRiskProfile {
        let mut profile = PlayerRiskProfile::new("p".into());
        let v = Violation {
            kind: ViolationKind::Accuracy,
            severity: Severity::Low,
            confidence: 0.2,
            detected_at: at,
            evidence: "old".into(),
        };
        profile.append(&vec![v; n], at);
        profile
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(severity_for(&detection(ViolationKind::Accuracy, 0.81)), Severity::High);
        assert_eq!(severity_for(&detection(ViolationKind::Accuracy, 0.8)), Severity::Medium);
        assert_eq!(severity_for(&detection(ViolationKind::Accuracy, 0.29)), Severity::Low);
        assert_eq!(severity_for(&detection(ViolationKind::HardwareMismatch, 0.5)), Severity::High);
    }

    #[test]
    fn test_action_thresholds() {
        let t = AntiCheatThresholds::default();
        let empty = PlayerRiskProfile::new("p".into());

        let v = decide("p", vec![detection(ViolationKind::ReactionTime, 1.0)], &empty, &t, 0);
        assert_eq!(v.action, EnforcementAction::Ban);
        assert_eq!(v.suspicion_score(), 100);

        let v = decide(
            "p",
            vec![detection(ViolationKind::Accuracy, 0.4), detection(ViolationKind::ActionSpeed, 0.35)],
            &empty,
            &t,
            0,
        );
        assert_eq!(v.action, EnforcementAction::Kick);

        let weak = vec![
            detection(ViolationKind::Accuracy, 0.1),
            detection(ViolationKind::ActionSpeed, 0.1),
            detection(ViolationKind::ReactionTime, 0.1),
        ];
        assert_eq!(decide("p", weak, &empty, &t, 0).action, EnforcementAction::Warn);

        let single = decide("p", vec![detection(ViolationKind::Accuracy, 0.5)], &empty, &t, 0);
        assert_eq!(single.action, EnforcementAction::None);
        assert!(!single.is_cheating);
        assert_eq!(single.suspicion_score(), 50);
    }

    #[test]
    fn test_longitudinal_pattern_escalates() {
        let t = AntiCheatThresholds::default();
        let now = 100 * 3_600_000;

        let v = decide("p", vec![detection(ViolationKind::Accuracy, 0.2)], &past(5, now - 1_000), &t, now);
        assert!(v.pattern_detected);
        assert_eq!(v.action, EnforcementAction::Warn);
        assert_eq!(v.violations.last().unwrap().kind, ViolationKind::RepeatedViolations);

        let v = decide("p", vec![detection(ViolationKind::Accuracy, 0.2)], &past(10, now - 1_000), &t, now);
        assert_eq!(v.action, EnforcementAction::Ban);

        // History outside the window is ignored
        let v = decide("p", vec![detection(ViolationKind::Accuracy, 0.2)], &past(10, 0), &t, now);
        assert!(!v.pattern_detected);
        assert_eq!(v.action, EnforcementAction::None);
    }

    #[test]
    fn test_clean_session_does_not_trigger_pattern() {
        let t = AntiCheatThresholds::default();
        let v = decide("p", vec![], &past(20, 1_000), &t, 2_000);
        assert!(!v.pattern_detected);
        assert_eq!(v.action, EnforcementAction::None);
        assert_eq!(v.reason, "no violations");
    }
}
