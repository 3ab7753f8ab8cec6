//! Core data model for the game session pipeline.
//!
//! Tickets, rooms, per-player sessions, anti-cheat violations and the
//! longitudinal risk profile. All timestamps are server-side milliseconds
//! since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type PlayerId = String;
pub type GameId = String;
pub type TicketId = String;
pub type RoomId = String;
pub type SessionId = String;

/// Current server time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Queue mode for a ticket and the room it forms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Casual,
    Ranked,
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMode::Casual => write!(f, "casual"),
            GameMode::Ranked => write!(f, "ranked"),
        }
    }
}

/// A queued request to be matched into a game room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingTicket {
    pub ticket_id: TicketId,
    pub player_id: PlayerId,
    pub game_id: GameId,
    pub skill_rating: f64,
    pub mode: GameMode,
    pub enqueued_at: u64,
    pub expires_at: u64,
}

impl MatchmakingTicket {
    /// Milliseconds this ticket has been waiting at `now`
    pub fn wait_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.enqueued_at)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Lifecycle of a single match instance.
///
/// Transitions only move forward along
/// `forming → ready → inProgress → settling → ended`; any non-terminal state
/// may jump to `disqualified`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RoomState {
    Forming,
    Ready,
    InProgress,
    Settling,
    Ended,
    Disqualified,
}

impl RoomState {
    fn ordinal(self) -> u8 {
        match self {
            RoomState::Forming => 0,
            RoomState::Ready => 1,
            RoomState::InProgress => 2,
            RoomState::Settling => 3,
            RoomState::Ended => 4,
            RoomState::Disqualified => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoomState::Ended | RoomState::Disqualified)
    }

    /// Whether `next` is a legal successor of `self` in the lifecycle DAG
    pub fn can_transition_to(self, next: RoomState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RoomState::Disqualified => true,
            RoomState::Forming => false,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomState::Forming => "forming",
            RoomState::Ready => "ready",
            RoomState::InProgress => "inProgress",
            RoomState::Settling => "settling",
            RoomState::Ended => "ended",
            RoomState::Disqualified => "disqualified",
        };
        write!(f, "{}", name)
    }
}

/// One instance of a match with its committed players
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameRoom {
    pub room_id: RoomId,
    pub game_id: GameId,
    pub mode: GameMode,
    pub players: Vec<PlayerId>,
    pub capacity: usize,
    pub state: RoomState,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    /// Tickets whose formation event created this room
    pub ticket_ids: Vec<TicketId>,
}

impl GameRoom {
    pub fn is_member(&self, player_id: &str) -> bool {
        self.players.iter().any(|p| p == player_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Playing,
    Completed,
    Abandoned,
    Disqualified,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ViolationKind {
    ReactionTime,
    Accuracy,
    ActionSpeed,
    HardwareMismatch,
    RepeatedViolations,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::ReactionTime => "reaction_time",
            ViolationKind::Accuracy => "accuracy",
            ViolationKind::ActionSpeed => "action_speed",
            ViolationKind::HardwareMismatch => "hardware_mismatch",
            ViolationKind::RepeatedViolations => "repeated_violations",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Contribution of one violation to a player's risk score
    pub fn risk_weight(self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High => 40,
        }
    }
}

/// A single anti-cheat finding attached to a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub confidence: f64,
    pub detected_at: u64,
    pub evidence: String,
}

/// Recommended enforcement for a player, ordered by strictness
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    None,
    Warn,
    Kick,
    Ban,
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnforcementAction::None => "none",
            EnforcementAction::Warn => "warn",
            EnforcementAction::Kick => "kick",
            EnforcementAction::Ban => "ban",
        };
        write!(f, "{}", name)
    }
}

/// Device identity reported by the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareFingerprint {
    pub device_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Client-reported behavioral samples, accumulated over a session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    #[serde(default)]
    pub reaction_times_ms: Vec<f64>,
    #[serde(default)]
    pub accuracy_samples: Vec<f64>,
    #[serde(default)]
    pub fps_samples: Vec<f64>,
    #[serde(default)]
    pub latency_ms: Vec<f64>,
    #[serde(default)]
    pub hardware: Option<HardwareFingerprint>,
}

/// Samples kept per series for one session; older samples fall off the front
pub const MAX_TELEMETRY_SAMPLES: usize = 256;

fn append_capped(series: &mut Vec<f64>, incoming: Vec<f64>) {
    series.extend(incoming);
    if series.len() > MAX_TELEMETRY_SAMPLES {
        series.drain(..series.len() - MAX_TELEMETRY_SAMPLES);
    }
}

impl TelemetryReport {
    /// Append another report's samples; the latest fingerprint wins
    pub fn absorb(&mut self, other: TelemetryReport) {
        append_capped(&mut self.reaction_times_ms, other.reaction_times_ms);
        append_capped(&mut self.accuracy_samples, other.accuracy_samples);
        append_capped(&mut self.fps_samples, other.fps_samples);
        append_capped(&mut self.latency_ms, other.latency_ms);
        if other.hardware.is_some() {
            self.hardware = other.hardware;
        }
    }

    /// Longest sample series in this report
    pub fn largest_series(&self) -> usize {
        [
            self.reaction_times_ms.len(),
            self.accuracy_samples.len(),
            self.fps_samples.len(),
            self.latency_ms.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Input to the anti-cheat engine: client samples plus server-observed timing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BehaviorTelemetry {
    pub game_id: GameId,
    pub reaction_times_ms: Vec<f64>,
    pub accuracy_samples: Vec<f64>,
    /// Server receipt times of the player's actions, in received order
    pub action_timestamps_ms: Vec<u64>,
    pub session_duration_ms: u64,
    pub hardware: Option<HardwareFingerprint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FpsMetrics {
    pub average: f64,
    pub minimum: f64,
}

impl FpsMetrics {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().sum();
        let minimum = samples.iter().copied().fold(f64::INFINITY, f64::min);
        Some(Self {
            average: sum / samples.len() as f64,
            minimum,
        })
    }
}

/// One server-timestamped `room.action` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub seq: u64,
    pub player_id: PlayerId,
    pub action: serde_json::Value,
    pub client_timestamp: Option<u64>,
    pub server_timestamp: u64,
}

impl ActionLogEntry {
    /// The action's `kind` field, used by deterministic replay rules
    pub fn kind(&self) -> Option<&str> {
        self.action.get("kind").and_then(|k| k.as_str())
    }
}

/// One player's participation in one match
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSession {
    pub session_id: SessionId,
    pub room_id: RoomId,
    pub game_id: GameId,
    pub player_id: PlayerId,
    pub entry_fee: u64,
    pub entry_fee_debited: bool,
    pub reward: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub score: i64,
    pub rank: Option<u32>,
    pub fps_metrics: Option<FpsMetrics>,
    pub network_latency: Option<f64>,
    pub anti_cheat_flags: Vec<ViolationKind>,
    pub violations: Vec<Violation>,
    pub suspicion_score: u8,
    pub validated: bool,
    pub validation_hash: Option<String>,
    pub status: SessionStatus,
    pub action_log_ref: Option<String>,
    /// User-facing explanation when the result is not a plain completion
    pub review_note: Option<String>,
    #[serde(default)]
    pub telemetry: TelemetryReport,
}

impl PlayerSession {
    pub fn new(session_id: SessionId, room: &GameRoom, player_id: PlayerId, entry_fee: u64) -> Self {
        Self {
            session_id,
            room_id: room.room_id.clone(),
            game_id: room.game_id.clone(),
            player_id,
            entry_fee,
            entry_fee_debited: false,
            reward: 0,
            start_time: None,
            end_time: None,
            score: 0,
            rank: None,
            fps_metrics: None,
            network_latency: None,
            anti_cheat_flags: Vec::new(),
            violations: Vec::new(),
            suspicion_score: 0,
            validated: false,
            validation_hash: None,
            status: SessionStatus::Playing,
            action_log_ref: None,
            review_note: None,
            telemetry: TelemetryReport::default(),
        }
    }

    /// Merge a new suspicion reading; the score never decreases within a session
    pub fn raise_suspicion(&mut self, score: u8) {
        self.suspicion_score = self.suspicion_score.max(score.min(100));
    }

    pub fn record_violations(&mut self, violations: &[Violation]) {
        for violation in violations {
            if !self.anti_cheat_flags.contains(&violation.kind) {
                self.anti_cheat_flags.push(violation.kind);
            }
            self.violations.push(violation.clone());
        }
    }

    /// A session whose status is still `playing` can never be finalized
    pub fn can_finalize(&self) -> bool {
        self.status != SessionStatus::Playing
    }

    /// Eligible for rewards and leaderboards
    pub fn is_rankable(&self) -> bool {
        self.validated && self.status == SessionStatus::Completed
    }

    /// Derive fps and latency summaries from accumulated telemetry
    pub fn summarize_telemetry(&mut self) {
        self.fps_metrics = FpsMetrics::from_samples(&self.telemetry.fps_samples);
        if !self.telemetry.latency_ms.is_empty() {
            let sum: f64 = self.telemetry.latency_ms.iter().sum();
            self.network_latency = Some(sum / self.telemetry.latency_ms.len() as f64);
        }
    }
}

/// A player's longitudinal anti-cheat history. Append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRiskProfile {
    pub player_id: PlayerId,
    pub violations: Vec<Violation>,
    pub total_violations: u64,
    pub last_violation_at: Option<u64>,
    pub risk_score: u8,
}

/// Violations older than this no longer contribute to the risk score
pub const RISK_SCORE_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1000;

impl PlayerRiskProfile {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            ..Default::default()
        }
    }

    /// Number of recorded violations detected at or after `since`
    pub fn violations_since(&self, since: u64) -> usize {
        self.violations.iter().filter(|v| v.detected_at >= since).count()
    }

    /// Append violations and recompute the derived fields
    pub fn append(&mut self, violations: &[Violation], now: u64) {
        self.violations.extend(violations.iter().cloned());
        self.total_violations = self.violations.len() as u64;
        self.last_violation_at = self.violations.iter().map(|v| v.detected_at).max();
        self.recompute_risk(now);
    }

    pub fn recompute_risk(&mut self, now: u64) {
        let since = now.saturating_sub(RISK_SCORE_WINDOW_MS);
        let total: u32 = self
            .violations
            .iter()
            .filter(|v| v.detected_at >= since)
            .map(|v| v.severity.risk_weight())
            .sum();
        self.risk_score = total.min(100) as u8;
    }
}
