//! Server-side score validation
//!
//! Games with replay rules are re-scored from the server-recorded action log.
//! Games without them get a plausibility check against the configured score
//! bounds and the score-per-second ceiling.

use crate::config::{GameDefinition, ReplayRules, ValidationConfig};
use crate::errors::ArenaError;
use crate::types::{ActionLogEntry, GameId, PlayerSession, SessionStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const UNDER_REVIEW: &str = "disqualified — under review";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub validated: bool,
    pub reason: Option<String>,
    /// Score recomputed from the action log, for replayable games
    pub replayed_score: Option<i64>,
    pub validation_hash: String,
}

impl ValidationOutcome {
    pub fn error(&self) -> Option<ArenaError> {
        match (&self.reason, self.validated) {
            (Some(reason), false) => Some(ArenaError::ValidationFailed(reason.clone())),
            _ => None,
        }
    }

    /// Record the outcome on the session; failed scores are disqualified
    pub fn apply_to(&self, session: &mut PlayerSession) {
        session.validated = self.validated;
        session.validation_hash = Some(self.validation_hash.clone());
        if !self.validated {
            session.status = SessionStatus::Disqualified;
            session.review_note = Some(match &self.reason {
                Some(reason) => format!("{}: {}", UNDER_REVIEW, reason),
                None => UNDER_REVIEW.to_string(),
            });
        }
    }
}

pub struct ScoreValidator {
    config: ValidationConfig,
    games: HashMap<GameId, GameDefinition>,
}

impl ScoreValidator {
    pub fn new(config: ValidationConfig, games: HashMap<GameId, GameDefinition>) -> Self {
        Self { config, games }
    }

    /// Validate a finished session against its own entries in `action_log`
    pub fn validate(&self, session: &PlayerSession, action_log: &[ActionLogEntry]) -> ValidationOutcome {
        let entries: Vec<&ActionLogEntry> = action_log
            .iter()
            .filter(|e| e.player_id == session.player_id)
            .collect();
        let hash = validation_hash(session, &entries);

        let verdict = self.check(session, &entries);
        let (validated, reason, replayed_score) = match verdict {
            Ok(replayed) => (true, None, replayed),
            Err((reason, replayed)) => (false, Some(reason), replayed),
        };

        if !validated {
            tracing::warn!(
                session_id = %session.session_id,
                player_id = %session.player_id,
                score = session.score,
                reason = reason.as_deref().unwrap_or(""),
                "Score validation failed"
            );
        }

        ValidationOutcome {
            validated,
            reason,
            replayed_score,
            validation_hash: hash,
        }
    }

    fn check(
        &self,
        session: &PlayerSession,
        entries: &[&ActionLogEntry],
    ) -> Result<Option<i64>, (String, Option<i64>)> {
        if !session.can_finalize() {
            return Err(("session is still in play".to_string(), None));
        }
        let Some(game) = self.games.get(&session.game_id) else {
            return Err((format!("unknown game {}", session.game_id), None));
        };

        check_score_range(game, session).map_err(|reason| (reason, None))?;
        check_log_order(session, entries).map_err(|reason| (reason, None))?;

        match &game.replay {
            Some(rules) => {
                let replayed = replay(rules, entries).map_err(|reason| (reason, None))?;
                if entries.is_empty() && session.score != 0 {
                    return Err(("missing action log for a replayable game".to_string(), Some(replayed)));
                }
                let allowed = self.config.score_tolerance * (replayed.unsigned_abs().max(1) as f64);
                let delta = session.score.abs_diff(replayed) as f64;
                if delta > allowed {
                    return Err((
                        format!(
                            "reported score {} does not match replayed score {}",
                            session.score, replayed
                        ),
                        Some(replayed),
                    ));
                }
                Ok(Some(replayed))
            }
            None => check_bounds(game, session).map(|_| None).map_err(|reason| (reason, None)),
        }
    }
}

/// Deterministic re-scoring from a points table
fn replay(rules: &ReplayRules, entries: &[&ActionLogEntry]) -> Result<i64, String> {
    let mut total: i64 = 0;
    for entry in entries {
        let points = match entry.kind().and_then(|kind| rules.points.get(kind)) {
            Some(points) => *points,
            None if rules.strict => {
                return Err(format!(
                    "action #{} has unknown kind {:?}",
                    entry.seq,
                    entry.kind().unwrap_or("<missing>")
                ));
            }
            None => 0,
        };
        total = total.saturating_add(points);
    }
    Ok(total)
}

/// Server timestamps must be non-decreasing and inside the session window
fn check_log_order(session: &PlayerSession, entries: &[&ActionLogEntry]) -> Result<(), String> {
    let mut previous = 0u64;
    for entry in entries {
        if entry.server_timestamp < previous {
            return Err(format!("action #{} is out of server order", entry.seq));
        }
        previous = entry.server_timestamp;

        if let Some(start) = session.start_time {
            if entry.server_timestamp < start {
                return Err(format!("action #{} precedes the match start", entry.seq));
            }
        }
        if let Some(end) = session.end_time {
            if entry.server_timestamp > end {
                return Err(format!("action #{} arrived after the session ended", entry.seq));
            }
        }
    }
    Ok(())
}

/// Reported scores are client input; anything outside the configured range is rejected
fn check_score_range(game: &GameDefinition, session: &PlayerSession) -> Result<(), String> {
    if session.score < game.min_score || session.score > game.max_score {
        return Err(format!(
            "score {} outside [{}, {}]",
            session.score, game.min_score, game.max_score
        ));
    }
    Ok(())
}

fn check_bounds(game: &GameDefinition, session: &PlayerSession) -> Result<(), String> {
    let elapsed_secs = match (session.start_time, session.end_time) {
        (Some(start), Some(end)) => (end.saturating_sub(start) as f64 / 1000.0).min(game.duration_secs as f64),
        _ => game.duration_secs as f64,
    };
    let ceiling = game.max_score_per_second * elapsed_secs.max(1.0);
    if session.score as f64 > ceiling {
        return Err(format!(
            "score {} exceeds plausible maximum {:.0} ({} points/s over {:.0}s)",
            session.score, ceiling, game.max_score_per_second, elapsed_secs
        ));
    }
    Ok(())
}

/// Hex SHA-256 over the session identity, final score and the action log digest
pub fn validation_hash(session: &PlayerSession, entries: &[&ActionLogEntry]) -> String {
    let mut log_hasher = Sha256::new();
    for entry in entries {
        log_hasher.update(entry.seq.to_be_bytes());
        log_hasher.update(entry.server_timestamp.to_be_bytes());
        log_hasher.update(entry.action.to_string().as_bytes());
    }
    let log_digest = log_hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(session.session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(session.player_id.as_bytes());
    hasher.update(b"|");
    hasher.update(session.score.to_be_bytes());
    hasher.update(b"|");
    hasher.update(log_digest);
    hex::encode(hasher.finalize())
}
