//! In-memory state of one live room.
//!
//! All mutation goes through the owning manager, which holds the room's
//! transition lock while calling into this type. Nothing here awaits.

use crate::anticheat::Verdict;
use crate::config::GameDefinition;
use crate::errors::{ArenaError, ArenaResult};
use crate::gateway::messages::Standing;
use crate::types::{ActionLogEntry, GameRoom, PlayerId, PlayerSession, RoomState, SessionStatus};
use std::collections::{HashMap, HashSet};

const BASIS_POINTS: u64 = 10_000;

fn to_basis_points(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * BASIS_POINTS as f64).round() as u64
}

/// `amount * fraction` rounded down, computed wide so large fees cannot wrap
fn portion(amount: u128, fraction: f64) -> u128 {
    amount * u128::from(to_basis_points(fraction)) / u128::from(BASIS_POINTS)
}

pub struct RoomRuntime {
    pub room: GameRoom,
    pub game: GameDefinition,
    /// One session per player, in `room.players` order
    pub sessions: Vec<PlayerSession>,
    pub ready: HashSet<PlayerId>,
    pub action_log: Vec<ActionLogEntry>,
    pub verdicts: HashMap<PlayerId, Verdict>,
    pub close_reason: Option<String>,
    next_seq: u64,
}

impl RoomRuntime {
    pub fn new(room: GameRoom, game: GameDefinition, sessions: Vec<PlayerSession>) -> Self {
        Self {
            room,
            game,
            sessions,
            ready: HashSet::new(),
            action_log: Vec::new(),
            verdicts: HashMap::new(),
            close_reason: None,
            next_seq: 1,
        }
    }

    pub fn state(&self) -> RoomState {
        self.room.state
    }

    /// Move the room forward; illegal moves are rejected and leave the state untouched
    pub fn transition(&mut self, next: RoomState, now: u64) -> ArenaResult<RoomState> {
        let from = self.room.state;
        if !from.can_transition_to(next) {
            return Err(ArenaError::InvalidTransition { from, to: next });
        }
        self.room.state = next;
        match next {
            RoomState::InProgress => self.room.started_at = Some(now),
            RoomState::Settling | RoomState::Disqualified => {
                self.room.ended_at.get_or_insert(now);
            }
            _ => {}
        }
        tracing::info!(
            room_id = %self.room.room_id,
            from = %from,
            to = %next,
            "Room transition"
        );
        Ok(from)
    }

    pub fn require_member(&self, player_id: &str) -> ArenaResult<()> {
        if self.room.is_member(player_id) {
            Ok(())
        } else {
            Err(ArenaError::NotRoomMember {
                room_id: self.room.room_id.clone(),
                player_id: player_id.to_string(),
            })
        }
    }

    /// Reject a request that is only legal in `expected`
    pub fn require_state(&self, expected: RoomState) -> ArenaResult<()> {
        if self.room.state == expected {
            Ok(())
        } else {
            Err(ArenaError::InvalidTransition {
                from: self.room.state,
                to: expected,
            })
        }
    }

    /// Only players whose session is still in play may act
    pub fn require_active(&self, player_id: &str) -> ArenaResult<()> {
        match self.session(player_id) {
            Some(session) if session.status == SessionStatus::Playing => Ok(()),
            _ => Err(ArenaError::NotRoomMember {
                room_id: self.room.room_id.clone(),
                player_id: player_id.to_string(),
            }),
        }
    }

    pub fn session(&self, player_id: &str) -> Option<&PlayerSession> {
        self.sessions.iter().find(|s| s.player_id == player_id)
    }

    pub fn session_mut(&mut self, player_id: &str) -> Option<&mut PlayerSession> {
        self.sessions.iter_mut().find(|s| s.player_id == player_id)
    }

    /// Players still taking part in the match
    pub fn active_players(&self) -> Vec<PlayerId> {
        self.sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Playing)
            .map(|s| s.player_id.clone())
            .collect()
    }

    pub fn other_members(&self, player_id: &str) -> Vec<PlayerId> {
        self.room
            .players
            .iter()
            .filter(|p| p.as_str() != player_id)
            .cloned()
            .collect()
    }

    /// Append a player action with the next sequence number and server time
    pub fn record_action(
        &mut self,
        player_id: &str,
        action: serde_json::Value,
        client_timestamp: Option<u64>,
        now: u64,
    ) -> ActionLogEntry {
        // Receipt times never go backwards even if the wall clock does
        let server_timestamp = self
            .action_log
            .last()
            .map(|e| e.server_timestamp.max(now))
            .unwrap_or(now);
        let entry = ActionLogEntry {
            seq: self.next_seq,
            player_id: player_id.to_string(),
            action,
            client_timestamp,
            server_timestamp,
        };
        self.next_seq += 1;
        self.action_log.push(entry.clone());
        entry
    }

    pub fn action_timestamps(&self, player_id: &str) -> Vec<u64> {
        self.action_log
            .iter()
            .filter(|e| e.player_id == player_id)
            .map(|e| e.server_timestamp)
            .collect()
    }

    /// Mark a player as gone. Returns false if they were no longer playing.
    pub fn abandon(&mut self, player_id: &str, now: u64) -> bool {
        let Some(session) = self.session_mut(player_id) else {
            return false;
        };
        if session.status != SessionStatus::Playing {
            return false;
        }
        session.status = SessionStatus::Abandoned;
        session.end_time = Some(now);
        session.review_note = Some("abandoned".to_string());
        true
    }

    /// Close every session that is still playing as part of a room-wide disqualification
    pub fn disqualify_sessions(&mut self, reason: &str, now: u64) {
        for session in &mut self.sessions {
            if session.status == SessionStatus::Playing {
                session.status = SessionStatus::Disqualified;
                session.end_time = Some(now);
                session.review_note = Some(format!("match cancelled: {}", reason));
            }
        }
        self.close_reason = Some(reason.to_string());
    }

    /// Players whose entry fee was taken and must be returned
    pub fn refund_due(&self) -> Vec<(PlayerId, u64)> {
        self.sessions
            .iter()
            .filter(|s| s.entry_fee_debited && s.entry_fee > 0)
            .map(|s| (s.player_id.clone(), s.entry_fee))
            .collect()
    }

    /// Rank rankable sessions by score and split the prize pool.
    ///
    /// The pool is every debited fee minus the house rake; shares follow
    /// `payout_split` by rank and are rounded down.
    pub fn rank_and_pay(&mut self) {
        let collected: u128 = self
            .sessions
            .iter()
            .filter(|s| s.entry_fee_debited)
            .map(|s| u128::from(s.entry_fee))
            .sum();
        let pool = portion(collected, 1.0 - self.game.house_rake.clamp(0.0, 1.0));

        let mut order: Vec<usize> = (0..self.sessions.len())
            .filter(|&i| self.sessions[i].is_rankable())
            .collect();
        order.sort_by(|&a, &b| self.sessions[b].score.cmp(&self.sessions[a].score));

        for session in &mut self.sessions {
            session.rank = None;
            session.reward = 0;
        }
        for (position, &idx) in order.iter().enumerate() {
            let share = self.game.payout_split.get(position).copied().unwrap_or(0.0);
            let session = &mut self.sessions[idx];
            session.rank = Some(position as u32 + 1);
            session.reward = u64::try_from(portion(pool, share)).unwrap_or(u64::MAX);
        }
    }

    pub fn standings(&self) -> Vec<Standing> {
        standings_of(&self.sessions)
    }
}

/// Settlement lines ordered by rank; unranked sessions last
pub fn standings_of(sessions: &[PlayerSession]) -> Vec<Standing> {
    let mut standings: Vec<Standing> = sessions
        .iter()
        .map(|s| Standing {
            player_id: s.player_id.clone(),
            session_id: s.session_id.clone(),
            score: s.score,
            rank: s.rank,
            status: s.status,
            validated: s.validated,
            reward: s.reward,
            suspicion_score: s.suspicion_score,
            note: s.review_note.clone(),
        })
        .collect();
    standings.sort_by_key(|s| s.rank.unwrap_or(u32::MAX));
    standings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GameMode;

    fn runtime(players: &[&str], fee: u64) -> RoomRuntime {
        let room = GameRoom {
            room_id: "room-1".into(),
            game_id: "tap-race".into(),
            mode: GameMode::Ranked,
            players: players.iter().map(|p| p.to_string()).collect(),
            capacity: players.len(),
            state: RoomState::Forming,
            created_at: 0,
            started_at: None,
            ended_at: None,
            ticket_ids: vec![],
        };
        let sessions = room
            .players
            .iter()
            .map(|p| PlayerSession::new(format!("s-{}", p), &room, p.clone(), fee))
            .collect();
        let game = GameDefinition {
            min_players: 2,
            max_players: players.len(),
            entry_fee: fee,
            house_rake: 0.1,
            payout_split: vec![0.7, 0.3],
            ..Default::default()
        };
        RoomRuntime::new(room, game, sessions)
    }

    #[test]
    fn test_transition_rejects_backward_moves() {
        let mut rt = runtime(&["a", "b"], 0);
        rt.transition(RoomState::Ready, 1).unwrap();
        rt.transition(RoomState::InProgress, 2).unwrap();
        assert_eq!(rt.room.started_at, Some(2));

        let err = rt.transition(RoomState::Ready, 3).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::InvalidTransition {
                from: RoomState::InProgress,
                to: RoomState::Ready
            }
        ));
        rt.transition(RoomState::Disqualified, 4).unwrap();
        assert!(rt.transition(RoomState::Settling, 5).is_err());
        assert_eq!(rt.state(), RoomState::Disqualified);
    }

    #[test]
    fn test_action_sequence_and_server_order() {
        let mut rt = runtime(&["a", "b"], 0);
        let first = rt.record_action("a", serde_json::json!({"kind": "hit"}), Some(999), 100);
        let second = rt.record_action("b", serde_json::json!({"kind": "hit"}), Some(1), 90);
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(second.server_timestamp, 100);
        assert_eq!(rt.action_timestamps("a"), vec![100]);
    }

    #[test]
    fn test_rank_and_pay_skips_unranked() {
        let mut rt = runtime(&["a", "b", "c"], 100);
        for (i, score) in [300, 900, 500].into_iter().enumerate() {
            let s = &mut rt.sessions[i];
            s.entry_fee_debited = true;
            s.score = score;
            s.status = SessionStatus::Completed;
            s.validated = true;
        }
        // b posted the top score but failed validation
        rt.sessions[1].validated = false;
        rt.sessions[1].status = SessionStatus::Disqualified;

        rt.rank_and_pay();
        // Pool: 300 * 0.9 = 270
        assert_eq!(rt.sessions[2].rank, Some(1));
        assert_eq!(rt.sessions[2].reward, 189);
        assert_eq!(rt.sessions[0].rank, Some(2));
        assert_eq!(rt.sessions[0].reward, 81);
        assert_eq!(rt.sessions[1].rank, None);
        assert_eq!(rt.sessions[1].reward, 0);

        let standings = rt.standings();
        assert_eq!(standings[0].player_id, "c");
        assert_eq!(standings[2].player_id, "b");
    }

    #[test]
    fn test_abandon_and_refunds() {
        let mut rt = runtime(&["a", "b"], 50);
        rt.sessions[0].entry_fee_debited = true;
        assert!(rt.abandon("a", 10));
        assert!(!rt.abandon("a", 11));
        assert_eq!(rt.active_players(), vec!["b".to_string()]);

        rt.disqualify_sessions("not enough players", 12);
        assert_eq!(rt.sessions[0].status, SessionStatus::Abandoned);
        assert_eq!(rt.sessions[1].status, SessionStatus::Disqualified);
        assert_eq!(rt.refund_due(), vec![("a".to_string(), 50)]);
    }

    #[test]
    fn test_large_fees_do_not_wrap() {
        let fee = u64::MAX / 2;
        let mut rt = runtime(&["a", "b"], fee);
        for (i, score) in [10, 20].into_iter().enumerate() {
            let s = &mut rt.sessions[i];
            s.entry_fee_debited = true;
            s.score = score;
            s.status = SessionStatus::Completed;
            s.validated = true;
        }

        rt.rank_and_pay();
        let collected = u128::from(fee) * 2;
        let pool = collected * 9_000 / 10_000;
        assert_eq!(u128::from(rt.sessions[1].reward), pool * 7_000 / 10_000);
        assert_eq!(u128::from(rt.sessions[0].reward), pool * 3_000 / 10_000);
        assert!(rt.sessions[0].reward < rt.sessions[1].reward);
    }

    #[test]
    fn test_disqualified_room_refunds_removed_players_too() {
        let mut rt = runtime(&["a", "b"], 50);
        for s in &mut rt.sessions {
            s.entry_fee_debited = true;
        }
        rt.sessions[0].status = SessionStatus::Disqualified;
        rt.disqualify_sessions("player a banned by anti-cheat", 5);
        assert_eq!(
            rt.refund_due(),
            vec![("a".to_string(), 50), ("b".to_string(), 50)]
        );
    }
}
