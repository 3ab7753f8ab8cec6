//! Lock-free in-memory store
//!
//! Backs both store traits with `DashMap`s. Used by tests and by servers
//! started with `--in-memory`.

use super::{RiskProfileStore, SessionStore};
use crate::errors::{ArenaResult, StorageError};
use crate::types::{GameId, PlayerId, PlayerRiskProfile, PlayerSession, RoomId, SessionId, Violation};
use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BTreeSet;

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, PlayerSession>,
    room_index: DashMap<RoomId, Vec<SessionId>>,
    leaderboards: DashMap<GameId, BTreeSet<(Reverse<i64>, SessionId)>>,
    profiles: DashMap<PlayerId, PlayerRiskProfile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put_session(&self, session: &PlayerSession) -> ArenaResult<()> {
        // Holding the entry keeps check-then-write atomic for this session
        let mut entry = self.sessions.entry(session.session_id.clone());
        let previous = match &entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().validated {
                    return Err(StorageError::ImmutableSession(session.session_id.clone()).into());
                }
                Some(existing.get().score)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => None,
        };

        match previous {
            Some(old_score) => {
                if let Some(mut board) = self.leaderboards.get_mut(&session.game_id) {
                    board.remove(&(Reverse(old_score), session.session_id.clone()));
                }
            }
            None => {
                self.room_index
                    .entry(session.room_id.clone())
                    .or_default()
                    .push(session.session_id.clone());
            }
        }

        if session.is_rankable() {
            self.leaderboards
                .entry(session.game_id.clone())
                .or_default()
                .insert((Reverse(session.score), session.session_id.clone()));
        }

        match entry {
            dashmap::mapref::entry::Entry::Occupied(ref mut existing) => {
                existing.insert(session.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
            }
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> ArenaResult<Option<PlayerSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn sessions_for_room(&self, room_id: &str) -> ArenaResult<Vec<PlayerSession>> {
        let ids = match self.room_index.get(room_id) {
            Some(ids) => ids.value().clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
            .collect())
    }

    async fn leaderboard(&self, game_id: &str, limit: usize) -> ArenaResult<Vec<PlayerSession>> {
        let ids: Vec<SessionId> = match self.leaderboards.get(game_id) {
            Some(board) => board.iter().take(limit).map(|(_, id)| id.clone()).collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
            .collect())
    }
}

#[async_trait]
impl RiskProfileStore for MemoryStore {
    async fn load_profile(&self, player_id: &str) -> ArenaResult<PlayerRiskProfile> {
        Ok(self
            .profiles
            .get(player_id)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| PlayerRiskProfile::new(player_id.to_string())))
    }

    async fn append_violations(
        &self,
        player_id: &str,
        violations: &[Violation],
        now: u64,
    ) -> ArenaResult<PlayerRiskProfile> {
        let mut profile = self
            .profiles
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerRiskProfile::new(player_id.to_string()));
        profile.append(violations, now);
        Ok(profile.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GameMode, GameRoom, RoomState, SessionStatus, Severity, ViolationKind};

    fn room(room_id: &str) -> GameRoom {
        GameRoom {
            room_id: room_id.to_string(),
            game_id: "tap-race".to_string(),
            mode: GameMode::Ranked,
            players: vec!["a".into(), "b".into()],
            capacity: 2,
            state: RoomState::Forming,
            created_at: 0,
            started_at: None,
            ended_at: None,
            ticket_ids: vec![],
        }
    }

    fn finished(id: &str, room_id: &str, score: i64, status: SessionStatus) -> PlayerSession {
        let mut session = PlayerSession::new(id.to_string(), &room(room_id), format!("player-{}", id), 0);
        session.score = score;
        session.status = status;
        session.validated = status == SessionStatus::Completed;
        session
    }

    #[tokio::test]
    async fn test_leaderboard_excludes_disqualified() {
        let store = MemoryStore::new();
        store.put_session(&finished("s1", "r1", 300, SessionStatus::Completed)).await.unwrap();
        store.put_session(&finished("s2", "r1", 900, SessionStatus::Disqualified)).await.unwrap();
        store.put_session(&finished("s3", "r2", 500, SessionStatus::Completed)).await.unwrap();

        let board = store.leaderboard("tap-race", 10).await.unwrap();
        let ids: Vec<&str> = board.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s1"]);

        // Disqualified sessions are still retrievable for audit
        assert!(store.get_session("s2").await.unwrap().is_some());
        assert_eq!(store.sessions_for_room("r1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validated_session_is_immutable() {
        let store = MemoryStore::new();
        let mut session = finished("s1", "r1", 100, SessionStatus::Completed);
        store.put_session(&session).await.unwrap();

        session.score = 10_000;
        assert!(store.put_session(&session).await.is_err());
        assert_eq!(store.get_session("s1").await.unwrap().unwrap().score, 100);
    }

    #[tokio::test]
    async fn test_score_update_moves_leaderboard_entry() {
        let store = MemoryStore::new();
        let mut session = finished("s1", "r1", 100, SessionStatus::Playing);
        session.validated = false;
        store.put_session(&session).await.unwrap();
        assert!(store.leaderboard("tap-race", 10).await.unwrap().is_empty());

        session.status = SessionStatus::Completed;
        session.validated = true;
        session.score = 250;
        store.put_session(&session).await.unwrap();
        let board = store.leaderboard("tap-race", 10).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].score, 250);
        assert_eq!(store.sessions_for_room("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_risk_profile_is_append_only() {
        let store = MemoryStore::new();
        let violation = Violation {
            kind: ViolationKind::ReactionTime,
            severity: Severity::High,
            confidence: 1.0,
            detected_at: 1_000,
            evidence: "min reaction 40ms".to_string(),
        };

        assert_eq!(store.load_profile("p1").await.unwrap().total_violations, 0);
        store.append_violations("p1", &[violation.clone()], 1_000).await.unwrap();
        let profile = store.append_violations("p1", &[violation], 2_000).await.unwrap();
        assert_eq!(profile.total_violations, 2);
        assert_eq!(profile.last_violation_at, Some(1_000));
        assert_eq!(profile.risk_score, 80);
    }
}
