//! Persistence interfaces for sessions and risk profiles
//!
//! `SessionStore` keeps one record per player per room, indexed by room and
//! by `(game, score desc)` for leaderboards. `RiskProfileStore` is the
//! append-only longitudinal anti-cheat history.

use crate::errors::ArenaResult;
use crate::types::{PlayerRiskProfile, PlayerSession, Violation};
use async_trait::async_trait;

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Durable record of player sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or update a session. Rejected once the stored copy is validated.
    async fn put_session(&self, session: &PlayerSession) -> ArenaResult<()>;

    async fn get_session(&self, session_id: &str) -> ArenaResult<Option<PlayerSession>>;

    async fn sessions_for_room(&self, room_id: &str) -> ArenaResult<Vec<PlayerSession>>;

    /// Highest validated, completed scores for a game
    async fn leaderboard(&self, game_id: &str, limit: usize) -> ArenaResult<Vec<PlayerSession>>;
}

/// Append-only store of per-player violation history
#[async_trait]
pub trait RiskProfileStore: Send + Sync {
    /// Profile for a player; an empty profile if none was ever written
    async fn load_profile(&self, player_id: &str) -> ArenaResult<PlayerRiskProfile>;

    /// Append violations and return the updated profile
    async fn append_violations(
        &self,
        player_id: &str,
        violations: &[Violation],
        now: u64,
    ) -> ArenaResult<PlayerRiskProfile>;
}

/// Order-preserving key encoding for a score, highest first
pub(crate) fn inverted_score_key(score: i64) -> [u8; 8] {
    let ordered = (score as u64) ^ (1u64 << 63);
    (u64::MAX - ordered).to_be_bytes()
}
