//! Persistent session and risk-profile records stored in RocksDB.
//!
//! Key layout:
//! - `session:id:<session_id>` → JSON `PlayerSession`
//! - `session:room:<room_id>:<session_id>` → empty (room index)
//! - `leaderboard:<game_id>:<inverted score BE>:<session_id>` → empty
//! - `risk:player:<player_id>` → JSON `PlayerRiskProfile`

use super::{inverted_score_key, RiskProfileStore, SessionStore};
use crate::errors::{ArenaError, ArenaResult, StorageError};
use crate::types::{PlayerRiskProfile, PlayerSession, Violation};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

const SESSION_PREFIX: &str = "session:id:";
const ROOM_INDEX_PREFIX: &str = "session:room:";
const LEADERBOARD_PREFIX: &str = "leaderboard:";
const RISK_PREFIX: &str = "risk:player:";

fn session_key(session_id: &str) -> Vec<u8> {
    format!("{}{}", SESSION_PREFIX, session_id).into_bytes()
}

fn room_index_prefix(room_id: &str) -> Vec<u8> {
    format!("{}{}:", ROOM_INDEX_PREFIX, room_id).into_bytes()
}

fn room_index_key(room_id: &str, session_id: &str) -> Vec<u8> {
    let mut key = room_index_prefix(room_id);
    key.extend_from_slice(session_id.as_bytes());
    key
}

fn leaderboard_prefix(game_id: &str) -> Vec<u8> {
    format!("{}{}:", LEADERBOARD_PREFIX, game_id).into_bytes()
}

fn leaderboard_key(game_id: &str, score: i64, session_id: &str) -> Vec<u8> {
    // Key layout: prefix | inverted score (be) | ':' | session_id
    let mut key = leaderboard_prefix(game_id);
    key.extend_from_slice(&inverted_score_key(score));
    key.push(b':');
    key.extend_from_slice(session_id.as_bytes());
    key
}

fn risk_key(player_id: &str) -> Vec<u8> {
    format!("{}{}", RISK_PREFIX, player_id).into_bytes()
}

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    // Serializes read-modify-write cycles (immutability check, risk appends)
    write_lock: Arc<Mutex<()>>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> ArenaResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)
            .map_err(|e| ArenaError::Storage(StorageError::DatabaseOpenFailed(e.to_string())))?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> ArenaResult<Option<T>> {
        let Some(bytes) = self
            .db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
        Ok(Some(value))
    }

    /// Keys under `prefix`, in key order, up to `limit`
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> ArenaResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) || keys.len() >= limit {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn session_id_suffix(key: &[u8], prefix_len: usize) -> String {
        String::from_utf8_lossy(&key[prefix_len..]).to_string()
    }

    /// Every stored key, for inspection tooling
    pub fn all_keys(&self) -> ArenaResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }
}

#[async_trait]
impl SessionStore for RocksStore {
    async fn put_session(&self, session: &PlayerSession) -> ArenaResult<()> {
        let _guard = self.write_lock.lock();
        let key = session_key(&session.session_id);

        let existing: Option<PlayerSession> = self.get_json(&key)?;
        let mut batch = WriteBatch::default();
        if let Some(existing) = existing {
            if existing.validated {
                return Err(StorageError::ImmutableSession(session.session_id.clone()).into());
            }
            batch.delete(leaderboard_key(&existing.game_id, existing.score, &existing.session_id));
        }

        let bytes = serde_json::to_vec(session).map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to encode session {}: {}",
                session.session_id, e
            ))
        })?;
        batch.put(&key, bytes);
        batch.put(room_index_key(&session.room_id, &session.session_id), b"");
        if session.is_rankable() {
            batch.put(
                leaderboard_key(&session.game_id, session.score, &session.session_id),
                b"",
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        tracing::debug!(
            session_id = %session.session_id,
            status = ?session.status,
            validated = session.validated,
            "Stored session"
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> ArenaResult<Option<PlayerSession>> {
        self.get_json(&session_key(session_id))
    }

    async fn sessions_for_room(&self, room_id: &str) -> ArenaResult<Vec<PlayerSession>> {
        let prefix = room_index_prefix(room_id);
        let mut sessions = Vec::new();
        for key in self.scan_prefix(&prefix, usize::MAX)? {
            let session_id = Self::session_id_suffix(&key, prefix.len());
            if let Some(session) = self.get_json(&session_key(&session_id))? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn leaderboard(&self, game_id: &str, limit: usize) -> ArenaResult<Vec<PlayerSession>> {
        let prefix = leaderboard_prefix(game_id);
        // prefix | 8-byte score | ':' | session_id
        let id_offset = prefix.len() + 9;
        let mut sessions = Vec::new();
        for key in self.scan_prefix(&prefix, limit)? {
            if key.len() <= id_offset {
                continue;
            }
            let session_id = Self::session_id_suffix(&key, id_offset);
            if let Some(session) = self.get_json(&session_key(&session_id))? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

#[async_trait]
impl RiskProfileStore for RocksStore {
    async fn load_profile(&self, player_id: &str) -> ArenaResult<PlayerRiskProfile> {
        Ok(self
            .get_json(&risk_key(player_id))?
            .unwrap_or_else(|| PlayerRiskProfile::new(player_id.to_string())))
    }

    async fn append_violations(
        &self,
        player_id: &str,
        violations: &[Violation],
        now: u64,
    ) -> ArenaResult<PlayerRiskProfile> {
        let _guard = self.write_lock.lock();
        let key = risk_key(player_id);
        let mut profile: PlayerRiskProfile = self
            .get_json(&key)?
            .unwrap_or_else(|| PlayerRiskProfile::new(player_id.to_string()));
        profile.append(violations, now);

        let bytes = serde_json::to_vec(&profile).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to encode risk profile for {}: {}", player_id, e))
        })?;
        self.db
            .put(&key, bytes)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(profile)
    }
}
