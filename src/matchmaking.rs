//! Matchmaking queue
//!
//! Tickets are pooled per `(game, mode)`. Every `tick` first expires stale
//! tickets, then forms as many groups as it can. Claiming happens under the
//! queue lock, so under concurrent ticks a ticket is handed to exactly one
//! formation. No I/O is done while the lock is held; formations and timeouts
//! are returned to the caller for delivery.

use crate::config::MatchmakingConfig;
use crate::errors::{ArenaError, ArenaResult};
use crate::types::{now_millis, GameId, GameMode, MatchmakingTicket, PlayerId, TicketId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Client request to enter the queue
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub player_id: PlayerId,
    pub game_id: GameId,
    pub mode: GameMode,
    pub skill_rating: f64,
    /// Ticket to resume after a transient disconnect
    pub resume_ticket: Option<TicketId>,
}

/// A group of tickets claimed together for one room
#[derive(Debug, Clone, PartialEq)]
pub struct MatchFormation {
    pub formation_id: String,
    pub game_id: GameId,
    pub mode: GameMode,
    pub tickets: Vec<MatchmakingTicket>,
    pub formed_at: u64,
}

impl MatchFormation {
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.tickets.iter().map(|t| t.player_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchmakingEvent {
    MatchFound(MatchFormation),
    Timeout(MatchmakingTicket),
}

type PoolKey = (GameId, GameMode);

#[derive(Default)]
struct QueueState {
    pools: HashMap<PoolKey, Vec<MatchmakingTicket>>,
    active: HashMap<TicketId, PoolKey>,
    by_player: HashMap<PlayerId, TicketId>,
    /// Tickets whose owner disconnected; resumable until they expire
    parked: HashMap<TicketId, MatchmakingTicket>,
}

impl QueueState {
    /// A player holds at most one active ticket; an older one is replaced
    fn insert(&mut self, ticket: MatchmakingTicket) {
        if let Some(previous) = self.by_player.get(&ticket.player_id).cloned() {
            if previous != ticket.ticket_id {
                tracing::warn!(
                    player_id = %ticket.player_id,
                    replaced = %previous,
                    ticket_id = %ticket.ticket_id,
                    "Replacing player's active ticket"
                );
                self.remove_active(&previous);
            }
        }
        let key = (ticket.game_id.clone(), ticket.mode);
        self.active.insert(ticket.ticket_id.clone(), key.clone());
        self.by_player.insert(ticket.player_id.clone(), ticket.ticket_id.clone());
        let pool = self.pools.entry(key).or_default();
        pool.push(ticket);
        pool.sort_by_key(|t| t.enqueued_at);
    }

    fn remove_active(&mut self, ticket_id: &str) -> Option<MatchmakingTicket> {
        let key = self.active.remove(ticket_id)?;
        let pool = self.pools.get_mut(&key)?;
        let idx = pool.iter().position(|t| t.ticket_id == ticket_id)?;
        let ticket = pool.remove(idx);
        self.forget_player(&ticket);
        Some(ticket)
    }

    fn drop_parked_for(&mut self, player_id: &str) {
        self.parked.retain(|_, t| t.player_id != player_id);
    }

    fn forget_player(&mut self, ticket: &MatchmakingTicket) {
        if self.by_player.get(&ticket.player_id) == Some(&ticket.ticket_id) {
            self.by_player.remove(&ticket.player_id);
        }
    }
}

pub struct MatchmakingQueue {
    config: MatchmakingConfig,
    /// Players per room for each known game
    group_sizes: HashMap<GameId, usize>,
    state: Mutex<QueueState>,
}

impl MatchmakingQueue {
    pub fn new(config: MatchmakingConfig, group_sizes: HashMap<GameId, usize>) -> Self {
        Self {
            config,
            group_sizes,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Number of tickets currently eligible for pairing
    pub fn queued_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn enqueue(&self, request: JoinRequest) -> ArenaResult<TicketId> {
        self.enqueue_at(request, now_millis())
    }

    /// Add a ticket, or return the player's live ticket if they already have one
    pub fn enqueue_at(&self, request: JoinRequest, now: u64) -> ArenaResult<TicketId> {
        if !self.group_sizes.contains_key(&request.game_id) {
            return Err(ArenaError::UnknownGame(request.game_id));
        }
        if !request.skill_rating.is_finite() {
            return Err(ArenaError::BadRequest("skill rating must be a finite number".to_string()));
        }

        let mut state = self.state.lock();

        if let Some(ticket_id) = request.resume_ticket {
            return Self::resume(&mut state, ticket_id, &request.player_id, now);
        }

        if let Some(existing) = state.by_player.get(&request.player_id) {
            tracing::debug!(player_id = %request.player_id, ticket_id = %existing, "Player already queued");
            return Ok(existing.clone());
        }
        // A fresh ticket supersedes whatever was parked on disconnect
        state.drop_parked_for(&request.player_id);

        let ticket = MatchmakingTicket {
            ticket_id: Uuid::new_v4().to_string(),
            player_id: request.player_id,
            game_id: request.game_id,
            skill_rating: request.skill_rating,
            mode: request.mode,
            enqueued_at: now,
            expires_at: now + self.config.ticket_ttl_ms,
        };
        let ticket_id = ticket.ticket_id.clone();
        tracing::info!(
            ticket_id = %ticket_id,
            player_id = %ticket.player_id,
            game_id = %ticket.game_id,
            mode = %ticket.mode,
            rating = ticket.skill_rating,
            "Ticket enqueued"
        );
        state.insert(ticket);
        Ok(ticket_id)
    }

    fn resume(state: &mut QueueState, ticket_id: TicketId, player_id: &str, now: u64) -> ArenaResult<TicketId> {
        if let Some(key) = state.active.get(&ticket_id) {
            let owned = state
                .pools
                .get(key)
                .and_then(|pool| pool.iter().find(|t| t.ticket_id == ticket_id))
                .map(|t| t.player_id == player_id)
                .unwrap_or(false);
            return if owned {
                Ok(ticket_id)
            } else {
                Err(ArenaError::TicketNotFound(ticket_id))
            };
        }

        match state.parked.remove(&ticket_id) {
            Some(ticket) if ticket.player_id != player_id => {
                state.parked.insert(ticket_id.clone(), ticket);
                Err(ArenaError::TicketNotFound(ticket_id))
            }
            Some(ticket) if ticket.is_expired(now) => Err(ArenaError::TicketExpired(ticket_id)),
            Some(ticket) => {
                tracing::info!(ticket_id = %ticket_id, player_id = %player_id, "Ticket resumed after reconnect");
                state.insert(ticket);
                Ok(ticket_id)
            }
            None => Err(ArenaError::TicketNotFound(ticket_id)),
        }
    }

    /// Remove a ticket owned by `player_id`
    pub fn cancel(&self, ticket_id: &str, player_id: &str) -> ArenaResult<()> {
        let mut state = self.state.lock();
        if let Some(ticket) = state.parked.get(ticket_id) {
            if ticket.player_id == player_id {
                state.parked.remove(ticket_id);
                return Ok(());
            }
        }

        let owned = state
            .active
            .get(ticket_id)
            .and_then(|key| state.pools.get(key))
            .and_then(|pool| pool.iter().find(|t| t.ticket_id == ticket_id))
            .map(|t| t.player_id == player_id)
            .unwrap_or(false);
        if !owned {
            return Err(ArenaError::TicketNotFound(ticket_id.to_string()));
        }
        state.remove_active(ticket_id);
        tracing::info!(ticket_id = %ticket_id, player_id = %player_id, "Ticket cancelled");
        Ok(())
    }

    /// Take the player's ticket out of pairing until they resume or it expires
    pub fn park(&self, player_id: &str) -> Option<TicketId> {
        let mut state = self.state.lock();
        let ticket_id = state.by_player.get(player_id)?.clone();
        let ticket = state.remove_active(&ticket_id)?;
        tracing::debug!(ticket_id = %ticket_id, player_id = %player_id, "Ticket parked on disconnect");
        state.parked.insert(ticket_id.clone(), ticket);
        Some(ticket_id)
    }

    pub fn tick(&self) -> Vec<MatchmakingEvent> {
        self.tick_at(now_millis())
    }

    /// Expire stale tickets and claim every group that can be formed at `now`
    pub fn tick_at(&self, now: u64) -> Vec<MatchmakingEvent> {
        let mut events = Vec::new();
        let mut state = self.state.lock();

        let mut expired: Vec<MatchmakingTicket> = Vec::new();
        for pool in state.pools.values_mut() {
            let (stale, live): (Vec<_>, Vec<_>) = pool.drain(..).partition(|t| t.is_expired(now));
            *pool = live;
            expired.extend(stale);
        }
        for ticket in &expired {
            state.active.remove(&ticket.ticket_id);
            state.forget_player(ticket);
        }
        let parked_expired: Vec<TicketId> = state
            .parked
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.ticket_id.clone())
            .collect();
        for ticket_id in parked_expired {
            if let Some(ticket) = state.parked.remove(&ticket_id) {
                expired.push(ticket);
            }
        }
        for ticket in expired {
            tracing::info!(ticket_id = %ticket.ticket_id, player_id = %ticket.player_id, "Ticket expired without a match");
            events.push(MatchmakingEvent::Timeout(ticket));
        }

        let keys: Vec<PoolKey> = state.pools.keys().cloned().collect();
        for key in keys {
            let group_size = self.group_sizes.get(&key.0).copied().unwrap_or(2).max(1);
            loop {
                let Some(pool) = state.pools.get(&key) else { break };
                let picked = match key.1 {
                    GameMode::Casual => Self::casual_group(pool, group_size),
                    GameMode::Ranked => self.ranked_group(pool, group_size, now),
                };
                let Some(indices) = picked else { break };

                let ticket_ids: Vec<TicketId> = indices.iter().map(|&i| pool[i].ticket_id.clone()).collect();
                let mut tickets = Vec::with_capacity(ticket_ids.len());
                for ticket_id in &ticket_ids {
                    if let Some(ticket) = state.remove_active(ticket_id) {
                        tickets.push(ticket);
                    }
                }
                tickets.sort_by_key(|t| t.enqueued_at);

                let formation = MatchFormation {
                    formation_id: Uuid::new_v4().to_string(),
                    game_id: key.0.clone(),
                    mode: key.1,
                    tickets,
                    formed_at: now,
                };
                tracing::info!(
                    formation_id = %formation.formation_id,
                    game_id = %formation.game_id,
                    mode = %formation.mode,
                    players = ?formation.player_ids(),
                    "Match formed"
                );
                events.push(MatchmakingEvent::MatchFound(formation));
            }
        }
        state.pools.retain(|_, pool| !pool.is_empty());

        events
    }

    /// Oldest `n` tickets; skill is ignored
    fn casual_group(pool: &[MatchmakingTicket], n: usize) -> Option<Vec<usize>> {
        if pool.len() < n {
            return None;
        }
        // Pools are kept sorted by enqueue time
        Some((0..n).collect())
    }

    /// Tightest rating window of `n` tickets inside the widened tolerance band.
    ///
    /// Ties on spread go to the window with the longest combined wait.
    fn ranked_group(&self, pool: &[MatchmakingTicket], n: usize, now: u64) -> Option<Vec<usize>> {
        if pool.len() < n {
            return None;
        }

        let mut order: Vec<usize> = (0..pool.len()).collect();
        order.sort_by(|&a, &b| {
            pool[a]
                .skill_rating
                .partial_cmp(&pool[b].skill_rating)
                .unwrap_or(Ordering::Equal)
                .then(pool[a].enqueued_at.cmp(&pool[b].enqueued_at))
        });

        let mut best: Option<(f64, u64, usize)> = None;
        for start in 0..=(order.len() - n) {
            let window = &order[start..start + n];
            let spread = pool[window[n - 1]].skill_rating - pool[window[0]].skill_rating;
            let max_wait = window.iter().map(|&i| pool[i].wait_ms(now)).max().unwrap_or(0);
            if spread > self.config.tolerance_at(max_wait) {
                continue;
            }
            let combined_wait: u64 = window.iter().map(|&i| pool[i].wait_ms(now)).sum();
            let better = match best {
                None => true,
                Some((best_spread, best_wait, _)) => {
                    spread < best_spread || (spread == best_spread && combined_wait > best_wait)
                }
            };
            if better {
                best = Some((spread, combined_wait, start));
            }
        }

        best.map(|(_, _, start)| order[start..start + n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn queue() -> MatchmakingQueue {
        let mut sizes = HashMap::new();
        sizes.insert("duel".to_string(), 2);
        sizes.insert("trio".to_string(), 3);
        sizes.insert("solo".to_string(), 1);
        MatchmakingQueue::new(MatchmakingConfig::default(), sizes)
    }

    fn join(player: &str, game: &str, mode: GameMode, rating: f64) -> JoinRequest {
        JoinRequest {
            player_id: player.to_string(),
            game_id: game.to_string(),
            mode,
            skill_rating: rating,
            resume_ticket: None,
        }
    }

    fn formations(events: &[MatchmakingEvent]) -> Vec<&MatchFormation> {
        events
            .iter()
            .filter_map(|e| match e {
                MatchmakingEvent::MatchFound(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_close_ratings_match_within_default_band() {
        let q = queue();
        q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.enqueue_at(join("b", "duel", GameMode::Ranked, 1520.0), 2_000).unwrap();

        let events = q.tick_at(2_100);
        let found = formations(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].player_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn test_lonely_ticket_times_out() {
        let q = queue();
        let ticket_id = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();

        assert!(q.tick_at(30_000).is_empty());
        let events = q.tick_at(61_000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MatchmakingEvent::Timeout(ticket) => assert_eq!(ticket.ticket_id, ticket_id),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn test_tolerance_widens_with_wait() {
        let q = queue();
        q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.enqueue_at(join("b", "duel", GameMode::Ranked, 1600.0), 0).unwrap();

        // Spread 100 exceeds the initial ±50 band
        assert!(formations(&q.tick_at(1_000)).is_empty());
        assert!(formations(&q.tick_at(9_999)).is_empty());
        // After 10s the band is 100
        assert_eq!(formations(&q.tick_at(10_000)).len(), 1);
    }

    #[test]
    fn test_prefers_minimal_delta_then_longest_wait() {
        let q = queue();
        q.enqueue_at(join("old", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.enqueue_at(join("mid", "duel", GameMode::Ranked, 1500.0), 1_000).unwrap();
        q.enqueue_at(join("new", "duel", GameMode::Ranked, 1500.0), 2_000).unwrap();
        q.enqueue_at(join("far", "duel", GameMode::Ranked, 1540.0), 0).unwrap();

        let events = q.tick_at(2_000);
        let found = formations(&events);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].player_ids(), vec!["old".to_string(), "mid".to_string()]);
        // Remaining pair is within the band as well
        let second: HashSet<String> = found[1].player_ids().into_iter().collect();
        assert_eq!(second, HashSet::from(["far".to_string(), "new".to_string()]));
    }

    #[test]
    fn test_ranked_pairs_respect_tolerance_property() {
        let q = queue();
        let ratings = [1000.0, 1030.0, 1100.0, 1180.0, 1450.0, 1490.0, 2100.0];
        for (i, r) in ratings.iter().enumerate() {
            q.enqueue_at(join(&format!("p{}", i), "duel", GameMode::Ranked, *r), i as u64 * 1_500).unwrap();
        }
        let now = 12_000;
        let config = MatchmakingConfig::default();
        for formation in formations(&q.tick_at(now)) {
            let a = &formation.tickets[0];
            let b = &formation.tickets[1];
            let max_wait = a.wait_ms(now).max(b.wait_ms(now));
            assert!((a.skill_rating - b.skill_rating).abs() <= config.tolerance_at(max_wait));
        }
    }

    #[test]
    fn test_casual_ignores_skill_and_groups_by_size() {
        let q = queue();
        q.enqueue_at(join("a", "trio", GameMode::Casual, 100.0), 0).unwrap();
        q.enqueue_at(join("b", "trio", GameMode::Casual, 2900.0), 1).unwrap();
        assert!(formations(&q.tick_at(10)).is_empty());

        q.enqueue_at(join("c", "trio", GameMode::Casual, 1500.0), 2).unwrap();
        q.enqueue_at(join("d", "trio", GameMode::Ranked, 1500.0), 2).unwrap();
        let events = q.tick_at(20);
        let found = formations(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tickets.len(), 3);
        assert_eq!(found[0].mode, GameMode::Casual);
        // The ranked ticket stays in its own pool
        assert_eq!(q.queued_count(), 1);
    }

    #[test]
    fn test_reenqueue_is_idempotent_and_cancel_checks_owner() {
        let q = queue();
        let first = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        let second = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 10).unwrap();
        assert_eq!(first, second);

        assert!(matches!(q.cancel(&first, "mallory"), Err(ArenaError::TicketNotFound(_))));
        q.cancel(&first, "a").unwrap();
        assert!(matches!(q.cancel(&first, "a"), Err(ArenaError::TicketNotFound(_))));
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn test_resume_only_before_expiry() {
        let q = queue();
        let ticket_id = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        assert_eq!(q.park("a"), Some(ticket_id.clone()));
        assert_eq!(q.queued_count(), 0);

        let mut resume = join("a", "duel", GameMode::Ranked, 1500.0);
        resume.resume_ticket = Some(ticket_id.clone());
        assert_eq!(q.enqueue_at(resume.clone(), 5_000).unwrap(), ticket_id);
        assert_eq!(q.queued_count(), 1);

        q.park("a");
        assert!(matches!(q.enqueue_at(resume, 61_000), Err(ArenaError::TicketExpired(_))));
    }

    #[test]
    fn test_fresh_join_after_park_supersedes_parked_ticket() {
        let q = queue();
        let parked = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.park("a");
        let fresh = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 10).unwrap();
        assert_ne!(parked, fresh);

        let mut resume = join("a", "duel", GameMode::Ranked, 1500.0);
        resume.resume_ticket = Some(parked);
        assert!(matches!(q.enqueue_at(resume, 20), Err(ArenaError::TicketNotFound(_))));
        assert_eq!(q.queued_count(), 1);
        // Nobody to play against but themselves
        assert!(formations(&q.tick_at(30)).is_empty());

        q.enqueue_at(join("b", "duel", GameMode::Ranked, 1500.0), 40).unwrap();
        let events = q.tick_at(50);
        let found = formations(&events);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].player_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(found[0].tickets[0].ticket_id, fresh);
    }

    #[test]
    fn test_resumed_ticket_replaces_active_one() {
        let q = queue();
        let first = q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.park("a");
        let mut resume = join("a", "duel", GameMode::Ranked, 1500.0);
        resume.resume_ticket = Some(first.clone());
        assert_eq!(q.enqueue_at(resume.clone(), 10).unwrap(), first);
        // Resuming the live ticket again is a no-op
        assert_eq!(q.enqueue_at(resume, 20).unwrap(), first);
        assert_eq!(q.queued_count(), 1);
        assert!(formations(&q.tick_at(30)).is_empty());
    }

    #[test]
    fn test_parked_ticket_times_out() {
        let q = queue();
        q.enqueue_at(join("a", "duel", GameMode::Ranked, 1500.0), 0).unwrap();
        q.park("a");
        let events = q.tick_at(60_001);
        assert!(matches!(events.as_slice(), [MatchmakingEvent::Timeout(_)]));
    }

    #[test]
    fn test_unknown_game_and_bad_rating_rejected() {
        let q = queue();
        assert!(matches!(
            q.enqueue_at(join("a", "chess", GameMode::Ranked, 1500.0), 0),
            Err(ArenaError::UnknownGame(_))
        ));
        assert!(matches!(
            q.enqueue_at(join("a", "duel", GameMode::Ranked, f64::NAN), 0),
            Err(ArenaError::BadRequest(_))
        ));
    }

    #[test]
    fn test_single_player_game_forms_immediately() {
        let q = queue();
        q.enqueue_at(join("a", "solo", GameMode::Casual, 0.0), 0).unwrap();
        let events = q.tick_at(1);
        assert_eq!(formations(&events).len(), 1);
    }

    #[test]
    fn test_concurrent_ticks_never_double_claim() {
        let q = Arc::new(queue());
        for i in 0..200 {
            q.enqueue_at(join(&format!("p{}", i), "duel", GameMode::Casual, 1500.0), i).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || q.tick_at(1_000))
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for event in handle.join().unwrap() {
                if let MatchmakingEvent::MatchFound(f) = event {
                    for ticket in f.tickets {
                        assert!(seen.insert(ticket.ticket_id), "ticket matched twice");
                        total += 1;
                    }
                }
            }
        }
        assert_eq!(total, 200);
    }
}
