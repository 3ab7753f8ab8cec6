//! Realtime gateway
//!
//! Maps inbound client events onto the matchmaking queue and the room
//! manager, and fans room events out to the connected players. Transport
//! framing lives in [`ws`]; everything here works on parsed messages so it
//! can be driven directly in tests.
//!
//! A rejected request is answered with `room.error` to the sender only.

pub mod messages;
pub mod rate_limit;
pub mod ws;

use self::messages::{ClientMessage, Outbound, ServerMessage};
use self::rate_limit::TokenBucket;
use crate::config::ServerConfig;
use crate::errors::{ArenaError, ArenaResult};
use crate::matchmaking::{JoinRequest, MatchmakingQueue};
use crate::metrics::MetricsRegistry;
use crate::rooms::GameRoomManager;
use crate::types::PlayerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
    bucket: Mutex<TokenBucket>,
}

pub struct RealtimeGateway {
    queue: Arc<MatchmakingQueue>,
    rooms: Arc<GameRoomManager>,
    metrics: Arc<MetricsRegistry>,
    connections: DashMap<PlayerId, Connection>,
    messages_per_second: u32,
    message_burst: u32,
    next_connection_id: AtomicU64,
}

impl RealtimeGateway {
    pub fn new(
        config: &ServerConfig,
        queue: Arc<MatchmakingQueue>,
        rooms: Arc<GameRoomManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            queue,
            rooms,
            metrics,
            connections: DashMap::new(),
            messages_per_second: config.messages_per_second,
            message_burst: config.message_burst,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, player_id: &str) -> bool {
        self.connections.contains_key(player_id)
    }

    /// Register a connection for `player_id`. A newer connection replaces an
    /// older one; the old receiver then sees its channel close.
    pub fn connect(&self, player_id: &str) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id,
            tx,
            bucket: Mutex::new(TokenBucket::new(self.message_burst, self.messages_per_second)),
        };
        if self.connections.insert(player_id.to_string(), connection).is_none() {
            MetricsRegistry::incr(&self.metrics.connections_active);
        }
        tracing::info!(player_id = %player_id, connection_id = id, "Player connected");
        (id, rx)
    }

    /// Drop a connection. Queued tickets are parked for resumption; an
    /// in-progress match treats the player as gone.
    pub async fn disconnect(&self, player_id: &str, connection_id: u64) {
        let removed = self
            .connections
            .remove_if(player_id, |_, conn| conn.id == connection_id)
            .is_some();
        if !removed {
            // Superseded by a newer connection
            return;
        }
        MetricsRegistry::decr(&self.metrics.connections_active);
        tracing::info!(player_id = %player_id, connection_id, "Player disconnected");

        self.queue.park(player_id);
        self.rooms.player_disconnected(player_id).await;
    }

    /// Entry point for one raw text frame
    pub async fn handle_text(&self, player_id: &str, text: &str) {
        MetricsRegistry::incr(&self.metrics.messages_received);

        if !self.try_consume(player_id) {
            self.reject(player_id, &ArenaError::RateLimited);
            return;
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                self.reject(player_id, &ArenaError::BadRequest(e.to_string()));
                return;
            }
        };

        if let Err(e) = self.handle_message(player_id, message).await {
            self.reject(player_id, &e);
        }
    }

    pub async fn handle_message(&self, player_id: &str, message: ClientMessage) -> ArenaResult<()> {
        match message {
            ClientMessage::MatchmakingJoin {
                game_id,
                mode,
                skill_rating,
                ticket_id,
            } => {
                if let Some(room_id) = self.rooms.room_for_player(player_id) {
                    return Err(ArenaError::BadRequest(format!("already playing in room {}", room_id)));
                }
                let ticket_id = self.queue.enqueue(JoinRequest {
                    player_id: player_id.to_string(),
                    game_id,
                    mode,
                    skill_rating,
                    resume_ticket: ticket_id,
                })?;
                MetricsRegistry::incr(&self.metrics.tickets_enqueued);
                self.send_to(player_id, ServerMessage::MatchmakingQueued { ticket_id });
            }
            ClientMessage::MatchmakingLeave { ticket_id } => {
                self.queue.cancel(&ticket_id, player_id)?;
                self.send_to(player_id, ServerMessage::MatchmakingLeft { ticket_id });
            }
            ClientMessage::RoomJoin { room_id } => {
                self.rooms.join(player_id, &room_id).await?;
            }
            ClientMessage::RoomReady { room_id } => {
                self.rooms.ready(player_id, &room_id).await?;
            }
            ClientMessage::RoomAction {
                room_id,
                action,
                client_timestamp,
            } => {
                self.rooms.action(player_id, &room_id, action, client_timestamp).await?;
            }
            ClientMessage::RoomScoreUpdate { room_id, score } => {
                self.rooms.score_update(player_id, &room_id, score).await?;
            }
            ClientMessage::RoomEnd {
                room_id,
                final_score,
                action_log_ref,
            } => {
                self.rooms.end(player_id, &room_id, final_score, action_log_ref).await?;
            }
            ClientMessage::RoomTelemetry { room_id, telemetry } => {
                self.rooms.telemetry(player_id, &room_id, telemetry).await?;
            }
        }
        Ok(())
    }

    /// Fan an addressed message out to every connected recipient
    pub fn deliver(&self, outbound: Outbound) {
        let Outbound { recipients, message } = outbound;
        for player_id in &recipients {
            self.send_to(player_id, message.clone());
        }
    }

    /// Returns false when the player has no live connection
    pub fn send_to(&self, player_id: &str, message: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(player_id) else {
            tracing::debug!(player_id = %player_id, event = message.event_name(), "No connection, event dropped");
            return false;
        };
        if conn.tx.send(message).is_err() {
            return false;
        }
        MetricsRegistry::incr(&self.metrics.messages_sent);
        true
    }

    fn try_consume(&self, player_id: &str) -> bool {
        match self.connections.get(player_id) {
            Some(conn) => conn.bucket.lock().try_consume(1.0),
            None => false,
        }
    }

    fn reject(&self, player_id: &str, error: &ArenaError) {
        MetricsRegistry::incr(&self.metrics.messages_rejected);
        tracing::debug!(player_id = %player_id, code = error.code(), error = %error, "Request rejected");
        self.send_to(player_id, ServerMessage::error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anticheat::AntiCheatEngine;
    use crate::collaborators::{EnforcementLog, FingerprintRegistry, LedgerWallet};
    use crate::config::ArenaConfig;
    use crate::rooms::RoomServices;
    use crate::store::MemoryStore;
    use crate::types::GameMode;
    use crate::validation::ScoreValidator;

    fn gateway(config: &ArenaConfig) -> (RealtimeGateway, Arc<MatchmakingQueue>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let services = RoomServices {
            validator: Arc::new(ScoreValidator::new(config.validation.clone(), config.games.clone())),
            anticheat: Arc::new(AntiCheatEngine::new(config, store.clone(), Arc::new(FingerprintRegistry::new()))),
            sessions: store,
            wallet: Arc::new(LedgerWallet::new(1_000)),
            enforcement: Arc::new(EnforcementLog::new()),
            metrics: metrics.clone(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let rooms = GameRoomManager::new(config.rooms.clone(), config.games.clone(), services, tx);
        let queue = Arc::new(MatchmakingQueue::new(config.matchmaking.clone(), config.group_sizes()));
        (RealtimeGateway::new(&config.server, queue.clone(), rooms, metrics), queue)
    }

    fn error_code(message: ServerMessage) -> String {
        match message {
            ServerMessage::RoomError { code, .. } => code,
            other => panic!("expected room.error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_queues_and_acknowledges() {
        let config = ArenaConfig::with_demo_game();
        let (gw, queue) = gateway(&config);
        let (_, mut rx) = gw.connect("p1");

        gw.handle_text(
            "p1",
            r#"{"type":"matchmaking.join","gameId":"reflex-duel","mode":"ranked","skillRating":1500}"#,
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerMessage::MatchmakingQueued { ticket_id } => assert!(!ticket_id.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_payload_only_reaches_sender() {
        let config = ArenaConfig::with_demo_game();
        let (gw, _) = gateway(&config);
        let (_, mut rx1) = gw.connect("p1");
        let (_, mut rx2) = gw.connect("p2");

        gw.handle_text("p1", "{not json").await;
        assert_eq!(error_code(rx1.try_recv().unwrap()), "BAD_PAYLOAD");
        assert!(rx2.try_recv().is_err());

        gw.handle_text("p1", r#"{"type":"room.join","roomId":"nope"}"#).await;
        assert_eq!(error_code(rx1.try_recv().unwrap()), "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let mut config = ArenaConfig::with_demo_game();
        config.server.message_burst = 2;
        config.server.messages_per_second = 0;
        let (gw, _) = gateway(&config);
        let (_, mut rx) = gw.connect("p1");

        for _ in 0..3 {
            gw.handle_text("p1", r#"{"type":"matchmaking.leave","ticketId":"t"}"#).await;
        }
        assert_eq!(error_code(rx.try_recv().unwrap()), "TICKET_NOT_FOUND");
        assert_eq!(error_code(rx.try_recv().unwrap()), "TICKET_NOT_FOUND");
        assert_eq!(error_code(rx.try_recv().unwrap()), "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_disconnect_parks_ticket_and_replaced_connection_is_ignored() {
        let config = ArenaConfig::with_demo_game();
        let (gw, queue) = gateway(&config);
        let (old_id, _old_rx) = gw.connect("p1");
        let (new_id, _new_rx) = gw.connect("p1");
        assert_eq!(gw.connection_count(), 1);

        gw.handle_message(
            "p1",
            ClientMessage::MatchmakingJoin {
                game_id: "reflex-duel".into(),
                mode: GameMode::Casual,
                skill_rating: 1200.0,
                ticket_id: None,
            },
        )
        .await
        .unwrap();

        gw.disconnect("p1", old_id).await;
        assert!(gw.is_connected("p1"));
        assert_eq!(queue.queued_count(), 1);

        gw.disconnect("p1", new_id).await;
        assert!(!gw.is_connected("p1"));
        assert_eq!(queue.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_deliver_skips_offline_players() {
        let config = ArenaConfig::with_demo_game();
        let (gw, _) = gateway(&config);
        let (_, mut rx) = gw.connect("p1");

        gw.deliver(Outbound::to(
            vec!["p1".into(), "ghost".into()],
            ServerMessage::MatchmakingTimeout { ticket_id: "t1".into() },
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::MatchmakingTimeout { ticket_id: "t1".into() }
        );
        assert!(!gw.send_to("ghost", ServerMessage::MatchmakingLeft { ticket_id: "t1".into() }));
    }
}
