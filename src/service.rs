//! Service container
//!
//! Builds every component from an [`ArenaConfig`], injects the store and
//! collaborator implementations, and runs the background loops: the
//! matchmaking tick, outbound event dispatch and archive purging.

use crate::anticheat::AntiCheatEngine;
use crate::api::AppState;
use crate::collaborators::{
    AccountEnforcement, EnforcementLog, FingerprintRegistry, HardwareVerifier, LedgerWallet, Wallet,
};
use crate::config::{ArenaConfig, StorageConfig};
use crate::errors::ArenaResult;
use crate::gateway::messages::{Outbound, ServerMessage};
use crate::gateway::RealtimeGateway;
use crate::matchmaking::{MatchmakingEvent, MatchmakingQueue};
use crate::metrics::MetricsRegistry;
use crate::rooms::{GameRoomManager, RoomServices};
use crate::store::{MemoryStore, RiskProfileStore, RocksStore, SessionStore};
use crate::types::now_millis;
use crate::validation::ScoreValidator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ARCHIVE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Persistence backends
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub profiles: Arc<dyn RiskProfileStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            sessions: store.clone(),
            profiles: store,
        }
    }

    pub fn rocks(path: &str) -> ArenaResult<Self> {
        let store = Arc::new(RocksStore::open(path)?);
        Ok(Self {
            sessions: store.clone(),
            profiles: store,
        })
    }

    pub fn from_config(config: &StorageConfig) -> ArenaResult<Self> {
        if config.in_memory {
            tracing::info!("Using in-memory session store");
            Ok(Self::memory())
        } else {
            tracing::info!(path = %config.data_directory, "Opening RocksDB session store");
            Self::rocks(&config.data_directory)
        }
    }
}

/// External collaborators consumed by rooms and anti-cheat
#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn Wallet>,
    pub hardware: Arc<dyn HardwareVerifier>,
    pub enforcement: Arc<dyn AccountEnforcement>,
}

impl Collaborators {
    /// In-process ledger, fingerprint registry and enforcement log
    pub fn in_process(opening_balance: u64) -> Self {
        Self {
            wallet: Arc::new(LedgerWallet::new(opening_balance)),
            hardware: Arc::new(FingerprintRegistry::new()),
            enforcement: Arc::new(EnforcementLog::new()),
        }
    }
}

pub struct ArenaService {
    config: ArenaConfig,
    pub queue: Arc<MatchmakingQueue>,
    pub rooms: Arc<GameRoomManager>,
    pub gateway: Arc<RealtimeGateway>,
    pub sessions: Arc<dyn SessionStore>,
    pub metrics: Arc<MetricsRegistry>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl ArenaService {
    pub fn new(config: ArenaConfig, stores: Stores, collaborators: Collaborators) -> Arc<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let services = RoomServices {
            validator: Arc::new(ScoreValidator::new(config.validation.clone(), config.games.clone())),
            anticheat: Arc::new(AntiCheatEngine::new(
                &config,
                stores.profiles.clone(),
                collaborators.hardware.clone(),
            )),
            sessions: stores.sessions.clone(),
            wallet: collaborators.wallet.clone(),
            enforcement: collaborators.enforcement.clone(),
            metrics: metrics.clone(),
        };
        let rooms = GameRoomManager::new(config.rooms.clone(), config.games.clone(), services, outbound_tx);
        let queue = Arc::new(MatchmakingQueue::new(config.matchmaking.clone(), config.group_sizes()));
        let gateway = Arc::new(RealtimeGateway::new(
            &config.server,
            queue.clone(),
            rooms.clone(),
            metrics.clone(),
        ));

        tracing::info!(games = config.games.len(), "Arena service assembled");
        Arc::new(Self {
            config,
            queue,
            rooms,
            gateway,
            sessions: stores.sessions,
            metrics,
            outbound: Mutex::new(Some(outbound_rx)),
        })
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            games: self.config.games.keys().cloned().collect(),
            queue: self.queue.clone(),
            rooms: self.rooms.clone(),
            gateway: self.gateway.clone(),
            sessions: self.sessions.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Spawn the background loops. Only the first call starts anything.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let Some(mut outbound) = self.outbound.lock().take() else {
            tracing::warn!("Arena service already started");
            return Vec::new();
        };
        let mut handles = Vec::new();

        let gateway = self.gateway.clone();
        handles.push(tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                gateway.deliver(event);
            }
            tracing::debug!("Outbound dispatch stopped");
        }));

        let service = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.matchmaking.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let events = service.queue.tick();
                service.process_matchmaking(events).await;
            }
        }));

        let rooms = self.rooms.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ARCHIVE_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let purged = rooms.purge_archive(now_millis());
                if purged > 0 {
                    tracing::debug!(purged, "Purged archived rooms");
                }
            }
        }));

        tracing::info!(
            tick_ms = self.config.matchmaking.tick_interval_ms,
            "Matchmaking and dispatch loops started"
        );
        handles
    }

    /// Turn queue events into rooms and notifications
    pub async fn process_matchmaking(&self, events: Vec<MatchmakingEvent>) {
        for event in events {
            match event {
                MatchmakingEvent::MatchFound(formation) => {
                    MetricsRegistry::incr(&self.metrics.matches_formed);
                    match self.rooms.create_room(&formation).await {
                        Ok(room) => {
                            for ticket in &formation.tickets {
                                self.gateway.send_to(
                                    &ticket.player_id,
                                    ServerMessage::MatchmakingFound {
                                        room_id: room.room_id.clone(),
                                        game_id: room.game_id.clone(),
                                        mode: room.mode,
                                        ticket_id: ticket.ticket_id.clone(),
                                        players: room.players.clone(),
                                    },
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                formation_id = %formation.formation_id,
                                error = %e,
                                "Room creation failed for match formation"
                            );
                            self.gateway
                                .deliver(Outbound::to(formation.player_ids(), ServerMessage::error(&e)));
                        }
                    }
                }
                MatchmakingEvent::Timeout(ticket) => {
                    MetricsRegistry::incr(&self.metrics.tickets_timed_out);
                    tracing::info!(
                        ticket_id = %ticket.ticket_id,
                        player_id = %ticket.player_id,
                        "Ticket timed out"
                    );
                    self.gateway.send_to(
                        &ticket.player_id,
                        ServerMessage::MatchmakingTimeout {
                            ticket_id: ticket.ticket_id,
                        },
                    );
                }
            }
        }
    }
}
