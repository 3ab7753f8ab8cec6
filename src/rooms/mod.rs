//! Game room manager
//!
//! Owns every live room. Each room sits behind its own async mutex, so the
//! transitions of one room are serialized while different rooms proceed in
//! parallel. Wallet, hardware and enforcement calls are made with the room
//! lock released; their outcome is applied afterwards, with a compensating
//! transition (refund, disqualification) when they fail.
//!
//! Outbound events are pushed onto an unbounded channel in the order the
//! room produced them; the gateway drains it.

pub mod runtime;

pub use runtime::RoomRuntime;

use crate::anticheat::{AntiCheatEngine, Verdict};
use crate::collaborators::{call_with_timeout, AccountEnforcement, CreditOutcome, DebitOutcome, Wallet};
use crate::config::{GameDefinition, RoomConfig};
use crate::errors::{ArenaError, ArenaResult};
use crate::gateway::messages::{Outbound, ServerMessage, Standing};
use crate::matchmaking::MatchFormation;
use crate::metrics::MetricsRegistry;
use crate::store::SessionStore;
use crate::types::{
    now_millis, BehaviorTelemetry, EnforcementAction, GameId, GameRoom, PlayerId, PlayerSession, RoomId, RoomState,
    SessionStatus, TelemetryReport, TicketId, MAX_TELEMETRY_SAMPLES,
};
use crate::validation::{ScoreValidator, ValidationOutcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

type SharedRoom = Arc<Mutex<RoomRuntime>>;

/// Read-only view of a room for queries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: GameRoom,
    pub standings: Vec<Standing>,
    pub archived: bool,
}

struct ArchivedRoom {
    snapshot: RoomSnapshot,
    archived_at: u64,
}

/// Components the manager delegates to
#[derive(Clone)]
pub struct RoomServices {
    pub validator: Arc<ScoreValidator>,
    pub anticheat: Arc<AntiCheatEngine>,
    pub sessions: Arc<dyn SessionStore>,
    pub wallet: Arc<dyn Wallet>,
    pub enforcement: Arc<dyn AccountEnforcement>,
    pub metrics: Arc<MetricsRegistry>,
}

/// A room that left play; remaining work happens without the room lock
struct Closing {
    room: GameRoom,
    sessions: Vec<PlayerSession>,
    refunds: Vec<(PlayerId, u64)>,
    credits: Vec<(PlayerId, u64)>,
    verdicts: Vec<Verdict>,
}

struct SettlementJob {
    session: PlayerSession,
    telemetry: BehaviorTelemetry,
    analyzed: bool,
}

struct SettlementPlan {
    jobs: Vec<SettlementJob>,
    action_log: Vec<crate::types::ActionLogEntry>,
}

enum Departure {
    Continue,
    Settle,
    Disqualify(String),
}

/// What to do once the room lock is released
enum Followup {
    Nothing,
    Settle(SettlementPlan),
    Close(Closing),
}

pub struct GameRoomManager {
    config: RoomConfig,
    games: HashMap<GameId, GameDefinition>,
    rooms: DashMap<RoomId, SharedRoom>,
    archive: DashMap<RoomId, ArchivedRoom>,
    /// Every ticket that has been placed into a room
    formations: DashMap<TicketId, RoomId>,
    player_rooms: DashMap<PlayerId, RoomId>,
    services: RoomServices,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl GameRoomManager {
    pub fn new(
        config: RoomConfig,
        games: HashMap<GameId, GameDefinition>,
        services: RoomServices,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            games,
            rooms: DashMap::new(),
            archive: DashMap::new(),
            formations: DashMap::new(),
            player_rooms: DashMap::new(),
            services,
            outbound,
        })
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// The live room a player currently belongs to
    pub fn room_for_player(&self, player_id: &str) -> Option<RoomId> {
        self.player_rooms.get(player_id).map(|r| r.value().clone())
    }

    pub async fn room_snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let live = self.rooms.get(room_id).map(|r| r.value().clone());
        if let Some(shared) = live {
            let rt = shared.lock().await;
            return Some(RoomSnapshot {
                room: rt.room.clone(),
                standings: rt.standings(),
                archived: false,
            });
        }
        self.archive.get(room_id).map(|a| a.snapshot.clone())
    }

    fn emit(&self, outbound: Outbound) {
        if outbound.recipients.is_empty() {
            return;
        }
        if self.outbound.send(outbound).is_err() {
            tracing::debug!("Outbound channel closed, dropping room event");
        }
    }

    fn broadcast(&self, rt: &RoomRuntime, message: ServerMessage) {
        self.emit(Outbound::to(rt.room.players.clone(), message));
    }

    /// Live room for a request; archived rooms reject every mutation
    fn live(&self, room_id: &str, wanted: RoomState) -> ArenaResult<SharedRoom> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(room.value().clone());
        }
        match self.archive.get(room_id) {
            Some(archived) => Err(ArenaError::InvalidTransition {
                from: archived.snapshot.room.state,
                to: wanted,
            }),
            None => Err(ArenaError::RoomNotFound(room_id.to_string())),
        }
    }

    /// Create a room in `forming` for a match formation
    pub async fn create_room(self: &Arc<Self>, formation: &MatchFormation) -> ArenaResult<GameRoom> {
        let game = self
            .games
            .get(&formation.game_id)
            .cloned()
            .ok_or_else(|| ArenaError::UnknownGame(formation.game_id.clone()))?;
        let room_id = Uuid::new_v4().to_string();
        let players = formation.player_ids();
        if players.len() > game.max_players {
            return Err(ArenaError::RoomFull {
                room_id,
                capacity: game.max_players,
            });
        }
        let distinct: HashSet<&PlayerId> = players.iter().collect();
        if distinct.len() != players.len() {
            tracing::error!(
                formation_id = %formation.formation_id,
                players = ?players,
                "Invariant violated: player matched against themselves"
            );
            return Err(ArenaError::BadRequest(format!(
                "formation {} lists a player twice",
                formation.formation_id
            )));
        }

        self.claim_tickets(formation, &room_id)?;

        let now = now_millis();
        let room = GameRoom {
            room_id: room_id.clone(),
            game_id: formation.game_id.clone(),
            mode: formation.mode,
            players,
            capacity: game.max_players,
            state: RoomState::Forming,
            created_at: now,
            started_at: None,
            ended_at: None,
            ticket_ids: formation.tickets.iter().map(|t| t.ticket_id.clone()).collect(),
        };
        let sessions: Vec<PlayerSession> = room
            .players
            .iter()
            .map(|p| PlayerSession::new(Uuid::new_v4().to_string(), &room, p.clone(), game.entry_fee))
            .collect();
        for session in &sessions {
            if let Err(e) = self.services.sessions.put_session(session).await {
                tracing::error!(session_id = %session.session_id, error = %e, "Failed to persist new session");
            }
        }

        for player_id in &room.players {
            self.player_rooms.insert(player_id.clone(), room_id.clone());
        }
        self.rooms.insert(
            room_id.clone(),
            Arc::new(Mutex::new(RoomRuntime::new(room.clone(), game, sessions))),
        );
        MetricsRegistry::incr(&self.services.metrics.rooms_created);
        MetricsRegistry::incr(&self.services.metrics.rooms_active);
        tracing::info!(
            room_id = %room_id,
            game_id = %room.game_id,
            players = ?room.players,
            "Room created"
        );

        let manager = Arc::clone(self);
        let timeout = self.config.ready_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.ready_timeout(&room_id).await;
        });

        Ok(room)
    }

    /// Record each ticket against the room; a ticket seen before is a double match
    fn claim_tickets(&self, formation: &MatchFormation, room_id: &str) -> ArenaResult<()> {
        let mut claimed: Vec<TicketId> = Vec::new();
        for ticket in &formation.tickets {
            match self.formations.entry(ticket.ticket_id.clone()) {
                Entry::Occupied(existing) => {
                    let existing_room = existing.get().clone();
                    drop(existing);
                    for ticket_id in &claimed {
                        self.formations.remove(ticket_id);
                    }
                    tracing::error!(
                        ticket_id = %ticket.ticket_id,
                        existing_room = %existing_room,
                        formation_id = %formation.formation_id,
                        "Invariant violated: ticket matched into two rooms"
                    );
                    MetricsRegistry::incr(&self.services.metrics.duplicate_matches);
                    return Err(ArenaError::DuplicateMatch {
                        ticket_id: ticket.ticket_id.clone(),
                        existing_room,
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(room_id.to_string());
                    claimed.push(ticket.ticket_id.clone());
                }
            }
        }
        Ok(())
    }

    /// `room.join`: (re)attach a member and announce them
    pub async fn join(&self, player_id: &str, room_id: &str) -> ArenaResult<()> {
        let shared = self.live(room_id, RoomState::InProgress)?;
        let rt = shared.lock().await;
        rt.require_member(player_id)?;
        if !matches!(rt.state(), RoomState::Forming | RoomState::Ready | RoomState::InProgress) {
            return Err(ArenaError::InvalidTransition {
                from: rt.state(),
                to: RoomState::InProgress,
            });
        }

        self.emit(Outbound::one(player_id, ServerMessage::RoomJoined { room: rt.room.clone() }));
        self.emit(Outbound::to(
            rt.other_members(player_id),
            ServerMessage::RoomPlayerJoined {
                room_id: room_id.to_string(),
                player_id: player_id.to_string(),
            },
        ));
        Ok(())
    }

    /// `room.ready`: the last member to signal ready moves the room to `ready`
    /// and triggers the entry-fee debits.
    pub async fn ready(self: &Arc<Self>, player_id: &str, room_id: &str) -> ArenaResult<()> {
        let shared = self.live(room_id, RoomState::Ready)?;
        let debits = {
            let mut rt = shared.lock().await;
            rt.require_member(player_id)?;
            rt.require_state(RoomState::Forming)?;
            rt.ready.insert(player_id.to_string());

            let ready_count = rt.ready.len();
            self.broadcast(
                &rt,
                ServerMessage::RoomPlayerReady {
                    room_id: room_id.to_string(),
                    player_id: player_id.to_string(),
                    ready_count,
                },
            );
            if ready_count < rt.room.players.len() {
                return Ok(());
            }

            rt.transition(RoomState::Ready, now_millis())?;
            self.broadcast(
                &rt,
                ServerMessage::RoomStateChanged {
                    room_id: room_id.to_string(),
                    state: RoomState::Ready,
                },
            );
            rt.sessions
                .iter()
                .filter(|s| s.entry_fee > 0)
                .map(|s| (s.player_id.clone(), s.entry_fee))
                .collect::<Vec<_>>()
        };

        self.collect_entry_fees(&shared, debits).await;
        Ok(())
    }

    /// Debit every entry fee, then start the match or close it (failed closed)
    async fn collect_entry_fees(self: &Arc<Self>, shared: &SharedRoom, debits: Vec<(PlayerId, u64)>) {
        let timeout = self.config.collaborator_timeout();
        let results = join_all(debits.into_iter().map(|(player_id, fee)| async move {
            let outcome = call_with_timeout("wallet", timeout, self.services.wallet.debit(&player_id, fee)).await;
            (player_id, fee, outcome)
        }))
        .await;

        let now = now_millis();
        let mut rt = shared.lock().await;
        if rt.state() != RoomState::Ready {
            // Closed while the debits were in flight; hand back what was taken
            drop(rt);
            let taken: Vec<(PlayerId, u64)> = results
                .iter()
                .filter(|(_, _, outcome)| matches!(outcome, Ok(DebitOutcome::Ok)))
                .map(|(player_id, fee, _)| (player_id.clone(), *fee))
                .collect();
            self.refund(&taken).await;
            return;
        }

        let mut failures = Vec::new();
        for (player_id, _, outcome) in &results {
            match outcome {
                Ok(DebitOutcome::Ok) => {
                    if let Some(session) = rt.session_mut(player_id) {
                        session.entry_fee_debited = true;
                    }
                }
                Ok(DebitOutcome::InsufficientFunds) => {
                    failures.push(format!("{}: insufficient funds", player_id));
                }
                Err(e) => {
                    tracing::warn!(room_id = %rt.room.room_id, player_id = %player_id, error = %e, "Entry fee debit failed");
                    MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
                    failures.push(format!("{}: {}", player_id, e.code()));
                }
            }
        }

        if failures.is_empty() {
            if let Err(e) = self.start_locked(&mut rt, now) {
                tracing::error!(room_id = %rt.room.room_id, error = %e, "Could not start room");
            }
            return;
        }

        let reason = format!("entry fee debit failed ({})", failures.join(", "));
        match self.disqualify_locked(&mut rt, &reason, now) {
            Ok(closing) => {
                drop(rt);
                self.finish(closing, RoomState::Disqualified).await;
            }
            Err(e) => tracing::error!(error = %e, "Could not disqualify room after debit failure"),
        }
    }

    fn start_locked(self: &Arc<Self>, rt: &mut RoomRuntime, now: u64) -> ArenaResult<()> {
        rt.transition(RoomState::InProgress, now)?;
        for session in &mut rt.sessions {
            if session.status == SessionStatus::Playing {
                session.start_time = Some(now);
            }
        }
        let room_id = rt.room.room_id.clone();
        self.broadcast(
            rt,
            ServerMessage::RoomStarted {
                room_id: room_id.clone(),
                start_time: now,
            },
        );

        let manager = Arc::clone(self);
        let duration = rt.game.duration();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            manager.duration_elapsed(&room_id).await;
        });
        Ok(())
    }

    /// Ready barrier expired: drop anyone not ready and cancel the match
    pub async fn ready_timeout(&self, room_id: &str) {
        let Some(shared) = self.rooms.get(room_id).map(|r| r.value().clone()) else {
            return;
        };
        let closing = {
            let mut rt = shared.lock().await;
            if rt.state() != RoomState::Forming {
                return;
            }
            let now = now_millis();
            let missing: Vec<PlayerId> = rt
                .room
                .players
                .iter()
                .filter(|p| !rt.ready.contains(*p))
                .cloned()
                .collect();
            for player_id in &missing {
                if rt.abandon(player_id, now) {
                    if let Some(session) = rt.session_mut(player_id) {
                        session.review_note = Some("not ready before the ready timeout".to_string());
                    }
                }
            }
            let reason = format!("ready timeout ({} not ready)", missing.join(", "));
            match self.disqualify_locked(&mut rt, &reason, now) {
                Ok(closing) => closing,
                Err(e) => {
                    tracing::warn!(room_id = %room_id, error = %e, "Ready timeout could not close room");
                    return;
                }
            }
        };
        self.finish(closing, RoomState::Disqualified).await;
    }

    /// `room.action`: stamp, log and relay to the other members untouched
    pub async fn action(
        &self,
        player_id: &str,
        room_id: &str,
        action: serde_json::Value,
        client_timestamp: Option<u64>,
    ) -> ArenaResult<u64> {
        let shared = self.live(room_id, RoomState::InProgress)?;
        let mut rt = shared.lock().await;
        rt.require_member(player_id)?;
        rt.require_state(RoomState::InProgress)?;
        rt.require_active(player_id)?;

        let entry = rt.record_action(player_id, action, client_timestamp, now_millis());
        self.emit(Outbound::to(
            rt.other_members(player_id),
            ServerMessage::RoomAction {
                room_id: room_id.to_string(),
                player_id: player_id.to_string(),
                seq: entry.seq,
                action: entry.action,
                client_timestamp: entry.client_timestamp,
                server_timestamp: entry.server_timestamp,
            },
        ));
        Ok(entry.seq)
    }

    /// `room.score_update`: keep the last reported score and relay it
    pub async fn score_update(&self, player_id: &str, room_id: &str, score: i64) -> ArenaResult<()> {
        let shared = self.live(room_id, RoomState::InProgress)?;
        let mut rt = shared.lock().await;
        rt.require_member(player_id)?;
        rt.require_state(RoomState::InProgress)?;
        rt.require_active(player_id)?;

        if let Some(session) = rt.session_mut(player_id) {
            session.score = score;
        }
        self.emit(Outbound::to(
            rt.other_members(player_id),
            ServerMessage::RoomScoreUpdate {
                room_id: room_id.to_string(),
                player_id: player_id.to_string(),
                score,
                server_timestamp: now_millis(),
            },
        ));
        Ok(())
    }

    /// `room.telemetry`: accumulate samples; during play, run a live check
    pub async fn telemetry(&self, player_id: &str, room_id: &str, report: TelemetryReport) -> ArenaResult<()> {
        if report.largest_series() > MAX_TELEMETRY_SAMPLES {
            return Err(ArenaError::BadRequest(format!(
                "telemetry report exceeds {} samples per series",
                MAX_TELEMETRY_SAMPLES
            )));
        }
        let shared = self.live(room_id, RoomState::InProgress)?;
        let behavior = {
            let mut rt = shared.lock().await;
            rt.require_member(player_id)?;
            if !matches!(rt.state(), RoomState::Forming | RoomState::Ready | RoomState::InProgress) {
                return Err(ArenaError::InvalidTransition {
                    from: rt.state(),
                    to: RoomState::InProgress,
                });
            }
            rt.require_active(player_id)?;
            if let Some(session) = rt.session_mut(player_id) {
                session.telemetry.absorb(report);
            }
            if rt.state() != RoomState::InProgress {
                return Ok(());
            }
            let Some(session) = rt.session(player_id) else {
                return Ok(());
            };
            behavior_of(&rt, session, now_millis())
        };

        let verdict = match self.services.anticheat.inspect(player_id, &behavior).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(room_id = %room_id, player_id = %player_id, error = %e, "Live anti-cheat check failed");
                return Ok(());
            }
        };
        if verdict.action >= EnforcementAction::Kick {
            self.apply_live_verdict(&shared, verdict).await;
        }
        Ok(())
    }

    /// Kick removes the player from play; ban cancels the whole match.
    ///
    /// The verdict is claimed on the room before it reaches the risk profile:
    /// a room that already left play is settled by the full analysis instead.
    async fn apply_live_verdict(&self, shared: &SharedRoom, verdict: Verdict) {
        let now = now_millis();
        let (room_id, followup) = {
            let mut rt = shared.lock().await;
            if rt.state() != RoomState::InProgress || rt.verdicts.contains_key(&verdict.player_id) {
                return;
            }
            let room_id = rt.room.room_id.clone();
            let player_id = verdict.player_id.clone();
            if let Some(session) = rt.session_mut(&player_id) {
                session.record_violations(&verdict.violations);
                session.raise_suspicion(verdict.suspicion_score());
                if session.status == SessionStatus::Playing {
                    session.status = SessionStatus::Disqualified;
                    session.end_time = Some(now);
                    session.review_note = Some(format!("removed by anti-cheat ({}): {}", verdict.action, verdict.reason));
                }
            }
            rt.verdicts.insert(player_id.clone(), verdict.clone());

            let departure = if verdict.action == EnforcementAction::Ban {
                Departure::Disqualify(format!("player {} banned by anti-cheat", player_id))
            } else {
                self.emit(Outbound::to(
                    rt.other_members(&player_id),
                    ServerMessage::RoomPlayerLeft {
                        room_id: room_id.clone(),
                        player_id: player_id.clone(),
                    },
                ));
                departure_outcome(&rt)
            };
            (room_id, self.followup_locked(&mut rt, departure, now))
        };

        if let Err(e) = self.services.anticheat.record(&verdict, now).await {
            tracing::warn!(player_id = %verdict.player_id, error = %e, "Failed to record live verdict");
        }
        self.enforce(&room_id, &verdict).await;
        self.run_followup(shared, followup).await;
    }

    /// `room.end`: record the final score and settle the room
    pub async fn end(
        &self,
        player_id: &str,
        room_id: &str,
        final_score: i64,
        action_log_ref: Option<String>,
    ) -> ArenaResult<()> {
        let shared = self.live(room_id, RoomState::Settling)?;
        let plan = {
            let mut rt = shared.lock().await;
            rt.require_member(player_id)?;
            rt.require_state(RoomState::InProgress)?;
            rt.require_active(player_id)?;
            if let Some(session) = rt.session_mut(player_id) {
                session.score = final_score;
                session.action_log_ref = action_log_ref;
            }
            tracing::info!(room_id = %room_id, player_id = %player_id, final_score, "End requested");
            self.begin_settlement(&mut rt, now_millis())?
        };
        self.complete_settlement(&shared, plan).await;
        Ok(())
    }

    /// Hard duration cap reached
    pub async fn duration_elapsed(&self, room_id: &str) {
        let Some(shared) = self.rooms.get(room_id).map(|r| r.value().clone()) else {
            return;
        };
        let plan = {
            let mut rt = shared.lock().await;
            if rt.state() != RoomState::InProgress {
                return;
            }
            tracing::info!(room_id = %room_id, "Duration cap reached");
            match self.begin_settlement(&mut rt, now_millis()) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(room_id = %room_id, error = %e, "Could not settle at duration cap");
                    return;
                }
            }
        };
        self.complete_settlement(&shared, plan).await;
    }

    /// A player's connection is gone; mid-match this is an abandonment
    pub async fn player_disconnected(&self, player_id: &str) {
        let Some(room_id) = self.room_for_player(player_id) else {
            return;
        };
        let Some(shared) = self.rooms.get(&room_id).map(|r| r.value().clone()) else {
            return;
        };
        let now = now_millis();
        let followup = {
            let mut rt = shared.lock().await;
            if !matches!(rt.state(), RoomState::Ready | RoomState::InProgress) {
                return;
            }
            if !rt.abandon(player_id, now) {
                return;
            }
            tracing::info!(room_id = %room_id, player_id = %player_id, "Player abandoned the match");
            self.emit(Outbound::to(
                rt.other_members(player_id),
                ServerMessage::RoomPlayerLeft {
                    room_id: room_id.clone(),
                    player_id: player_id.to_string(),
                },
            ));
            let departure = departure_outcome(&rt);
            self.followup_locked(&mut rt, departure, now)
        };
        self.run_followup(&shared, followup).await;
    }

    fn followup_locked(&self, rt: &mut RoomRuntime, departure: Departure, now: u64) -> Followup {
        let result = match departure {
            Departure::Continue => return Followup::Nothing,
            Departure::Settle => self.begin_settlement(rt, now).map(Followup::Settle),
            Departure::Disqualify(reason) => self.disqualify_locked(rt, &reason, now).map(Followup::Close),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(room_id = %rt.room.room_id, error = %e, "Room could not leave play");
            Followup::Nothing
        })
    }

    async fn run_followup(&self, shared: &SharedRoom, followup: Followup) {
        match followup {
            Followup::Nothing => {}
            Followup::Settle(plan) => self.complete_settlement(shared, plan).await,
            Followup::Close(closing) => self.finish(closing, RoomState::Disqualified).await,
        }
    }

    /// `inProgress → settling`; snapshot what validation and anti-cheat need
    fn begin_settlement(&self, rt: &mut RoomRuntime, now: u64) -> ArenaResult<SettlementPlan> {
        rt.transition(RoomState::Settling, now)?;
        for session in &mut rt.sessions {
            if session.status == SessionStatus::Playing {
                session.status = SessionStatus::Completed;
                session.end_time = Some(now);
            }
        }
        self.broadcast(
            rt,
            ServerMessage::RoomStateChanged {
                room_id: rt.room.room_id.clone(),
                state: RoomState::Settling,
            },
        );

        let view: &RoomRuntime = rt;
        let jobs = view
            .sessions
            .iter()
            .map(|s| SettlementJob {
                session: s.clone(),
                telemetry: behavior_of(view, s, now),
                analyzed: view.verdicts.contains_key(&s.player_id),
            })
            .collect();
        Ok(SettlementPlan {
            jobs,
            action_log: view.action_log.clone(),
        })
    }

    /// Validate and analyze every session, rank, pay out, then `settling → ended`
    async fn complete_settlement(&self, shared: &SharedRoom, plan: SettlementPlan) {
        let validator = &self.services.validator;
        let anticheat = &self.services.anticheat;
        let action_log = &plan.action_log;

        let outcomes: Vec<(PlayerId, ValidationOutcome, Option<Verdict>)> =
            join_all(plan.jobs.iter().map(|job| async move {
                let player_id = job.session.player_id.clone();
                let validation = validator.validate(&job.session, action_log);
                let verdict = if job.analyzed {
                    None
                } else {
                    match anticheat.analyze(&player_id, &job.telemetry).await {
                        Ok(verdict) => Some(verdict),
                        Err(e) => {
                            tracing::warn!(player_id = %player_id, error = %e, "Anti-cheat analysis failed");
                            None
                        }
                    }
                };
                (player_id, validation, verdict)
            }))
            .await;

        let now = now_millis();
        let closing = {
            let mut rt = shared.lock().await;
            let mut fresh_verdicts = Vec::new();
            for (player_id, validation, verdict) in outcomes {
                let Some(session) = rt.session_mut(&player_id) else {
                    continue;
                };
                if session.status == SessionStatus::Abandoned {
                    session.validated = false;
                    session.validation_hash = Some(validation.validation_hash.clone());
                } else {
                    validation.apply_to(session);
                    let counter = if validation.validated {
                        &self.services.metrics.sessions_validated
                    } else {
                        &self.services.metrics.sessions_rejected
                    };
                    MetricsRegistry::incr(counter);
                }

                if let Some(verdict) = &verdict {
                    session.record_violations(&verdict.violations);
                    session.raise_suspicion(verdict.suspicion_score());
                    if verdict.action >= EnforcementAction::Kick && session.status == SessionStatus::Completed {
                        session.status = SessionStatus::Disqualified;
                        session.review_note = Some(format!(
                            "disqualified by anti-cheat ({}): {}",
                            verdict.action, verdict.reason
                        ));
                    }
                }
                session.summarize_telemetry();

                if let Some(verdict) = verdict {
                    if verdict.action != EnforcementAction::None {
                        fresh_verdicts.push(verdict.clone());
                    }
                    rt.verdicts.insert(player_id, verdict);
                }
            }

            rt.rank_and_pay();
            if let Err(e) = rt.transition(RoomState::Ended, now) {
                tracing::error!(room_id = %rt.room.room_id, error = %e, "Settlement could not end room");
                return;
            }
            let credits = rt
                .sessions
                .iter()
                .filter(|s| s.is_rankable() && s.reward > 0)
                .map(|s| (s.player_id.clone(), s.reward))
                .collect();
            Closing {
                room: rt.room.clone(),
                sessions: rt.sessions.clone(),
                refunds: Vec::new(),
                credits,
                verdicts: fresh_verdicts,
            }
        };
        self.finish(closing, RoomState::Ended).await;
    }

    /// Any state → `disqualified`; every debited fee becomes a refund
    fn disqualify_locked(&self, rt: &mut RoomRuntime, reason: &str, now: u64) -> ArenaResult<Closing> {
        rt.transition(RoomState::Disqualified, now)?;
        rt.disqualify_sessions(reason, now);
        tracing::warn!(room_id = %rt.room.room_id, reason = %reason, "Room disqualified");
        Ok(Closing {
            room: rt.room.clone(),
            sessions: rt.sessions.clone(),
            refunds: rt.refund_due(),
            credits: Vec::new(),
            verdicts: Vec::new(),
        })
    }

    /// Collaborator calls, persistence and the final broadcast for a closed room
    async fn finish(&self, mut closing: Closing, state: RoomState) {
        let room_id = closing.room.room_id.clone();
        self.refund(&closing.refunds).await;

        let failed_credits = self.pay(&closing.credits).await;
        for session in &mut closing.sessions {
            if failed_credits.contains(&session.player_id) {
                session.review_note = Some("reward credit pending".to_string());
            }
        }

        for verdict in &closing.verdicts {
            self.enforce(&room_id, verdict).await;
        }

        self.persist(&closing.sessions).await;

        let standings = runtime::standings_of(&closing.sessions);
        self.emit(Outbound::to(
            closing.room.players.clone(),
            ServerMessage::RoomStateChanged {
                room_id: room_id.clone(),
                state,
            },
        ));
        self.emit(Outbound::to(
            closing.room.players.clone(),
            ServerMessage::RoomResult {
                room_id: room_id.clone(),
                state,
                standings: standings.clone(),
            },
        ));

        let counter = match state {
            RoomState::Ended => &self.services.metrics.rooms_ended,
            _ => &self.services.metrics.rooms_disqualified,
        };
        MetricsRegistry::incr(counter);
        tracing::info!(room_id = %room_id, state = %state, "Room closed");

        self.archive_room(closing.room, standings);
    }

    async fn refund(&self, refunds: &[(PlayerId, u64)]) {
        let timeout = self.config.collaborator_timeout();
        for (player_id, amount) in refunds {
            match call_with_timeout("wallet", timeout, self.services.wallet.credit(player_id, *amount)).await {
                Ok(CreditOutcome::Ok) => {
                    tracing::info!(player_id = %player_id, amount = *amount, "Entry fee refunded");
                }
                Ok(CreditOutcome::Failed(reason)) => {
                    tracing::error!(player_id = %player_id, amount = *amount, reason = %reason, "Refund rejected by wallet");
                    MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
                }
                Err(e) => {
                    tracing::warn!(player_id = %player_id, amount = *amount, error = %e, "Refund failed");
                    MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
                }
            }
        }
    }

    /// Credit rewards; returns players whose credit did not go through
    async fn pay(&self, credits: &[(PlayerId, u64)]) -> Vec<PlayerId> {
        let timeout = self.config.collaborator_timeout();
        let mut failed = Vec::new();
        for (player_id, amount) in credits {
            match call_with_timeout("wallet", timeout, self.services.wallet.credit(player_id, *amount)).await {
                Ok(CreditOutcome::Ok) => {
                    tracing::info!(player_id = %player_id, amount = *amount, "Reward credited");
                }
                Ok(CreditOutcome::Failed(reason)) => {
                    tracing::error!(player_id = %player_id, reason = %reason, "Reward credit rejected");
                    MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
                    failed.push(player_id.clone());
                }
                Err(e) => {
                    tracing::warn!(player_id = %player_id, error = %e, "Reward credit failed");
                    MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
                    failed.push(player_id.clone());
                }
            }
        }
        failed
    }

    /// Forward a verdict to account enforcement and tell the player why
    async fn enforce(&self, room_id: &str, verdict: &Verdict) {
        self.services.metrics.record_verdict(verdict.action);
        let result = call_with_timeout(
            "enforcement",
            self.config.collaborator_timeout(),
            self.services
                .enforcement
                .apply_action(&verdict.player_id, verdict.action, &verdict.reason),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(player_id = %verdict.player_id, action = %verdict.action, error = %e, "Enforcement call failed");
            MetricsRegistry::incr(&self.services.metrics.collaborator_failures);
        }
        self.emit(Outbound::one(
            &verdict.player_id,
            ServerMessage::RoomVerdict {
                room_id: room_id.to_string(),
                action: verdict.action,
                reason: verdict.reason.clone(),
            },
        ));
    }

    async fn persist(&self, sessions: &[PlayerSession]) {
        for session in sessions {
            if let Err(e) = self.services.sessions.put_session(session).await {
                tracing::error!(session_id = %session.session_id, error = %e, "Failed to persist session");
            }
        }
    }

    fn archive_room(&self, room: GameRoom, standings: Vec<Standing>) {
        let room_id = room.room_id.clone();
        self.rooms.remove(&room_id);
        for player_id in &room.players {
            self.player_rooms.remove_if(player_id, |_, r| *r == room_id);
        }
        self.archive.insert(
            room_id,
            ArchivedRoom {
                snapshot: RoomSnapshot {
                    room,
                    standings,
                    archived: true,
                },
                archived_at: now_millis(),
            },
        );
        MetricsRegistry::decr(&self.services.metrics.rooms_active);
    }

    /// Drop archived rooms past retention along with their ticket claims
    pub fn purge_archive(&self, now: u64) -> usize {
        let retention = self.config.archive_retention_ms;
        let expired: Vec<(RoomId, Vec<TicketId>)> = self
            .archive
            .iter()
            .filter(|a| a.archived_at + retention <= now)
            .map(|a| (a.key().clone(), a.snapshot.room.ticket_ids.clone()))
            .collect();
        for (room_id, tickets) in &expired {
            self.archive.remove(room_id);
            for ticket_id in tickets {
                self.formations.remove(ticket_id);
            }
        }
        expired.len()
    }
}

/// Minimum-player rule after someone leaves play
fn departure_outcome(rt: &RoomRuntime) -> Departure {
    let active = rt.active_players().len();
    if active < rt.game.min_players {
        Departure::Disqualify(format!(
            "{} of {} required players remain",
            active, rt.game.min_players
        ))
    } else if active <= 1 && rt.room.players.len() > 1 && rt.state() == RoomState::InProgress {
        Departure::Settle
    } else {
        Departure::Continue
    }
}

/// Anti-cheat input for one session: client samples plus server-observed timing
fn behavior_of(rt: &RoomRuntime, session: &PlayerSession, now: u64) -> BehaviorTelemetry {
    let start = session.start_time.or(rt.room.started_at).unwrap_or(now);
    let end = session.end_time.unwrap_or(now);
    BehaviorTelemetry {
        game_id: rt.room.game_id.clone(),
        reaction_times_ms: session.telemetry.reaction_times_ms.clone(),
        accuracy_samples: session.telemetry.accuracy_samples.clone(),
        action_timestamps_ms: rt.action_timestamps(&session.player_id),
        session_duration_ms: end.saturating_sub(start),
        hardware: session.telemetry.hardware.clone(),
    }
}
