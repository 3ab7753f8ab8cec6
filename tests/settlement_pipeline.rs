//! Matchmaking → room → settlement over a RocksDB-backed service
//!
//! Drives the gateway directly with parsed client messages and runs
//! matchmaking ticks by hand so every step is deterministic.

use arena::collaborators::{EnforcementLog, FingerprintRegistry, LedgerWallet};
use arena::gateway::messages::{ClientMessage, ServerMessage};
use arena::service::{ArenaService, Collaborators, Stores};
use arena::types::{now_millis, GameMode, RoomState, SessionStatus};
use arena::validation::UNDER_REVIEW;
use arena::ArenaConfig;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Pipeline {
    service: Arc<ArenaService>,
    wallet: Arc<LedgerWallet>,
    enforcement: Arc<EnforcementLog>,
    _dir: TempDir,
}

fn pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let stores = Stores::rocks(dir.path().to_str().unwrap()).unwrap();
    let wallet = Arc::new(LedgerWallet::new(500));
    let enforcement = Arc::new(EnforcementLog::new());
    let collaborators = Collaborators {
        wallet: wallet.clone(),
        hardware: Arc::new(FingerprintRegistry::new()),
        enforcement: enforcement.clone(),
    };
    let mut config = ArenaConfig::with_demo_game();
    config.rooms.ready_timeout_ms = 60_000;
    Pipeline {
        service: ArenaService::new(config, stores, collaborators),
        wallet,
        enforcement,
        _dir: dir,
    }
}

fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

async fn send(p: &Pipeline, player: &str, msg: ClientMessage) {
    p.service.gateway.handle_message(player, msg).await.unwrap();
}

/// Queue two players, tick, and return the room both were placed in
async fn matched_room(
    p: &Pipeline,
    players: [(&str, f64); 2],
    receivers: &mut [UnboundedReceiver<ServerMessage>; 2],
) -> String {
    for (player, rating) in players {
        send(
            p,
            player,
            ClientMessage::MatchmakingJoin {
                game_id: "reflex-duel".into(),
                mode: GameMode::Ranked,
                skill_rating: rating,
                ticket_id: None,
            },
        )
        .await;
    }
    let events = p.service.queue.tick();
    p.service.process_matchmaking(events).await;

    let mut room_ids = Vec::new();
    for rx in receivers.iter_mut() {
        let found = drain(rx)
            .into_iter()
            .find_map(|msg| match msg {
                ServerMessage::MatchmakingFound { room_id, players, .. } => {
                    assert_eq!(players.len(), 2);
                    Some(room_id)
                }
                _ => None,
            })
            .expect("matchmaking.found");
        room_ids.push(found);
    }
    assert_eq!(room_ids[0], room_ids[1]);
    room_ids.remove(0)
}

async fn ready_both(p: &Pipeline, room_id: &str, players: [&str; 2]) {
    for player in players {
        send(p, player, ClientMessage::RoomReady { room_id: room_id.into() }).await;
    }
}

async fn act(p: &Pipeline, player: &str, room_id: &str, kind: &str) {
    send(
        p,
        player,
        ClientMessage::RoomAction {
            room_id: room_id.into(),
            action: json!({ "kind": kind }),
            client_timestamp: Some(now_millis()),
        },
    )
    .await;
}

#[tokio::test]
async fn test_full_match_settles_and_pays_winner() {
    let p = pipeline();
    let (_, rx1) = p.service.gateway.connect("alice");
    let (_, rx2) = p.service.gateway.connect("bob");
    let mut receivers = [rx1, rx2];

    let room_id = matched_room(&p, [("alice", 1500.0), ("bob", 1520.0)], &mut receivers).await;
    assert_eq!(
        p.service.rooms.room_snapshot(&room_id).await.unwrap().room.state,
        RoomState::Forming
    );

    ready_both(&p, &room_id, ["alice", "bob"]).await;
    assert_eq!(p.wallet.balance("alice"), 400);

    for kind in ["hit", "hit", "combo"] {
        act(&p, "alice", &room_id, kind).await;
    }
    act(&p, "bob", &room_id, "hit").await;
    send(&p, "bob", ClientMessage::RoomScoreUpdate { room_id: room_id.clone(), score: 10 }).await;
    send(
        &p,
        "alice",
        ClientMessage::RoomEnd {
            room_id: room_id.clone(),
            final_score: 45,
            action_log_ref: Some("client-log-1".into()),
        },
    )
    .await;

    let snapshot = p.service.rooms.room_snapshot(&room_id).await.unwrap();
    assert_eq!(snapshot.room.state, RoomState::Ended);
    let winner = &snapshot.standings[0];
    assert_eq!(winner.player_id, "alice");
    assert_eq!(winner.rank, Some(1));
    // Two fees of 100, 10% rake, winner takes all
    assert_eq!(winner.reward, 180);
    assert_eq!(p.wallet.balance("alice"), 580);
    assert_eq!(p.wallet.balance("bob"), 400);
    assert!(p.enforcement.records().is_empty());

    let board = p.service.sessions.leaderboard("reflex-duel", 10).await.unwrap();
    assert_eq!(
        board.iter().map(|s| (s.player_id.as_str(), s.score)).collect::<Vec<_>>(),
        vec![("alice", 45), ("bob", 10)]
    );
    let stored = p.service.sessions.get_session(&board[0].session_id).await.unwrap().unwrap();
    assert!(stored.validated);
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(stored.action_log_ref.as_deref(), Some("client-log-1"));
    assert_eq!(stored.validation_hash.as_ref().map(|h| h.len()), Some(64));

    // Finalized sessions are immutable
    let mut tampered = stored.clone();
    tampered.score = 9_999;
    assert!(p.service.sessions.put_session(&tampered).await.is_err());
}

#[tokio::test]
async fn test_tampered_score_is_disqualified_and_hidden_from_leaderboard() {
    let p = pipeline();
    let (_, rx1) = p.service.gateway.connect("carol");
    let (_, rx2) = p.service.gateway.connect("dave");
    let mut receivers = [rx1, rx2];

    let room_id = matched_room(&p, [("carol", 1400.0), ("dave", 1410.0)], &mut receivers).await;
    ready_both(&p, &room_id, ["carol", "dave"]).await;

    act(&p, "carol", &room_id, "hit").await;
    act(&p, "dave", &room_id, "combo").await;
    send(&p, "dave", ClientMessage::RoomScoreUpdate { room_id: room_id.clone(), score: 25 }).await;
    // Replay of carol's log gives 10
    send(
        &p,
        "carol",
        ClientMessage::RoomEnd {
            room_id: room_id.clone(),
            final_score: 500,
            action_log_ref: None,
        },
    )
    .await;

    let sessions = p.service.sessions.sessions_for_room(&room_id).await.unwrap();
    let carol = sessions.iter().find(|s| s.player_id == "carol").unwrap();
    assert_eq!(carol.status, SessionStatus::Disqualified);
    assert!(!carol.validated);
    assert!(carol.review_note.as_deref().unwrap().starts_with(UNDER_REVIEW));
    assert!(carol.validation_hash.is_some());

    let board = p.service.sessions.leaderboard("reflex-duel", 10).await.unwrap();
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].player_id, "dave");
    assert_eq!(p.wallet.balance("dave"), 580);
}

#[tokio::test]
async fn test_lonely_ticket_times_out() {
    let p = pipeline();
    let (_, mut rx) = p.service.gateway.connect("erin");
    send(
        &p,
        "erin",
        ClientMessage::MatchmakingJoin {
            game_id: "reflex-duel".into(),
            mode: GameMode::Ranked,
            skill_rating: 1800.0,
            ticket_id: None,
        },
    )
    .await;

    let events = p.service.queue.tick_at(now_millis() + 61_000);
    p.service.process_matchmaking(events).await;

    let messages = drain(&mut rx);
    assert!(matches!(messages[0], ServerMessage::MatchmakingQueued { .. }));
    assert!(matches!(messages[1], ServerMessage::MatchmakingTimeout { .. }));
    assert_eq!(p.service.rooms.active_rooms(), 0);
    assert_eq!(p.service.queue.queued_count(), 0);
}

#[tokio::test]
async fn test_player_in_a_room_cannot_queue_again() {
    let p = pipeline();
    let (_, rx1) = p.service.gateway.connect("fay");
    let (_, rx2) = p.service.gateway.connect("gus");
    let mut receivers = [rx1, rx2];
    matched_room(&p, [("fay", 1500.0), ("gus", 1500.0)], &mut receivers).await;

    let err = p
        .service
        .gateway
        .handle_message(
            "fay",
            ClientMessage::MatchmakingJoin {
                game_id: "reflex-duel".into(),
                mode: GameMode::Ranked,
                skill_rating: 1500.0,
                ticket_id: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BAD_PAYLOAD");
}
