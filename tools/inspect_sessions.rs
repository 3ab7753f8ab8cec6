//! Dump the contents of an arena session database
//!
//! Usage: inspect_sessions [data_dir] [game_id]

use arena::store::{RiskProfileStore, RocksStore, SessionStore};
use std::collections::BTreeMap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let data_dir = args.next().unwrap_or_else(|| "./DB/arena_data".to_string());
    let game_filter = args.next();

    let store = RocksStore::open(&data_dir)?;
    let keys = store.all_keys()?;
    println!("Database: {} ({} keys)", data_dir, keys.len());

    let mut by_prefix: BTreeMap<String, usize> = BTreeMap::new();
    for key in &keys {
        let prefix = key.splitn(3, ':').take(2).collect::<Vec<_>>().join(":");
        *by_prefix.entry(prefix).or_default() += 1;
    }
    for (prefix, count) in &by_prefix {
        println!("  {:<24} {}", prefix, count);
    }

    let mut games: Vec<String> = keys
        .iter()
        .filter_map(|k| k.strip_prefix("leaderboard:"))
        .filter_map(|rest| rest.split(':').next())
        .map(|g| g.to_string())
        .collect();
    games.sort();
    games.dedup();
    if let Some(game) = game_filter {
        games.retain(|g| *g == game);
    }

    for game in games {
        println!("\nLeaderboard {}:", game);
        for (i, session) in store.leaderboard(&game, 20).await?.iter().enumerate() {
            let profile = store.load_profile(&session.player_id).await?;
            println!(
                "  {:>2}. {:<16} score={:<8} room={} risk={}",
                i + 1,
                session.player_id,
                session.score,
                session.room_id,
                profile.risk_score
            );
        }
    }
    Ok(())
}
