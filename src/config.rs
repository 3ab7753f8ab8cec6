//! Configuration management with validation and defaults
//!
//! Loaded from an optional TOML file, then overridden by `ARENA_*`
//! environment variables, then validated for logical consistency.

use crate::errors::{ArenaResult, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub server: ServerConfig,
    pub matchmaking: MatchmakingConfig,
    pub rooms: RoomConfig,
    pub validation: ValidationConfig,
    pub anti_cheat: AntiCheatThresholds,
    pub storage: StorageConfig,
    pub games: HashMap<String, GameDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Sustained inbound messages per second allowed on one connection
    pub messages_per_second: u32,
    pub message_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            messages_per_second: 30,
            message_burst: 60,
        }
    }
}

/// Skill tolerance band and queue timing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    pub ticket_ttl_ms: u64,
    pub tick_interval_ms: u64,
    pub base_tolerance: f64,
    pub tolerance_step: f64,
    pub tolerance_step_interval_ms: u64,
    pub max_tolerance: f64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_ms: 60_000,
            tick_interval_ms: 250,
            base_tolerance: 50.0,
            tolerance_step: 25.0,
            tolerance_step_interval_ms: 5_000,
            max_tolerance: 500.0,
        }
    }
}

impl MatchmakingConfig {
    /// Allowed rating spread for a ticket that has waited `wait_ms`
    pub fn tolerance_at(&self, wait_ms: u64) -> f64 {
        let steps = wait_ms / self.tolerance_step_interval_ms.max(1);
        (self.base_tolerance + self.tolerance_step * steps as f64).min(self.max_tolerance)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub ready_timeout_ms: u64,
    /// Upper bound on any single wallet / hardware call
    pub collaborator_timeout_ms: u64,
    /// How long archived rooms stay queryable
    pub archive_retention_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 15_000,
            collaborator_timeout_ms: 2_000,
            archive_retention_ms: 60 * 60 * 1000,
        }
    }
}

impl RoomConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Relative tolerance between a reported and a replayed score
    pub score_tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { score_tolerance: 0.01 }
    }
}

/// Statistical detector thresholds. Overridable per game.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AntiCheatThresholds {
    pub min_reaction_ms: f64,
    pub reaction_floor_ms: f64,
    pub reaction_variance_ms2: f64,
    pub fast_mean_reaction_ms: f64,
    pub max_accuracy: f64,
    pub accuracy_consistency: f64,
    pub consistent_mean_accuracy: f64,
    pub max_actions_per_second: f64,
    pub macro_actions_per_second: f64,
    pub macro_interval_variance_ms2: f64,
    pub hardware_mismatch_confidence: f64,
    pub min_samples: usize,
    pub pattern_window_ms: u64,
    pub pattern_violation_count: usize,
    pub ban_violation_count: usize,
}

impl Default for AntiCheatThresholds {
    fn default() -> Self {
        Self {
            min_reaction_ms: 100.0,
            reaction_floor_ms: 50.0,
            reaction_variance_ms2: 100.0,
            fast_mean_reaction_ms: 200.0,
            max_accuracy: 0.98,
            accuracy_consistency: 0.95,
            consistent_mean_accuracy: 0.90,
            max_actions_per_second: 15.0,
            macro_actions_per_second: 8.0,
            macro_interval_variance_ms2: 1.0,
            hardware_mismatch_confidence: 0.8,
            min_samples: 3,
            pattern_window_ms: 24 * 60 * 60 * 1000,
            pattern_violation_count: 5,
            ban_violation_count: 10,
        }
    }
}

/// Per-game threshold table; any field left out keeps the global value
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AntiCheatOverrides {
    pub min_reaction_ms: Option<f64>,
    pub reaction_floor_ms: Option<f64>,
    pub reaction_variance_ms2: Option<f64>,
    pub fast_mean_reaction_ms: Option<f64>,
    pub max_accuracy: Option<f64>,
    pub accuracy_consistency: Option<f64>,
    pub consistent_mean_accuracy: Option<f64>,
    pub max_actions_per_second: Option<f64>,
    pub macro_actions_per_second: Option<f64>,
    pub macro_interval_variance_ms2: Option<f64>,
    pub hardware_mismatch_confidence: Option<f64>,
    pub min_samples: Option<usize>,
    pub pattern_window_ms: Option<u64>,
    pub pattern_violation_count: Option<usize>,
    pub ban_violation_count: Option<usize>,
}

impl AntiCheatOverrides {
    pub fn apply_to(&self, thresholds: &mut AntiCheatThresholds) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    thresholds.$field = value;
                })*
            };
        }
        overlay!(
            min_reaction_ms,
            reaction_floor_ms,
            reaction_variance_ms2,
            fast_mean_reaction_ms,
            max_accuracy,
            accuracy_consistency,
            consistent_mean_accuracy,
            max_actions_per_second,
            macro_actions_per_second,
            macro_interval_variance_ms2,
            hardware_mismatch_confidence,
            min_samples,
            pattern_window_ms,
            pattern_violation_count,
            ban_violation_count,
        );
    }
}

/// Deterministic points table used to replay an action log
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayRules {
    pub points: HashMap<String, i64>,
    /// Reject the whole log when it contains an action kind not in `points`
    pub strict: bool,
}

/// Per-game settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameDefinition {
    pub min_players: usize,
    pub max_players: usize,
    pub duration_secs: u64,
    pub entry_fee: u64,
    pub house_rake: f64,
    /// Share of the prize pool by final rank; must sum to at most 1.0
    pub payout_split: Vec<f64>,
    pub min_score: i64,
    pub max_score: i64,
    pub max_score_per_second: f64,
    pub replay: Option<ReplayRules>,
    /// Overrides `anti_cheat.max_actions_per_second` for this game
    pub max_actions_per_second: Option<f64>,
    pub anti_cheat: Option<AntiCheatOverrides>,
}

impl Default for GameDefinition {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 2,
            duration_secs: 180,
            entry_fee: 0,
            house_rake: 0.1,
            payout_split: vec![1.0],
            min_score: 0,
            max_score: 1_000_000,
            max_score_per_second: 200.0,
            replay: None,
            max_actions_per_second: None,
            anti_cheat: None,
        }
    }
}

impl GameDefinition {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    /// Keep everything in memory instead of RocksDB
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/arena_data".to_string(),
            in_memory: false,
        }
    }
}

impl ArenaConfig {
    /// Game definition by id
    pub fn game(&self, game_id: &str) -> Option<&GameDefinition> {
        self.games.get(game_id)
    }

    /// Global thresholds with the game's own table laid over them
    pub fn thresholds_for(&self, game_id: &str) -> AntiCheatThresholds {
        let mut thresholds = self.anti_cheat.clone();
        let Some(game) = self.games.get(game_id) else {
            return thresholds;
        };
        if let Some(overrides) = &game.anti_cheat {
            overrides.apply_to(&mut thresholds);
        }
        if let Some(ceiling) = game.max_actions_per_second {
            thresholds.max_actions_per_second = ceiling;
        }
        thresholds
    }

    /// Players per room for every configured game
    pub fn group_sizes(&self) -> HashMap<String, usize> {
        self.games
            .iter()
            .map(|(id, game)| (id.clone(), game.max_players))
            .collect()
    }

    /// Configuration with a single demo game, used when no file is supplied
    pub fn with_demo_game() -> Self {
        let mut config = Self::default();
        let mut points = HashMap::new();
        points.insert("hit".to_string(), 10);
        points.insert("combo".to_string(), 25);
        points.insert("miss".to_string(), 0);
        config.games.insert(
            "reflex-duel".to_string(),
            GameDefinition {
                duration_secs: 60,
                entry_fee: 100,
                replay: Some(ReplayRules { points, strict: true }),
                ..Default::default()
            },
        );
        config.games.insert(
            "tap-race".to_string(),
            GameDefinition {
                duration_secs: 60,
                max_score: 20_000,
                max_score_per_second: 200.0,
                ..Default::default()
            },
        );
        config
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mm = &self.matchmaking;
        if mm.ticket_ttl_ms == 0 || mm.tick_interval_ms == 0 {
            return Err(ConfigurationError::ValidationFailed(
                "ticket_ttl_ms and tick_interval_ms must be > 0".to_string(),
            ));
        }
        if mm.base_tolerance < 0.0 || mm.base_tolerance > mm.max_tolerance {
            return Err(ConfigurationError::ValidationFailed(
                "base_tolerance must be between 0 and max_tolerance".to_string(),
            ));
        }
        if self.rooms.ready_timeout_ms == 0 || self.rooms.collaborator_timeout_ms == 0 {
            return Err(ConfigurationError::ValidationFailed(
                "room timeouts must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation.score_tolerance) {
            return Err(ConfigurationError::InvalidValue {
                field: "validation.score_tolerance".to_string(),
                value: self.validation.score_tolerance.to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }

        for (game_id, game) in &self.games {
            if game.min_players == 0 || game.min_players > game.max_players {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("games.{}.min_players", game_id),
                    value: game.min_players.to_string(),
                    reason: "must be between 1 and max_players".to_string(),
                });
            }
            if game.duration_secs == 0 {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("games.{}.duration_secs", game_id),
                    value: "0".to_string(),
                    reason: "must be > 0".to_string(),
                });
            }
            if game.min_score > game.max_score {
                return Err(ConfigurationError::ValidationFailed(format!(
                    "games.{}: min_score exceeds max_score",
                    game_id
                )));
            }
            let split: f64 = game.payout_split.iter().sum();
            if split > 1.0 + f64::EPSILON || game.payout_split.iter().any(|s| *s < 0.0) {
                return Err(ConfigurationError::ValidationFailed(format!(
                    "games.{}: payout_split must be non-negative and sum to at most 1.0",
                    game_id
                )));
            }
            if !(0.0..=1.0).contains(&game.house_rake) {
                return Err(ConfigurationError::InvalidValue {
                    field: format!("games.{}.house_rake", game_id),
                    value: game.house_rake.to_string(),
                    reason: "must be in [0, 1]".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> ArenaResult<ArenaConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => ArenaConfig::with_demo_game(),
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> ArenaResult<ArenaConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        Self::parse(&content)
    }

    /// Parse a TOML document into a configuration
    pub fn parse(content: &str) -> ArenaResult<ArenaConfig> {
        toml::from_str(content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(config: &mut ArenaConfig) -> ArenaResult<()> {
        if let Ok(host) = env::var("ARENA_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("ARENA_PORT") {
            config.server.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "ARENA_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(dir) = env::var("ARENA_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(tick) = env::var("ARENA_TICK_INTERVAL_MS") {
            config.matchmaking.tick_interval_ms = tick.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "ARENA_TICK_INTERVAL_MS".to_string(),
                value: tick,
                reason: "Expected milliseconds".to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ArenaConfig::default().validate().is_ok());
        assert!(ArenaConfig::with_demo_game().validate().is_ok());
    }

    #[test]
    fn test_tolerance_band_widens_and_caps() {
        let mm = MatchmakingConfig::default();
        assert_eq!(mm.tolerance_at(0), 50.0);
        assert_eq!(mm.tolerance_at(4_999), 50.0);
        assert_eq!(mm.tolerance_at(5_000), 75.0);
        assert_eq!(mm.tolerance_at(12_000), 100.0);
        assert_eq!(mm.tolerance_at(10 * 60_000), 500.0);
    }

    #[test]
    fn test_invalid_player_bounds() {
        let mut config = ArenaConfig::with_demo_game();
        if let Some(game) = config.games.get_mut("reflex-duel") {
            game.min_players = 3;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_payout_split() {
        let mut config = ArenaConfig::with_demo_game();
        if let Some(game) = config.games.get_mut("tap-race") {
            game.payout_split = vec![0.7, 0.6];
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml_with_game_overrides() {
        let toml = r#"
            [matchmaking]
            ticket_ttl_ms = 30000

            [anti_cheat]
            min_reaction_ms = 120.0
            ban_violation_count = 8

            [games.sniper]
            min_players = 2
            max_players = 4
            duration_secs = 120
            max_actions_per_second = 20.0

            [games.sniper.anti_cheat]
            max_accuracy = 0.995

            [games.sniper.replay]
            strict = false
            [games.sniper.replay.points]
            headshot = 100
        "#;
        let config = ConfigLoader::parse(toml).unwrap();
        assert_eq!(config.matchmaking.ticket_ttl_ms, 30_000);
        assert_eq!(config.matchmaking.base_tolerance, 50.0);

        let sniper = config.game("sniper").unwrap();
        assert_eq!(sniper.max_players, 4);
        assert_eq!(sniper.replay.as_ref().unwrap().points["headshot"], 100);

        let thresholds = config.thresholds_for("sniper");
        assert_eq!(thresholds.max_accuracy, 0.995);
        assert_eq!(thresholds.max_actions_per_second, 20.0);
        // Fields the game leaves out come from the global section, not the built-in defaults
        assert_eq!(thresholds.min_reaction_ms, 120.0);
        assert_eq!(thresholds.ban_violation_count, 8);
        assert_eq!(thresholds.accuracy_consistency, 0.95);
        assert_eq!(config.thresholds_for("unknown").max_accuracy, 0.98);
        assert_eq!(config.thresholds_for("unknown").min_reaction_ms, 120.0);
    }

    #[test]
    fn test_misspelled_game_threshold_is_rejected() {
        let toml = r#"
            [games.sniper.anti_cheat]
            max_acuracy = 0.995
        "#;
        assert!(ConfigLoader::parse(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9191").unwrap();

        let config = ConfigLoader::new().with_path(file.path()).load().unwrap();
        assert_eq!(config.server.port, 9191);
    }
}
