//! Anti-cheat engine
//!
//! Runs the statistical detectors over a session's behavioral telemetry and
//! turns them into a recommended action. The engine never enforces anything
//! itself: the verdict is returned to the caller, which forwards it to the
//! account-enforcement collaborator.
//!
//! Analyses of the same player are serialized; different players run in
//! parallel.

pub mod detectors;
pub mod verdict;

pub use verdict::Verdict;

use crate::collaborators::{call_with_timeout, FingerprintCheck, HardwareVerifier};
use crate::config::{AntiCheatThresholds, ArenaConfig};
use crate::errors::ArenaResult;
use crate::store::RiskProfileStore;
use crate::types::{now_millis, BehaviorTelemetry, GameId, PlayerId, PlayerRiskProfile};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct AntiCheatEngine {
    defaults: AntiCheatThresholds,
    per_game: HashMap<GameId, AntiCheatThresholds>,
    profiles: Arc<dyn RiskProfileStore>,
    hardware: Arc<dyn HardwareVerifier>,
    hardware_timeout: Duration,
    player_locks: DashMap<PlayerId, Arc<Mutex<()>>>,
}

impl AntiCheatEngine {
    pub fn new(
        config: &ArenaConfig,
        profiles: Arc<dyn RiskProfileStore>,
        hardware: Arc<dyn HardwareVerifier>,
    ) -> Self {
        let per_game = config
            .games
            .keys()
            .map(|id| (id.clone(), config.thresholds_for(id)))
            .collect();
        Self {
            defaults: config.anti_cheat.clone(),
            per_game,
            profiles,
            hardware,
            hardware_timeout: config.rooms.collaborator_timeout(),
            player_locks: DashMap::new(),
        }
    }

    pub fn thresholds(&self, game_id: &str) -> &AntiCheatThresholds {
        self.per_game.get(game_id).unwrap_or(&self.defaults)
    }

    /// Pure verdict for `telemetry` given the stored history at `now`
    pub fn evaluate(
        &self,
        player_id: &str,
        telemetry: &BehaviorTelemetry,
        hardware_check: Option<&FingerprintCheck>,
        profile: &PlayerRiskProfile,
        now: u64,
    ) -> Verdict {
        let thresholds = self.thresholds(&telemetry.game_id);
        let detections = [
            detectors::reaction_time(telemetry, thresholds),
            detectors::accuracy(telemetry, thresholds),
            detectors::action_speed(telemetry, thresholds),
            detectors::hardware(hardware_check, thresholds),
        ]
        .into_iter()
        .flatten()
        .collect();

        verdict::decide(player_id, detections, profile, thresholds, now)
    }

    /// Verdict without appending to the risk profile. Used for live checks
    /// mid-match. A first-seen device is still bound by the hardware verifier.
    pub async fn inspect(&self, player_id: &str, telemetry: &BehaviorTelemetry) -> ArenaResult<Verdict> {
        self.serialized(player_id, || async move {
            let now = now_millis();
            let profile = self.profiles.load_profile(player_id).await?;
            let check = self.verify_hardware(player_id, telemetry).await;
            Ok(self.evaluate(player_id, telemetry, check.as_ref(), &profile, now))
        })
        .await
    }

    /// Evaluate and append any violations to the player's risk profile
    pub async fn analyze(&self, player_id: &str, telemetry: &BehaviorTelemetry) -> ArenaResult<Verdict> {
        self.analyze_at(player_id, telemetry, now_millis()).await
    }

    pub async fn analyze_at(&self, player_id: &str, telemetry: &BehaviorTelemetry, now: u64) -> ArenaResult<Verdict> {
        self.serialized(player_id, || async move {
            let profile = self.profiles.load_profile(player_id).await?;
            let check = self.verify_hardware(player_id, telemetry).await;
            let verdict = self.evaluate(player_id, telemetry, check.as_ref(), &profile, now);

            if !verdict.violations.is_empty() {
                let updated = self
                    .profiles
                    .append_violations(player_id, &verdict.violations, now)
                    .await?;
                tracing::info!(
                    player_id = %player_id,
                    action = %verdict.action,
                    confidence = verdict.confidence,
                    violations = verdict.violations.len(),
                    risk_score = updated.risk_score,
                    pattern = verdict.pattern_detected,
                    "Anti-cheat verdict"
                );
            }
            Ok(verdict)
        })
        .await
    }

    /// Append an already-computed verdict to the player's history
    pub async fn record(&self, verdict: &Verdict, now: u64) -> ArenaResult<()> {
        if verdict.violations.is_empty() {
            return Ok(());
        }
        self.serialized(&verdict.player_id, || async move {
            self.profiles
                .append_violations(&verdict.player_id, &verdict.violations, now)
                .await?;
            Ok(())
        })
        .await
    }

    /// Hardware check with fail-open semantics: unreachable means "no signal"
    async fn verify_hardware(&self, player_id: &str, telemetry: &BehaviorTelemetry) -> Option<FingerprintCheck> {
        let hardware = telemetry.hardware.as_ref()?;
        match call_with_timeout(
            "hardware",
            self.hardware_timeout,
            self.hardware.verify_fingerprint(player_id, hardware),
        )
        .await
        {
            Ok(check) => Some(check),
            Err(e) => {
                tracing::warn!(player_id = %player_id, error = %e, "Hardware verification unavailable, failing open");
                None
            }
        }
    }

    /// Run `work` holding the player's lock, then drop the lock entry if no
    /// other task is waiting on it
    async fn serialized<T, F, Fut>(&self, player_id: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self
            .player_locks
            .entry(player_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            work().await
        };
        drop(lock);
        self.player_locks
            .remove_if(player_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    pub fn tracked_players(&self) -> usize {
        self.player_locks.len()
    }
}
