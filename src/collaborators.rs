//! External collaborator interfaces
//!
//! Wallet debits/credits, hardware fingerprint verification and account
//! enforcement live outside this subsystem. Rooms and the anti-cheat engine
//! only talk to them through these traits, always under a timeout.

use crate::errors::{ArenaError, ArenaResult};
use crate::types::{EnforcementAction, HardwareFingerprint, PlayerId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DebitOutcome {
    Ok,
    InsufficientFunds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CreditOutcome {
    Ok,
    Failed(String),
}

/// Wallet / ledger. `Err` means the wallet could not be reached.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn debit(&self, player_id: &str, amount: u64) -> ArenaResult<DebitOutcome>;
    async fn credit(&self, player_id: &str, amount: u64) -> ArenaResult<CreditOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintCheck {
    pub is_valid: bool,
    pub reason: Option<String>,
}

/// Hardware / identity verification
#[async_trait]
pub trait HardwareVerifier: Send + Sync {
    async fn verify_fingerprint(
        &self,
        player_id: &str,
        hardware: &HardwareFingerprint,
    ) -> ArenaResult<FingerprintCheck>;
}

/// Account enforcement. Consumes verdicts; this subsystem never bans on its own.
#[async_trait]
pub trait AccountEnforcement: Send + Sync {
    async fn apply_action(
        &self,
        player_id: &str,
        action: EnforcementAction,
        reason: &str,
    ) -> ArenaResult<()>;
}

/// Run a collaborator call under `timeout`, mapping expiry to `CollaboratorUnavailable`
pub async fn call_with_timeout<T, F>(collaborator: &'static str, timeout: Duration, call: F) -> ArenaResult<T>
where
    F: Future<Output = ArenaResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ArenaError::CollaboratorUnavailable {
            collaborator,
            reason: format!("no response within {}ms", timeout.as_millis()),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub player_id: PlayerId,
    pub kind: LedgerEntryKind,
    pub amount: u64,
}

/// In-process ledger with per-player balances and a journal of movements
pub struct LedgerWallet {
    balances: DashMap<PlayerId, u64>,
    journal: Mutex<Vec<LedgerEntry>>,
    opening_balance: u64,
}

impl LedgerWallet {
    /// Players not seen before start with `opening_balance`
    pub fn new(opening_balance: u64) -> Self {
        Self {
            balances: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            opening_balance,
        }
    }

    pub fn set_balance(&self, player_id: &str, balance: u64) {
        self.balances.insert(player_id.to_string(), balance);
    }

    pub fn balance(&self, player_id: &str) -> u64 {
        self.balances
            .get(player_id)
            .map(|b| *b.value())
            .unwrap_or(self.opening_balance)
    }

    pub fn journal(&self) -> Vec<LedgerEntry> {
        self.journal.lock().clone()
    }

    /// Journal entries of one kind for a player
    pub fn entries_for(&self, player_id: &str, kind: LedgerEntryKind) -> Vec<u64> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.player_id == player_id && e.kind == kind)
            .map(|e| e.amount)
            .collect()
    }
}

#[async_trait]
impl Wallet for LedgerWallet {
    async fn debit(&self, player_id: &str, amount: u64) -> ArenaResult<DebitOutcome> {
        let mut balance = self
            .balances
            .entry(player_id.to_string())
            .or_insert(self.opening_balance);
        if *balance < amount {
            return Ok(DebitOutcome::InsufficientFunds);
        }
        *balance -= amount;
        drop(balance);

        self.journal.lock().push(LedgerEntry {
            player_id: player_id.to_string(),
            kind: LedgerEntryKind::Debit,
            amount,
        });
        Ok(DebitOutcome::Ok)
    }

    async fn credit(&self, player_id: &str, amount: u64) -> ArenaResult<CreditOutcome> {
        let mut balance = self
            .balances
            .entry(player_id.to_string())
            .or_insert(self.opening_balance);
        *balance = balance.saturating_add(amount);
        drop(balance);

        self.journal.lock().push(LedgerEntry {
            player_id: player_id.to_string(),
            kind: LedgerEntryKind::Credit,
            amount,
        });
        Ok(CreditOutcome::Ok)
    }
}

/// Binds the first fingerprint seen for a player; later mismatches are invalid
#[derive(Default)]
pub struct FingerprintRegistry {
    bound: DashMap<PlayerId, String>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(hardware: &HardwareFingerprint) -> String {
        let mut hasher = Sha256::new();
        hasher.update(hardware.device_id.as_bytes());
        for (key, value) in &hardware.attributes {
            hasher.update(b"|");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl HardwareVerifier for FingerprintRegistry {
    async fn verify_fingerprint(
        &self,
        player_id: &str,
        hardware: &HardwareFingerprint,
    ) -> ArenaResult<FingerprintCheck> {
        let digest = Self::digest(hardware);
        let bound = self
            .bound
            .entry(player_id.to_string())
            .or_insert_with(|| digest.clone());

        if *bound == digest {
            Ok(FingerprintCheck {
                is_valid: true,
                reason: None,
            })
        } else {
            Ok(FingerprintCheck {
                is_valid: false,
                reason: Some(format!(
                    "device {} does not match the fingerprint bound to this account",
                    hardware.device_id
                )),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementRecord {
    pub player_id: PlayerId,
    pub action: EnforcementAction,
    pub reason: String,
}

/// Records recommended actions and logs them for the moderation pipeline
#[derive(Default)]
pub struct EnforcementLog {
    records: Mutex<Vec<EnforcementRecord>>,
}

impl EnforcementLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EnforcementRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AccountEnforcement for EnforcementLog {
    async fn apply_action(
        &self,
        player_id: &str,
        action: EnforcementAction,
        reason: &str,
    ) -> ArenaResult<()> {
        tracing::warn!(player_id = %player_id, action = %action, reason = %reason, "Enforcement action recommended");
        self.records.lock().push(EnforcementRecord {
            player_id: player_id.to_string(),
            action,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_ledger_debit_and_refund() {
        let wallet = LedgerWallet::new(500);
        assert_eq!(wallet.debit("p1", 200).await.unwrap(), DebitOutcome::Ok);
        assert_eq!(wallet.balance("p1"), 300);
        assert_eq!(wallet.debit("p1", 400).await.unwrap(), DebitOutcome::InsufficientFunds);
        assert_eq!(wallet.credit("p1", 200).await.unwrap(), CreditOutcome::Ok);
        assert_eq!(wallet.balance("p1"), 500);
        assert_eq!(wallet.entries_for("p1", LedgerEntryKind::Debit), vec![200]);
        assert_eq!(wallet.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_fingerprint_binds_on_first_use() {
        let registry = FingerprintRegistry::new();
        let device = HardwareFingerprint {
            device_id: "dev-1".to_string(),
            attributes: BTreeMap::from([("gpu".to_string(), "x".to_string())]),
        };
        let other = HardwareFingerprint {
            device_id: "dev-2".to_string(),
            attributes: BTreeMap::new(),
        };

        assert!(registry.verify_fingerprint("p1", &device).await.unwrap().is_valid);
        assert!(registry.verify_fingerprint("p1", &device).await.unwrap().is_valid);
        let check = registry.verify_fingerprint("p1", &other).await.unwrap();
        assert!(!check.is_valid);
        assert!(check.reason.unwrap().contains("dev-2"));
    }

    #[tokio::test]
    async fn test_call_with_timeout_maps_to_unavailable() {
        let result: ArenaResult<()> = call_with_timeout("wallet", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        match result {
            Err(ArenaError::CollaboratorUnavailable { collaborator, .. }) => assert_eq!(collaborator, "wallet"),
            other => panic!("Expected CollaboratorUnavailable, got {:?}", other),
        }
    }
}
