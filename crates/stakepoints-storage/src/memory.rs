//! In-memory points ledger.
//!
//! Useful for tests and dry runs. All balances are lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use stakepoints_core::checkpoint::CheckpointStore;
use stakepoints_core::error::PointsError;
use stakepoints_core::store::PointsStore;
use stakepoints_core::types::{AccrualOutcome, DedupKey, PointsLedgerEntry, WalletAddress};

use crate::now_secs;

#[derive(Default)]
struct LedgerState {
    entries: HashMap<WalletAddress, PointsLedgerEntry>,
    applied: HashSet<DedupKey>,
    checkpoints: HashMap<String, u64>,
}

/// In-memory points store.
///
/// Ledger and dedup set sit behind one lock, so the check, the record and
/// the increment happen together.
#[derive(Default)]
pub struct InMemoryPointsStore {
    state: Mutex<LedgerState>,
}

impl InMemoryPointsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of wallets with a ledger entry.
    pub fn wallet_count(&self) -> Result<usize, PointsError> {
        Ok(self.lock()?.entries.len())
    }

    /// Number of events recorded as applied.
    pub fn applied_count(&self) -> Result<usize, PointsError> {
        Ok(self.lock()?.applied.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, PointsError> {
        self.state
            .lock()
            .map_err(|_| PointsError::Storage("ledger lock poisoned".into()))
    }
}

#[async_trait]
impl PointsStore for InMemoryPointsStore {
    async fn accrue(
        &self,
        wallet: &WalletAddress,
        delta: &BigDecimal,
        key: &DedupKey,
    ) -> Result<AccrualOutcome, PointsError> {
        let mut state = self.lock()?;
        if !state.applied.insert(key.clone()) {
            return Ok(AccrualOutcome::Duplicate);
        }
        let updated_at = now_secs();
        state
            .entries
            .entry(wallet.clone())
            .and_modify(|e| {
                e.points = &e.points + delta;
                e.updated_at = updated_at;
            })
            .or_insert_with(|| PointsLedgerEntry {
                wallet_address: wallet.clone(),
                points: delta.clone(),
                updated_at,
            });
        Ok(AccrualOutcome::Applied)
    }

    async fn entry(&self, wallet: &WalletAddress) -> Result<Option<PointsLedgerEntry>, PointsError> {
        Ok(self.lock()?.entries.get(wallet).cloned())
    }

    async fn is_applied(&self, key: &DedupKey) -> Result<bool, PointsError> {
        Ok(self.lock()?.applied.contains(key))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryPointsStore {
    async fn load_checkpoint(&self, id: &str) -> Result<Option<u64>, PointsError> {
        Ok(self.lock()?.checkpoints.get(id).copied())
    }

    async fn save_checkpoint(&self, id: &str, block: u64) -> Result<(), PointsError> {
        let mut state = self.lock()?;
        let stored = state.checkpoints.entry(id.to_string()).or_insert(block);
        *stored = (*stored).max(block);
        Ok(())
    }
}
