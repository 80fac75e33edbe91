//! The points store contract.
//!
//! Implementations live in `stakepoints-storage` (memory, SQLite, Postgres).

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::error::PointsError;
use crate::types::{AccrualOutcome, DedupKey, PointsLedgerEntry, WalletAddress};

/// Durable mapping from wallet address to accumulated points.
///
/// `accrue` is the only write path. Implementations must make the dedup
/// check, the dedup record and the increment-or-create a single atomic unit:
/// concurrent calls for the same wallet may never lose an update, and a key
/// that was applied once is never applied again.
#[async_trait]
pub trait PointsStore: Send + Sync {
    /// Add `delta` to `wallet`'s balance (creating the entry if absent) unless
    /// `key` was already applied.
    async fn accrue(
        &self,
        wallet: &WalletAddress,
        delta: &BigDecimal,
        key: &DedupKey,
    ) -> Result<AccrualOutcome, PointsError>;

    /// Load a wallet's ledger entry.
    async fn entry(&self, wallet: &WalletAddress) -> Result<Option<PointsLedgerEntry>, PointsError>;

    /// Returns `true` if `key` has been applied.
    async fn is_applied(&self, key: &DedupKey) -> Result<bool, PointsError>;
}
