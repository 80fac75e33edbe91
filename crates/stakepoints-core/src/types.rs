//! Shared types for the points pipeline.

use std::fmt;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::error::PointsError;

// ─── WalletAddress ───────────────────────────────────────────────────────────

/// A chain address normalized to `0x` + 40 lower-case hex digits.
///
/// Every ledger key goes through [`WalletAddress::parse`], so the same wallet
/// written in checksum case and in lower case maps to a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, PointsError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| PointsError::malformed(format!("address '{raw}' lacks 0x prefix")))?;
        if digits.len() != 40 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PointsError::malformed(format!(
                "address '{raw}' is not 20 hex-encoded bytes"
            )));
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = PointsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

// ─── DedupKey ────────────────────────────────────────────────────────────────

/// Identifies one on-chain log occurrence: transaction hash + log index.
///
/// Redelivered logs (reconnects, replays, overlapping backfills) carry the
/// same key, which is how the store recognises them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub tx_hash: String,
    pub log_index: u64,
}

impl DedupKey {
    pub fn new(tx_hash: impl AsRef<str>, log_index: u64) -> Self {
        Self {
            tx_hash: tx_hash.as_ref().trim().to_ascii_lowercase(),
            log_index,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

// ─── StakeEvent ──────────────────────────────────────────────────────────────

/// A decoded `Staked` event, consumed once by the accrual engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEvent {
    /// Transaction sender. Part of the event shape; not used for accrual.
    pub staker: WalletAddress,
    /// Raw amount in the smallest on-chain unit, as delivered (`0x…` hex or decimal).
    pub amount: String,
    /// The wallet credited with points.
    pub on_behalf_of: WalletAddress,
    pub dedup_key: DedupKey,
    pub block_number: u64,
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

/// One wallet's accumulated points, as persisted by a [`crate::PointsStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsLedgerEntry {
    pub wallet_address: WalletAddress,
    pub points: BigDecimal,
    /// Unix timestamp (seconds) of the last applied accrual.
    pub updated_at: i64,
}

/// Result of a single accrual call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccrualOutcome {
    /// The delta was added to the wallet's balance.
    Applied,
    /// The dedup key had already been applied; nothing changed.
    Duplicate,
    /// The event normalized to a zero delta; the store was not touched and
    /// the dedup key was not recorded.
    Skipped,
}

impl AccrualOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
