//! The `Staked` event schema, the only part of the staking contract's
//! interface the pipeline consumes.
//!
//! ```text
//! event Staked(address indexed by, uint256 indexed amount, address indexed onBehalfOf);
//! ```
//!
//! All three parameters are indexed, so the payload lives in `topics[1..=3]`
//! and `data` is empty.

use alloy_primitives::keccak256;
use stakepoints_core::error::PointsError;
use stakepoints_core::types::{DedupKey, StakeEvent, WalletAddress};

use crate::log::RawLog;
use crate::source::LogFilter;

/// Event name subscribed to.
pub const STAKED_EVENT: &str = "Staked";

/// Canonical signature used to derive topic0.
pub const STAKED_SIGNATURE: &str = "Staked(address,uint256,address)";

/// keccak256 of a canonical event signature, `0x`-prefixed lower-case hex.
pub fn event_topic0(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

pub fn staked_topic0() -> String {
    event_topic0(STAKED_SIGNATURE)
}

/// Turns raw logs from the staking contract into [`StakeEvent`]s.
#[derive(Debug, Clone)]
pub struct StakedLogDecoder {
    contract: WalletAddress,
    topic0: String,
}

impl StakedLogDecoder {
    pub fn new(contract: WalletAddress) -> Self {
        Self {
            contract,
            topic0: staked_topic0(),
        }
    }

    pub fn contract(&self) -> &WalletAddress {
        &self.contract
    }

    /// Node-side filter selecting only `Staked` logs of the contract.
    pub fn filter(&self) -> LogFilter {
        LogFilter {
            address: self.contract.to_string(),
            topic0: self.topic0.clone(),
        }
    }

    /// Decode one log.
    ///
    /// `Ok(None)` for logs that are not `Staked` events of this contract and
    /// for logs removed by a reorg. `Err(MalformedEvent)` for a `Staked` log
    /// that cannot be decoded or lacks the position needed for its dedup key.
    pub fn decode(&self, log: &RawLog) -> Result<Option<StakeEvent>, PointsError> {
        if log.is_removed() {
            return Ok(None);
        }
        if !log.address.eq_ignore_ascii_case(self.contract.as_str()) {
            return Ok(None);
        }
        match log.topics.first() {
            Some(t0) if t0.eq_ignore_ascii_case(&self.topic0) => {}
            _ => return Ok(None),
        }
        if log.topics.len() != 4 {
            return Err(PointsError::malformed(format!(
                "Staked log has {} topics, expected 4",
                log.topics.len()
            )));
        }

        let tx_hash = log
            .tx_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PointsError::malformed("Staked log without transaction hash"))?;
        let log_index = log
            .log_index_u64()
            .ok_or_else(|| PointsError::malformed(format!("Staked log in {tx_hash} without log index")))?;

        Ok(Some(StakeEvent {
            staker: topic_address(&log.topics[1])?,
            amount: log.topics[2].clone(),
            on_behalf_of: topic_address(&log.topics[3])?,
            dedup_key: DedupKey::new(tx_hash, log_index),
            block_number: log.block_number_u64().unwrap_or_default(),
        }))
    }
}

/// Extract an address from a 32-byte indexed topic (12 zero bytes + 20 address bytes).
fn topic_address(topic: &str) -> Result<WalletAddress, PointsError> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PointsError::malformed(format!("topic '{topic}' is not a 32-byte word")));
    }
    let (padding, address) = digits.split_at(24);
    if padding.bytes().any(|b| b != b'0') {
        return Err(PointsError::malformed(format!("topic '{topic}' is not an address")));
    }
    WalletAddress::parse(&format!("0x{address}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    pub(crate) fn address_topic(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x").to_ascii_lowercase())
    }

    pub(crate) fn amount_topic(amount: u128) -> String {
        format!("0x{amount:064x}")
    }

    pub(crate) fn staked_log(on_behalf_of: &str, amount: u128, tx: &str, index: u64) -> RawLog {
        RawLog {
            address: CONTRACT.to_string(),
            topics: vec![
                staked_topic0(),
                address_topic("0x70997970C51812dc3A010C7d01b50e0d17dc79C8"),
                amount_topic(amount),
                address_topic(on_behalf_of),
            ],
            data: "0x".into(),
            block_number: Some("0x10".into()),
            tx_hash: Some(tx.into()),
            log_index: Some(format!("0x{index:x}")),
            removed: Some(false),
        }
    }

    fn decoder() -> StakedLogDecoder {
        StakedLogDecoder::new(WalletAddress::parse(CONTRACT).unwrap())
    }

    #[test]
    fn topic0_matches_known_vector() {
        assert_eq!(
            event_topic0("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(staked_topic0().len(), 66);
    }

    #[test]
    fn decodes_staked_log() {
        let wallet = "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC";
        let log = staked_log(wallet, 2_000_000_000_000_000_000, "0xAA", 7);
        let ev = decoder().decode(&log).unwrap().unwrap();

        assert_eq!(ev.on_behalf_of.as_str(), wallet.to_ascii_lowercase());
        assert_eq!(ev.staker.as_str(), "0x70997970c51812dc3a010c7d01b50e0d17dc79c8");
        assert_eq!(ev.amount, amount_topic(2_000_000_000_000_000_000));
        assert_eq!(ev.dedup_key, DedupKey::new("0xaa", 7));
        assert_eq!(ev.block_number, 16);
    }

    #[test]
    fn ignores_other_contracts_events_and_removed_logs() {
        let d = decoder();
        let base = staked_log("0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC", 1, "0x01", 0);

        let mut other_contract = base.clone();
        other_contract.address = "0x0000000000000000000000000000000000000001".into();
        assert!(d.decode(&other_contract).unwrap().is_none());

        let mut unstaked = base.clone();
        unstaked.topics[0] = event_topic0("Unstaked(address,uint256,address)");
        assert!(d.decode(&unstaked).unwrap().is_none());

        let mut removed = base;
        removed.removed = Some(true);
        assert!(d.decode(&removed).unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_staked_logs() {
        let d = decoder();
        let base = staked_log("0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC", 1, "0x01", 0);

        let mut short = base.clone();
        short.topics.truncate(3);
        assert!(d.decode(&short).unwrap_err().is_malformed());

        let mut bad_address = base.clone();
        bad_address.topics[3] = format!("0x{}", "f".repeat(64));
        assert!(d.decode(&bad_address).unwrap_err().is_malformed());

        let mut no_tx = base.clone();
        no_tx.tx_hash = None;
        assert!(d.decode(&no_tx).unwrap_err().is_malformed());

        let mut no_index = base;
        no_index.log_index = None;
        assert!(d.decode(&no_index).unwrap_err().is_malformed());
    }
}
