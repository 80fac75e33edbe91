//! stakepoints-core — foundation for the staking points ledger.
//!
//! # Architecture
//!
//! ```text
//! LogSource (evm) → StakedLogDecoder → StakeEvent
//!                                         │
//!                                         ▼
//!                              LedgerAccrualEngine
//!                                ├── AmountNormalizer (raw wei → points delta)
//!                                ├── RetryPolicy      (transient store errors)
//!                                └── PointsStore      (atomic dedup + increment)
//!
//! CheckpointStore ← StakePipeline (highest fully processed block)
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod normalizer;
pub mod retry;
pub mod store;
pub mod types;

pub use checkpoint::CheckpointStore;
pub use engine::{EngineMetricsSnapshot, LedgerAccrualEngine};
pub use error::PointsError;
pub use normalizer::AmountNormalizer;
pub use retry::{Backoff, RetryPolicy};
pub use store::PointsStore;
pub use types::{AccrualOutcome, DedupKey, PointsLedgerEntry, StakeEvent, WalletAddress};
