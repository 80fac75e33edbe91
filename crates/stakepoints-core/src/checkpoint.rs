//! Resume point for a log source.
//!
//! A checkpoint is the highest block whose logs have all been accrued (or
//! rejected as malformed). Restarting from `checkpoint` itself rather than
//! `checkpoint + 1` replays one block; the dedup key makes that harmless.

use async_trait::async_trait;

use crate::error::PointsError;

/// Persists checkpoints by id (one id per contract being followed).
///
/// Saves are monotone: saving a block lower than the stored one keeps the
/// stored value.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, id: &str) -> Result<Option<u64>, PointsError>;

    async fn save_checkpoint(&self, id: &str, block: u64) -> Result<(), PointsError>;
}
