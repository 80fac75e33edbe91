//! SQLite points ledger.
//!
//! Points are stored as decimal text and summed in Rust, so balances stay
//! exact regardless of size. Each accrual runs in one pooled transaction
//! whose first statement is the dedup insert, so the write lock is taken
//! before anything is read and concurrent accruals queue on SQLite's busy
//! handler instead of failing on lock upgrade. A cancelled accrual drops
//! its transaction, which rolls back before the connection is reused.
//!
//! # Usage
//! ```rust,no_run
//! use stakepoints_storage::sqlite::SqlitePointsStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqlitePointsStore::open("./points.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqlitePointsStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use stakepoints_core::checkpoint::CheckpointStore;
use stakepoints_core::error::PointsError;
use stakepoints_core::store::PointsStore;
use stakepoints_core::types::{AccrualOutcome, DedupKey, PointsLedgerEntry, WalletAddress};

use crate::error::store_error;
use crate::now_secs;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite primary result codes for `SQLITE_BUSY` and `SQLITE_LOCKED`.
/// Extended codes carry the primary code in the low byte.
fn is_busy(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn db_err(e: sqlx::Error) -> PointsError {
    store_error(e, is_busy)
}

/// SQLite-backed points store.
pub struct SqlitePointsStore {
    pool: SqlitePool,
}

impl SqlitePointsStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./points.db"`) or a full
    /// SQLite URL (`"sqlite:./points.db"`).
    pub async fn open(path: &str) -> Result<Self, PointsError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| PointsError::Config(format!("sqlite url '{url}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path, "SQLite points store ready");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection to `:memory:` would see its own database, so
    /// the pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, PointsError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PointsError::Config(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PointsError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS points_ledger (
                wallet_address TEXT    PRIMARY KEY,
                points         TEXT    NOT NULL,
                updated_at     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS applied_events (
                dedup_key      TEXT    PRIMARY KEY,
                wallet_address TEXT    NOT NULL,
                delta          TEXT    NOT NULL,
                applied_at     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_applied_wallet ON applied_events (wallet_address);",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT    PRIMARY KEY,
                block_number  INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Body of one accrual; runs inside an open transaction on `conn`.
    async fn accrue_in_tx(
        conn: &mut SqliteConnection,
        wallet: &WalletAddress,
        delta: &BigDecimal,
        key: &DedupKey,
    ) -> Result<AccrualOutcome, PointsError> {
        let now = now_secs();
        let inserted = sqlx::query(
            "INSERT INTO applied_events (dedup_key, wallet_address, delta, applied_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (dedup_key) DO NOTHING",
        )
        .bind(key.to_string())
        .bind(wallet.as_str())
        .bind(delta.to_string())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 0 {
            return Ok(AccrualOutcome::Duplicate);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT points FROM points_ledger WHERE wallet_address = ?1")
                .bind(wallet.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(db_err)?;

        let total = match current {
            Some(text) => parse_points(&text)? + delta,
            None => delta.clone(),
        };

        sqlx::query(
            "INSERT INTO points_ledger (wallet_address, points, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (wallet_address) DO UPDATE SET
                points     = excluded.points,
                updated_at = excluded.updated_at",
        )
        .bind(wallet.as_str())
        .bind(total.to_string())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(AccrualOutcome::Applied)
    }
}

fn parse_points(text: &str) -> Result<BigDecimal, PointsError> {
    BigDecimal::from_str(text)
        .map_err(|e| PointsError::Storage(format!("corrupt points value '{text}': {e}")))
}

#[async_trait]
impl PointsStore for SqlitePointsStore {
    async fn accrue(
        &self,
        wallet: &WalletAddress,
        delta: &BigDecimal,
        key: &DedupKey,
    ) -> Result<AccrualOutcome, PointsError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let outcome = Self::accrue_in_tx(&mut *tx, wallet, delta, key).await?;
        if outcome.is_applied() {
            tx.commit().await.map_err(db_err)?;
        } else {
            tx.rollback().await.map_err(db_err)?;
        }
        debug!(wallet = %wallet, key = %key, ?outcome, "sqlite accrual");
        Ok(outcome)
    }

    async fn entry(&self, wallet: &WalletAddress) -> Result<Option<PointsLedgerEntry>, PointsError> {
        let row = sqlx::query(
            "SELECT points, updated_at FROM points_ledger WHERE wallet_address = ?1",
        )
        .bind(wallet.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| {
            let points: String = r.get("points");
            Ok(PointsLedgerEntry {
                wallet_address: wallet.clone(),
                points: parse_points(&points)?,
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn is_applied(&self, key: &DedupKey) -> Result<bool, PointsError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM applied_events WHERE dedup_key = ?1")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl CheckpointStore for SqlitePointsStore {
    async fn load_checkpoint(&self, id: &str) -> Result<Option<u64>, PointsError> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT block_number FROM checkpoints WHERE checkpoint_id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        block
            .map(|b| {
                u64::try_from(b).map_err(|_| PointsError::Storage(format!("negative checkpoint {b}")))
            })
            .transpose()
    }

    async fn save_checkpoint(&self, id: &str, block: u64) -> Result<(), PointsError> {
        let block = i64::try_from(block)
            .map_err(|_| PointsError::Storage(format!("checkpoint {block} out of range")))?;
        sqlx::query(
            "INSERT INTO checkpoints (checkpoint_id, block_number, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (checkpoint_id) DO UPDATE SET
                block_number = max(block_number, excluded.block_number),
                updated_at   = excluded.updated_at",
        )
        .bind(id)
        .bind(block)
        .bind(now_secs())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
