//! PostgreSQL points ledger.
//!
//! Suitable for several pipeline instances sharing one ledger. Points are a
//! `NUMERIC` column and the increment is done by the database:
//!
//! ```sql
//! INSERT ... ON CONFLICT (wallet_address)
//! DO UPDATE SET points = stakepoints_ledger.points + EXCLUDED.points
//! ```
//!
//! The dedup row and the increment share one transaction. A concurrent
//! insert of the same dedup key waits on the first transaction and then
//! becomes a no-op.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! stakepoints-storage = { version = "0.1", features = ["postgres"] }
//! ```
//!
//! # Schema
//! Created automatically on first connect:
//! - `stakepoints_ledger` — wallet → accumulated points
//! - `stakepoints_applied_events` — one row per applied `tx_hash:log_index`
//! - `stakepoints_checkpoints` — highest fully processed block per contract

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use stakepoints_core::checkpoint::CheckpointStore;
use stakepoints_core::error::PointsError;
use stakepoints_core::store::PointsStore;
use stakepoints_core::types::{AccrualOutcome, DedupKey, PointsLedgerEntry, WalletAddress};

use crate::error::store_error;
use crate::now_secs;

/// SQLSTATEs worth retrying: serialization failure, deadlock, and the
/// server going away mid-session.
fn is_retryable(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57P01" | "57P03" | "08006" | "08003")
}

fn db_err(e: sqlx::Error) -> PointsError {
    store_error(e, is_retryable)
}

// ─── Connection options ────────────────────────────────────────────────────────

/// Connection options for the Postgres points store.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Statement cache size per connection (default: 100)
    pub statement_cache_capacity: usize,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            statement_cache_capacity: 100,
        }
    }
}

// ─── PostgresPointsStore ─────────────────────────────────────────────────────

/// PostgreSQL-backed points store. Cheap to clone; wraps a pool.
#[derive(Clone)]
pub struct PostgresPointsStore {
    pool: PgPool,
}

impl PostgresPointsStore {
    /// Connect with default pool options and initialize the schema.
    ///
    /// The URL format follows libpq convention:
    /// `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, PointsError> {
        Self::connect_with_options(database_url, PostgresOptions::default()).await
    }

    /// Connect with custom pool options.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, PointsError> {
        let connect = PgConnectOptions::from_str(database_url)
            .map_err(|e| PointsError::Config(format!("postgres url: {e}")))?
            .statement_cache_capacity(opts.statement_cache_capacity);

        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(Duration::from_secs(opts.connect_timeout_secs))
            .connect_with(connect)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(max_connections = opts.max_connections, "Postgres points store connected");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PointsError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stakepoints_ledger (
                wallet_address TEXT    PRIMARY KEY,
                points         NUMERIC NOT NULL,
                updated_at     BIGINT  NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stakepoints_applied_events (
                dedup_key      TEXT    PRIMARY KEY,
                wallet_address TEXT    NOT NULL,
                delta          NUMERIC NOT NULL,
                applied_at     BIGINT  NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_stakepoints_applied_wallet
             ON stakepoints_applied_events(wallet_address)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stakepoints_checkpoints (
                checkpoint_id TEXT   PRIMARY KEY,
                block_number  BIGINT NOT NULL,
                updated_at    BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

#[async_trait]
impl PointsStore for PostgresPointsStore {
    async fn accrue(
        &self,
        wallet: &WalletAddress,
        delta: &BigDecimal,
        key: &DedupKey,
    ) -> Result<AccrualOutcome, PointsError> {
        let now = now_secs();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            "INSERT INTO stakepoints_applied_events (dedup_key, wallet_address, delta, applied_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (dedup_key) DO NOTHING",
        )
        .bind(key.to_string())
        .bind(wallet.as_str())
        .bind(delta)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(AccrualOutcome::Duplicate);
        }

        sqlx::query(
            "INSERT INTO stakepoints_ledger (wallet_address, points, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (wallet_address) DO UPDATE SET
                points     = stakepoints_ledger.points + EXCLUDED.points,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(wallet.as_str())
        .bind(delta)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(wallet = %wallet, key = %key, "postgres accrual committed");
        Ok(AccrualOutcome::Applied)
    }

    async fn entry(&self, wallet: &WalletAddress) -> Result<Option<PointsLedgerEntry>, PointsError> {
        let row = sqlx::query(
            "SELECT points, updated_at FROM stakepoints_ledger WHERE wallet_address = $1",
        )
        .bind(wallet.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| PointsLedgerEntry {
            wallet_address: wallet.clone(),
            points: r.get("points"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn is_applied(&self, key: &DedupKey) -> Result<bool, PointsError> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM stakepoints_applied_events WHERE dedup_key = $1")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl CheckpointStore for PostgresPointsStore {
    async fn load_checkpoint(&self, id: &str) -> Result<Option<u64>, PointsError> {
        let block: Option<i64> = sqlx::query_scalar(
            "SELECT block_number FROM stakepoints_checkpoints WHERE checkpoint_id = $1",
        )
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
            "INSERT INTO stakepoints_checkpoints (checkpoint_id, block_number, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (checkpoint_id) DO UPDATE SET
                block_number = GREATEST(stakepoints_checkpoints.block_number, EXCLUDED.block_number),
                updated_at   = EXCLUDED.updated_at",
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

#[cfg(test)]
mod tests {
    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL environment variable to enable.
    // Example: DATABASE_URL=postgresql://localhost/stakepoints_test cargo test --features postgres

    use super::*;
    use std::sync::Arc;

    fn unique_wallet() -> WalletAddress {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        WalletAddress::parse(&format!("0x{:040x}", nanos)).unwrap()
    }

    #[test]
    fn retryable_sqlstates() {
        assert!(is_retryable("40001"));
        assert!(is_retryable("40P01"));
        assert!(!is_retryable("23505"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_accrue_and_dedup() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresPointsStore::connect(&url).await.unwrap();
        let wallet = unique_wallet();
        let key = DedupKey::new(format!("0x{}", wallet.as_str().trim_start_matches("0x")), 0);

        let first = store.accrue(&wallet, &BigDecimal::from(200), &key).await.unwrap();
        let again = store.accrue(&wallet, &BigDecimal::from(200), &key).await.unwrap();
        assert_eq!(first, AccrualOutcome::Applied);
        assert_eq!(again, AccrualOutcome::Duplicate);
        assert!(store.is_applied(&key).await.unwrap());

        let entry = store.entry(&wallet).await.unwrap().expect("entry not found");
        assert_eq!(entry.points, BigDecimal::from(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_concurrent_increments() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = Arc::new(PostgresPointsStore::connect(&url).await.unwrap());
        let wallet = unique_wallet();

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let store = Arc::clone(&store);
            let wallet = wallet.clone();
            let key = DedupKey::new(format!("{}-{i}", wallet.as_str()), i);
            handles.push(tokio::spawn(async move {
                store.accrue(&wallet, &BigDecimal::from(1), &key).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let entry = store.entry(&wallet).await.unwrap().unwrap();
        assert_eq!(entry.points, BigDecimal::from(50));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn test_postgres_checkpoint_monotone() {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let store = PostgresPointsStore::connect(&url).await.unwrap();
        let id = unique_wallet().to_string();

        store.save_checkpoint(&id, 500).await.unwrap();
        store.save_checkpoint(&id, 450).await.unwrap();
        assert_eq!(store.load_checkpoint(&id).await.unwrap(), Some(500));
    }
}
