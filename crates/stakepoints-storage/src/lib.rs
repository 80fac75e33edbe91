//! stakepoints-storage — points ledger backends.
//!
//! Every backend implements [`stakepoints_core::PointsStore`] and applies
//! the dedup record and the ledger increment as one atomic unit, and
//! [`stakepoints_core::CheckpointStore`] in the same database.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres` — PostgreSQL via `sqlx` (shared, production)

pub mod memory;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod error;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryPointsStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresPointsStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqlitePointsStore;

/// Current time as a Unix timestamp in seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
