//! Mapping `sqlx` errors onto the pipeline's transient / permanent split.

use stakepoints_core::error::PointsError;

/// Convert a `sqlx` error. `transient_code` decides which database error
/// codes (busy, lock and serialization failures) are worth retrying.
pub(crate) fn store_error(e: sqlx::Error, transient_code: fn(&str) -> bool) -> PointsError {
    let transient = match &e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().map(|c| transient_code(&c)).unwrap_or(false),
        _ => false,
    };
    if transient {
        PointsError::StoreUnavailable(e.to_string())
    } else {
        PointsError::Storage(e.to_string())
    }
}
