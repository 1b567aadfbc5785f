//! Error types for schema administration
//!
//! The taxonomy mirrors how failures are handled: only `LockTimeout` is
//! retryable; `RetriesExhausted` is terminal; everything surfaced by the
//! database that is not a lock-wait timeout is fatal and propagates to the
//! caller unchanged.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result type alias for admin operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// Errors raised while administering the database schema.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The database gave up waiting for a DDL lock. Retryable.
    #[error("lock wait timed out")]
    LockTimeout,

    /// The retry budget ran out while every attempt kept timing out.
    #[error("migration retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A blocking session is on the no-kill list; the whole kill batch was
    /// refused. Non-fatal: the retry loop continues without killing.
    #[error("blocking session {app_name} (pid {pid}) is on the no-kill list")]
    ProtectedByNoKill { app_name: String, pid: i32 },

    /// Not a valid SQL role name; refused before any SQL is rendered.
    #[error("invalid role name: {0:?}")]
    InvalidRole(String),

    /// Any non-timeout database error. Never retried.
    #[error("database error: {0}")]
    Database(tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to build connection pool: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[error("schema definition error: {0}")]
    Schema(#[from] graphmig_schema::SchemaError),

    /// The spawned DDL worker died without producing a result.
    #[error("migration worker failed: {0}")]
    Worker(String),
}

impl AdminError {
    /// Whether this error is the retryable lock-wait timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, AdminError::LockTimeout)
    }
}

/// Classify database errors at the conversion boundary.
///
/// `lock_timeout` firing raises SQLSTATE 55P03 (`lock_not_available`); a
/// statement cancelled by a timeout raises 57014 (`query_canceled`). Both
/// mean the attempt lost the race for the DDL lock and should be retried.
impl From<tokio_postgres::Error> for AdminError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.code() {
            Some(code)
                if *code == SqlState::LOCK_NOT_AVAILABLE
                    || *code == SqlState::QUERY_CANCELED =>
            {
                AdminError::LockTimeout
            }
            _ => AdminError::Database(err),
        }
    }
}
