//! Database error types.

use std::time::Duration;

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Connection settings are unusable.
    #[error("invalid ledger configuration: {0}")]
    Config(String),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/fleet-operator.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A ledger call did not finish within its deadline.
    #[error("{operation} did not complete within {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    /// Stored data does not fit the ledger model.
    #[error("ledger data integrity: {0}")]
    Integrity(String),
}

impl DbError {
    /// Lost or unusable connection to the ledger. Retrying inside the same
    /// tick will not help.
    pub fn is_connectivity(&self) -> bool {
        match self {
            DbError::Connect(_) => true,
            DbError::Query(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
