//! Database layer for the fleet operator.
//!
//! This module provides:
//! - Connection pool management
//! - Migrations for the instance ledger
//! - [`LedgerRepository`], the narrow query surface the reconciler uses,
//!   and its Postgres implementation [`PgLedger`]

mod error;
mod ledger;
mod pg_ledger;

pub use error::DbError;
pub use ledger::{
    ClosedSessionInstance, InstanceKey, InstancePatch, LedgerRepository, NewInstance, Region,
};
pub use pg_ledger::PgLedger;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use tracing::info;

/// Database configuration.
#[derive(Clone)]
pub struct DbConfig {
    /// Where and as whom to connect.
    pub connect_options: PgConnectOptions,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// Deadline for each ledger query.
    pub query_timeout: Duration,

    /// Log every statement at debug level. Off in production.
    pub statement_logging: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            connect_options: PgConnectOptions::new()
                .host("localhost")
                .database("psfleet"),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            query_timeout: Duration::from_secs(10),
            statement_logging: true,
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.connect_options.get_host())
            .field("port", &self.connect_options.get_port())
            .field("username", &self.connect_options.get_username())
            .field("database", &self.connect_options.get_database())
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("query_timeout", &self.query_timeout)
            .field("statement_logging", &self.statement_logging)
            .finish_non_exhaustive()
    }
}

impl DbConfig {
    /// Load configuration through `lookup`.
    ///
    /// `DATABASE_URL` wins; otherwise the options are built from the
    /// `DATABASE_HOST`/`PORT`/`USER`/`PASS`/`NAME` parts, taken verbatim so
    /// credentials need no URL escaping.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbError> {
        let defaults = Self::default();

        let connect_options = match lookup("DATABASE_URL") {
            Some(url) => PgConnectOptions::from_str(&url)
                .map_err(|e| DbError::Config(format!("invalid DATABASE_URL: {e}")))?,
            None => match (lookup("DATABASE_HOST"), lookup("DATABASE_NAME")) {
                (Some(host), Some(name)) => {
                    let port = parse_setting(&lookup, "DATABASE_PORT", 5432u16)?;
                    let mut options = PgConnectOptions::new()
                        .host(&host)
                        .port(port)
                        .database(&name);
                    if let Some(user) = lookup("DATABASE_USER") {
                        options = options.username(&user);
                    }
                    if let Some(pass) = lookup("DATABASE_PASS") {
                        options = options.password(&pass);
                    }
                    options
                }
                _ => defaults.connect_options.clone(),
            },
        };

        let max_connections =
            parse_setting(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?;
        let min_connections =
            parse_setting(&lookup, "DB_MIN_CONNECTIONS", defaults.min_connections)?;
        if max_connections == 0 || min_connections > max_connections {
            return Err(DbError::Config(format!(
                "DB_MAX_CONNECTIONS must be positive and at least DB_MIN_CONNECTIONS \
                 (max {max_connections}, min {min_connections})"
            )));
        }

        Ok(Self {
            connect_options,
            max_connections,
            min_connections,
            ..defaults
        })
    }
}

fn parse_setting<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, DbError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DbError::Config(format!("invalid {name}: {raw:?}"))),
        None => Ok(default),
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    query_timeout: Duration,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            statement_logging = config.statement_logging,
            "Connecting to database"
        );

        let mut options = config.connect_options.clone();
        if !config.statement_logging {
            options = options.disable_statement_logging();
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect_with(options)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self {
            pool,
            query_timeout: config.query_timeout,
        })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    ///
    /// Only used in development; production schemas are managed by the
    /// deployment.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/fleet-operator/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a ledger handle.
    pub fn ledger(&self) -> PgLedger {
        PgLedger::new(self.pool.clone(), self.query_timeout)
    }
}
