//! `PostgreSQL` pool for the durable tier.
//!
//! Every epoch's observations and aggregates live here as history, next to
//! the cross-epoch records. Queries are built at runtime with binds, so the
//! crate builds without a live database.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::DbError;

/// Sizing and timeouts for the durable pool, taken from the
/// `infrastructure` section of the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Upper bound on open connections. Flushes hold one for the whole
    /// epoch replacement, mirrors take one each.
    pub max_connections: u32,
    /// How long an acquire waits before failing with [`DbError::Postgres`].
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed. `None` keeps them.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Connection pool handle to `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Open a pool on `url` bounded by `limits`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if `url` does not parse or `limits` allows
    /// no connections, and [`DbError::Postgres`] if the server is unreachable.
    pub async fn connect(url: &str, limits: PoolLimits) -> Result<Self, DbError> {
        if limits.max_connections == 0 {
            return Err(DbError::Config(
                "pool must allow at least one connection".to_owned(),
            ));
        }
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| DbError::Config(format!("Invalid database URL: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(limits.max_connections)
            .acquire_timeout(limits.acquire_timeout)
            .idle_timeout(limits.idle_timeout)
            .connect_with(options)
            .await?;

        tracing::info!(
            max_connections = limits.max_connections,
            acquire_timeout_secs = limits.acquire_timeout.as_secs(),
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if any migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// The underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}
