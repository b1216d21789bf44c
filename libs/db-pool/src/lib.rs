//! PostgreSQL pool for the chat relay
//!
//! Wraps deadpool-postgres: reads sizing and timeouts from the environment,
//! verifies one connection before handing the pool out, and keeps the pool
//! gauges in `metrics` fresh.

mod metrics;

pub use metrics::acquire_with_metrics;
use metrics::update_pool_metrics;

use tokio_postgres::{Config as PgConfig, NoTls};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
pub use deadpool_postgres::PoolError;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const GAUGE_REFRESH: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Label applied to every pool metric
    pub service_name: String,
    pub database_url: String,
    pub max_connections: usize,
    /// Bound on opening a new PostgreSQL connection, also used for the startup check
    pub connect_timeout: Duration,
    /// Bound on waiting for a free pooled connection
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: "chat-relay".to_string(),
            database_url: String::new(),
            max_connections: 16,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl DbConfig {
    /// Read `DATABASE_URL` plus the optional `DB_*` overrides.
    ///
    /// Unparsable overrides fall back to the defaults.
    pub fn from_env(service_name: &str) -> Result<Self, String> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is not set".to_string())?;
        let defaults = Self::default();

        Ok(Self {
            service_name: service_name.to_string(),
            database_url,
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            connect_timeout: env_secs("DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            acquire_timeout: env_secs("DB_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout),
        })
    }

    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            max_connections = self.max_connections,
            connect_timeout = ?self.connect_timeout,
            acquire_timeout = ?self.acquire_timeout,
            "database pool settings"
        );
    }
}

#[derive(Debug, Error)]
pub enum DbPoolError {
    #[error("invalid database url: {0}")]
    InvalidUrl(#[source] tokio_postgres::Error),

    #[error("failed to build pool: {0}")]
    Build(String),

    #[error("startup connection check failed: {0}")]
    Verify(#[from] PoolError),

    #[error("startup connection check timed out after {0:?}")]
    VerifyTimeout(Duration),
}

pub type PgPool = Pool;

async fn verify(pool: &Pool) -> Result<(), PoolError> {
    let client = pool.get().await?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(PoolError::Backend)?;
    Ok(())
}

/// Build the pool and prove it can reach the database before returning it
pub async fn create_pool(config: DbConfig) -> Result<PgPool, DbPoolError> {
    let pg_config: PgConfig = config
        .database_url
        .parse()
        .map_err(DbPoolError::InvalidUrl)?;

    let manager = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .wait_timeout(Some(config.acquire_timeout))
        .create_timeout(Some(config.connect_timeout))
        .build()
        .map_err(|e| DbPoolError::Build(e.to_string()))?;

    match tokio::time::timeout(config.connect_timeout, verify(&pool)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(service = %config.service_name, error = %e, "database check failed");
            return Err(DbPoolError::Verify(e));
        }
        Err(_) => {
            error!(
                service = %config.service_name,
                timeout = ?config.connect_timeout,
                "database check timed out"
            );
            return Err(DbPoolError::VerifyTimeout(config.connect_timeout));
        }
    }

    info!(service = %config.service_name, "database pool ready");
    update_pool_metrics(&pool, &config.service_name);

    let gauge_pool = pool.clone();
    let service = config.service_name;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GAUGE_REFRESH);
        loop {
            ticker.tick().await;
            update_pool_metrics(&gauge_pool, &service);
        }
    });

    Ok(pool)
}
