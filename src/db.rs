use crate::error::AppError;
use db_pool::{create_pool as create_pg_pool, DbConfig as DbPoolConfig, PgPool};

const SCHEMA: &str = include_str!("../migrations/0001_chat_relay.sql");

pub async fn init_pool(database_url: &str) -> Result<PgPool, AppError> {
    let mut cfg = DbPoolConfig::from_env("chat-relay").unwrap_or_default();
    if cfg.database_url.is_empty() {
        cfg.database_url = database_url.to_string();
    }
    cfg.service_name = "chat-relay".to_string();
    cfg.log_config();

    let pool = create_pg_pool(cfg).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::info!("database schema is up to date");
    Ok(())
}
