pub mod migrations;
pub mod sqlite;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;
use tuna_core::config::DatabaseConfig;
use tuna_core::TunaResult;

pub use migrations::run_migrations;
pub use sqlite::*;

/// 创建SQLite连接池并完成表结构初始化
pub async fn create_database_pool(config: &DatabaseConfig) -> TunaResult<SqlitePool> {
    info!("创建SQLite数据库连接池: {}", config.url);

    let connect_options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
        .connect_with(connect_options)
        .await?;

    run_migrations(&pool).await?;

    info!("✅ 数据库连接池创建完成");
    Ok(pool)
}
