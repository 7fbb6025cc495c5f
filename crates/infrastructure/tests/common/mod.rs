#![allow(dead_code)]

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tuna_core::config::DatabaseConfig;
use tuna_core::models::{Machine, NewJob, NewMachine, NewSession, Session};
use tuna_core::traits::{JobRepository, MachineRepository, SessionRepository};
use tuna_infrastructure::database::{
    create_database_pool, run_migrations, SqliteJobRepository, SqliteMachineRepository,
    SqliteSessionRepository,
};

/// 单连接的内存数据库
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// 基于临时文件的WAL数据库，用于并发测试
pub async fn file_pool(dir: &tempfile::TempDir, max_connections: u32) -> SqlitePool {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("tuna.db").display()),
        max_connections,
        connection_timeout_seconds: 30,
    };
    create_database_pool(&config).await.unwrap()
}

pub async fn seed_session(pool: &SqlitePool) -> Session {
    SqliteSessionRepository::new(pool.clone())
        .create(&NewSession {
            arch: "gfx90a".to_string(),
            num_cu: 110,
            toolchain_version: "6.2.0".to_string(),
            reason: "nightly".to_string(),
        })
        .await
        .unwrap()
}

pub async fn seed_machine(pool: &SqlitePool, hostname: &str, gpu_count: i32) -> Machine {
    SqliteMachineRepository::new(pool.clone())
        .create(&NewMachine {
            hostname: hostname.to_string(),
            address: format!("10.0.0.{}", gpu_count),
            ssh_port: 22,
            ssh_user: "tuna".to_string(),
            arch: "gfx90a".to_string(),
            num_cu: 110,
            gpu_count,
            power_address: None,
        })
        .await
        .unwrap()
}

pub async fn seed_jobs(pool: &SqlitePool, session_id: i64, count: usize) -> Vec<i64> {
    let jobs: Vec<NewJob> = (0..count)
        .map(|i| NewJob::new(session_id, format!("config-{i}"), "nightly"))
        .collect();
    SqliteJobRepository::new(pool.clone())
        .create_batch(&jobs)
        .await
        .unwrap()
}
