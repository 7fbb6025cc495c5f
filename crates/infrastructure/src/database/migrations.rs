use sqlx::SqlitePool;
use tracing::info;
use tuna_core::TunaResult;

const SCHEMA: &[(&str, &str)] = &[
    (
        "session",
        r#"
        CREATE TABLE IF NOT EXISTS session (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            arch TEXT NOT NULL,
            num_cu INTEGER NOT NULL,
            toolchain_version TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "machine",
        r#"
        CREATE TABLE IF NOT EXISTS machine (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hostname TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL,
            ssh_port INTEGER NOT NULL DEFAULT 22,
            ssh_user TEXT NOT NULL,
            arch TEXT NOT NULL,
            num_cu INTEGER NOT NULL,
            gpu_count INTEGER NOT NULL DEFAULT 0,
            power_address TEXT,
            available INTEGER NOT NULL DEFAULT 1,
            unreachable INTEGER NOT NULL DEFAULT 0,
            host_failures INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "job",
        r#"
        CREATE TABLE IF NOT EXISTS job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES session(id),
            config_ref TEXT NOT NULL,
            solver TEXT,
            reason TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL DEFAULT 'new',
            step TEXT,
            valid INTEGER NOT NULL DEFAULT 1,
            machine_id INTEGER,
            device INTEGER,
            claim_token TEXT,
            retries INTEGER NOT NULL DEFAULT 0,
            claimed_at INTEGER,
            started_at INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "idx_job_claim",
        "CREATE INDEX IF NOT EXISTS idx_job_claim ON job(session_id, state, retries, id)",
    ),
    (
        "idx_job_claimed_at",
        "CREATE INDEX IF NOT EXISTS idx_job_claimed_at ON job(state, claimed_at)",
    ),
    (
        "merged_record",
        r#"
        CREATE TABLE IF NOT EXISTS merged_record (
            session_id INTEGER NOT NULL REFERENCES session(id),
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (session_id, key)
        )
        "#,
    ),
    (
        "golden_version",
        r#"
        CREATE TABLE IF NOT EXISTS golden_version (
            version INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL,
            base_version INTEGER,
            record_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "golden_record",
        r#"
        CREATE TABLE IF NOT EXISTS golden_record (
            version INTEGER NOT NULL REFERENCES golden_version(version) ON DELETE CASCADE,
            arch TEXT NOT NULL,
            num_cu INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            session_id INTEGER NOT NULL,
            PRIMARY KEY (version, arch, num_cu, key)
        )
        "#,
    ),
];

/// 幂等地创建表结构和索引
pub async fn run_migrations(pool: &SqlitePool) -> TunaResult<()> {
    info!("运行SQLite数据库迁移");

    for (name, statement) in SCHEMA {
        sqlx::query(statement).execute(pool).await.map_err(|e| {
            tuna_core::TunaError::DatabaseOperation(format!("创建 {name} 失败: {e}"))
        })?;
    }

    info!("✅ 数据库迁移完成");
    Ok(())
}
