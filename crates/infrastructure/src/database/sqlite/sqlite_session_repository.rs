use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use tuna_core::models::{NewSession, Session};
use tuna_core::traits::SessionRepository;
use tuna_core::TunaResult;

pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> TunaResult<Session> {
        Ok(Session {
            id: row.try_get("id")?,
            arch: row.try_get("arch")?,
            num_cu: row.try_get("num_cu")?,
            toolchain_version: row.try_get("toolchain_version")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, session: &NewSession) -> TunaResult<Session> {
        let row = sqlx::query(
            r#"
            INSERT INTO session (arch, num_cu, toolchain_version, reason, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, arch, num_cu, toolchain_version, reason, created_at
            "#,
        )
        .bind(&session.arch)
        .bind(session.num_cu)
        .bind(&session.toolchain_version)
        .bind(&session.reason)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        let created = Self::row_to_session(&row)?;
        debug!(
            "创建会话成功: ID {}, 架构 {} / {} CU",
            created.id, created.arch, created.num_cu
        );
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, arch, num_cu, toolchain_version, reason, created_at FROM session WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_session(&row)).transpose()
    }

    async fn list(&self) -> TunaResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, arch, num_cu, toolchain_version, reason, created_at FROM session ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_session).collect()
    }
}
