use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, instrument, warn};
use tuna_core::models::{GoldenRecord, GoldenSnapshot, GoldenVersion};
use tuna_core::traits::GoldenRepository;
use tuna_core::{TunaError, TunaResult};

pub struct SqliteGoldenRepository {
    pool: SqlitePool,
}

impl SqliteGoldenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> TunaResult<GoldenVersion> {
        Ok(GoldenVersion {
            version: row.try_get("version")?,
            session_id: row.try_get("session_id")?,
            base_version: row.try_get("base_version")?,
            record_count: row.try_get("record_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl GoldenRepository for SqliteGoldenRepository {
    async fn get_version(&self, version: i64) -> TunaResult<Option<GoldenVersion>> {
        let row = sqlx::query(
            "SELECT version, session_id, base_version, record_count, created_at FROM golden_version WHERE version = $1",
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_version(&row)).transpose()
    }

    async fn load_records(&self, version: i64) -> TunaResult<Vec<GoldenRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT arch, num_cu, key, value, session_id FROM golden_record
            WHERE version = $1
            ORDER BY arch, num_cu, key
            "#,
        )
        .bind(version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(GoldenRecord {
                    arch: row.try_get("arch")?,
                    num_cu: row.try_get("num_cu")?,
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                    session_id: row.try_get("session_id")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, snapshot), fields(
        version = snapshot.version,
        session_id = snapshot.session_id,
        records = snapshot.records.len(),
    ))]
    async fn commit_snapshot(
        &self,
        snapshot: &GoldenSnapshot,
        overwrite: bool,
    ) -> TunaResult<GoldenVersion> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT version FROM golden_version WHERE version = $1")
                .bind(snapshot.version)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            if !overwrite {
                return Err(TunaError::GoldenVersionExists {
                    version: snapshot.version,
                });
            }
            warn!("覆盖已存在的Golden版本 {}", snapshot.version);
            sqlx::query("DELETE FROM golden_record WHERE version = $1")
                .bind(snapshot.version)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM golden_version WHERE version = $1")
                .bind(snapshot.version)
                .execute(&mut *tx)
                .await?;
        }

        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO golden_version (version, session_id, base_version, record_count, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.version)
        .bind(snapshot.session_id)
        .bind(snapshot.base_version)
        .bind(snapshot.expected_session_records)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        for record in &snapshot.records {
            sqlx::query(
                r#"
                INSERT INTO golden_record (version, arch, num_cu, key, value, session_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(snapshot.version)
            .bind(&record.arch)
            .bind(record.num_cu)
            .bind(&record.key)
            .bind(&record.value)
            .bind(record.session_id)
            .execute(&mut *tx)
            .await?;
        }

        let actual: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM golden_record WHERE version = $1 AND session_id = $2",
        )
        .bind(snapshot.version)
        .bind(snapshot.session_id)
        .fetch_one(&mut *tx)
        .await?;

        if actual != snapshot.expected_session_records {
            error!(
                "Golden版本 {} 记录数不一致: 期望 {}, 实际 {}，回滚",
                snapshot.version, snapshot.expected_session_records, actual
            );
            tx.rollback().await?;
            return Err(TunaError::GoldenCountMismatch {
                expected: snapshot.expected_session_records,
                actual,
            });
        }

        tx.commit().await?;
        info!(
            "✅ Golden版本 {} 提交完成: 总记录 {}, 会话记录 {}",
            snapshot.version,
            snapshot.records.len(),
            actual
        );

        Ok(GoldenVersion {
            version: snapshot.version,
            session_id: snapshot.session_id,
            base_version: snapshot.base_version,
            record_count: actual,
            created_at,
        })
    }
}
