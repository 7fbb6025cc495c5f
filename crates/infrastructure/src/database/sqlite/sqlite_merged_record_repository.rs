use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;
use tuna_core::models::MergedRecord;
use tuna_core::traits::MergedRecordRepository;
use tuna_core::TunaResult;

pub struct SqliteMergedRecordRepository {
    pool: SqlitePool,
}

impl SqliteMergedRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MergedRecordRepository for SqliteMergedRecordRepository {
    async fn replace_session_records(
        &self,
        session_id: i64,
        records: &[MergedRecord],
    ) -> TunaResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM merged_record WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                "INSERT INTO merged_record (session_id, key, value) VALUES ($1, $2, $3)
                 ON CONFLICT (session_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(session_id)
            .bind(&record.key)
            .bind(&record.value)
            .execute(&mut *tx)
            .await?;
        }

        // 重复的键只保留最后一条
        let inserted: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM merged_record WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        info!("会话 {} 导入合并记录 {} 条", session_id, inserted);
        Ok(inserted as u64)
    }

    async fn list_session_records(&self, session_id: i64) -> TunaResult<Vec<MergedRecord>> {
        let rows = sqlx::query(
            "SELECT session_id, key, value FROM merged_record WHERE session_id = $1 ORDER BY key",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MergedRecord {
                    session_id: row.try_get("session_id")?,
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }
}
