use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument, warn};
use tuna_core::models::{
    ClaimBatch, ClaimRequest, Job, JobOutcome, JobResult, JobState, NewJob, ReportStatus,
    ResetFilter, ResetTarget, ResourceClass, ResourceKey,
};
use tuna_core::state_machine::{JobEvent, JobSnapshot, JobStateMachine};
use tuna_core::traits::JobRepository;
use tuna_core::{TunaError, TunaResult};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, session_id, config_ref, solver, reason, state, step, valid, \
     machine_id, device, claim_token, retries, claimed_at, started_at, created_at, updated_at";

/// 作业仓储
///
/// 所有状态变化都是带状态条件的单条 UPDATE，并发写入由SQLite的写锁串行化。
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> TunaResult<Job> {
        let claimed_at: Option<i64> = row.try_get("claimed_at")?;
        let started_at: Option<i64> = row.try_get("started_at")?;
        Ok(Job {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            config_ref: row.try_get("config_ref")?,
            solver: row.try_get("solver")?,
            reason: row.try_get("reason")?,
            state: row.try_get("state")?,
            step: row.try_get("step")?,
            valid: row.try_get("valid")?,
            machine_id: row.try_get("machine_id")?,
            device: row.try_get("device")?,
            claim_token: row.try_get("claim_token")?,
            retries: row.try_get("retries")?,
            claimed_at: claimed_at.and_then(DateTime::from_timestamp_millis),
            started_at: started_at.and_then(DateTime::from_timestamp_millis),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn resource_columns(request: &ClaimRequest) -> TunaResult<(Option<i64>, Option<i32>)> {
        match (request.class, request.resource) {
            (ResourceClass::Evaluate, Some(ResourceKey::Device { machine_id, gpu })) => {
                Ok((Some(machine_id), Some(gpu)))
            }
            (ResourceClass::Evaluate, _) => Err(TunaError::Internal(
                "评测作业必须绑定到具体GPU设备".to_string(),
            )),
            (ResourceClass::Compile, resource) => Ok((resource.map(|r| r.machine_id()), None)),
        }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_batch(&self, jobs: &[NewJob]) -> TunaResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO job (session_id, config_ref, solver, reason, state, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $6)
                RETURNING id
                "#,
            )
            .bind(job.session_id)
            .bind(&job.config_ref)
            .bind(&job.solver)
            .bind(&job.reason)
            .bind(JobState::New)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        info!("装载作业 {} 个", ids.len());
        Ok(ids)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::row_to_job(&row)).transpose()
    }

    #[instrument(skip(self, request), fields(
        session_id = request.session_id,
        class = %request.class,
        limit = request.limit,
    ))]
    async fn claim_batch(&self, request: &ClaimRequest) -> TunaResult<ClaimBatch> {
        if request.limit <= 0 {
            return Ok(ClaimBatch::default());
        }

        let (machine_id, device) = Self::resource_columns(request)?;
        let claim_token = Uuid::new_v4().to_string();
        let now = Utc::now();

        // 子查询选出候选，外层条件在同一条语句内再次校验状态
        let mut job_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE job
            SET state = $1, step = $2, claim_token = $3, machine_id = $4, device = $5,
                claimed_at = $6, started_at = NULL, updated_at = $7
            WHERE id IN (
                SELECT id FROM job
                WHERE session_id = $8
                  AND valid = 1
                  AND (state = $9 OR (state IN ('errored', 'error_status') AND step = $2))
                  AND ($10 IS NULL OR reason = $10)
                ORDER BY retries, id
                LIMIT $11
            )
              AND (state = $9 OR (state IN ('errored', 'error_status') AND step = $2))
            RETURNING id
            "#,
        )
        .bind(request.class.running_state())
        .bind(request.class)
        .bind(&claim_token)
        .bind(machine_id)
        .bind(device)
        .bind(now.timestamp_millis())
        .bind(now)
        .bind(request.session_id)
        .bind(request.class.ready_state())
        .bind(&request.reason)
        .bind(request.limit)
        .fetch_all(&self.pool)
        .await?;

        job_ids.sort_unstable();

        if !job_ids.is_empty() {
            counter!("tuna_jobs_claimed_total", "class" => request.class.as_str())
                .increment(job_ids.len() as u64);
            debug!("领取作业 {} 个: {:?}", job_ids.len(), job_ids);
        }

        Ok(ClaimBatch {
            claim_token,
            job_ids,
        })
    }

    async fn begin_execution(
        &self,
        job_id: i64,
        claim_token: &str,
        expected: JobState,
        resource: ResourceKey,
    ) -> TunaResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE job
            SET started_at = $1, machine_id = $2, device = $3, updated_at = $7
            WHERE id = $4
              AND state = $5
              AND claim_token = $6
              AND started_at IS NULL
              AND (machine_id IS NULL OR machine_id = $2)
              AND (device IS NULL OR device = $3)
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(resource.machine_id())
        .bind(resource.device())
        .bind(job_id)
        .bind(expected)
        .bind(claim_token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, outcome), fields(job_id = outcome.job_id, step = %outcome.step))]
    async fn report_outcome(
        &self,
        outcome: &JobOutcome,
        max_retries: i32,
    ) -> TunaResult<ReportStatus> {
        let job = self
            .get_by_id(outcome.job_id)
            .await?
            .ok_or(TunaError::JobNotFound { id: outcome.job_id })?;

        if !job.is_held_by(&outcome.claim_token) || job.step != Some(outcome.step) {
            warn!(
                "忽略作业 {} 的重复或过期结果，当前状态: {}",
                job.id, job.state
            );
            counter!("tuna_outcomes_ignored_total").increment(1);
            return Ok(ReportStatus::Ignored { state: job.state });
        }

        let event = match &outcome.result {
            JobResult::Success => JobEvent::Succeed,
            JobResult::Failure { kind, .. } => JobEvent::Fail(*kind),
        };
        let current = JobSnapshot {
            state: job.state,
            step: job.step,
            retries: job.retries,
        };
        let next = JobStateMachine::new(max_retries).apply(current, event)?;

        let result = sqlx::query(
            r#"
            UPDATE job
            SET state = $1, retries = $2, claim_token = NULL, updated_at = $3
            WHERE id = $4 AND state = $5 AND claim_token = $6
            "#,
        )
        .bind(next.state)
        .bind(next.retries)
        .bind(Utc::now())
        .bind(job.id)
        .bind(job.state)
        .bind(&outcome.claim_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("作业 {} 在回报结果前已被回收或重新领取", job.id);
            counter!("tuna_outcomes_ignored_total").increment(1);
            let state = self
                .get_by_id(job.id)
                .await?
                .map(|j| j.state)
                .unwrap_or(job.state);
            return Ok(ReportStatus::Ignored { state });
        }

        if next.state == JobState::Aborted {
            warn!("作业 {} 重试 {} 次后终止", job.id, next.retries);
        }
        counter!("tuna_outcomes_applied_total", "state" => next.state.as_str()).increment(1);
        debug!("作业 {} 状态更新: {} -> {}", job.id, job.state, next.state);

        Ok(ReportStatus::Applied {
            from: job.state,
            to: next.state,
        })
    }

    async fn requeue_stale(&self, older_than: Duration) -> TunaResult<Vec<i64>> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| TunaError::Internal(format!("无效的陈旧阈值: {e}")))?;
        let now = Utc::now();
        let cutoff = (now - older_than).timestamp_millis();

        let mut job_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE job
            SET state = CASE state WHEN $1 THEN $2 ELSE $3 END,
                claim_token = NULL, machine_id = NULL, device = NULL,
                claimed_at = NULL, started_at = NULL, updated_at = $4
            WHERE state IN ($1, $5) AND COALESCE(started_at, claimed_at) <= $6
            RETURNING id
            "#,
        )
        .bind(JobState::Running)
        .bind(JobState::New)
        .bind(JobState::Compiled)
        .bind(now)
        .bind(JobState::RunningEval)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        job_ids.sort_unstable();
        if !job_ids.is_empty() {
            warn!("回收陈旧领取的作业 {} 个: {:?}", job_ids.len(), job_ids);
            counter!("tuna_jobs_requeued_total").increment(job_ids.len() as u64);
        }
        Ok(job_ids)
    }

    async fn reset(&self, filter: &ResetFilter, target: ResetTarget) -> TunaResult<u64> {
        let mut sql = String::from(
            r#"
            UPDATE job
            SET state = $1, step = NULL, retries = 0, claim_token = NULL, machine_id = NULL,
                device = NULL, claimed_at = NULL, started_at = NULL, updated_at = $2
            WHERE session_id = $3 AND ($4 IS NULL OR reason = $4)
            "#,
        );
        if !filter.states.is_empty() {
            let placeholders: Vec<String> = (0..filter.states.len())
                .map(|i| format!("${}", i + 5))
                .collect();
            sql.push_str(&format!(" AND state IN ({})", placeholders.join(", ")));
        }

        let mut query = sqlx::query(&sql)
            .bind(target.state())
            .bind(Utc::now())
            .bind(filter.session_id)
            .bind(&filter.reason);
        for state in &filter.states {
            query = query.bind(*state);
        }

        let affected = query.execute(&self.pool).await?.rows_affected();
        info!(
            "重置会话 {} 的作业 {} 个为 {}",
            filter.session_id,
            affected,
            target.state()
        );
        Ok(affected)
    }

    async fn state_counts(&self, session_id: i64) -> TunaResult<Vec<(JobState, i64)>> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM job WHERE session_id = $1 GROUP BY state",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = rows
            .iter()
            .map(|row| Ok((row.try_get::<JobState, _>("state")?, row.try_get("count")?)))
            .collect::<TunaResult<Vec<(JobState, i64)>>>()?;
        counts.sort_by_key(|(state, _)| *state);
        Ok(counts)
    }
}
