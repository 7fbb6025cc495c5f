use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tuna_core::models::{
    ClaimRequest, FailureKind, JobOutcome, JobState, NewJob, ReportStatus, ResetFilter,
    ResetTarget, ResourceClass, ResourceKey,
};
use tuna_core::traits::JobRepository;
use tuna_infrastructure::database::SqliteJobRepository;

mod common;
use common::{file_pool, memory_pool, seed_jobs, seed_machine, seed_session};

const MAX_RETRIES: i32 = 3;

fn device(machine_id: i64, gpu: i32) -> ResourceKey {
    ResourceKey::Device { machine_id, gpu }
}

#[tokio::test]
async fn test_claim_respects_limit_and_order() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let ids = seed_jobs(&pool, session.id, 5).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 3)).await?;
    assert_eq!(batch.job_ids, ids[..3].to_vec());
    assert!(!batch.claim_token.is_empty());

    for id in &batch.job_ids {
        let job = repo.get_by_id(*id).await?.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.step, Some(ResourceClass::Compile));
        assert_eq!(job.claim_token.as_deref(), Some(batch.claim_token.as_str()));
        assert!(job.claimed_at.is_some());
    }

    let rest = repo.claim_batch(&ClaimRequest::compile(session.id, 10)).await?;
    assert_eq!(rest.job_ids, ids[3..].to_vec());

    let empty = repo.claim_batch(&ClaimRequest::compile(session.id, 10)).await?;
    assert!(empty.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_claim_filters_reason_and_session() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let other = seed_session(&pool).await;
    let repo = SqliteJobRepository::new(pool);

    repo.create_batch(&[
        NewJob::new(session.id, "a", "nightly"),
        NewJob::new(session.id, "b", "adhoc"),
        NewJob::new(other.id, "c", "nightly"),
    ])
    .await?;

    let batch = repo
        .claim_batch(&ClaimRequest::compile(session.id, 10).with_reason("adhoc"))
        .await?;
    assert_eq!(batch.len(), 1);
    let job = repo.get_by_id(batch.job_ids[0]).await?.unwrap();
    assert_eq!(job.config_ref, "b");
    Ok(())
}

#[tokio::test]
async fn test_evaluate_claim_binds_device_and_requires_compiled() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let machine = seed_machine(&pool, "node-01", 2).await;
    seed_jobs(&pool, session.id, 2).await;
    let repo = SqliteJobRepository::new(pool);

    let nothing = repo
        .claim_batch(&ClaimRequest::evaluate(session.id, device(machine.id, 1), 5))
        .await?;
    assert!(nothing.is_empty());

    let compile = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    let job_id = compile.job_ids[0];
    let status = repo
        .report_outcome(
            &JobOutcome::success(job_id, &compile.claim_token, ResourceClass::Compile),
            MAX_RETRIES,
        )
        .await?;
    assert_eq!(
        status,
        ReportStatus::Applied {
            from: JobState::Running,
            to: JobState::Compiled
        }
    );

    let eval = repo
        .claim_batch(&ClaimRequest::evaluate(session.id, device(machine.id, 1), 5))
        .await?;
    assert_eq!(eval.job_ids, vec![job_id]);
    let job = repo.get_by_id(job_id).await?.unwrap();
    assert_eq!(job.state, JobState::RunningEval);
    assert_eq!(job.machine_id, Some(machine.id));
    assert_eq!(job.device, Some(1));

    let node_only = ClaimRequest {
        resource: Some(ResourceKey::Node {
            machine_id: machine.id,
        }),
        ..ClaimRequest::evaluate(session.id, device(machine.id, 0), 1)
    };
    assert!(repo.claim_batch(&node_only).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_begin_execution_checks_token_and_state() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let machine = seed_machine(&pool, "node-01", 1).await;
    seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    let job_id = batch.job_ids[0];
    let node = ResourceKey::Node {
        machine_id: machine.id,
    };

    assert!(!repo
        .begin_execution(job_id, "stale-token", JobState::Running, node)
        .await?);
    assert!(!repo
        .begin_execution(job_id, &batch.claim_token, JobState::RunningEval, node)
        .await?);
    assert!(repo
        .begin_execution(job_id, &batch.claim_token, JobState::Running, node)
        .await?);

    let job = repo.get_by_id(job_id).await?.unwrap();
    assert_eq!(job.machine_id, Some(machine.id));
    assert!(job.started_at.is_some());

    // 同一次领取只能开始一次
    assert!(!repo
        .begin_execution(job_id, &batch.claim_token, JobState::Running, node)
        .await?);

    repo.requeue_stale(Duration::ZERO).await?;
    assert!(!repo
        .begin_execution(job_id, &batch.claim_token, JobState::Running, node)
        .await?);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_outcome_is_ignored() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    let outcome = JobOutcome::success(batch.job_ids[0], &batch.claim_token, ResourceClass::Compile);

    assert!(repo.report_outcome(&outcome, MAX_RETRIES).await?.is_applied());
    let again = repo.report_outcome(&outcome, MAX_RETRIES).await?;
    assert_eq!(
        again,
        ReportStatus::Ignored {
            state: JobState::Compiled
        }
    );

    let job = repo.get_by_id(batch.job_ids[0]).await?.unwrap();
    assert_eq!(job.state, JobState::Compiled);
    assert!(job.claim_token.is_none());
    Ok(())
}

#[tokio::test]
async fn test_failures_retry_then_abort() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let ids = seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    for attempt in 1..=2 {
        let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
        assert_eq!(batch.job_ids, ids);
        let outcome = JobOutcome::failure(
            ids[0],
            &batch.claim_token,
            ResourceClass::Compile,
            FailureKind::ErrorStatus,
            "exit 1",
        );
        repo.report_outcome(&outcome, 1).await?;

        let job = repo.get_by_id(ids[0]).await?.unwrap();
        assert_eq!(job.retries, attempt);
        if attempt == 1 {
            assert_eq!(job.state, JobState::ErrorStatus);
        } else {
            assert_eq!(job.state, JobState::Aborted);
        }
    }

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    assert!(batch.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_error_config_is_not_reclaimed() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    repo.report_outcome(
        &JobOutcome::failure(
            batch.job_ids[0],
            &batch.claim_token,
            ResourceClass::Compile,
            FailureKind::ErrorConfig,
            "bad config",
        ),
        MAX_RETRIES,
    )
    .await?;

    assert!(repo
        .claim_batch(&ClaimRequest::compile(session.id, 1))
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_requeued_job_is_claimable_exactly_once() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let ids = seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let first = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;

    assert!(repo.requeue_stale(Duration::from_secs(3600)).await?.is_empty());
    let requeued = repo.requeue_stale(Duration::ZERO).await?;
    assert_eq!(requeued, ids);

    let job = repo.get_by_id(ids[0]).await?.unwrap();
    assert_eq!(job.state, JobState::New);
    assert!(job.claim_token.is_none());
    assert!(job.claimed_at.is_none());

    // 原持有者迟到的结果不生效
    let late = JobOutcome::success(ids[0], &first.claim_token, ResourceClass::Compile);
    assert!(!repo.report_outcome(&late, MAX_RETRIES).await?.is_applied());

    let second = repo.claim_batch(&ClaimRequest::compile(session.id, 5)).await?;
    assert_eq!(second.job_ids, ids);
    let third = repo.claim_batch(&ClaimRequest::compile(session.id, 5)).await?;
    assert!(third.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_queue_wait_does_not_count_once_execution_starts() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let machine = seed_machine(&pool, "node-01", 1).await;
    let ids = seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    // 在队列中等待超过阈值后才开始执行
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let node = ResourceKey::Node {
        machine_id: machine.id,
    };
    assert!(repo
        .begin_execution(ids[0], &batch.claim_token, JobState::Running, node)
        .await?);

    assert!(repo.requeue_stale(Duration::from_secs(1)).await?.is_empty());
    let job = repo.get_by_id(ids[0]).await?.unwrap();
    assert!(job.is_held_by(&batch.claim_token));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(repo.requeue_stale(Duration::from_secs(1)).await?, ids);
    Ok(())
}

#[tokio::test]
async fn test_requeue_eval_returns_to_compiled() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let machine = seed_machine(&pool, "node-01", 1).await;
    let ids = seed_jobs(&pool, session.id, 1).await;
    let repo = SqliteJobRepository::new(pool);

    let compile = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    repo.report_outcome(
        &JobOutcome::success(ids[0], &compile.claim_token, ResourceClass::Compile),
        MAX_RETRIES,
    )
    .await?;
    repo.claim_batch(&ClaimRequest::evaluate(session.id, device(machine.id, 0), 1))
        .await?;

    repo.requeue_stale(Duration::ZERO).await?;
    let job = repo.get_by_id(ids[0]).await?.unwrap();
    assert_eq!(job.state, JobState::Compiled);
    assert_eq!(job.device, None);
    Ok(())
}

#[tokio::test]
async fn test_reset_filters_states_and_clears_retries() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let ids = seed_jobs(&pool, session.id, 3).await;
    let repo = SqliteJobRepository::new(pool);

    let batch = repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    repo.report_outcome(
        &JobOutcome::failure(
            batch.job_ids[0],
            &batch.claim_token,
            ResourceClass::Compile,
            FailureKind::ErrorConfig,
            "bad",
        ),
        MAX_RETRIES,
    )
    .await?;

    let filter = ResetFilter::session(session.id).with_states(vec![JobState::ErrorConfig]);
    let affected = repo.reset(&filter, ResetTarget::New).await?;
    assert_eq!(affected, 1);

    let job = repo.get_by_id(ids[0]).await?.unwrap();
    assert_eq!(job.state, JobState::New);
    assert_eq!(job.retries, 0);
    assert_eq!(job.step, None);

    let all = repo
        .reset(&ResetFilter::session(session.id), ResetTarget::Compiled)
        .await?;
    assert_eq!(all, 3);
    assert_eq!(
        repo.state_counts(session.id).await?,
        vec![(JobState::Compiled, 3)]
    );
    Ok(())
}

#[tokio::test]
async fn test_state_counts_groups_by_state() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    seed_jobs(&pool, session.id, 4).await;
    let repo = SqliteJobRepository::new(pool);

    repo.claim_batch(&ClaimRequest::compile(session.id, 1)).await?;
    assert_eq!(
        repo.state_counts(session.id).await?,
        vec![(JobState::New, 3), (JobState::Running, 1)]
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_claimers_never_share_a_job() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = file_pool(&dir, 8).await;
    let session = seed_session(&pool).await;
    let ids = seed_jobs(&pool, session.id, 60).await;
    let repo = Arc::new(SqliteJobRepository::new(pool));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        let session_id = session.id;
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = repo
                    .claim_batch(&ClaimRequest::compile(session_id, 4))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.job_ids);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await?);
    }

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), ids.len(), "a job was claimed more than once");
    assert_eq!(unique, ids.into_iter().collect::<HashSet<_>>());
    Ok(())
}
