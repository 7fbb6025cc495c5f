use anyhow::Result;
use tuna_core::models::{GoldenRecord, GoldenSnapshot, MergedRecord};
use tuna_core::traits::{
    GoldenRepository, MachineRepository, MergedRecordRepository, SessionRepository,
};
use tuna_core::TunaError;
use tuna_infrastructure::database::{
    SqliteGoldenRepository, SqliteMachineRepository, SqliteMergedRecordRepository,
    SqliteSessionRepository,
};

mod common;
use common::{memory_pool, seed_machine, seed_session};

fn merged(session_id: i64, key: &str, value: &str) -> MergedRecord {
    MergedRecord {
        session_id,
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn golden(key: &str, value: &str, session_id: i64) -> GoldenRecord {
    GoldenRecord {
        arch: "gfx90a".to_string(),
        num_cu: 110,
        key: key.to_string(),
        value: value.to_string(),
        session_id,
    }
}

#[tokio::test]
async fn test_session_create_and_list() -> Result<()> {
    let pool = memory_pool().await;
    let created = seed_session(&pool).await;
    let repo = SqliteSessionRepository::new(pool);

    let fetched = repo.get_by_id(created.id).await?.unwrap();
    assert_eq!(fetched.arch, "gfx90a");
    assert_eq!(fetched.num_cu, 110);
    assert_eq!(repo.list().await?.len(), 1);
    assert!(repo.get_by_id(created.id + 1).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_machine_health_flags() -> Result<()> {
    let pool = memory_pool().await;
    let machine = seed_machine(&pool, "node-01", 4).await;
    seed_machine(&pool, "node-02", 4).await;
    let repo = SqliteMachineRepository::new(pool);

    assert_eq!(repo.list_allocatable().await?.len(), 2);
    assert_eq!(repo.record_host_failure(machine.id).await?, 1);
    assert_eq!(repo.record_host_failure(machine.id).await?, 2);

    repo.set_available(machine.id, false).await?;
    let allocatable = repo.list_allocatable().await?;
    assert_eq!(allocatable.len(), 1);
    assert_eq!(allocatable[0].hostname, "node-02");

    repo.clear_host_failures(machine.id).await?;
    repo.set_available(machine.id, true).await?;
    repo.set_unreachable(machine.id, true).await?;
    let fetched = repo.get_by_hostname("node-01").await?.unwrap();
    assert_eq!(fetched.host_failures, 0);
    assert!(fetched.unreachable);
    assert!(!fetched.is_allocatable());

    assert!(matches!(
        repo.set_available(9999, true).await,
        Err(TunaError::MachineNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_merged_records_are_replaced() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let repo = SqliteMergedRecordRepository::new(pool);

    repo.replace_session_records(
        session.id,
        &[merged(session.id, "b", "1:2,3"), merged(session.id, "a", "2:1,1")],
    )
    .await?;
    let written = repo
        .replace_session_records(session.id, &[merged(session.id, "c", "3:1,2")])
        .await?;
    assert_eq!(written, 1);

    let records = repo.list_session_records(session.id).await?;
    assert_eq!(records, vec![merged(session.id, "c", "3:1,2")]);
    Ok(())
}

#[tokio::test]
async fn test_repeated_keys_count_once() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let repo = SqliteMergedRecordRepository::new(pool);

    let written = repo
        .replace_session_records(
            session.id,
            &[
                merged(session.id, "a", "1:2,3"),
                merged(session.id, "b", "2:1,1"),
                merged(session.id, "a", "1:2,4"),
            ],
        )
        .await?;
    assert_eq!(written, 2);

    let records = repo.list_session_records(session.id).await?;
    assert_eq!(
        records,
        vec![
            merged(session.id, "a", "1:2,4"),
            merged(session.id, "b", "2:1,1"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_golden_commit_and_version_exists() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let repo = SqliteGoldenRepository::new(pool);

    let snapshot = GoldenSnapshot {
        version: 1,
        session_id: session.id,
        base_version: None,
        records: vec![golden("k2", "1:1,1", session.id), golden("k1", "2:1,1", session.id)],
        expected_session_records: 2,
    };
    let version = repo.commit_snapshot(&snapshot, false).await?;
    assert_eq!(version.record_count, 2);

    let records = repo.load_records(1).await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, "k1");

    assert!(matches!(
        repo.commit_snapshot(&snapshot, false).await,
        Err(TunaError::GoldenVersionExists { version: 1 })
    ));

    let replacement = GoldenSnapshot {
        records: vec![golden("k3", "1:1,1", session.id)],
        expected_session_records: 1,
        ..snapshot
    };
    repo.commit_snapshot(&replacement, true).await?;
    let records = repo.load_records(1).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "k3");
    Ok(())
}

#[tokio::test]
async fn test_golden_count_mismatch_rolls_back() -> Result<()> {
    let pool = memory_pool().await;
    let session = seed_session(&pool).await;
    let repo = SqliteGoldenRepository::new(pool);

    let snapshot = GoldenSnapshot {
        version: 2,
        session_id: session.id,
        base_version: Some(1),
        records: vec![golden("k1", "1:1,1", session.id), golden("k2", "2:1,1", 99)],
        expected_session_records: 2,
    };

    let result = repo.commit_snapshot(&snapshot, false).await;
    assert!(matches!(
        result,
        Err(TunaError::GoldenCountMismatch {
            expected: 2,
            actual: 1
        })
    ));
    assert!(repo.get_version(2).await?.is_none());
    assert!(repo.load_records(2).await?.is_empty());
    Ok(())
}
