use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tuna_core::config::WorkerConfig;
use tuna_core::models::queue_names;
use tuna_core::models::{
    ClaimBatch, ClaimRequest, FailureKind, JobDispatchMessage, JobResult, JobState, Message,
    MessageType, ResourceClass, ResourceKey,
};
use tuna_core::traits::{
    BackendOutput, ExecutionContext, JobRepository, MessageQueue, TuningBackend,
};
use tuna_core::{TunaError, TunaResult};
use tuna_infrastructure::InMemoryMessageQueue;
use tuna_testing_utils::{
    jobs_for_session, JobBuilder, MachineBuilder, MockBackend, MockJobRepository,
    MockMachineRepository, MockSessionRepository, SessionBuilder,
};
use tuna_worker::{CancellationRegistry, Worker, WorkerBinding, WorkerPool, WorkerStep};

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

struct Fixture {
    jobs: Arc<MockJobRepository>,
    queue: Arc<InMemoryMessageQueue>,
    backend: Arc<MockBackend>,
}

impl Fixture {
    fn new(jobs: Vec<tuna_core::models::Job>) -> Self {
        Self {
            jobs: Arc::new(MockJobRepository::with_jobs(jobs)),
            queue: Arc::new(InMemoryMessageQueue::new()),
            backend: Arc::new(MockBackend::new()),
        }
    }

    fn worker(&self, binding: WorkerBinding, cancel: CancellationToken) -> Worker {
        self.worker_with_backend(binding, cancel, self.backend.clone())
    }

    fn worker_with_backend(
        &self,
        binding: WorkerBinding,
        cancel: CancellationToken,
        backend: Arc<dyn TuningBackend>,
    ) -> Worker {
        Worker::new(
            binding,
            SessionBuilder::new().build(),
            MachineBuilder::new().with_hostname("node-01").build(),
            self.jobs.clone(),
            self.queue.clone(),
            backend,
            cancel,
            RECEIVE_TIMEOUT,
        )
    }

    async fn claim_and_publish(&self, request: ClaimRequest, queue: &str) -> ClaimBatch {
        let batch = self.jobs.claim_batch(&request).await.unwrap();
        for job_id in &batch.job_ids {
            let message = Message::job_dispatch(JobDispatchMessage {
                job_id: *job_id,
                session_id: request.session_id,
                step: request.class,
                claim_token: batch.claim_token.clone(),
                resource: request.resource,
            });
            self.queue.publish_message(queue, &message).await.unwrap();
        }
        batch
    }

    async fn outcomes(&self) -> Vec<tuna_core::models::JobOutcomeMessage> {
        self.queue
            .consume_messages(&queue_names::outcomes(1))
            .await
            .unwrap()
            .into_iter()
            .map(|m| match m.message_type {
                MessageType::JobOutcome(outcome) => outcome,
                other => panic!("unexpected message: {other:?}"),
            })
            .collect()
    }
}

struct FailingBackend;

#[async_trait]
impl TuningBackend for FailingBackend {
    async fn execute(&self, _ctx: &ExecutionContext) -> TunaResult<BackendOutput> {
        Err(TunaError::Backend("backend unavailable".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[tokio::test]
async fn test_compile_worker_executes_and_reports() {
    let f = Fixture::new(jobs_for_session(1, 2));
    let batch = f
        .claim_and_publish(ClaimRequest::compile(1, 1), &queue_names::compile(1))
        .await;
    let worker = f.worker(WorkerBinding::compile(1, 1, 0), CancellationToken::new());

    assert_eq!(
        worker.process_next().await.unwrap(),
        WorkerStep::Completed {
            job_id: 1,
            success: true
        }
    );
    assert_eq!(worker.process_next().await.unwrap(), WorkerStep::Idle);

    let job = f.jobs.get(1).unwrap();
    assert!(job.started_at.is_some());
    assert_eq!(job.machine_id, Some(1));

    let outcomes = f.outcomes().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].hostname, "node-01");
    assert_eq!(outcomes[0].outcome.claim_token, batch.claim_token);
    assert_eq!(outcomes[0].outcome.step, ResourceClass::Compile);
    assert_eq!(outcomes[0].records.len(), 1);
    assert_eq!(f.backend.calls()[0].device, None);
}

#[tokio::test]
async fn test_stale_claim_is_skipped_without_running_backend() {
    let f = Fixture::new(jobs_for_session(1, 1));
    f.claim_and_publish(ClaimRequest::compile(1, 1), &queue_names::compile(1))
        .await;

    // 回收后被重新领取，旧消息的令牌已失效
    f.jobs.requeue_stale(Duration::ZERO).await.unwrap();
    let fresh = f.jobs.claim_batch(&ClaimRequest::compile(1, 1)).await.unwrap();
    assert_eq!(fresh.job_ids, vec![1]);

    let worker = f.worker(WorkerBinding::compile(1, 1, 0), CancellationToken::new());
    assert_eq!(
        worker.process_next().await.unwrap(),
        WorkerStep::Skipped { job_id: 1 }
    );
    assert_eq!(f.backend.call_count(), 0);
    assert!(f.outcomes().await.is_empty());
    assert_eq!(f.jobs.get(1).unwrap().state, JobState::Running);
}

#[tokio::test]
async fn test_duplicate_dispatch_runs_once() {
    let f = Fixture::new(jobs_for_session(1, 1));
    let batch = f
        .claim_and_publish(ClaimRequest::compile(1, 1), &queue_names::compile(1))
        .await;
    let duplicate = Message::job_dispatch(JobDispatchMessage {
        job_id: 1,
        session_id: 1,
        step: ResourceClass::Compile,
        claim_token: batch.claim_token.clone(),
        resource: None,
    });
    f.queue
        .publish_message(&queue_names::compile(1), &duplicate)
        .await
        .unwrap();

    let worker = f.worker(WorkerBinding::compile(1, 1, 0), CancellationToken::new());
    assert!(matches!(
        worker.process_next().await.unwrap(),
        WorkerStep::Completed { job_id: 1, .. }
    ));
    assert_eq!(
        worker.process_next().await.unwrap(),
        WorkerStep::Skipped { job_id: 1 }
    );
    assert_eq!(f.backend.call_count(), 1);
}

#[tokio::test]
async fn test_cancelled_worker_leaves_claim_in_place() {
    let f = Fixture::new(jobs_for_session(1, 1));
    f.claim_and_publish(ClaimRequest::compile(1, 1), &queue_names::compile(1))
        .await;

    let registry = CancellationRegistry::new();
    let token = registry.token_for(1, "gfx90a");
    registry.cancel_machine(1);

    let worker = f.worker(WorkerBinding::compile(1, 1, 0), token);
    assert_eq!(worker.process_next().await.unwrap(), WorkerStep::Cancelled);
    assert_eq!(f.backend.call_count(), 0);
    assert!(f.outcomes().await.is_empty());

    let job = f.jobs.get(1).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.claim_token.is_some());
}

#[tokio::test]
async fn test_cancel_interrupts_waiting_worker() {
    let f = Fixture::new(Vec::new());
    let cancel = CancellationToken::new();
    let worker = Worker::new(
        WorkerBinding::compile(1, 1, 0),
        SessionBuilder::new().build(),
        MachineBuilder::new().build(),
        f.jobs.clone(),
        f.queue.clone(),
        f.backend.clone(),
        cancel.clone(),
        Duration::from_secs(30),
    );

    let handle = tokio::spawn(async move { worker.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should stop")
        .unwrap();
}

#[tokio::test]
async fn test_eval_worker_only_sees_its_device_queue() {
    let jobs = (1..=2)
        .map(|id| JobBuilder::new().with_id(id).compiled().build())
        .collect();
    let f = Fixture::new(jobs);
    let gpu0 = ResourceKey::Device {
        machine_id: 1,
        gpu: 0,
    };
    let queue = WorkerBinding::device(1, 1, 0).queue();
    assert_eq!(queue, "eval:1:1-0");
    f.claim_and_publish(ClaimRequest::evaluate(1, gpu0, 1), &queue)
        .await;

    let other = f.worker(WorkerBinding::device(1, 1, 1), CancellationToken::new());
    assert_eq!(other.process_next().await.unwrap(), WorkerStep::Idle);

    let worker = f.worker(WorkerBinding::device(1, 1, 0), CancellationToken::new());
    assert_eq!(
        worker.process_next().await.unwrap(),
        WorkerStep::Completed {
            job_id: 1,
            success: true
        }
    );
    let calls = f.backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].step, ResourceClass::Evaluate);
    assert_eq!(calls[0].device, Some(0));
}

#[tokio::test]
async fn test_backend_error_is_reported_as_failure() {
    let f = Fixture::new(jobs_for_session(1, 1));
    f.claim_and_publish(ClaimRequest::compile(1, 1), &queue_names::compile(1))
        .await;
    let worker = f.worker_with_backend(
        WorkerBinding::compile(1, 1, 0),
        CancellationToken::new(),
        Arc::new(FailingBackend),
    );

    assert_eq!(
        worker.process_next().await.unwrap(),
        WorkerStep::Completed {
            job_id: 1,
            success: false
        }
    );
    let outcomes = f.outcomes().await;
    assert!(matches!(
        &outcomes[0].outcome.result,
        JobResult::Failure {
            kind: FailureKind::Errored,
            ..
        }
    ));
    assert!(outcomes[0].records.is_empty());
}

fn pool(
    machines: Vec<tuna_core::models::Machine>,
    registry: Arc<CancellationRegistry>,
    compile_slots: u32,
) -> (WorkerPool, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let pool = WorkerPool::new(
        Arc::new(MockSessionRepository::with_sessions(vec![
            SessionBuilder::new().build(),
        ])),
        Arc::new(MockMachineRepository::with_machines(machines)),
        Arc::new(MockJobRepository::with_jobs(jobs_for_session(1, 4))),
        Arc::new(InMemoryMessageQueue::new()),
        backend.clone(),
        registry,
        WorkerConfig {
            compile_slots_per_machine: compile_slots,
            ..WorkerConfig::default()
        },
        RECEIVE_TIMEOUT,
    );
    (pool, backend)
}

#[tokio::test]
async fn test_pool_builds_compile_and_device_workers() {
    let registry = Arc::new(CancellationRegistry::new());
    let (pool, _) = pool(
        vec![
            MachineBuilder::new().with_id(1).with_gpu_count(2).build(),
            MachineBuilder::new()
                .with_id(2)
                .with_hostname("node-02")
                .with_arch("gfx942", 304)
                .with_gpu_count(8)
                .build(),
            MachineBuilder::new()
                .with_id(3)
                .with_hostname("node-03")
                .unavailable()
                .build(),
        ],
        registry,
        2,
    );

    let queues: Vec<String> = pool
        .build_workers(1, "node-01")
        .await
        .unwrap()
        .iter()
        .map(|w| w.binding().queue())
        .collect();
    assert_eq!(
        queues,
        vec!["compile:1", "compile:1", "eval:1:1-0", "eval:1:1-1"]
    );

    // 架构不匹配只做编译
    assert_eq!(pool.build_workers(1, "node-02").await.unwrap().len(), 2);
    assert!(pool.build_workers(1, "node-03").await.unwrap().is_empty());
    assert!(pool.build_workers(1, "node-99").await.is_err());
    assert!(pool.build_workers(9, "node-01").await.is_err());
}

#[tokio::test]
async fn test_pool_stops_on_shutdown() {
    let registry = Arc::new(CancellationRegistry::new());
    let (pool, _) = pool(
        vec![MachineBuilder::new().with_gpu_count(1).build()],
        registry.clone(),
        1,
    );

    let handle = tokio::spawn(async move { pool.run(1, "node-01").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.shutdown();

    let stopped = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("pool should stop")
        .unwrap()
        .unwrap();
    assert_eq!(stopped, 2);
}
