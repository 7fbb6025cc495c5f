use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tuna_core::models::queue_names;
use tuna_core::models::{
    FailureKind, JobDispatchMessage, JobOutcome, JobOutcomeMessage, JobResult, Machine, Message,
    MessageType, ResourceClass, ResourceKey, Session,
};
use tuna_core::traits::{
    BackendOutput, ExecutionContext, JobRepository, MessageQueue, TuningBackend,
};
use tuna_core::TunaResult;

/// worker绑定的资源和队列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBinding {
    pub session_id: i64,
    pub resource: ResourceKey,
    /// 编译槽位序号，评测worker为0
    pub slot: u32,
}

impl WorkerBinding {
    pub fn compile(session_id: i64, machine_id: i64, slot: u32) -> Self {
        Self {
            session_id,
            resource: ResourceKey::Node { machine_id },
            slot,
        }
    }

    pub fn device(session_id: i64, machine_id: i64, gpu: i32) -> Self {
        Self {
            session_id,
            resource: ResourceKey::Device { machine_id, gpu },
            slot: 0,
        }
    }

    pub fn class(&self) -> ResourceClass {
        self.resource.class()
    }

    /// 编译worker消费会话共享队列，评测worker只消费自己设备的队列
    pub fn queue(&self) -> String {
        match self.resource.device_index() {
            Some(index) => queue_names::eval(self.session_id, &index),
            None => queue_names::compile(self.session_id),
        }
    }
}

impl fmt::Display for WorkerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource {
            ResourceKey::Node { machine_id } => {
                write!(f, "compile[{}:{}#{}]", self.session_id, machine_id, self.slot)
            }
            ResourceKey::Device { machine_id, gpu } => {
                write!(f, "eval[{}:{}-{}]", self.session_id, machine_id, gpu)
            }
        }
    }
}

/// 处理一次队列消息的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// 等待超时，没有取到任务
    Idle,
    /// 取消令牌已触发，worker应退出循环
    Cancelled,
    /// 作业已不处于预期状态或已换了领取者，未执行
    Skipped { job_id: i64 },
    /// 后端已执行并回报了结果
    Completed { job_id: i64, success: bool },
}

/// 绑定到单个资源的worker
///
/// 每次只处理一个作业。取消只在任务边界检查，已开始执行的作业总会执行完并回报；
/// 取出消息后发现已取消则直接退出，不回报失败，作业领取留给陈旧回收。
pub struct Worker {
    binding: WorkerBinding,
    session: Session,
    machine: Machine,
    job_repo: Arc<dyn JobRepository>,
    message_queue: Arc<dyn MessageQueue>,
    backend: Arc<dyn TuningBackend>,
    cancel: CancellationToken,
    receive_timeout: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        binding: WorkerBinding,
        session: Session,
        machine: Machine,
        job_repo: Arc<dyn JobRepository>,
        message_queue: Arc<dyn MessageQueue>,
        backend: Arc<dyn TuningBackend>,
        cancel: CancellationToken,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            binding,
            session,
            machine,
            job_repo,
            message_queue,
            backend,
            cancel,
            receive_timeout,
        }
    }

    pub fn binding(&self) -> WorkerBinding {
        self.binding
    }

    /// 取一条任务并处理
    pub async fn process_next(&self) -> TunaResult<WorkerStep> {
        if self.cancel.is_cancelled() {
            return Ok(WorkerStep::Cancelled);
        }

        let queue = self.binding.queue();
        // 只有等待任务的阶段可以被取消打断
        let received = tokio::select! {
            received = self.message_queue.receive_message(&queue, self.receive_timeout) => received?,
            _ = self.cancel.cancelled() => return Ok(WorkerStep::Cancelled),
        };
        let Some(message) = received else {
            return Ok(WorkerStep::Idle);
        };

        let MessageType::JobDispatch(dispatch) = message.message_type else {
            warn!("{} 收到非派发消息，已丢弃", self.binding);
            return Ok(WorkerStep::Idle);
        };

        if self.cancel.is_cancelled() {
            info!(
                "{} 已取消，作业 {} 留待回收",
                self.binding, dispatch.job_id
            );
            return Ok(WorkerStep::Cancelled);
        }

        self.handle_dispatch(dispatch).await
    }

    async fn handle_dispatch(&self, dispatch: JobDispatchMessage) -> TunaResult<WorkerStep> {
        let job_id = dispatch.job_id;
        let class = self.binding.class();

        if dispatch.session_id != self.binding.session_id || dispatch.step != class {
            warn!(
                "{} 收到不属于本队列的作业 {} ({} / {})",
                self.binding, job_id, dispatch.session_id, dispatch.step
            );
            return Ok(WorkerStep::Skipped { job_id });
        }

        let Some(job) = self.job_repo.get_by_id(job_id).await? else {
            warn!("{} 找不到作业 {}", self.binding, job_id);
            return Ok(WorkerStep::Skipped { job_id });
        };

        // 执行前确认作业仍处于运行状态且仍由这次领取持有
        let started = self
            .job_repo
            .begin_execution(
                job_id,
                &dispatch.claim_token,
                class.running_state(),
                self.binding.resource,
            )
            .await?;
        if !started {
            debug!(
                "{} 跳过作业 {}: 当前状态 {}，领取已失效",
                self.binding, job_id, job.state
            );
            counter!("tuna_jobs_skipped_total", "step" => class.as_str()).increment(1);
            return Ok(WorkerStep::Skipped { job_id });
        }

        let ctx = ExecutionContext {
            job,
            session: self.session.clone(),
            machine: self.machine.clone(),
            step: class,
            device: self.binding.resource.device(),
        };

        let output = match self.backend.execute(&ctx).await {
            Ok(output) => output,
            Err(e) => {
                error!("{} 执行作业 {} 出错: {}", self.binding, job_id, e);
                BackendOutput {
                    result: JobResult::Failure {
                        kind: FailureKind::Errored,
                        message: e.to_string(),
                    },
                    host_fault: false,
                    records: Vec::new(),
                    duration_ms: 0,
                }
            }
        };

        let success = output.result.is_success();
        let outcome = JobOutcome {
            job_id,
            claim_token: dispatch.claim_token,
            step: class,
            result: output.result,
            host_fault: output.host_fault,
        };
        let message = Message::job_outcome(JobOutcomeMessage {
            session_id: self.binding.session_id,
            machine_id: self.machine.id,
            hostname: self.machine.hostname.clone(),
            outcome,
            records: output.records,
        });
        self.message_queue
            .publish_message(&queue_names::outcomes(self.binding.session_id), &message)
            .await?;

        counter!(
            "tuna_jobs_executed_total",
            "step" => class.as_str(),
            "result" => if success { "success" } else { "failure" }
        )
        .increment(1);
        Ok(WorkerStep::Completed { job_id, success })
    }

    /// 循环处理任务，直到取消令牌触发
    pub async fn run(&self) {
        info!("{} 启动，队列: {}", self.binding, self.binding.queue());
        let mut completed = 0usize;

        loop {
            match self.process_next().await {
                Ok(WorkerStep::Cancelled) => break,
                Ok(WorkerStep::Completed { .. }) => completed += 1,
                Ok(WorkerStep::Idle) | Ok(WorkerStep::Skipped { .. }) => {}
                Err(e) => {
                    error!("{} 处理任务失败: {}", self.binding, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.receive_timeout) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }

        info!("{} 停止，共完成 {} 个作业", self.binding, completed);
    }
}
