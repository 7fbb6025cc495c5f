use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use tuna_core::config::DispatcherConfig;
use tuna_core::models::queue_names;
use tuna_core::models::{
    ClaimBatch, ClaimRequest, JobDispatchMessage, Message, ResourceClass, ResourceKey, Session,
};
use tuna_core::traits::{JobRepository, MessageQueue, SessionRepository};
use tuna_core::{TunaError, TunaResult};

use crate::machine_pool::MachinePool;

/// 一轮派发的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub compile: usize,
    pub evaluate: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.compile + self.evaluate
    }
}

/// 作业派发器
///
/// 每个会话一个编译队列，由所有编译机器共享；每个(会话, 设备)一个评测队列，
/// 保证每块物理GPU同一时间只有一个在途作业。队列中未被取走的消息数加上本轮
/// 领取数不超过 `batch_size`。
pub struct JobDispatcher {
    session_repo: Arc<dyn SessionRepository>,
    job_repo: Arc<dyn JobRepository>,
    message_queue: Arc<dyn MessageQueue>,
    machine_pool: Arc<MachinePool>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(
        session_repo: Arc<dyn SessionRepository>,
        job_repo: Arc<dyn JobRepository>,
        message_queue: Arc<dyn MessageQueue>,
        machine_pool: Arc<MachinePool>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            session_repo,
            job_repo,
            message_queue,
            machine_pool,
            config,
        }
    }

    /// 对会话执行一轮派发
    #[instrument(skip(self))]
    pub async fn dispatch_session(&self, session_id: i64) -> TunaResult<DispatchReport> {
        let session = self
            .session_repo
            .get_by_id(session_id)
            .await?
            .ok_or(TunaError::SessionNotFound { id: session_id })?;

        let mut report = DispatchReport::default();

        if self.machine_pool.compile_machines().await?.is_empty() {
            debug!("会话 {} 没有可用的编译机器，跳过编译派发", session.id);
        } else {
            let queue = queue_names::compile(session.id);
            report.compile = self
                .fill_queue(&session, ResourceClass::Compile, None, &queue)
                .await?;
        }

        for device in self.machine_pool.eval_devices(&session).await? {
            let Some(index) = device.device_index() else {
                continue;
            };
            let queue = queue_names::eval(session.id, &index);
            report.evaluate += self
                .fill_queue(&session, ResourceClass::Evaluate, Some(device), &queue)
                .await?;
        }

        if report.total() > 0 {
            info!(
                "会话 {} 派发完成: 编译 {} 个, 评测 {} 个",
                session.id, report.compile, report.evaluate
            );
        }
        Ok(report)
    }

    /// 按队列深度补足到 `batch_size`
    async fn fill_queue(
        &self,
        session: &Session,
        class: ResourceClass,
        resource: Option<ResourceKey>,
        queue: &str,
    ) -> TunaResult<usize> {
        let depth = self.message_queue.get_queue_size(queue).await? as i64;
        let limit = self.config.batch_size - depth;
        if limit <= 0 {
            debug!("队列 {} 已有 {} 条消息，本轮不派发", queue, depth);
            return Ok(0);
        }

        let mut request = match resource {
            Some(resource) => ClaimRequest::evaluate(session.id, resource, limit),
            None => ClaimRequest::compile(session.id, limit),
        };
        if let Some(reason) = &self.config.reason {
            request = request.with_reason(reason.clone());
        }

        let batch = self.job_repo.claim_batch(&request).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        self.publish_batch(session.id, class, resource, queue, &batch)
            .await
    }

    async fn publish_batch(
        &self,
        session_id: i64,
        step: ResourceClass,
        resource: Option<ResourceKey>,
        queue: &str,
        batch: &ClaimBatch,
    ) -> TunaResult<usize> {
        let mut published = 0;
        for job_id in &batch.job_ids {
            let message = Message::job_dispatch(JobDispatchMessage {
                job_id: *job_id,
                session_id,
                step,
                claim_token: batch.claim_token.clone(),
                resource,
            });

            // 发布失败的作业保持已领取状态，由陈旧回收重新放回
            match self.message_queue.publish_message(queue, &message).await {
                Ok(()) => published += 1,
                Err(e) => error!("作业 {} 发布到队列 {} 失败: {}", job_id, queue, e),
            }
        }

        counter!("tuna_jobs_dispatched_total", "class" => step.as_str())
            .increment(published as u64);
        if published < batch.len() {
            warn!(
                "队列 {} 只发布了 {}/{} 个作业",
                queue,
                published,
                batch.len()
            );
        }
        Ok(published)
    }

    /// 周期派发，直到收到关闭信号
    pub async fn run(&self, session_ids: Vec<i64>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.dispatch_interval_seconds));
        info!("派发器启动，会话: {:?}", session_ids);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for session_id in &session_ids {
                        if let Err(e) = self.dispatch_session(*session_id).await {
                            error!("会话 {} 派发失败: {}", session_id, e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("派发器收到停止信号");
                    break;
                }
            }
        }
    }
}
