use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tuna_core::models::queue_names;
use tuna_core::models::{JobOutcomeMessage, JobResult, Message, MessageType, ReportStatus};
use tuna_core::traits::{JobRepository, MessageQueue, RecordStaging};
use tuna_core::TunaResult;

use crate::machine_pool::{HostHealth, MachinePool};

/// 一次收集的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub applied: usize,
    pub ignored: usize,
    pub records_staged: usize,
    /// 处理失败后放回队列等待重试
    pub requeued: usize,
}

/// 结果收集器
///
/// 消费会话的结果队列，按状态机规则更新作业，并把成功评测产出的记录暂存到
/// 对应机器的文件中。重复或过期的结果不会重复暂存记录。
pub struct ResultCollector {
    job_repo: Arc<dyn JobRepository>,
    message_queue: Arc<dyn MessageQueue>,
    staging: Arc<dyn RecordStaging>,
    machine_pool: Arc<MachinePool>,
    max_retries: i32,
}

impl ResultCollector {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        message_queue: Arc<dyn MessageQueue>,
        staging: Arc<dyn RecordStaging>,
        machine_pool: Arc<MachinePool>,
        max_retries: i32,
    ) -> Self {
        Self {
            job_repo,
            message_queue,
            staging,
            machine_pool,
            max_retries,
        }
    }

    /// 处理单条结果消息
    ///
    /// 记录先于状态转换暂存：暂存失败时作业保持运行中且仍由原令牌持有，
    /// 结果可以重新投递。重新暂存写入相同的行，合并时属于平凡合并。
    pub async fn apply(&self, message: &JobOutcomeMessage) -> TunaResult<ReportStatus> {
        let outcome = &message.outcome;
        if outcome.result.is_success() && !message.records.is_empty() {
            self.stage_if_held(message).await?;
        }

        let status = self
            .job_repo
            .report_outcome(outcome, self.max_retries)
            .await?;

        let ReportStatus::Applied { from, to } = status else {
            return Ok(status);
        };
        debug!("作业 {} 结果生效: {} -> {}", outcome.job_id, from, to);

        if outcome.host_fault {
            match self.machine_pool.record_host_failure(message.machine_id).await? {
                HostHealth::Degraded { failures } => {
                    debug!("机器 {} 主机侧失败累计 {} 次", message.hostname, failures)
                }
                HostHealth::Disabled | HostHealth::Unreachable => {
                    warn!("机器 {} 已移出分配", message.hostname)
                }
            }
        } else if let JobResult::Success = outcome.result {
            self.machine_pool
                .record_host_success(message.machine_id)
                .await?;
        }

        Ok(status)
    }

    async fn stage_if_held(&self, message: &JobOutcomeMessage) -> TunaResult<()> {
        let outcome = &message.outcome;
        let held = self
            .job_repo
            .get_by_id(outcome.job_id)
            .await?
            .is_some_and(|job| job.is_held_by(&outcome.claim_token));
        if !held {
            debug!("作业 {} 已不由该令牌持有，跳过暂存", outcome.job_id);
            return Ok(());
        }
        self.staging
            .stage(message.session_id, &message.hostname, &message.records)
            .await
    }

    /// 取出结果队列中当前所有消息并处理
    pub async fn collect_once(&self, session_id: i64) -> TunaResult<CollectReport> {
        let queue = queue_names::outcomes(session_id);
        let messages = self.message_queue.consume_messages(&queue).await?;
        let mut report = CollectReport::default();

        for message in messages {
            self.handle_message(&message, &mut report).await;
        }

        if report.applied + report.ignored + report.requeued > 0 {
            info!(
                "会话 {} 收集结果: 生效 {}, 忽略 {}, 暂存记录 {}, 待重试 {}",
                session_id, report.applied, report.ignored, report.records_staged, report.requeued
            );
        }
        Ok(report)
    }

    /// 处理失败的消息放回结果队列，返回是否放回
    async fn handle_message(&self, message: &Message, report: &mut CollectReport) -> bool {
        let MessageType::JobOutcome(outcome) = &message.message_type else {
            warn!("结果队列收到非结果消息: {}", message.message_type_str());
            return false;
        };

        match self.apply(outcome).await {
            Ok(ReportStatus::Applied { .. }) => {
                report.applied += 1;
                if outcome.outcome.result.is_success() {
                    report.records_staged += outcome.records.len();
                }
                false
            }
            Ok(ReportStatus::Ignored { .. }) => {
                report.ignored += 1;
                false
            }
            Err(e) => {
                error!("处理作业 {} 的结果失败: {}", outcome.outcome.job_id, e);
                let queue = queue_names::outcomes(outcome.session_id);
                if let Err(e) = self.message_queue.publish_message(&queue, message).await {
                    error!("作业 {} 的结果无法放回队列: {}", outcome.outcome.job_id, e);
                    return false;
                }
                report.requeued += 1;
                true
            }
        }
    }

    /// 持续消费结果队列，直到收到关闭信号
    pub async fn run(
        &self,
        session_id: i64,
        receive_timeout: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let queue = queue_names::outcomes(session_id);
        info!("结果收集器启动: {}", queue);
        let mut report = CollectReport::default();

        loop {
            tokio::select! {
                received = self.message_queue.receive_message(&queue, receive_timeout) => {
                    match received {
                        Ok(Some(message)) => {
                            if self.handle_message(&message, &mut report).await {
                                tokio::time::sleep(receive_timeout).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("读取结果队列失败: {}", e);
                            tokio::time::sleep(receive_timeout).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(
                        "结果收集器收到停止信号，累计生效 {}, 忽略 {}",
                        report.applied, report.ignored
                    );
                    break;
                }
            }
        }
    }
}
