use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tuna_core::config::WorkerConfig;
use tuna_core::traits::{JobRepository, MachineRepository, MessageQueue, SessionRepository, TuningBackend};
use tuna_core::{TunaError, TunaResult};

use crate::cancellation::CancellationRegistry;
use crate::worker::{Worker, WorkerBinding};

/// 单台机器上的worker集合
///
/// 按配置启动若干编译槽位worker；机器架构与会话一致时，每块GPU再启动一个评测worker。
/// 所有worker共享机器的取消令牌。
pub struct WorkerPool {
    session_repo: Arc<dyn SessionRepository>,
    machine_repo: Arc<dyn MachineRepository>,
    job_repo: Arc<dyn JobRepository>,
    message_queue: Arc<dyn MessageQueue>,
    backend: Arc<dyn TuningBackend>,
    registry: Arc<CancellationRegistry>,
    config: WorkerConfig,
    receive_timeout: Duration,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_repo: Arc<dyn SessionRepository>,
        machine_repo: Arc<dyn MachineRepository>,
        job_repo: Arc<dyn JobRepository>,
        message_queue: Arc<dyn MessageQueue>,
        backend: Arc<dyn TuningBackend>,
        registry: Arc<CancellationRegistry>,
        config: WorkerConfig,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            session_repo,
            machine_repo,
            job_repo,
            message_queue,
            backend,
            registry,
            config,
            receive_timeout,
        }
    }

    /// 为指定机器构建会话的worker
    pub async fn build_workers(&self, session_id: i64, hostname: &str) -> TunaResult<Vec<Worker>> {
        let session = self
            .session_repo
            .get_by_id(session_id)
            .await?
            .ok_or(TunaError::SessionNotFound { id: session_id })?;
        let machine = self
            .machine_repo
            .get_by_hostname(hostname)
            .await?
            .ok_or_else(|| TunaError::Configuration(format!("机器未登记: {hostname}")))?;

        if !machine.is_allocatable() {
            warn!("机器 {} 当前不可分配，不启动worker", hostname);
            return Ok(Vec::new());
        }

        let mut bindings: Vec<WorkerBinding> = (0..self.config.compile_slots_per_machine)
            .map(|slot| WorkerBinding::compile(session.id, machine.id, slot))
            .collect();
        if machine.matches_session(&session) {
            bindings.extend(
                (0..machine.gpu_count).map(|gpu| WorkerBinding::device(session.id, machine.id, gpu)),
            );
        } else {
            info!(
                "机器 {} ({}/{}) 与会话 {} ({}/{}) 不匹配，只启动编译worker",
                hostname, machine.arch, machine.num_cu, session.id, session.arch, session.num_cu
            );
        }

        let cancel = self.registry.token_for(machine.id, &machine.arch);
        Ok(bindings
            .into_iter()
            .map(|binding| {
                Worker::new(
                    binding,
                    session.clone(),
                    machine.clone(),
                    self.job_repo.clone(),
                    self.message_queue.clone(),
                    self.backend.clone(),
                    cancel.clone(),
                    self.receive_timeout,
                )
            })
            .collect())
    }

    /// 启动所有worker并等待它们退出，返回退出的worker数
    pub async fn run(&self, session_id: i64, hostname: &str) -> TunaResult<usize> {
        let workers = self.build_workers(session_id, hostname).await?;
        if workers.is_empty() {
            return Ok(0);
        }

        info!(
            "机器 {} 启动 {} 个worker，后端: {}",
            hostname,
            workers.len(),
            self.backend.name()
        );

        let mut tasks = JoinSet::new();
        for worker in workers {
            tasks.spawn(async move {
                worker.run().await;
                worker.binding()
            });
        }

        let mut stopped = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(binding) => {
                    stopped += 1;
                    info!("{} 已退出", binding);
                }
                Err(e) => error!("worker任务异常退出: {}", e),
            }
        }
        Ok(stopped)
    }
}
