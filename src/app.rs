use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tuna_core::config::AppConfig;
use tuna_core::models::{
    GoldenVersion, JobState, Machine, NewJob, NewMachine, NewSession, ResetFilter, ResetTarget,
    Session,
};
use tuna_core::traits::{
    GoldenRepository, JobRepository, MachineRepository, MergedRecordRepository, MessageQueue,
    SessionRepository, TuningBackend,
};
use tuna_core::TunaError;
use tuna_dispatcher::{
    CollectReport, CommandPowerControl, DispatchReport, JobDispatcher, MachinePool, RecoverySweep,
    ResultCollector,
};
use tuna_infrastructure::{
    create_database_pool, FileRecordStaging, MessageQueueFactory, SqliteGoldenRepository,
    SqliteJobRepository, SqliteMachineRepository, SqliteMergedRecordRepository,
    SqliteSessionRepository,
};
use tuna_records::{import_merged_file, GoldenRequest, GoldenVersioner};
use tuna_worker::{CancellationRegistry, SentinelWatcher, ShellBackend, WorkerPool};

use crate::shutdown::ShutdownManager;

/// 单个会话一轮派发的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchRound {
    pub session_id: i64,
    pub collected: CollectReport,
    pub dispatched: DispatchReport,
}

/// 作业清单文件：每行一个配置引用，空行和 `#` 开头的行忽略
pub fn parse_job_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// 主应用程序
///
/// 持有数据库和消息队列，按子命令组装派发端或worker端的组件。
pub struct Application {
    config: AppConfig,
    session_repo: Arc<dyn SessionRepository>,
    machine_repo: Arc<dyn MachineRepository>,
    job_repo: Arc<dyn JobRepository>,
    merged_repo: Arc<dyn MergedRecordRepository>,
    golden_repo: Arc<dyn GoldenRepository>,
    message_queue: Arc<dyn MessageQueue>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = create_database_pool(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        let message_queue = MessageQueueFactory::create(&config.message_queue)
            .await
            .context("创建消息队列失败")?;

        Ok(Self {
            session_repo: Arc::new(SqliteSessionRepository::new(pool.clone())),
            machine_repo: Arc::new(SqliteMachineRepository::new(pool.clone())),
            job_repo: Arc::new(SqliteJobRepository::new(pool.clone())),
            merged_repo: Arc::new(SqliteMergedRecordRepository::new(pool.clone())),
            golden_repo: Arc::new(SqliteGoldenRepository::new(pool)),
            message_queue,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.config.message_queue.receive_timeout_seconds)
    }

    fn machine_pool(&self) -> Arc<MachinePool> {
        let mut pool = MachinePool::new(
            self.machine_repo.clone(),
            self.config.worker.host_failure_threshold,
        );
        if let Some(command) = &self.config.worker.power_command {
            pool = pool.with_power_control(Arc::new(CommandPowerControl::new(command.clone())));
        }
        Arc::new(pool)
    }

    fn dispatcher(&self, machine_pool: Arc<MachinePool>) -> JobDispatcher {
        JobDispatcher::new(
            self.session_repo.clone(),
            self.job_repo.clone(),
            self.message_queue.clone(),
            machine_pool,
            self.config.dispatcher.clone(),
        )
    }

    fn collector(&self, machine_pool: Arc<MachinePool>) -> ResultCollector {
        ResultCollector::new(
            self.job_repo.clone(),
            self.message_queue.clone(),
            Arc::new(FileRecordStaging::new(&self.config.worker.staging_dir)),
            machine_pool,
            self.config.dispatcher.max_job_retries,
        )
    }

    fn sweep(&self) -> RecoverySweep {
        RecoverySweep::new(
            self.job_repo.clone(),
            Duration::from_secs(self.config.dispatcher.stale_after_seconds),
            Duration::from_secs(self.config.dispatcher.sweep_interval_seconds),
        )
    }

    async fn require_session(&self, session_id: i64) -> Result<Session> {
        Ok(self
            .session_repo
            .get_by_id(session_id)
            .await?
            .ok_or(TunaError::SessionNotFound { id: session_id })?)
    }

    pub async fn add_session(&self, session: NewSession) -> Result<Session> {
        let session = self.session_repo.create(&session).await?;
        info!(
            "会话 {} 已创建: {}/{} 工具链 {}",
            session.id, session.arch, session.num_cu, session.toolchain_version
        );
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.session_repo.list().await?)
    }

    pub async fn add_machine(&self, machine: NewMachine) -> Result<Machine> {
        let machine = self.machine_repo.create(&machine).await?;
        info!(
            "机器 {} 已登记: {}/{} GPU {}",
            machine.hostname, machine.arch, machine.num_cu, machine.gpu_count
        );
        Ok(machine)
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        Ok(self.machine_repo.list().await?)
    }

    /// 手动上线或下线机器，上线时清除失败计数和不可达标记
    pub async fn set_machine_available(&self, hostname: &str, available: bool) -> Result<Machine> {
        let machine = self
            .machine_repo
            .get_by_hostname(hostname)
            .await?
            .ok_or_else(|| TunaError::Configuration(format!("机器未登记: {hostname}")))?;

        self.machine_repo.set_available(machine.id, available).await?;
        if available {
            self.machine_repo.set_unreachable(machine.id, false).await?;
            self.machine_repo.clear_host_failures(machine.id).await?;
        }
        info!(
            "机器 {} 已{}",
            hostname,
            if available { "上线" } else { "下线" }
        );

        Ok(self
            .machine_repo
            .get_by_id(machine.id)
            .await?
            .ok_or(TunaError::MachineNotFound { id: machine.id })?)
    }

    /// 从作业清单文件装载作业
    pub async fn load_jobs(
        &self,
        session_id: i64,
        path: &Path,
        reason: &str,
        solver: Option<&str>,
    ) -> Result<Vec<i64>> {
        self.require_session(session_id).await?;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("读取作业清单失败: {}", path.display()))?;

        let jobs: Vec<NewJob> = parse_job_list(&content)
            .into_iter()
            .map(|config_ref| {
                let job = NewJob::new(session_id, config_ref, reason);
                match solver {
                    Some(solver) => job.with_solver(solver),
                    None => job,
                }
            })
            .collect();
        if jobs.is_empty() {
            warn!("作业清单为空: {}", path.display());
            return Ok(Vec::new());
        }

        let ids = self.job_repo.create_batch(&jobs).await?;
        info!("会话 {} 装载作业 {} 个", session_id, ids.len());
        Ok(ids)
    }

    pub async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<i64>> {
        Ok(self.job_repo.requeue_stale(older_than).await?)
    }

    pub async fn reset(&self, filter: &ResetFilter, target: ResetTarget) -> Result<u64> {
        self.require_session(filter.session_id).await?;
        let count = self.job_repo.reset(filter, target).await?;
        info!("会话 {} 重置 {} 个作业为 {}", filter.session_id, count, target.state());
        Ok(count)
    }

    pub async fn status(&self, session_id: i64) -> Result<Vec<(JobState, i64)>> {
        self.require_session(session_id).await?;
        Ok(self.job_repo.state_counts(session_id).await?)
    }

    pub async fn import_merged(&self, session_id: i64, path: &Path) -> Result<u64> {
        self.require_session(session_id).await?;
        Ok(import_merged_file(path, session_id, self.merged_repo.as_ref()).await?)
    }

    pub async fn update_golden(&self, request: &GoldenRequest) -> Result<GoldenVersion> {
        let versioner = GoldenVersioner::new(
            self.session_repo.clone(),
            self.merged_repo.clone(),
            self.golden_repo.clone(),
        );
        Ok(versioner.update(request).await?)
    }

    /// 单轮处理：先收集结果，再回收陈旧领取，最后派发
    pub async fn dispatch_once(&self, session_ids: &[i64]) -> Result<Vec<DispatchRound>> {
        let machine_pool = self.machine_pool();
        let collector = self.collector(machine_pool.clone());
        let dispatcher = self.dispatcher(machine_pool);

        let mut rounds = Vec::with_capacity(session_ids.len());
        for &session_id in session_ids {
            let collected = collector.collect_once(session_id).await?;
            rounds.push(DispatchRound {
                session_id,
                collected,
                dispatched: DispatchReport::default(),
            });
        }

        let requeued = self.sweep().sweep_once().await?;
        if !requeued.is_empty() {
            info!("回收陈旧领取 {} 个", requeued.len());
        }

        for round in &mut rounds {
            round.dispatched = dispatcher.dispatch_session(round.session_id).await?;
        }
        Ok(rounds)
    }

    /// 持续运行派发器、回收任务和各会话的结果收集器，直到关闭
    pub async fn run_dispatcher(&self, session_ids: Vec<i64>, shutdown: &ShutdownManager) -> Result<()> {
        for &session_id in &session_ids {
            self.require_session(session_id).await?;
        }

        let machine_pool = self.machine_pool();
        let mut tasks = JoinSet::new();

        let dispatcher = self.dispatcher(machine_pool.clone());
        let shutdown_rx = shutdown.subscribe().await;
        let ids = session_ids.clone();
        tasks.spawn(async move { dispatcher.run(ids, shutdown_rx).await });

        let sweep = self.sweep();
        let shutdown_rx = shutdown.subscribe().await;
        tasks.spawn(async move { sweep.run(shutdown_rx).await });

        for session_id in session_ids {
            let collector = self.collector(machine_pool.clone());
            let shutdown_rx = shutdown.subscribe().await;
            let receive_timeout = self.receive_timeout();
            tasks.spawn(async move { collector.run(session_id, receive_timeout, shutdown_rx).await });
        }

        info!("派发端已启动 {} 个后台任务", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("派发端任务异常退出: {}", e);
            }
        }
        Ok(())
    }

    /// 以配置中的命令后端运行本机worker
    pub async fn run_worker(
        &self,
        session_id: i64,
        hostname: &str,
        shutdown: &ShutdownManager,
    ) -> Result<usize> {
        let backend = Arc::new(ShellBackend::new(&self.config.worker));
        self.run_worker_with(session_id, hostname, backend, shutdown)
            .await
    }

    /// 运行本机worker，直到关闭或被取消标记终止，返回退出的worker数
    pub async fn run_worker_with(
        &self,
        session_id: i64,
        hostname: &str,
        backend: Arc<dyn TuningBackend>,
        shutdown: &ShutdownManager,
    ) -> Result<usize> {
        let registry = Arc::new(CancellationRegistry::new());
        let watcher = Arc::new(SentinelWatcher::new(
            &self.config.worker.sentinel_dir,
            registry.clone(),
            Duration::from_secs(self.config.worker.sentinel_poll_seconds),
        ));
        // 启动前已存在的标记先生效
        let present = watcher.check_once().await?;
        if !present.is_empty() {
            warn!("启动时已存在 {} 个取消标记", present.len());
        }

        let local = shutdown.token();
        let watcher_task = tokio::spawn({
            let watcher = watcher.clone();
            let token = local.clone();
            async move { watcher.run(token).await }
        });
        let bridge_task = tokio::spawn({
            let registry = registry.clone();
            let token = local.clone();
            async move {
                token.cancelled().await;
                registry.shutdown();
            }
        });

        let pool = WorkerPool::new(
            self.session_repo.clone(),
            self.machine_repo.clone(),
            self.job_repo.clone(),
            self.message_queue.clone(),
            backend,
            registry,
            self.config.worker.clone(),
            self.receive_timeout(),
        );
        let result = pool.run(session_id, hostname).await;

        local.cancel();
        for task in [watcher_task, bridge_task] {
            if let Err(e) = task.await {
                error!("worker辅助任务异常退出: {}", e);
            }
        }
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_list_skips_comments_and_blanks() {
        let content = "# 第一批\nconv-a\n\n  conv-b  \r\n#conv-c\n";
        assert_eq!(parse_job_list(content), vec!["conv-a", "conv-b"]);
    }
}
