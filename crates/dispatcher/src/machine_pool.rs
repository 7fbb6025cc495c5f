use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info, warn};
use tuna_core::models::{Machine, ResourceKey, Session};
use tuna_core::traits::MachineRepository;
use tuna_core::{TunaError, TunaResult};

use crate::power::PowerControl;

/// 记录一次主机侧失败后的机器健康状况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHealth {
    /// 失败次数未达阈值
    Degraded { failures: i32 },
    /// 已从分配中移除
    Disabled,
    /// 带外恢复失败，需要人工处理
    Unreachable,
}

/// 机器池
///
/// 编译作业可以在任何可用机器上运行；评测作业要求机器的架构和计算单元数
/// 与会话完全一致。主机侧连续失败达到阈值后机器被移出分配。
pub struct MachinePool {
    machine_repo: Arc<dyn MachineRepository>,
    power: Option<Arc<dyn PowerControl>>,
    failure_threshold: i32,
}

impl MachinePool {
    pub fn new(machine_repo: Arc<dyn MachineRepository>, failure_threshold: i32) -> Self {
        Self {
            machine_repo,
            power: None,
            failure_threshold,
        }
    }

    pub fn with_power_control(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = Some(power);
        self
    }

    /// 可执行编译作业的机器
    pub async fn compile_machines(&self) -> TunaResult<Vec<Machine>> {
        self.machine_repo.list_allocatable().await
    }

    /// 会话可用的评测机器
    pub async fn eval_machines(&self, session: &Session) -> TunaResult<Vec<Machine>> {
        Ok(self
            .machine_repo
            .list_allocatable()
            .await?
            .into_iter()
            .filter(|m| m.matches_session(session))
            .collect())
    }

    /// 会话可用的全部评测设备，每块物理GPU一个
    pub async fn eval_devices(&self, session: &Session) -> TunaResult<Vec<ResourceKey>> {
        let devices = self
            .eval_machines(session)
            .await?
            .iter()
            .flat_map(|m| {
                (0..m.gpu_count).map(move |gpu| ResourceKey::Device {
                    machine_id: m.id,
                    gpu,
                })
            })
            .collect();
        Ok(devices)
    }

    /// 检查机器能否承接指定资源上的作业
    pub async fn can_run(&self, session: &Session, resource: ResourceKey) -> TunaResult<bool> {
        let machine = self
            .machine_repo
            .get_by_id(resource.machine_id())
            .await?
            .ok_or(TunaError::MachineNotFound {
                id: resource.machine_id(),
            })?;

        if !machine.is_allocatable() {
            return Ok(false);
        }
        Ok(match resource {
            ResourceKey::Node { .. } => true,
            ResourceKey::Device { gpu, .. } => {
                machine.matches_session(session) && gpu < machine.gpu_count
            }
        })
    }

    /// 记录一次归因于主机的失败
    pub async fn record_host_failure(&self, machine_id: i64) -> TunaResult<HostHealth> {
        let failures = self.machine_repo.record_host_failure(machine_id).await?;
        counter!("tuna_host_failures_total").increment(1);

        if failures < self.failure_threshold {
            debug!("机器 {} 主机侧失败 {} 次", machine_id, failures);
            return Ok(HostHealth::Degraded { failures });
        }

        warn!(
            "机器 {} 连续失败 {} 次，移出分配",
            machine_id, failures
        );
        self.machine_repo.set_available(machine_id, false).await?;

        let Some(power) = &self.power else {
            return Ok(HostHealth::Disabled);
        };
        let machine = self
            .machine_repo
            .get_by_id(machine_id)
            .await?
            .ok_or(TunaError::MachineNotFound { id: machine_id })?;
        if machine.power_address.is_none() {
            return Ok(HostHealth::Disabled);
        }

        match power.restart(&machine).await {
            Ok(()) => {
                info!("机器 {} 已通过带外电源控制重启", machine.hostname);
                Ok(HostHealth::Disabled)
            }
            Err(e) => {
                error!("机器 {} 带外恢复失败，标记为不可达: {}", machine.hostname, e);
                self.machine_repo.set_unreachable(machine_id, true).await?;
                counter!("tuna_machines_unreachable_total").increment(1);
                Ok(HostHealth::Unreachable)
            }
        }
    }

    /// 成功执行后清零失败计数
    pub async fn record_host_success(&self, machine_id: i64) -> TunaResult<()> {
        self.machine_repo.clear_host_failures(machine_id).await
    }
}
