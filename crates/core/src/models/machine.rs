use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Session;

/// 计算节点
///
/// 机器从不删除，只通过 `available` / `unreachable` 标记控制是否参与分配。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub id: i64,
    pub hostname: String,
    /// 远程执行地址
    pub address: String,
    pub ssh_port: i32,
    pub ssh_user: String,
    pub arch: String,
    pub num_cu: i32,
    /// 可用于评测的物理GPU数量
    pub gpu_count: i32,
    /// 带外电源控制地址
    pub power_address: Option<String>,
    pub available: bool,
    pub unreachable: bool,
    /// 连续的主机侧失败次数
    pub host_failures: i32,
    pub updated_at: DateTime<Utc>,
}

/// 机器登记请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMachine {
    pub hostname: String,
    pub address: String,
    pub ssh_port: i32,
    pub ssh_user: String,
    pub arch: String,
    pub num_cu: i32,
    pub gpu_count: i32,
    pub power_address: Option<String>,
}

impl Machine {
    pub fn new(id: i64, new_machine: NewMachine) -> Self {
        Self {
            id,
            hostname: new_machine.hostname,
            address: new_machine.address,
            ssh_port: new_machine.ssh_port,
            ssh_user: new_machine.ssh_user,
            arch: new_machine.arch,
            num_cu: new_machine.num_cu,
            gpu_count: new_machine.gpu_count,
            power_address: new_machine.power_address,
            available: true,
            unreachable: false,
            host_failures: 0,
            updated_at: Utc::now(),
        }
    }

    /// 可参与分配：可用且未被标记为不可达
    pub fn is_allocatable(&self) -> bool {
        self.available && !self.unreachable
    }

    /// 评测要求架构和计算单元数与会话完全一致
    pub fn matches_session(&self, session: &Session) -> bool {
        self.arch == session.arch && self.num_cu == session.num_cu
    }
}
