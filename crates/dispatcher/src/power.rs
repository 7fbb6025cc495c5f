use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};
use tuna_core::models::Machine;
use tuna_core::{TunaError, TunaResult};

/// 带外电源控制
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// 重启机器，失败表示机器已无法通过带外方式恢复
    async fn restart(&self, machine: &Machine) -> TunaResult<()>;
}

/// 通过外部命令执行电源控制
///
/// 命令模板支持 `{power_address}` 和 `{hostname}` 占位符，由 `sh -c` 执行。
pub struct CommandPowerControl {
    template: String,
}

impl CommandPowerControl {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, machine: &Machine) -> TunaResult<String> {
        let address = machine.power_address.as_deref().ok_or_else(|| {
            TunaError::Configuration(format!("机器 {} 未配置带外电源地址", machine.hostname))
        })?;
        Ok(self
            .template
            .replace("{power_address}", address)
            .replace("{hostname}", &machine.hostname))
    }
}

#[async_trait]
impl PowerControl for CommandPowerControl {
    async fn restart(&self, machine: &Machine) -> TunaResult<()> {
        let command = self.render(machine)?;
        info!("重启机器 {}: {}", machine.hostname, command);

        let status = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            warn!("机器 {} 电源控制命令失败: {}", machine.hostname, status);
            Err(TunaError::Backend(format!(
                "电源控制命令退出状态 {status}"
            )))
        }
    }
}
