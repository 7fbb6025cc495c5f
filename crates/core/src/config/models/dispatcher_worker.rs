use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// 单次领取的作业上限
    pub batch_size: i64,
    pub dispatch_interval_seconds: u64,
    /// 失败次数超过该值的作业进入 aborted
    pub max_job_retries: i32,
    /// 运行超过该时长的领取视为陈旧
    pub stale_after_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// 仅调度带该标签的作业
    pub reason: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            dispatch_interval_seconds: 5,
            max_job_retries: 10,
            stale_after_seconds: 7200,
            sweep_interval_seconds: 300,
            reason: None,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size <= 0 {
            return Err(anyhow::anyhow!("批量大小必须大于0"));
        }

        if self.dispatch_interval_seconds == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.max_job_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }

        if self.stale_after_seconds == 0 {
            return Err(anyhow::anyhow!("陈旧阈值必须大于0"));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("回收间隔必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 每台机器的编译槽位数
    pub compile_slots_per_machine: u32,
    /// 性能记录暂存目录
    pub staging_dir: String,
    /// 取消标记所在目录
    pub sentinel_dir: String,
    pub sentinel_poll_seconds: u64,
    /// 后端命令模板，支持 {config} {step} {job_id} {session} {device} {solver} {arch} {num_cu}
    pub backend_command: String,
    /// 远程执行前缀，支持 {user} {address} {port}；为空表示本地执行
    pub remote_shell: Option<String>,
    pub backend_timeout_seconds: u64,
    /// 连续主机侧失败达到该值后机器下线
    pub host_failure_threshold: i32,
    /// 带外重启命令，支持 {power_address} {hostname}
    pub power_command: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            compile_slots_per_machine: 1,
            staging_dir: "/tmp/tuna/staging".to_string(),
            sentinel_dir: "/tmp".to_string(),
            sentinel_poll_seconds: 5,
            backend_command: "tuna-backend --step {step} --config {config}".to_string(),
            remote_shell: None,
            backend_timeout_seconds: 3600,
            host_failure_threshold: 3,
            power_command: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compile_slots_per_machine == 0 {
            return Err(anyhow::anyhow!("编译槽位数必须大于0"));
        }

        if self.staging_dir.is_empty() {
            return Err(anyhow::anyhow!("暂存目录不能为空"));
        }

        if self.sentinel_dir.is_empty() {
            return Err(anyhow::anyhow!("取消标记目录不能为空"));
        }

        if self.sentinel_poll_seconds == 0 {
            return Err(anyhow::anyhow!("取消标记轮询间隔必须大于0"));
        }

        if self.backend_command.trim().is_empty() {
            return Err(anyhow::anyhow!("后端命令不能为空"));
        }

        if self.backend_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("后端超时时间必须大于0"));
        }

        if self.host_failure_threshold <= 0 {
            return Err(anyhow::anyhow!("主机失败阈值必须大于0"));
        }

        Ok(())
    }
}
