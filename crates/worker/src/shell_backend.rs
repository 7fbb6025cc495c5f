use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tuna_core::config::WorkerConfig;
use tuna_core::models::{FailureKind, JobResult, PerformanceRecord, Provenance};
use tuna_core::traits::{BackendOutput, ExecutionContext, TuningBackend};
use tuna_core::TunaResult;

/// 远程shell连接失败时的退出码
const REMOTE_SHELL_FAILURE: i32 = 255;
/// 后端约定的配置无效退出码
const CONFIG_ERROR_EXIT: i32 = 2;
const MAX_MESSAGE_LEN: usize = 512;

/// 通过shell命令调用调优后端
///
/// 命令模板渲染后由 `sh -c` 执行，配置了远程前缀时整体加引号后交给远程shell。
/// 后端在stdout中以 `key=value` 行输出性能记录，其余输出忽略。
///
/// 退出码约定：0 成功；2 配置无效；其他非零为执行失败。启动失败、超时以及
/// 远程shell返回255视为主机侧失败。
pub struct ShellBackend {
    command_template: String,
    remote_shell: Option<String>,
    timeout: Duration,
}

impl ShellBackend {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command_template: config.backend_command.clone(),
            remote_shell: config.remote_shell.clone(),
            timeout: Duration::from_secs(config.backend_timeout_seconds),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 渲染最终执行的命令行
    pub fn render(&self, ctx: &ExecutionContext) -> String {
        let device = ctx.device.map(|d| d.to_string()).unwrap_or_default();
        let command = self
            .command_template
            .replace("{config}", &ctx.job.config_ref)
            .replace("{step}", ctx.step.as_str())
            .replace("{job_id}", &ctx.job.id.to_string())
            .replace("{session}", &ctx.session.id.to_string())
            .replace("{device}", &device)
            .replace("{solver}", ctx.job.solver.as_deref().unwrap_or(""))
            .replace("{arch}", &ctx.session.arch)
            .replace("{num_cu}", &ctx.session.num_cu.to_string());

        match &self.remote_shell {
            Some(prefix) => {
                let prefix = prefix
                    .replace("{user}", &ctx.machine.ssh_user)
                    .replace("{address}", &ctx.machine.address)
                    .replace("{port}", &ctx.machine.ssh_port.to_string());
                format!("{} {}", prefix, shell_quote(&command))
            }
            None => command,
        }
    }

    fn host_failure(message: String, started: Instant) -> BackendOutput {
        BackendOutput {
            result: JobResult::Failure {
                kind: FailureKind::ErrorStatus,
                message,
            },
            host_fault: true,
            records: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn classify(&self, code: Option<i32>, stderr: &str) -> (JobResult, bool) {
        let message = || tail(stderr, code);
        match code {
            Some(0) => (JobResult::Success, false),
            Some(CONFIG_ERROR_EXIT) => (
                JobResult::Failure {
                    kind: FailureKind::ErrorConfig,
                    message: message(),
                },
                false,
            ),
            Some(REMOTE_SHELL_FAILURE) if self.remote_shell.is_some() => (
                JobResult::Failure {
                    kind: FailureKind::ErrorStatus,
                    message: message(),
                },
                true,
            ),
            Some(_) => (
                JobResult::Failure {
                    kind: FailureKind::ErrorStatus,
                    message: message(),
                },
                false,
            ),
            // 被信号终止
            None => (
                JobResult::Failure {
                    kind: FailureKind::Errored,
                    message: message(),
                },
                false,
            ),
        }
    }
}

#[async_trait]
impl TuningBackend for ShellBackend {
    async fn execute(&self, ctx: &ExecutionContext) -> TunaResult<BackendOutput> {
        let started = Instant::now();
        let command_line = self.render(ctx);
        debug!("执行后端命令: job_id={}, command={}", ctx.job.id, command_line);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("启动后端命令失败: job_id={}, error={}", ctx.job.id, e);
                return Ok(Self::host_failure(format!("启动后端命令失败: {e}"), started));
            }
        };

        // 超时后future被丢弃，kill_on_drop负责结束子进程
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(Self::host_failure(format!("等待后端进程失败: {e}"), started));
            }
            Err(_) => {
                warn!(
                    "后端命令超时: job_id={}, timeout={}s",
                    ctx.job.id,
                    self.timeout.as_secs()
                );
                return Ok(Self::host_failure(
                    format!("后端命令超时 ({}s)", self.timeout.as_secs()),
                    started,
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        let (result, host_fault) = self.classify(code, &stderr);
        let records = parse_records(&stdout, &ctx.machine.hostname);

        let duration_ms = started.elapsed().as_millis() as u64;
        histogram!("tuna_backend_duration_seconds", "step" => ctx.step.as_str())
            .record(duration_ms as f64 / 1000.0);
        info!(
            "后端执行完成: job_id={}, step={}, success={}, exit_code={:?}, records={}, duration={}ms",
            ctx.job.id,
            ctx.step,
            result.is_success(),
            code,
            records.len(),
            duration_ms
        );

        Ok(BackendOutput {
            result,
            host_fault,
            records,
            duration_ms,
        })
    }

    fn name(&self) -> &str {
        "shell"
    }
}

/// 单引号包裹，内部单引号转义为 `'\''`
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn tail(stderr: &str, code: Option<i32>) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return format!("后端退出码: {code:?}");
    }
    let start = trimmed
        .char_indices()
        .rev()
        .nth(MAX_MESSAGE_LEN - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

/// 解析后端stdout中的 `key=value` 行，来源记为 `hostname:行号`
fn parse_records(stdout: &str, hostname: &str) -> Vec<PerformanceRecord> {
    stdout
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let (key, value) = line.trim().split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(PerformanceRecord::new(
                key,
                value,
                Provenance::new(hostname, index + 1),
            ))
        })
        .collect()
}
