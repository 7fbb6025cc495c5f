use serde::{Deserialize, Serialize};

use super::{JobState, ResourceClass};

/// 失败分类，对应不同的失败状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 一般执行错误
    Errored,
    /// 后端返回非零状态
    ErrorStatus,
    /// 配置本身无效，不会自动重试
    ErrorConfig,
}

impl FailureKind {
    pub fn state(&self) -> JobState {
        match self {
            FailureKind::Errored => JobState::Errored,
            FailureKind::ErrorStatus => JobState::ErrorStatus,
            FailureKind::ErrorConfig => JobState::ErrorConfig,
        }
    }
}

/// 后端执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Failure { kind: FailureKind, message: String },
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }
}

/// worker回报的作业结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: i64,
    /// 必须与作业当前的领取令牌一致才会生效
    pub claim_token: String,
    pub step: ResourceClass,
    pub result: JobResult,
    /// 失败是否归因于主机而非作业本身
    pub host_fault: bool,
}

impl JobOutcome {
    pub fn success(job_id: i64, claim_token: impl Into<String>, step: ResourceClass) -> Self {
        Self {
            job_id,
            claim_token: claim_token.into(),
            step,
            result: JobResult::Success,
            host_fault: false,
        }
    }

    pub fn failure(
        job_id: i64,
        claim_token: impl Into<String>,
        step: ResourceClass,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            claim_token: claim_token.into(),
            step,
            result: JobResult::Failure {
                kind,
                message: message.into(),
            },
            host_fault: false,
        }
    }

    pub fn with_host_fault(mut self, host_fault: bool) -> Self {
        self.host_fault = host_fault;
        self
    }
}

/// `report_outcome` 的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// 状态已推进
    Applied { from: JobState, to: JobState },
    /// 重复或过期的回报，未做任何修改
    Ignored { state: JobState },
}

impl ReportStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, ReportStatus::Applied { .. })
    }
}
