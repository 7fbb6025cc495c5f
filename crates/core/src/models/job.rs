use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceKey;

/// 调优作业
///
/// 一个作业对应会话内一次配置调优尝试。作业只能通过原子状态转换被修改，
/// 除非被运维人员批量重置。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub session_id: i64,
    /// 待调优配置的不透明描述
    pub config_ref: String,
    /// 可选的求解器/策略提示
    pub solver: Option<String>,
    /// 分组标签
    pub reason: String,
    pub state: JobState,
    /// 最近一次被领取时的步骤
    pub step: Option<ResourceClass>,
    pub valid: bool,
    pub machine_id: Option<i64>,
    pub device: Option<i32>,
    /// 领取令牌，每次成功领取重新生成
    pub claim_token: Option<String>,
    pub retries: i32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 作业装载请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub session_id: i64,
    pub config_ref: String,
    pub solver: Option<String>,
    pub reason: String,
}

impl NewJob {
    pub fn new(session_id: i64, config_ref: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            session_id,
            config_ref: config_ref.into(),
            solver: None,
            reason: reason.into(),
        }
    }

    pub fn with_solver(mut self, solver: impl Into<String>) -> Self {
        self.solver = Some(solver.into());
        self
    }
}

/// 作业生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Running,
    Compiled,
    RunningEval,
    Evaluated,
    Errored,
    ErrorStatus,
    ErrorConfig,
    Aborted,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::New,
        JobState::Running,
        JobState::Compiled,
        JobState::RunningEval,
        JobState::Evaluated,
        JobState::Errored,
        JobState::ErrorStatus,
        JobState::ErrorConfig,
        JobState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Compiled => "compiled",
            JobState::RunningEval => "running_eval",
            JobState::Evaluated => "evaluated",
            JobState::Errored => "errored",
            JobState::ErrorStatus => "error_status",
            JobState::ErrorConfig => "error_config",
            JobState::Aborted => "aborted",
        }
    }

    /// 已被某个worker领取
    pub fn is_claimed(&self) -> bool {
        matches!(self, JobState::Running | JobState::RunningEval)
    }

    /// 不会再被自动调度的状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Evaluated | JobState::Aborted | JobState::ErrorConfig
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::Errored | JobState::ErrorStatus | JobState::ErrorConfig
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "running" => Ok(JobState::Running),
            "compiled" => Ok(JobState::Compiled),
            "running_eval" => Ok(JobState::RunningEval),
            "evaluated" => Ok(JobState::Evaluated),
            "errored" => Ok(JobState::Errored),
            "error_status" => Ok(JobState::ErrorStatus),
            "error_config" => Ok(JobState::ErrorConfig),
            "aborted" => Ok(JobState::Aborted),
            _ => Err(format!("Invalid job state: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<JobState>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 资源类别，同时也是作业的执行步骤
///
/// 编译以节点为粒度，评测以物理GPU为粒度。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Compile,
    Evaluate,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Compile => "compile",
            ResourceClass::Evaluate => "evaluate",
        }
    }

    /// 该类别可领取的起始状态
    pub fn ready_state(&self) -> JobState {
        match self {
            ResourceClass::Compile => JobState::New,
            ResourceClass::Evaluate => JobState::Compiled,
        }
    }

    /// 领取成功后的运行状态
    pub fn running_state(&self) -> JobState {
        match self {
            ResourceClass::Compile => JobState::Running,
            ResourceClass::Evaluate => JobState::RunningEval,
        }
    }

    /// 成功完成后的状态
    pub fn done_state(&self) -> JobState {
        match self {
            ResourceClass::Compile => JobState::Compiled,
            ResourceClass::Evaluate => JobState::Evaluated,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile" => Ok(ResourceClass::Compile),
            "evaluate" | "eval" => Ok(ResourceClass::Evaluate),
            _ => Err(format!("Invalid resource class: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for ResourceClass {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ResourceClass {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(s.parse::<ResourceClass>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ResourceClass {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 批量领取请求
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub session_id: i64,
    pub class: ResourceClass,
    /// 评测领取必须绑定到具体GPU，编译领取绑定到会话共享队列
    pub resource: Option<ResourceKey>,
    pub limit: i64,
    pub reason: Option<String>,
}

impl ClaimRequest {
    pub fn compile(session_id: i64, limit: i64) -> Self {
        Self {
            session_id,
            class: ResourceClass::Compile,
            resource: None,
            limit,
            reason: None,
        }
    }

    pub fn evaluate(session_id: i64, resource: ResourceKey, limit: i64) -> Self {
        Self {
            session_id,
            class: ResourceClass::Evaluate,
            resource: Some(resource),
            limit,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// 一次领取的结果，零个作业不是错误
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    pub claim_token: String,
    pub job_ids: Vec<i64>,
}

impl ClaimBatch {
    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.job_ids.len()
    }
}

/// 运维重置的目标状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetTarget {
    New,
    Compiled,
}

impl ResetTarget {
    pub fn state(&self) -> JobState {
        match self {
            ResetTarget::New => JobState::New,
            ResetTarget::Compiled => JobState::Compiled,
        }
    }
}

impl FromStr for ResetTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ResetTarget::New),
            "compiled" => Ok(ResetTarget::Compiled),
            _ => Err(format!("Invalid reset target: {s}")),
        }
    }
}

/// 批量重置的作业筛选条件
#[derive(Debug, Clone, Default)]
pub struct ResetFilter {
    pub session_id: i64,
    pub reason: Option<String>,
    /// 为空时匹配所有状态
    pub states: Vec<JobState>,
}

impl ResetFilter {
    pub fn session(session_id: i64) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_states(mut self, states: Vec<JobState>) -> Self {
        self.states = states;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        job.session_id == self.session_id
            && self.reason.as_ref().is_none_or(|r| &job.reason == r)
            && (self.states.is_empty() || self.states.contains(&job.state))
    }
}

impl Job {
    pub fn new(id: i64, new_job: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id,
            session_id: new_job.session_id,
            config_ref: new_job.config_ref,
            solver: new_job.solver,
            reason: new_job.reason,
            state: JobState::New,
            step: None,
            valid: true,
            machine_id: None,
            device: None,
            claim_token: None,
            retries: 0,
            claimed_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 该作业当前可被哪个资源类别领取
    pub fn claimable_by(&self) -> Option<ResourceClass> {
        if !self.valid {
            return None;
        }
        match self.state {
            JobState::New => Some(ResourceClass::Compile),
            JobState::Compiled => Some(ResourceClass::Evaluate),
            JobState::Errored | JobState::ErrorStatus => self.step,
            _ => None,
        }
    }

    /// 是否仍被指定令牌持有
    pub fn is_held_by(&self, claim_token: &str) -> bool {
        self.state.is_claimed() && self.claim_token.as_deref() == Some(claim_token)
    }
}
