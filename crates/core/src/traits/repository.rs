//! 数据仓储层接口定义
//!
//! - `SessionRepository` - 调优会话
//! - `MachineRepository` - 计算节点登记与健康标记
//! - `JobRepository` - 作业生命周期，提供原子领取和条件状态转换
//! - `MergedRecordRepository` - 会话合并后的规范记录
//! - `GoldenRepository` - 只追加的Golden版本快照
//!
//! 所有接口返回 `TunaResult<T>`，实现需满足 `Send + Sync`。

use std::time::Duration;

use async_trait::async_trait;

use crate::models::{
    ClaimBatch, ClaimRequest, GoldenRecord, GoldenSnapshot, GoldenVersion, Job, JobOutcome,
    JobState, Machine, MergedRecord, NewJob, NewMachine, NewSession, ReportStatus, ResetFilter,
    ResetTarget, ResourceKey, Session,
};
use crate::TunaResult;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &NewSession) -> TunaResult<Session>;

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Session>>;

    async fn list(&self) -> TunaResult<Vec<Session>>;
}

#[async_trait]
pub trait MachineRepository: Send + Sync {
    async fn create(&self, machine: &NewMachine) -> TunaResult<Machine>;

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Machine>>;

    async fn get_by_hostname(&self, hostname: &str) -> TunaResult<Option<Machine>>;

    async fn list(&self) -> TunaResult<Vec<Machine>>;

    /// 可用且未被标记为不可达的机器
    async fn list_allocatable(&self) -> TunaResult<Vec<Machine>>;

    async fn set_available(&self, id: i64, available: bool) -> TunaResult<()>;

    async fn set_unreachable(&self, id: i64, unreachable: bool) -> TunaResult<()>;

    /// 累加主机侧失败次数，返回累加后的值
    async fn record_host_failure(&self, id: i64) -> TunaResult<i32>;

    async fn clear_host_failures(&self, id: i64) -> TunaResult<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 批量装载作业，返回新作业ID
    async fn create_batch(&self, jobs: &[NewJob]) -> TunaResult<Vec<i64>>;

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Job>>;

    /// 原子地领取至多 `limit` 个可调度作业
    ///
    /// 领取是一次条件状态转换，并发领取同一作业时只有一方成功。
    /// 没有可领取的作业时返回空批次而不是错误。
    async fn claim_batch(&self, request: &ClaimRequest) -> TunaResult<ClaimBatch>;

    /// worker执行前的比较并设置检查
    ///
    /// 仅当作业仍处于 `expected` 状态、仍由 `claim_token` 持有且绑定资源一致时
    /// 记录开始时间并返回 `true`。同一次领取只能开始一次。
    async fn begin_execution(
        &self,
        job_id: i64,
        claim_token: &str,
        expected: JobState,
        resource: ResourceKey,
    ) -> TunaResult<bool>;

    /// 应用worker回报的结果，重复或过期的回报不做修改
    async fn report_outcome(
        &self,
        outcome: &JobOutcome,
        max_retries: i32,
    ) -> TunaResult<ReportStatus>;

    /// 把 `older_than` 之前领取的运行中作业退回领取前状态
    ///
    /// 已开始执行的作业从开始执行时计时，队列中的等待不计入。
    async fn requeue_stale(&self, older_than: Duration) -> TunaResult<Vec<i64>>;

    /// 运维批量重置，同时清零重试计数
    async fn reset(&self, filter: &ResetFilter, target: ResetTarget) -> TunaResult<u64>;

    /// 会话内各状态的作业数量
    async fn state_counts(&self, session_id: i64) -> TunaResult<Vec<(JobState, i64)>>;
}

#[async_trait]
pub trait MergedRecordRepository: Send + Sync {
    /// 替换会话的全部合并记录
    async fn replace_session_records(
        &self,
        session_id: i64,
        records: &[MergedRecord],
    ) -> TunaResult<u64>;

    async fn list_session_records(&self, session_id: i64) -> TunaResult<Vec<MergedRecord>>;
}

#[async_trait]
pub trait GoldenRepository: Send + Sync {
    async fn get_version(&self, version: i64) -> TunaResult<Option<GoldenVersion>>;

    async fn load_records(&self, version: i64) -> TunaResult<Vec<GoldenRecord>>;

    /// 在单个事务中写入快照
    ///
    /// 版本已存在且未指定 `overwrite` 时失败；提交前校验版本中归属会话的记录数，
    /// 不一致则回滚，不留下任何数据。
    async fn commit_snapshot(
        &self,
        snapshot: &GoldenSnapshot,
        overwrite: bool,
    ) -> TunaResult<GoldenVersion>;
}
