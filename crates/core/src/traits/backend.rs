use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Job, JobResult, Machine, PerformanceRecord, ResourceClass, Session};
use crate::TunaResult;

/// 一次后端调用的上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job: Job,
    pub session: Session,
    pub machine: Machine,
    pub step: ResourceClass,
    pub device: Option<i32>,
}

/// 后端调用结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    pub result: JobResult,
    /// 失败是否归因于主机
    pub host_fault: bool,
    pub records: Vec<PerformanceRecord>,
    pub duration_ms: u64,
}

impl BackendOutput {
    pub fn success(records: Vec<PerformanceRecord>) -> Self {
        Self {
            result: JobResult::Success,
            host_fault: false,
            records,
            duration_ms: 0,
        }
    }
}

/// 调优后端
///
/// 接收作业描述和步骤，返回成功/失败及零或多条性能记录。
/// 崩溃后被重新调用不应破坏共享状态。
#[async_trait]
pub trait TuningBackend: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> TunaResult<BackendOutput>;

    fn name(&self) -> &str;
}
