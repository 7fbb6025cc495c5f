use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 调优会话
///
/// 将作业归组到同一个目标架构、计算单元数和工具链版本下。被作业引用后不可修改。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: i64,
    pub arch: String,
    pub num_cu: i32,
    pub toolchain_version: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// 会话创建请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub arch: String,
    pub num_cu: i32,
    pub toolchain_version: String,
    pub reason: String,
}

impl Session {
    pub fn new(id: i64, new_session: NewSession) -> Self {
        Self {
            id,
            arch: new_session.arch,
            num_cu: new_session.num_cu,
            toolchain_version: new_session.toolchain_version,
            reason: new_session.reason,
            created_at: Utc::now(),
        }
    }
}
