use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 记录来源：文件名与行号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub line: usize,
}

impl Provenance {
    pub fn new(source: impl Into<String>, line: usize) -> Self {
        Self {
            source: source.into(),
            line,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

/// 性能记录
///
/// `key` 是调优配置、方向和精度的确定性编码；`value` 由分号分隔的
/// `id:measurement` 子项组成，每个适用的策略一项。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub key: String,
    pub value: String,
    pub provenance: Provenance,
}

impl PerformanceRecord {
    pub fn new(key: impl Into<String>, value: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            provenance,
        }
    }

    /// 以 `key=value` 形式输出
    pub fn to_line(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// 合并后的规范记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub session_id: i64,
    pub key: String,
    pub value: String,
}

/// Golden版本中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenRecord {
    pub arch: String,
    pub num_cu: i32,
    pub key: String,
    pub value: String,
    /// 贡献该记录的会话
    pub session_id: i64,
}

/// Golden版本元数据，只追加不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenVersion {
    pub version: i64,
    pub session_id: i64,
    pub base_version: Option<i64>,
    pub record_count: i64,
    pub created_at: DateTime<Utc>,
}

/// 待提交的Golden快照
#[derive(Debug, Clone)]
pub struct GoldenSnapshot {
    pub version: i64,
    pub session_id: i64,
    pub base_version: Option<i64>,
    pub records: Vec<GoldenRecord>,
    /// 本会话合并出的规范记录数，提交时必须与版本中归属本会话的记录数一致
    pub expected_session_records: i64,
}
