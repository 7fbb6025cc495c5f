use thiserror::Error;

use crate::models::JobState;

/// 调优系统错误类型定义
#[derive(Debug, Error)]
pub enum TunaError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("会话未找到: {id}")]
    SessionNotFound { id: i64 },

    #[error("机器未找到: {id}")]
    MachineNotFound { id: i64 },

    #[error("非法的状态转换: {from} -> {event}")]
    InvalidTransition { from: JobState, event: String },

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("调优后端错误: {0}")]
    Backend(String),

    #[error("Golden版本已存在: {version}")]
    GoldenVersionExists { version: i64 },

    #[error("Golden记录数不一致: 期望 {expected}, 实际 {actual}")]
    GoldenCountMismatch { expected: i64, actual: i64 },

    #[error("无效的记录键: {key} - {message}")]
    InvalidKey { key: String, message: String },

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TunaError {
    fn from(e: serde_json::Error) -> Self {
        TunaError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type TunaResult<T> = std::result::Result<T, TunaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunaError::JobNotFound { id: 42 };
        assert_eq!(err.to_string(), "作业未找到: 42");

        let err = TunaError::GoldenCountMismatch {
            expected: 10,
            actual: 9,
        };
        assert!(err.to_string().contains("期望 10"));

        let err = TunaError::InvalidTransition {
            from: JobState::New,
            event: "succeed".to_string(),
        };
        assert_eq!(err.to_string(), "非法的状态转换: new -> succeed");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TunaError = parse.unwrap_err().into();
        assert!(matches!(err, TunaError::Serialization(_)));
    }
}
