use serde::{Deserialize, Serialize};

/// Message queue type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageQueueType {
    /// 单进程部署和测试
    #[default]
    InMemory,
    Redis,
}

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueConfig {
    #[serde(rename = "type", default)]
    pub r#type: MessageQueueType,
    pub url: String,
    /// worker阻塞等待消息的时长
    pub receive_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            r#type: MessageQueueType::InMemory,
            url: "redis://127.0.0.1:6379/0".to_string(),
            receive_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl MessageQueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.r#type == MessageQueueType::Redis
            && !(self.url.starts_with("redis://") || self.url.starts_with("rediss://"))
        {
            return Err(anyhow::anyhow!("Redis URL格式无效: {}", self.url));
        }

        if self.receive_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("消息接收超时时间必须大于0"));
        }

        if self.max_retry_attempts == 0 {
            return Err(anyhow::anyhow!("最大重试次数必须大于0"));
        }

        Ok(())
    }
}
