use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobOutcome, PerformanceRecord, ResourceClass, ResourceKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    JobDispatch(JobDispatchMessage),
    JobOutcome(JobOutcomeMessage),
}

/// 派发到编译/评测队列的作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDispatchMessage {
    pub job_id: i64,
    pub session_id: i64,
    pub step: ResourceClass,
    pub claim_token: String,
    /// 评测作业绑定的设备，编译作业为空
    pub resource: Option<ResourceKey>,
}

/// worker回报给结果收集器的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcomeMessage {
    pub session_id: i64,
    pub machine_id: i64,
    pub hostname: String,
    pub outcome: JobOutcome,
    pub records: Vec<PerformanceRecord>,
}

impl Message {
    pub fn job_dispatch(message: JobDispatchMessage) -> Self {
        let correlation_id = Some(format!("job-{}", message.job_id));
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::JobDispatch(message),
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn job_outcome(message: JobOutcomeMessage) -> Self {
        let correlation_id = Some(format!("job-{}", message.outcome.job_id));
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::JobOutcome(message),
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn message_type_str(&self) -> &'static str {
        match &self.message_type {
            MessageType::JobDispatch(_) => "job_dispatch",
            MessageType::JobOutcome(_) => "job_outcome",
        }
    }
}
