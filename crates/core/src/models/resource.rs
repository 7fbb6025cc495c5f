use std::fmt;

use serde::{Deserialize, Serialize};

use super::ResourceClass;

/// 可执行作业的具体资源
///
/// 节点资源用于编译，设备资源对应一块物理GPU。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceKey {
    Node { machine_id: i64 },
    Device { machine_id: i64, gpu: i32 },
}

impl ResourceKey {
    pub fn machine_id(&self) -> i64 {
        match self {
            ResourceKey::Node { machine_id } | ResourceKey::Device { machine_id, .. } => {
                *machine_id
            }
        }
    }

    pub fn device(&self) -> Option<i32> {
        match self {
            ResourceKey::Node { .. } => None,
            ResourceKey::Device { gpu, .. } => Some(*gpu),
        }
    }

    pub fn class(&self) -> ResourceClass {
        match self {
            ResourceKey::Node { .. } => ResourceClass::Compile,
            ResourceKey::Device { .. } => ResourceClass::Evaluate,
        }
    }

    /// 设备在整个集群内的唯一索引
    pub fn device_index(&self) -> Option<DeviceIndex> {
        match self {
            ResourceKey::Node { .. } => None,
            ResourceKey::Device { machine_id, gpu } => Some(DeviceIndex {
                machine_id: *machine_id,
                gpu: *gpu,
            }),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Node { machine_id } => write!(f, "node:{machine_id}"),
            ResourceKey::Device { machine_id, gpu } => write!(f, "device:{machine_id}-{gpu}"),
        }
    }
}

/// 集群范围的物理设备索引，GPU编号只在单台机器内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIndex {
    pub machine_id: i64,
    pub gpu: i32,
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.machine_id, self.gpu)
    }
}

/// 队列命名规则
pub mod queue_names {
    use super::DeviceIndex;

    /// 会话共享的编译队列
    pub fn compile(session_id: i64) -> String {
        format!("compile:{session_id}")
    }

    /// 每个(会话, 设备)独占的评测队列
    pub fn eval(session_id: i64, device: &DeviceIndex) -> String {
        format!("eval:{session_id}:{device}")
    }

    /// 作业结果回报队列
    pub fn outcomes(session_id: i64) -> String {
        format!("outcomes:{session_id}")
    }
}
