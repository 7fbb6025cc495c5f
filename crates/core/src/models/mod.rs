//! # 数据模型
//!
//! 调优编排系统的核心数据结构：会话、机器、作业、性能记录和Golden版本，
//! 以及组件之间通过消息队列传递的消息。
//!
//! ## 作业状态流转
//! ```text
//! new → running → compiled → running_eval → evaluated
//!         ↓                        ↓
//!   errored / error_status / error_config  (超过重试上限 → aborted)
//! ```
//!
//! 状态字段以小写字符串存储在数据库中。

pub mod job;
pub mod machine;
pub mod message;
pub mod outcome;
pub mod record;
pub mod resource;
pub mod session;

pub use job::*;
pub use machine::*;
pub use message::*;
pub use outcome::*;
pub use record::*;
pub use resource::*;
pub use session::*;
