use std::time::Duration;

use async_trait::async_trait;

use crate::{models::Message, TunaResult};

/// 消息队列抽象接口
///
/// 同一队列内的消息按入队顺序投递。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定队列
    async fn publish_message(&self, queue: &str, message: &Message) -> TunaResult<()>;

    /// 取出指定队列中当前所有消息
    async fn consume_messages(&self, queue: &str) -> TunaResult<Vec<Message>>;

    /// 阻塞等待一条消息，超时返回 `None`
    async fn receive_message(&self, queue: &str, timeout: Duration)
        -> TunaResult<Option<Message>>;

    /// 创建队列
    async fn create_queue(&self, queue: &str) -> TunaResult<()>;

    /// 删除队列
    async fn delete_queue(&self, queue: &str) -> TunaResult<()>;

    /// 获取队列中的消息数量
    async fn get_queue_size(&self, queue: &str) -> TunaResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> TunaResult<()>;
}
