use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use tuna_core::models::Message;
use tuna_core::traits::MessageQueue;
use tuna_core::{TunaError, TunaResult};

/// 内存消息队列实现
///
/// 使用 Tokio channels 实现，适用于单进程部署和测试。每个队列一个通道，
/// 多个消费者共享同一个接收端，消息按入队顺序投递。
#[derive(Debug, Clone)]
pub struct InMemoryMessageQueue {
    /// 队列存储：队列名 -> 通道
    queues: Arc<RwLock<HashMap<String, Arc<QueueChannels>>>>,
    config: InMemoryQueueConfig,
}

#[derive(Debug)]
struct QueueChannels {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// 队列大小统计
    size: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 队列最大容量（0表示无限制）
    pub max_queue_size: u32,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100_000,
        }
    }
}

impl InMemoryMessageQueue {
    /// 创建新的内存消息队列实例
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    /// 使用指定配置创建内存消息队列实例
    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("Creating in-memory message queue with config: {:?}", config);
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// 获取或创建队列通道
    async fn get_or_create_queue(&self, queue_name: &str) -> Arc<QueueChannels> {
        if let Some(channels) = self.queues.read().await.get(queue_name) {
            return channels.clone();
        }

        let mut queues = self.queues.write().await;
        queues
            .entry(queue_name.to_string())
            .or_insert_with(|| {
                debug!("Creating new queue: {}", queue_name);
                let (sender, receiver) = mpsc::unbounded_channel();
                Arc::new(QueueChannels {
                    sender,
                    receiver: Mutex::new(receiver),
                    size: AtomicU32::new(0),
                })
            })
            .clone()
    }

    /// 当前存在的队列名
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> TunaResult<()> {
        debug!("Publishing message to queue '{}': {}", queue, message.id);

        let channels = self.get_or_create_queue(queue).await;

        if self.config.max_queue_size > 0
            && channels.size.load(Ordering::Relaxed) >= self.config.max_queue_size
        {
            warn!("Queue '{}' is full, message rejected", queue);
            return Err(TunaError::MessageQueue(format!(
                "Queue '{queue}' is full"
            )));
        }

        channels.sender.send(message.clone()).map_err(|e| {
            error!("Failed to send message to queue '{}': {}", queue, e);
            TunaError::MessageQueue(format!("Failed to send message to queue '{queue}': {e}"))
        })?;
        channels.size.fetch_add(1, Ordering::Relaxed);

        debug!("Successfully published message {} to queue '{}'", message.id, queue);
        Ok(())
    }

    async fn consume_messages(&self, queue: &str) -> TunaResult<Vec<Message>> {
        let channels = self.get_or_create_queue(queue).await;
        let mut receiver = channels.receiver.lock().await;
        let mut messages = Vec::new();

        while let Ok(message) = receiver.try_recv() {
            channels.size.fetch_sub(1, Ordering::Relaxed);
            messages.push(message);
        }

        if !messages.is_empty() {
            debug!("Consumed {} messages from queue '{}'", messages.len(), queue);
        }
        Ok(messages)
    }

    async fn receive_message(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> TunaResult<Option<Message>> {
        let channels = self.get_or_create_queue(queue).await;

        let received = tokio::time::timeout(timeout, async {
            let mut receiver = channels.receiver.lock().await;
            receiver.recv().await
        })
        .await;

        match received {
            Ok(Some(message)) => {
                channels.size.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(message))
            }
            Ok(None) => Err(TunaError::MessageQueue(format!(
                "Queue '{queue}' channel closed"
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn create_queue(&self, queue: &str) -> TunaResult<()> {
        self.get_or_create_queue(queue).await;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> TunaResult<()> {
        if self.queues.write().await.remove(queue).is_some() {
            info!("Deleted queue '{}'", queue);
        }
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> TunaResult<u32> {
        Ok(self
            .queues
            .read()
            .await
            .get(queue)
            .map(|channels| channels.size.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> TunaResult<()> {
        let purged = self.consume_messages(queue).await?;
        info!("Purged {} messages from queue '{}'", purged.len(), queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuna_core::models::{JobDispatchMessage, MessageType, ResourceClass};

    fn dispatch(job_id: i64) -> Message {
        Message::job_dispatch(JobDispatchMessage {
            job_id,
            session_id: 1,
            step: ResourceClass::Compile,
            claim_token: "t".to_string(),
            resource: None,
        })
    }

    fn job_id(message: &Message) -> i64 {
        match &message.message_type {
            MessageType::JobDispatch(m) => m.job_id,
            _ => panic!("unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_fifo_order_within_queue() {
        let queue = InMemoryMessageQueue::new();
        for id in 1..=5 {
            queue.publish_message("compile:1", &dispatch(id)).await.unwrap();
        }
        assert_eq!(queue.get_queue_size("compile:1").await.unwrap(), 5);

        let mut received = Vec::new();
        while let Some(message) = queue
            .receive_message("compile:1", Duration::from_millis(10))
            .await
            .unwrap()
        {
            received.push(job_id(&message));
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.get_queue_size("compile:1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        let queue = InMemoryMessageQueue::new();
        let message = queue
            .receive_message("eval:1:1-0", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let queue = InMemoryMessageQueue::new();
        queue.publish_message("eval:1:1-0", &dispatch(1)).await.unwrap();
        queue.publish_message("eval:1:1-1", &dispatch(2)).await.unwrap();

        let first = queue.consume_messages("eval:1:1-0").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(job_id(&first[0]), 1);
        assert_eq!(queue.get_queue_size("eval:1:1-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_queue_size_rejects() {
        let queue = InMemoryMessageQueue::with_config(InMemoryQueueConfig { max_queue_size: 1 });
        queue.publish_message("q", &dispatch(1)).await.unwrap();
        assert!(queue.publish_message("q", &dispatch(2)).await.is_err());

        queue.purge_queue("q").await.unwrap();
        assert_eq!(queue.get_queue_size("q").await.unwrap(), 0);
        queue.publish_message("q", &dispatch(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_receive_wakes_on_publish() {
        let queue = InMemoryMessageQueue::new();
        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            consumer
                .receive_message("compile:9", Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish_message("compile:9", &dispatch(42)).await.unwrap();

        let message = handle.await.unwrap().expect("message should arrive");
        assert_eq!(job_id(&message), 42);
    }
}
