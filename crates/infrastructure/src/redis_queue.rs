use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tuna_core::config::MessageQueueConfig;
use tuna_core::models::Message;
use tuna_core::traits::MessageQueue;
use tuna_core::{TunaError, TunaResult};

const KEY_PREFIX: &str = "tuna:queue:";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 基于Redis列表的消息队列
///
/// 每个队列对应一个列表，RPUSH 入队、LPOP 出队，多个进程共享同一个Redis即可协作。
#[derive(Clone)]
pub struct RedisMessageQueue {
    connection: ConnectionManager,
    max_retry_attempts: u32,
    retry_delay: Duration,
}

impl RedisMessageQueue {
    pub async fn new(config: &MessageQueueConfig) -> TunaResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            TunaError::MessageQueue(format!("Failed to create Redis client: {e}"))
        })?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("连接Redis失败: {}", e);
            TunaError::MessageQueue(format!("Failed to connect to Redis: {e}"))
        })?;

        info!("Connected to Redis message queue");
        Ok(Self {
            connection,
            max_retry_attempts: config.max_retry_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
        })
    }

    fn queue_key(queue: &str) -> String {
        format!("{KEY_PREFIX}{queue}")
    }

    fn decode(queue: &str, payload: &str) -> Option<Message> {
        match Message::deserialize(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("丢弃队列 '{}' 中无法解析的消息: {}", queue, e);
                counter!("tuna_queue_malformed_total").increment(1);
                None
            }
        }
    }

    async fn publish_with_retry(&self, key: &str, payload: &str) -> TunaResult<()> {
        let mut last_error = None;

        for attempt in 0..self.max_retry_attempts {
            let mut conn = self.connection.clone();
            match conn.rpush::<_, _, i64>(key, payload).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Failed to publish to '{}' (attempt {}/{}): {}",
                        key,
                        attempt + 1,
                        self.max_retry_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.max_retry_attempts {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(TunaError::MessageQueue(format!(
            "Failed to publish to '{key}' after {} attempts: {}",
            self.max_retry_attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        )))
    }
}

fn redis_error(e: redis::RedisError) -> TunaError {
    TunaError::MessageQueue(format!("Redis command failed: {e}"))
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> TunaResult<()> {
        let payload = message.serialize()?;
        self.publish_with_retry(&Self::queue_key(queue), &payload)
            .await?;
        counter!("tuna_queue_published_total", "type" => message.message_type_str()).increment(1);
        debug!("Published message {} to queue '{}'", message.id, queue);
        Ok(())
    }

    async fn consume_messages(&self, queue: &str) -> TunaResult<Vec<Message>> {
        let key = Self::queue_key(queue);
        let mut conn = self.connection.clone();
        let (payloads, _): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(payloads
            .iter()
            .filter_map(|payload| Self::decode(queue, payload))
            .collect())
    }

    async fn receive_message(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> TunaResult<Option<Message>> {
        let key = Self::queue_key(queue);
        let deadline = Instant::now() + timeout;

        loop {
            let mut conn = self.connection.clone();
            let payload: Option<String> = conn.lpop(&key, None).await.map_err(redis_error)?;
            if let Some(payload) = payload {
                if let Some(message) = Self::decode(queue, &payload) {
                    return Ok(Some(message));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn create_queue(&self, _queue: &str) -> TunaResult<()> {
        // 列表在首次 RPUSH 时自动创建
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> TunaResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, i64>(Self::queue_key(queue))
            .await
            .map_err(redis_error)?;
        info!("Deleted queue '{}'", queue);
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> TunaResult<u32> {
        let mut conn = self.connection.clone();
        let size: i64 = conn
            .llen(Self::queue_key(queue))
            .await
            .map_err(redis_error)?;
        Ok(size.max(0) as u32)
    }

    async fn purge_queue(&self, queue: &str) -> TunaResult<()> {
        self.delete_queue(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_prefix() {
        assert_eq!(RedisMessageQueue::queue_key("eval:3:1-0"), "tuna:queue:eval:3:1-0");
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        assert!(RedisMessageQueue::decode("compile:1", "not json").is_none());
    }
}
