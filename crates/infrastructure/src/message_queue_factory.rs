use std::sync::Arc;

use tracing::{debug, info};
use tuna_core::config::{MessageQueueConfig, MessageQueueType};
use tuna_core::traits::MessageQueue;
use tuna_core::TunaResult;

use crate::{InMemoryMessageQueue, RedisMessageQueue};

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(config: &MessageQueueConfig) -> TunaResult<Arc<dyn MessageQueue>> {
        debug!("Creating message queue with type: {:?}", config.r#type);

        match config.r#type {
            MessageQueueType::InMemory => {
                info!("Initializing in-memory message queue");
                Ok(Arc::new(InMemoryMessageQueue::new()))
            }
            MessageQueueType::Redis => {
                info!("Initializing Redis message queue");
                Ok(Arc::new(RedisMessageQueue::new(config).await?))
            }
        }
    }
}
