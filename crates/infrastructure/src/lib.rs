pub mod database;
pub mod in_memory_queue;
pub mod message_queue_factory;
pub mod redis_queue;
pub mod staging;

pub use database::*;
pub use in_memory_queue::{InMemoryMessageQueue, InMemoryQueueConfig};
pub use message_queue_factory::MessageQueueFactory;
pub use redis_queue::RedisMessageQueue;
pub use staging::FileRecordStaging;
