pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod logging;
pub mod message_queue;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatcher_worker::{DispatcherConfig, WorkerConfig};
pub use logging::LoggingConfig;
pub use message_queue::{MessageQueueConfig, MessageQueueType};
