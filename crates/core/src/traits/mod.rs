pub mod backend;
pub mod message_queue;
pub mod repository;
pub mod staging;

pub use backend::*;
pub use message_queue::*;
pub use repository::*;
pub use staging::*;
