pub mod cancellation;
pub mod pool;
pub mod shell_backend;
pub mod worker;

pub use cancellation::{CancellationRegistry, Sentinel, SentinelWatcher};
pub use pool::WorkerPool;
pub use shell_backend::ShellBackend;
pub use worker::{Worker, WorkerBinding, WorkerStep};
