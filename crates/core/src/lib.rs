pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod state_machine;
pub mod traits;

pub use errors::*;
pub use logging::init_logging;
pub use models::{Job, JobState, Machine, Message, ResourceClass, ResourceKey, Session};
pub use state_machine::{JobEvent, JobSnapshot, JobStateMachine};
pub use traits::{
    GoldenRepository, JobRepository, MachineRepository, MergedRecordRepository, MessageQueue,
    RecordStaging, SessionRepository, TuningBackend,
};
