pub mod sqlite_golden_repository;
pub mod sqlite_job_repository;
pub mod sqlite_machine_repository;
pub mod sqlite_merged_record_repository;
pub mod sqlite_session_repository;

pub use sqlite_golden_repository::SqliteGoldenRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_machine_repository::SqliteMachineRepository;
pub use sqlite_merged_record_repository::SqliteMergedRecordRepository;
pub use sqlite_session_repository::SqliteSessionRepository;
