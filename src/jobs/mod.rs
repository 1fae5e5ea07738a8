//! Supervisor side: job records, queue, workers and the manager API

pub mod layout;
pub mod lifecycle;
pub mod manager;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use lifecycle::JobStatus;
pub use manager::{recover, JobManager, RecoveryReport};
pub use store::{FsJobStore, JobStore};
pub use types::{Job, JobReceipt, StatusReport, SubmitRequest};
