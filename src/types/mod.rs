pub mod job;
pub mod report;

pub use job::{BackupOutcome, InstanceFailure, InstanceKey, RestoreOutcome, Stage};
pub use report::{Operation, RunReport};
