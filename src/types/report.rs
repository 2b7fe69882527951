use tracing::{error, info, warn};

use super::job::{BackupOutcome, InstanceFailure, InstanceKey, RestoreOutcome};
use crate::store::MetadataRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }
}

/// Aggregated result of one `backup` or `restore` run, assembled by the
/// orchestrator after every task has joined.
#[derive(Debug)]
pub struct RunReport {
    pub operation: Operation,
    /// Metadata records written during a backup run.
    pub records: Vec<MetadataRecord>,
    pub restored: Vec<InstanceKey>,
    pub skipped: Vec<InstanceKey>,
    pub failures: Vec<InstanceFailure>,
}

impl RunReport {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            records: Vec::new(),
            restored: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &InstanceFailure> {
        self.failures.iter().filter(|f| f.is_timeout())
    }

    pub(crate) fn push_backup(&mut self, outcome: BackupOutcome) {
        match outcome {
            BackupOutcome::Succeeded(record) => self.records.push(record),
            BackupOutcome::Failed { record, failure } => {
                self.records.extend(record);
                self.failures.push(failure);
            }
        }
    }

    pub(crate) fn push_restore(&mut self, outcome: RestoreOutcome) {
        match outcome {
            RestoreOutcome::Restored(key) => self.restored.push(key),
            RestoreOutcome::Skipped(key) => self.skipped.push(key),
            RestoreOutcome::Failed(failure) => self.failures.push(failure),
        }
    }

    pub fn log_summary(&self) {
        for f in &self.failures {
            error!(
                engine = %f.engine,
                database = f.database.as_deref().unwrap_or(f.name.as_str()),
                stage = f.stage.as_str(),
                kind = ?f.kind(),
                error = %f.error,
                "instance failed"
            );
        }
        for key in &self.skipped {
            warn!(engine = %key.engine, database = %key.database, "restore skipped");
        }
        let succeeded = match self.operation {
            Operation::Backup => self.records.iter().filter(|r| r.succeeded()).count(),
            Operation::Restore => self.restored.len(),
        };
        info!(
            operation = self.operation.as_str(),
            succeeded,
            skipped = self.skipped.len(),
            failed = self.failures.len(),
            "run finished"
        );
    }
}
