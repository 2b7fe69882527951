use std::fmt;
use std::path::PathBuf;

use crate::engine::{Database, Engine};
use crate::error::{ErrorKind, VaultdumpError};
use crate::store::MetadataRecord;

/// Run-wide identity of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub engine: Engine,
    pub database: String,
}

impl InstanceKey {
    pub fn of(db: &Database) -> Self {
        Self {
            engine: db.engine(),
            database: db.name().to_string(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.engine, self.database)
    }
}

/// Where in the per-instance state machine a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialize,
    Backup,
    Compress,
    Metadata,
    Restore,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initialize => "initialize",
            Stage::Backup => "backup",
            Stage::Compress => "compress",
            Stage::Metadata => "metadata",
            Stage::Restore => "restore",
        }
    }
}

#[derive(Debug)]
pub struct InstanceFailure {
    pub engine: Engine,
    /// Configured instance name; the database may not be known yet.
    pub name: String,
    pub database: Option<String>,
    /// Directory whose metadata should record this failure, when it is safe
    /// to write there.
    pub metadata_dir: Option<PathBuf>,
    pub stage: Stage,
    pub error: VaultdumpError,
}

impl InstanceFailure {
    pub fn for_database(db: &Database, stage: Stage, error: impl Into<VaultdumpError>) -> Self {
        Self {
            engine: db.engine(),
            name: db.config().name.clone(),
            database: Some(db.name().to_string()),
            metadata_dir: Some(db.instance_dir()),
            stage,
            error: error.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }
}

#[derive(Debug)]
pub enum BackupOutcome {
    /// Metadata written with `status=success`.
    Succeeded(MetadataRecord),
    /// Metadata written (when possible) with `status=failed`.
    Failed {
        record: Option<MetadataRecord>,
        failure: InstanceFailure,
    },
}

#[derive(Debug)]
pub enum RestoreOutcome {
    Restored(InstanceKey),
    /// The latest backup failed; nothing to restore from.
    Skipped(InstanceKey),
    Failed(InstanceFailure),
}
