use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error as ThisError;

use crate::engine::Engine;

/// Marks errors worth another attempt against the broker.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("config file {0} not found")]
    NotFound(PathBuf),

    #[error("config load failed: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid timestamp format {0:?}")]
    InvalidTimestampFormat(String),

    #[error("{engine} instance {instance:?} has no database name")]
    MissingDatabase { engine: Engine, instance: String },

    #[error("{engine} instance {instance:?} has no role name")]
    MissingRole { engine: Engine, instance: String },

    #[error("duplicate instance {engine}/{database}")]
    DuplicateInstance { engine: Engine, database: String },

    #[error("{engine}/{database}: timeout must be greater than zero")]
    ZeroTimeout { engine: Engine, database: String },
}

#[derive(Debug, ThisError)]
pub enum CredentialError {
    #[error("broker address not configured (set VAULT_ADDR or broker.address)")]
    MissingAddress,

    #[error("no authentication method configured (token or approle)")]
    MissingAuthMethod,

    #[error("invalid broker URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("no secret data at {0}")]
    NoData(String),

    #[error("secret at {path} is missing string field {field:?}")]
    MalformedSecret { path: String, field: &'static str },

    #[error("approle login for {role:?} failed: {reason}")]
    AppRoleLogin { role: String, reason: String },

    #[error("credential lease for {role_path} expired at {expired_at}")]
    LeaseExpired {
        role_path: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },
}

impl IsRetryable for CredentialError {
    fn is_retryable(&self) -> bool {
        match self {
            CredentialError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            CredentialError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Failure of one external tool run.
#[derive(Debug, ThisError)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Exit {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{tool} did not finish within {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("failed to prepare {tool} invocation: {source}")]
    Prepare {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, ThisError)]
pub enum BackupError {
    #[error("create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported backup method {0:?}")]
    UnsupportedMethod(String),

    #[error("operation timed out: {0}")]
    Timeout(#[source] ToolError),

    #[error("backup failed: {0}")]
    Tool(#[source] ToolError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<ToolError> for BackupError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Timeout { .. } => BackupError::Timeout(e),
            other => BackupError::Tool(other),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum RestoreError {
    #[error("backup source {path} not found: {source}")]
    MissingArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported restore method {0:?}")]
    UnsupportedRestoreMethod(String),

    #[error("operation timed out: {0}")]
    Timeout(#[source] ToolError),

    #[error("restore failed: {0}")]
    RestoreFailed(#[source] ToolError),

    #[error("metadata record has no artifact path")]
    NoArtifact,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<ToolError> for RestoreError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Timeout { .. } => RestoreError::Timeout(e),
            other => RestoreError::RestoreFailed(other),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum CompressionError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is a directory and cannot be streamed")]
    NotAFile { path: PathBuf },

    #[error("{path} has no .{ext} suffix")]
    MissingSuffix { path: PathBuf, ext: &'static str },

    #[error("stream {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, ThisError)]
pub enum MetadataError {
    #[error("metadata file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata JSON {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, ThisError)]
pub enum VaultdumpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("task join error: {0}")]
    TaskJoin(String),
}

impl VaultdumpError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            VaultdumpError::Backup(BackupError::Timeout(_))
                | VaultdumpError::Restore(RestoreError::Timeout(_))
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultdumpError::Config(_) => ErrorKind::Config,
            VaultdumpError::Credential(_)
            | VaultdumpError::Backup(BackupError::Credential(_))
            | VaultdumpError::Restore(RestoreError::Credential(_)) => ErrorKind::Credential,
            VaultdumpError::Backup(BackupError::Timeout(_))
            | VaultdumpError::Restore(RestoreError::Timeout(_)) => ErrorKind::Timeout,
            VaultdumpError::Backup(BackupError::Tool(_))
            | VaultdumpError::Restore(RestoreError::RestoreFailed(_)) => ErrorKind::ToolFailed,
            VaultdumpError::Backup(BackupError::UnsupportedMethod(_))
            | VaultdumpError::Restore(RestoreError::UnsupportedRestoreMethod(_)) => {
                ErrorKind::UnsupportedMethod
            }
            VaultdumpError::Backup(BackupError::CreateDir { .. })
            | VaultdumpError::Restore(RestoreError::MissingArtifact { .. })
            | VaultdumpError::Restore(RestoreError::NoArtifact) => ErrorKind::Io,
            VaultdumpError::Compression(_) => ErrorKind::Compression,
            VaultdumpError::Metadata(_) | VaultdumpError::Restore(RestoreError::Metadata(_)) => {
                ErrorKind::Metadata
            }
            VaultdumpError::TaskJoin(_) => ErrorKind::Internal,
        }
    }
}

/// Failure classification persisted next to the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Credential,
    Timeout,
    ToolFailed,
    UnsupportedMethod,
    Io,
    Compression,
    Metadata,
    Internal,
}
