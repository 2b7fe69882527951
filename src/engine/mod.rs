//! Database engine adapters.
//!
//! Every supported technology is one variant of [`Database`]; the enum is the
//! single dispatch point used by the orchestrator. Native tool invocation
//! details stay inside the variant modules.

mod mongodb;
mod postgres;
pub(crate) mod process;

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::broker::LeasedCredential;
use crate::config::{EngineInstanceConfig, SettingsLayer, ToolsConfig};
use crate::error::{BackupError, RestoreError};

pub use mongodb::{MongoDb, MongoMethod};
pub use postgres::{PgMethod, Postgres};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl Engine {
    pub const ALL: [Engine; 2] = [Engine::Postgres, Engine::MongoDb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::MongoDb => "mongodb",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::MongoDb => 27017,
        }
    }

    pub fn default_method(&self) -> &'static str {
        match self {
            Engine::Postgres => "custom",
            Engine::MongoDb => "archive",
        }
    }

    /// Lowest-precedence settings layer.
    pub fn builtin_layer(&self) -> SettingsLayer {
        SettingsLayer {
            host: Some("localhost".to_string()),
            port: Some(self.default_port()),
            method: Some(self.default_method().to_string()),
            ..SettingsLayer::default()
        }
    }

    pub fn tools(&self, configured: &ToolsConfig) -> ToolSet {
        let (dump, restore, sql) = match self {
            Engine::Postgres => ("pg_dump", "pg_restore", "psql"),
            Engine::MongoDb => ("mongodump", "mongorestore", "mongosh"),
        };
        ToolSet {
            dump: configured.dump.clone().unwrap_or_else(|| dump.to_string()),
            restore: configured
                .restore
                .clone()
                .unwrap_or_else(|| restore.to_string()),
            sql: configured.sql.clone().unwrap_or_else(|| sql.to_string()),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executables used for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSet {
    pub dump: String,
    pub restore: String,
    pub sql: String,
}

/// Everything one adapter needs: resolved settings, tools and the lease.
#[derive(Debug, Clone)]
pub struct Target {
    pub config: EngineInstanceConfig,
    pub tools: ToolSet,
    pub credential: LeasedCredential,
}

impl Target {
    /// `<output_root>/<engine>/<database>/<timestamp>-<database>.<ext>`
    fn artifact_path(&self, ext: &str) -> PathBuf {
        let mut timestamp = String::new();
        if write!(timestamp, "{}", Local::now().format(&self.config.timestamp_format)).is_err() {
            timestamp.clear();
            let fallback = Local::now().format(crate::config::DEFAULT_TIMESTAMP_FORMAT);
            let _ = write!(timestamp, "{fallback}");
        }
        self.config
            .instance_dir()
            .join(format!("{timestamp}-{}.{ext}", self.config.database))
    }

    async fn ensure_parent(path: &Path) -> Result<(), BackupError> {
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| BackupError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })
    }

    async fn ensure_artifact(path: &Path) -> Result<(), RestoreError> {
        tokio::fs::metadata(path)
            .await
            .map(|_| ())
            .map_err(|source| RestoreError::MissingArtifact {
                path: path.to_path_buf(),
                source,
            })
    }

    fn port(&self) -> String {
        self.config.port.to_string()
    }
}

/// Runtime database instance: one resolved config plus its leased credential.
/// Identity is `(engine, database)`.
#[derive(Debug, Clone)]
pub enum Database {
    Postgres(Postgres),
    MongoDb(MongoDb),
}

impl Database {
    pub fn new(config: EngineInstanceConfig, tools: ToolSet, credential: LeasedCredential) -> Self {
        let target = Target {
            config,
            tools,
            credential,
        };
        match target.config.engine {
            Engine::Postgres => Database::Postgres(Postgres::new(target)),
            Engine::MongoDb => Database::MongoDb(MongoDb::new(target)),
        }
    }

    fn target(&self) -> &Target {
        match self {
            Database::Postgres(p) => p.target(),
            Database::MongoDb(m) => m.target(),
        }
    }

    pub fn name(&self) -> &str {
        &self.target().config.database
    }

    pub fn engine(&self) -> Engine {
        self.target().config.engine
    }

    /// `<output_root>/<engine>`
    pub fn path(&self) -> PathBuf {
        self.config().output_directory.join(self.engine().as_str())
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.config().instance_dir()
    }

    pub fn config(&self) -> &EngineInstanceConfig {
        &self.target().config
    }

    pub fn credential(&self) -> &LeasedCredential {
        &self.target().credential
    }

    /// Run the native dump tool; returns the artifact path.
    pub async fn backup(&self) -> Result<PathBuf, BackupError> {
        match self {
            Database::Postgres(p) => p.backup().await,
            Database::MongoDb(m) => m.backup().await,
        }
    }

    /// Restore from `artifact` using `method` (the method recorded at backup
    /// time), falling back to the configured one.
    pub async fn restore(&self, artifact: &Path, method: Option<&str>) -> Result<(), RestoreError> {
        let method = method.unwrap_or(&self.config().method);
        match self {
            Database::Postgres(p) => p.restore(artifact, method).await,
            Database::MongoDb(m) => m.restore(artifact, method).await,
        }
    }
}
