use chrono::format::{Item, StrftimeItems};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::credentials::ConnectionFacts;
use crate::engine::Engine;
use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "VAULTDUMP_";
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Top-level configuration. Loaded once at the composition root and passed
/// down as a plain value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub broker: BrokerConfig,
    pub backup: BackupConfig,
    pub retention: RetentionConfig,
    pub postgres: EngineGroupConfig,
    pub mongodb: EngineGroupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            backup: BackupConfig::default(),
            retention: RetentionConfig::default(),
            postgres: EngineGroupConfig::default(),
            mongodb: EngineGroupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: Option<String>,
    pub token: Option<String>,
    pub approle: Option<String>,
    pub namespace: Option<String>,
    /// Mount under which AppRole roles live, e.g. `auth/approle/role`.
    pub role_base: String,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: None,
            token: None,
            approle: None,
            namespace: None,
            role_base: "auth/approle/role".to_string(),
            request_timeout_secs: 15,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub output_directory: PathBuf,
    pub timestamp_format: String,
    pub timeout_secs: u64,
    pub compress: bool,
    pub restore_concurrency: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("backups"),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            timeout_secs: 3600,
            compress: false,
            restore_concurrency: 4,
        }
    }
}

/// Parsed for compatibility with existing config files; not enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_last: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineGroupConfig {
    pub enabled: bool,
    /// Prefix of the dynamic credentials endpoint, e.g. `database/creds`.
    pub creds_path: String,
    #[serde(flatten)]
    pub overrides: SettingsLayer,
    pub tools: ToolsConfig,
    pub instances: Vec<InstanceConfig>,
}

impl Default for EngineGroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            creds_path: "database/creds".to_string(),
            overrides: SettingsLayer::default(),
            tools: ToolsConfig::default(),
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub dump: Option<String>,
    pub restore: Option<String>,
    /// Plain-SQL executor (Postgres `psql`).
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    /// Optional KV path holding static connection facts for this instance.
    pub kv_path: Option<String>,
    #[serde(flatten)]
    pub overrides: SettingsLayer,
}

/// One layer of instance settings. Every field is optional; resolution folds
/// layers in order and a later `Some` replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub method: Option<String>,
    pub role_name: Option<String>,
    pub compress: Option<bool>,
    pub output_directory: Option<PathBuf>,
    pub timestamp_format: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl SettingsLayer {
    pub fn merge(self, over: SettingsLayer) -> SettingsLayer {
        SettingsLayer {
            host: over.host.or(self.host),
            port: over.port.or(self.port),
            database: over.database.or(self.database),
            method: over.method.or(self.method),
            role_name: over.role_name.or(self.role_name),
            compress: over.compress.or(self.compress),
            output_directory: over.output_directory.or(self.output_directory),
            timestamp_format: over.timestamp_format.or(self.timestamp_format),
            timeout_secs: over.timeout_secs.or(self.timeout_secs),
        }
    }
}

impl From<&BackupConfig> for SettingsLayer {
    fn from(b: &BackupConfig) -> Self {
        SettingsLayer {
            compress: Some(b.compress),
            output_directory: Some(b.output_directory.clone()),
            timestamp_format: Some(b.timestamp_format.clone()),
            timeout_secs: Some(b.timeout_secs),
            ..SettingsLayer::default()
        }
    }
}

impl From<ConnectionFacts> for SettingsLayer {
    fn from(f: ConnectionFacts) -> Self {
        SettingsLayer {
            host: f.host,
            port: f.port,
            database: f.database,
            ..SettingsLayer::default()
        }
    }
}

/// Fully resolved settings of one database instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInstanceConfig {
    pub engine: Engine,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub method: String,
    pub role_name: String,
    pub compress: bool,
    pub output_directory: PathBuf,
    pub timestamp_format: String,
    pub timeout: Duration,
}

impl EngineInstanceConfig {
    /// Fold `layers` (lowest precedence first) into concrete settings.
    pub fn resolve(
        engine: Engine,
        name: &str,
        layers: impl IntoIterator<Item = SettingsLayer>,
    ) -> Result<Self, ConfigError> {
        let merged = layers
            .into_iter()
            .fold(engine.builtin_layer(), SettingsLayer::merge);

        let database = merged
            .database
            .filter(|d| !d.is_empty())
            .or_else(|| (!name.is_empty()).then(|| name.to_string()))
            .ok_or_else(|| ConfigError::MissingDatabase {
                engine,
                instance: name.to_string(),
            })?;
        let role_name = merged
            .role_name
            .filter(|r| !r.is_empty())
            .ok_or_else(|| ConfigError::MissingRole {
                engine,
                instance: name.to_string(),
            })?;
        let timeout_secs = merged.timeout_secs.unwrap_or(0);
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout { engine, database });
        }
        let timestamp_format = merged
            .timestamp_format
            .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string());
        if StrftimeItems::new(&timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidTimestampFormat(timestamp_format));
        }

        Ok(Self {
            engine,
            name: if name.is_empty() { database.clone() } else { name.to_string() },
            host: merged.host.unwrap_or_else(|| "localhost".to_string()),
            port: merged.port.unwrap_or_else(|| engine.default_port()),
            method: merged
                .method
                .unwrap_or_else(|| engine.default_method().to_string()),
            compress: merged.compress.unwrap_or(false),
            output_directory: merged
                .output_directory
                .unwrap_or_else(|| PathBuf::from("backups")),
            timeout: Duration::from_secs(timeout_secs),
            database,
            role_name,
            timestamp_format,
        })
    }

    /// `<output_root>/<engine>/<database>`, home of artifacts and metadata.
    pub fn instance_dir(&self) -> PathBuf {
        self.output_directory
            .join(self.engine.as_str())
            .join(&self.database)
    }
}

impl Config {
    /// Layered load: struct defaults, then the TOML file, then
    /// `VAULTDUMP_`-prefixed environment variables (`__` nests).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn group(&self, engine: Engine) -> &EngineGroupConfig {
        match engine {
            Engine::Postgres => &self.postgres,
            Engine::MongoDb => &self.mongodb,
        }
    }

    /// Configured layers for one instance: backup-wide defaults, engine
    /// group, then the instance itself.
    pub fn layers_for(&self, engine: Engine, instance: &InstanceConfig) -> Vec<SettingsLayer> {
        vec![
            SettingsLayer::from(&self.backup),
            self.group(engine).overrides.clone(),
            instance.overrides.clone(),
        ]
    }
}
