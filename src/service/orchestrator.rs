use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::compression;
use super::initializer::{self, Initialized};
use crate::broker::{BrokerSession, BrokerSettings};
use crate::config::Config;
use crate::engine::Database;
use crate::error::{CompressionError, RestoreError, VaultdumpError};
use crate::store::{MetadataRecord, RunStatus, metadata};
use crate::types::{
    BackupOutcome, InstanceFailure, InstanceKey, Operation, RestoreOutcome, RunReport, Stage,
};

/// Drives one backup or restore run over every configured instance.
///
/// The broker session is authenticated once before any task starts and is
/// only read afterwards.
pub struct Orchestrator {
    config: Arc<Config>,
    session: Arc<BrokerSession>,
}

impl Orchestrator {
    /// Authenticate against the broker. Failure here is fatal for the run.
    pub async fn connect(config: Config) -> Result<Self, VaultdumpError> {
        let settings = BrokerSettings::from_env(&config.broker)?;
        info!(address = %settings.address, approle = ?settings.approle, "authenticating to broker");
        let session = BrokerSession::authenticate(settings).await?;
        Ok(Self::with_session(config, session))
    }

    pub fn with_session(config: Config, session: BrokerSession) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(session),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<BrokerSession> {
        &self.session
    }

    pub async fn initialize_databases(&self) -> Initialized {
        initializer::initialize_databases(&self.config, &self.session).await
    }

    pub async fn run_backup(&self) -> RunReport {
        let init = self.initialize_databases().await;
        self.backup_all(init).await
    }

    pub async fn run_restore(&self) -> RunReport {
        let init = self.initialize_databases().await;
        self.restore_all(init).await
    }

    /// One spawned task per database. Each task returns its own outcome; the
    /// report is assembled only after all of them have joined.
    pub async fn backup_all(&self, init: Initialized) -> RunReport {
        let mut report = RunReport::new(Operation::Backup);

        for failure in init.failures {
            let record = match failure.metadata_dir.as_deref() {
                Some(dir) => {
                    let now = Utc::now();
                    let record = failed_record(&failure, None, now, now);
                    match persist(dir.to_path_buf(), record.clone()).await {
                        Ok(_) => Some(record),
                        Err(e) => {
                            warn!(
                                engine = %failure.engine,
                                name = %failure.name,
                                error = %e,
                                "failed to record initialization failure"
                            );
                            None
                        }
                    }
                }
                None => None,
            };
            report.push_backup(BackupOutcome::Failed { record, failure });
        }

        let (keys, handles): (Vec<_>, Vec<_>) = init
            .databases
            .into_iter()
            .map(|db| {
                let key = (InstanceKey::of(&db), db.config().name.clone(), db.instance_dir());
                (key, tokio::spawn(backup_instance(db)))
            })
            .unzip();

        for ((key, name, dir), joined) in keys.into_iter().zip(future::join_all(handles).await) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let failure = InstanceFailure {
                        engine: key.engine,
                        name,
                        database: Some(key.database),
                        metadata_dir: Some(dir.clone()),
                        stage: Stage::Backup,
                        error: VaultdumpError::TaskJoin(e.to_string()),
                    };
                    let now = Utc::now();
                    let record = failed_record(&failure, None, now, now);
                    let record = persist(dir, record.clone()).await.ok().map(|_| record);
                    BackupOutcome::Failed { record, failure }
                }
            };
            report.push_backup(outcome);
        }

        report.log_summary();
        report
    }

    /// Restore every database from its latest metadata record, at most
    /// `backup.restore_concurrency` at a time.
    pub async fn restore_all(&self, init: Initialized) -> RunReport {
        let mut report = RunReport::new(Operation::Restore);
        for failure in init.failures {
            report.push_restore(RestoreOutcome::Failed(failure));
        }

        let limit = self.config.backup.restore_concurrency.max(1);
        let outcomes: Vec<RestoreOutcome> = stream::iter(init.databases)
            .map(|db| async move { restore_instance(db).await })
            .buffer_unordered(limit)
            .collect()
            .await;
        for outcome in outcomes {
            report.push_restore(outcome);
        }

        report.log_summary();
        report
    }
}

async fn backup_instance(db: Database) -> BackupOutcome {
    let started_at = Utc::now();
    let clock = Instant::now();
    let backup = db.backup().await;
    let completed_at = Utc::now();
    let duration_ms = clock.elapsed().as_millis() as u64;

    let artifact = match backup {
        Ok(path) => finish_artifact(&db, path).await,
        Err(e) => Err((Stage::Backup, e.into())),
    };

    let (record, failure) = match artifact {
        Ok((path, compressed)) => {
            let size_bytes = match blocking({
                let path = path.clone();
                move || {
                    compression::artifact_size(&path).map_err(|source| CompressionError::Io {
                        path: path.clone(),
                        source,
                    })
                }
            })
            .await
            {
                Ok(size) => size,
                Err(e) => {
                    warn!(
                        database = %db.name(),
                        engine = %db.engine(),
                        error = %e,
                        "could not size artifact"
                    );
                    0
                }
            };
            let record = MetadataRecord {
                engine: db.engine(),
                database: db.name().to_string(),
                file_path: Some(path),
                status: RunStatus::Success,
                error: None,
                error_kind: None,
                method: Some(db.config().method.clone()),
                compressed,
                started_at,
                completed_at,
                duration_ms,
                size_bytes,
            };
            (record, None)
        }
        Err((stage, error)) => {
            let failure = InstanceFailure::for_database(&db, stage, error);
            let method = Some(db.config().method.clone());
            let mut record = failed_record(&failure, method, started_at, completed_at);
            record.duration_ms = duration_ms;
            (record, Some(failure))
        }
    };

    match (persist(db.instance_dir(), record.clone()).await, failure) {
        (Ok(_), None) => BackupOutcome::Succeeded(record),
        (Ok(_), Some(failure)) => BackupOutcome::Failed {
            record: Some(record),
            failure,
        },
        (Err(e), failure) => {
            if let Some(earlier) = failure {
                warn!(
                    database = %db.name(),
                    engine = %db.engine(),
                    error = %earlier.error,
                    "backup failed before metadata write"
                );
            }
            BackupOutcome::Failed {
                record: None,
                failure: InstanceFailure::for_database(&db, Stage::Metadata, e),
            }
        }
    }
}

/// Optional compression after a successful dump. Directory artifacts are
/// kept as-is.
async fn finish_artifact(
    db: &Database,
    path: PathBuf,
) -> Result<(PathBuf, bool), (Stage, VaultdumpError)> {
    if !db.config().compress {
        return Ok((path, false));
    }
    if path.is_dir() {
        info!(
            database = %db.name(),
            engine = %db.engine(),
            path = %path.display(),
            "directory artifact; compression skipped"
        );
        return Ok((path, false));
    }
    let compressed = blocking(move || compression::compress(&path))
        .await
        .map_err(|e| (Stage::Compress, e))?;
    Ok((compressed, true))
}

async fn restore_instance(db: Database) -> RestoreOutcome {
    let key = InstanceKey::of(&db);
    let meta_path = metadata::metadata_path(&db.instance_dir());

    let loaded = blocking(move || metadata::load(&meta_path).map_err(RestoreError::from)).await;
    let record = match loaded {
        Ok(record) => record,
        Err(e) => {
            return RestoreOutcome::Failed(InstanceFailure::for_database(&db, Stage::Restore, e));
        }
    };
    if !record.succeeded() {
        warn!(
            database = %db.name(),
            engine = %db.engine(),
            error = record.error.as_deref().unwrap_or("unknown"),
            "latest backup failed; restore skipped"
        );
        return RestoreOutcome::Skipped(key);
    }

    match restore_from_record(&db, &record).await {
        Ok(()) => RestoreOutcome::Restored(key),
        Err(e) => RestoreOutcome::Failed(InstanceFailure::for_database(&db, Stage::Restore, e)),
    }
}

async fn restore_from_record(db: &Database, record: &MetadataRecord) -> Result<(), VaultdumpError> {
    let artifact = record.file_path.clone().ok_or(RestoreError::NoArtifact)?;
    let method = record.method.as_deref();

    if !record.is_compressed() {
        return Ok(db.restore(&artifact, method).await?);
    }

    let scratch = ScratchFile(blocking(move || compression::decompress(&artifact)).await?);
    let result = db.restore(scratch.path(), method).await;
    drop(scratch);
    Ok(result?)
}

/// Decompressed restore input, removed when dropped whatever the restore
/// outcome.
struct ScratchFile(PathBuf);

impl ScratchFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %e, "failed to remove scratch file");
        }
    }
}

fn failed_record(
    failure: &InstanceFailure,
    method: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> MetadataRecord {
    MetadataRecord {
        engine: failure.engine,
        database: failure
            .database
            .clone()
            .unwrap_or_else(|| failure.name.clone()),
        file_path: None,
        status: RunStatus::Failed,
        error: Some(failure.error.to_string()),
        error_kind: Some(failure.kind()),
        method,
        compressed: false,
        started_at,
        completed_at,
        duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        size_bytes: 0,
    }
}

async fn persist(dir: PathBuf, record: MetadataRecord) -> Result<PathBuf, VaultdumpError> {
    blocking(move || metadata::write(&dir, &record)).await
}

async fn blocking<T, E>(
    f: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<T, VaultdumpError>
where
    T: Send + 'static,
    E: Into<VaultdumpError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultdumpError::TaskJoin(e.to_string()))?
        .map_err(Into::into)
}
