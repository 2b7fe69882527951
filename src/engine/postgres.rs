use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info};

use super::Target;
use super::process::ToolInvocation;
use crate::error::{BackupError, RestoreError};

const ENGINE: &str = "postgres";

/// `pg_dump -F` output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgMethod {
    Plain,
    Custom,
    Directory,
    Tar,
}

impl PgMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PgMethod::Plain => "plain",
            PgMethod::Custom => "custom",
            PgMethod::Directory => "directory",
            PgMethod::Tar => "tar",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PgMethod::Plain => "sql",
            PgMethod::Custom => "dump",
            PgMethod::Directory => "dir",
            PgMethod::Tar => "tar",
        }
    }
}

impl FromStr for PgMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" | "p" => Ok(PgMethod::Plain),
            "custom" | "c" => Ok(PgMethod::Custom),
            "directory" | "d" => Ok(PgMethod::Directory),
            "tar" | "t" => Ok(PgMethod::Tar),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Postgres {
    target: Target,
}

impl Postgres {
    pub(super) fn new(target: Target) -> Self {
        Self { target }
    }

    pub(super) fn target(&self) -> &Target {
        &self.target
    }

    fn connection_args(&self) -> Vec<String> {
        let t = &self.target;
        vec![
            "-h".into(),
            t.config.host.clone(),
            "-p".into(),
            t.port(),
            "-U".into(),
            t.credential.username.clone(),
            "-d".into(),
            t.config.database.clone(),
        ]
    }

    /// `pg_dump` into a timestamped artifact. The password travels in
    /// `PGPASSWORD`, never on argv.
    pub(super) async fn backup(&self) -> Result<PathBuf, BackupError> {
        let t = &self.target;
        let method: PgMethod = t
            .config
            .method
            .parse()
            .map_err(BackupError::UnsupportedMethod)?;
        t.credential.ensure_valid()?;

        let backup_path = t.artifact_path(method.extension());
        Target::ensure_parent(&backup_path).await?;

        let mut args = self.connection_args();
        args.extend([
            "-F".into(),
            method.as_str().into(),
            "-f".into(),
            backup_path.to_string_lossy().into_owned(),
        ]);

        info!(
            database = %t.config.database,
            engine = ENGINE,
            method = method.as_str(),
            path = %backup_path.display(),
            "backup started"
        );
        let started = Instant::now();
        let run = ToolInvocation {
            tool: &t.tools.dump,
            args,
            envs: vec![("PGPASSWORD", t.credential.password())],
            timeout: t.config.timeout,
        }
        .run()
        .await;

        if let Err(e) = run {
            error!(
                database = %t.config.database,
                engine = ENGINE,
                path = %backup_path.display(),
                error = %e,
                "backup failed"
            );
            return Err(e.into());
        }
        info!(
            database = %t.config.database,
            engine = ENGINE,
            path = %backup_path.display(),
            duration_ms = started.elapsed().as_millis() as u64,
            "backup completed"
        );
        Ok(backup_path)
    }

    /// Plain dumps go through `psql -f`; archive formats through `pg_restore -c`.
    pub(super) async fn restore(&self, artifact: &Path, method: &str) -> Result<(), RestoreError> {
        let t = &self.target;
        Target::ensure_artifact(artifact).await?;
        let method: PgMethod = method
            .parse()
            .map_err(RestoreError::UnsupportedRestoreMethod)?;
        t.credential.ensure_valid()?;

        let source = artifact.to_string_lossy().into_owned();
        let mut args = self.connection_args();
        let tool = match method {
            PgMethod::Plain => {
                args.extend(["-f".into(), source]);
                &t.tools.sql
            }
            PgMethod::Custom | PgMethod::Directory | PgMethod::Tar => {
                args.extend(["-c".into(), "-F".into(), method.as_str().into(), source]);
                &t.tools.restore
            }
        };

        info!(
            database = %t.config.database,
            engine = ENGINE,
            method = method.as_str(),
            source = %artifact.display(),
            "restore started"
        );
        let started = Instant::now();
        ToolInvocation {
            tool,
            args,
            envs: vec![("PGPASSWORD", t.credential.password())],
            timeout: t.config.timeout,
        }
        .run()
        .await
        .inspect_err(|e| {
            error!(
                database = %t.config.database,
                engine = ENGINE,
                source = %artifact.display(),
                error = %e,
                "restore failed"
            );
        })?;
        info!(
            database = %t.config.database,
            engine = ENGINE,
            source = %artifact.display(),
            duration_ms = started.elapsed().as_millis() as u64,
            "restore completed"
        );
        Ok(())
    }
}
