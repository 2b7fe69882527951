use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{error, info};

use super::Target;
use super::process::ToolInvocation;
use crate::error::{BackupError, RestoreError, ToolError};

const ENGINE: &str = "mongodb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MongoMethod {
    Directory,
    DirectoryGzip,
    Archive,
    ArchiveGzip,
}

impl MongoMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MongoMethod::Directory => "directory",
            MongoMethod::DirectoryGzip => "directory-gzip",
            MongoMethod::Archive => "archive",
            MongoMethod::ArchiveGzip => "archive-gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MongoMethod::Directory | MongoMethod::DirectoryGzip => "dump",
            MongoMethod::Archive => "archive",
            MongoMethod::ArchiveGzip => "archive.gz",
        }
    }

    /// `--out=`/`--dir=` style flag plus optional `--gzip`.
    fn location_args(&self, dump: bool, path: &Path) -> Vec<String> {
        let path = path.display();
        let mut args = match self {
            MongoMethod::Directory | MongoMethod::DirectoryGzip if dump => {
                vec![format!("--out={path}")]
            }
            MongoMethod::Directory | MongoMethod::DirectoryGzip => vec![format!("--dir={path}")],
            MongoMethod::Archive | MongoMethod::ArchiveGzip => vec![format!("--archive={path}")],
        };
        if matches!(self, MongoMethod::DirectoryGzip | MongoMethod::ArchiveGzip) {
            args.push("--gzip".to_string());
        }
        args
    }
}

impl FromStr for MongoMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" => Ok(MongoMethod::Directory),
            "directory-gzip" => Ok(MongoMethod::DirectoryGzip),
            "archive" => Ok(MongoMethod::Archive),
            "archive-gzip" => Ok(MongoMethod::ArchiveGzip),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MongoDb {
    target: Target,
}

impl MongoDb {
    pub(super) fn new(target: Target) -> Self {
        Self { target }
    }

    pub(super) fn target(&self) -> &Target {
        &self.target
    }

    /// The Mongo tools take no password from the environment, so it goes into
    /// a private `--config` file that lives until the tool exits.
    fn password_file(&self, tool: &str) -> Result<NamedTempFile, ToolError> {
        let prepare = |source: std::io::Error| ToolError::Prepare {
            tool: tool.to_string(),
            source,
        };
        let mut file = tempfile::Builder::new()
            .prefix("vaultdump-mongo-")
            .suffix(".yaml")
            .tempfile()
            .map_err(prepare)?;
        writeln!(file, "password: {}", yaml_quote(self.target.credential.password()))
            .and_then(|_| file.flush())
            .map_err(prepare)?;
        Ok(file)
    }

    fn connection_args(&self, password_file: &Path) -> Vec<String> {
        let t = &self.target;
        vec![
            format!("--host={}", t.config.host),
            format!("--port={}", t.port()),
            format!("--username={}", t.credential.username),
            format!("--config={}", password_file.display()),
            "--authenticationDatabase=admin".to_string(),
            "--quiet".to_string(),
        ]
    }

    pub(super) async fn backup(&self) -> Result<PathBuf, BackupError> {
        let t = &self.target;
        let method: MongoMethod = t
            .config
            .method
            .parse()
            .map_err(BackupError::UnsupportedMethod)?;
        t.credential.ensure_valid()?;

        let backup_path = t.artifact_path(method.extension());
        Target::ensure_parent(&backup_path).await?;

        let password_file = self.password_file(&t.tools.dump)?;
        let mut args = self.connection_args(password_file.path());
        args.push(format!("--db={}", t.config.database));
        args.extend(method.location_args(true, &backup_path));

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
            envs: vec![],
            timeout: t.config.timeout,
        }
        .run()
        .await;
        drop(password_file);

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

    /// `mongorestore --drop`, scoped to this database's namespaces.
    pub(super) async fn restore(&self, artifact: &Path, method: &str) -> Result<(), RestoreError> {
        let t = &self.target;
        Target::ensure_artifact(artifact).await?;
        let method: MongoMethod = method
            .parse()
            .map_err(RestoreError::UnsupportedRestoreMethod)?;
        t.credential.ensure_valid()?;

        let password_file = self.password_file(&t.tools.restore)?;
        let mut args = self.connection_args(password_file.path());
        args.push(format!("--nsInclude={}.*", t.config.database));
        args.push("--drop".to_string());
        args.extend(method.location_args(false, artifact));

        info!(
            database = %t.config.database,
            engine = ENGINE,
            method = method.as_str(),
            source = %artifact.display(),
            "restore started"
        );
        let started = Instant::now();
        let run = ToolInvocation {
            tool: &t.tools.restore,
            args,
            envs: vec![],
            timeout: t.config.timeout,
        }
        .run()
        .await;
        drop(password_file);

        if let Err(e) = run {
            error!(
                database = %t.config.database,
                engine = ENGINE,
                source = %artifact.display(),
                error = %e,
                "restore failed"
            );
            return Err(e.into());
        }
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

fn yaml_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
