use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::error::{ErrorKind, MetadataError};
use crate::service::compression::COMPRESSED_EXT;

pub const METADATA_FILENAME: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Outcome of the latest backup run of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub engine: Engine,
    pub database: String,
    #[serde(with = "artifact_path")]
    pub file_path: Option<PathBuf>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub size_bytes: u64,
}

impl MetadataRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Whether restore must inflate the artifact first.
    ///
    /// Records that carry `method` also carry an authoritative `compressed`
    /// flag; engines may gzip natively (`archive-gzip` ends in `.gz`), so the
    /// suffix only decides for older records written without either field.
    pub fn is_compressed(&self) -> bool {
        if self.compressed || self.method.is_some() {
            return self.compressed;
        }
        self.file_path
            .as_deref()
            .and_then(Path::extension)
            .is_some_and(|ext| ext == COMPRESSED_EXT)
    }
}

pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILENAME)
}

/// Serialize `record` as indented JSON to `<dir>/metadata.json`, replacing any
/// previous record. The file is written next to its final name and renamed
/// into place, so readers never observe a partial document.
pub fn write(dir: &Path, record: &MetadataRecord) -> Result<PathBuf, MetadataError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| MetadataError::Io { path, source }
    };

    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let path = metadata_path(dir);
    let tmp = dir.join(format!("{METADATA_FILENAME}.tmp"));

    let mut body = serde_json::to_vec_pretty(record).map_err(|source| MetadataError::Json {
        path: path.clone(),
        source,
    })?;
    body.push(b'\n');

    fs::write(&tmp, &body).map_err(io_err(&tmp))?;
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&path)(e));
    }
    Ok(path)
}

/// Decode the record at `path`.
pub fn load(path: &Path) -> Result<MetadataRecord, MetadataError> {
    let raw = fs::read(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| MetadataError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// `file_path` is absent on failure; on disk that is the literal `"none"`.
mod artifact_path {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::PathBuf;

    const SENTINEL: &str = "none";

    pub fn serialize<S: Serializer>(value: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(path) => s.serialize_str(&path.to_string_lossy()),
            None => s.serialize_str(SENTINEL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(SENTINEL))
            .map(PathBuf::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(status: RunStatus, file_path: Option<&str>) -> MetadataRecord {
        let now = Utc::now();
        MetadataRecord {
            engine: Engine::Postgres,
            database: "db1".into(),
            file_path: file_path.map(PathBuf::from),
            status,
            error: (status == RunStatus::Failed).then(|| "pg_dump exited with 1".to_string()),
            error_kind: (status == RunStatus::Failed).then_some(ErrorKind::ToolFailed),
            method: Some("plain".into()),
            compressed: false,
            started_at: now,
            completed_at: now,
            duration_ms: 12,
            size_bytes: 2048,
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempdir().unwrap();
        let rec = record(RunStatus::Success, Some("/b/postgres/db1/x-db1.sql"));
        let path = write(dir.path(), &rec).unwrap();
        assert_eq!(path, dir.path().join("metadata.json"));
        assert_eq!(load(&path).unwrap(), rec);
    }

    #[test]
    fn write_creates_missing_dir_and_overwrites() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("postgres").join("db1");
        write(&nested, &record(RunStatus::Success, Some("/a.sql"))).unwrap();
        write(&nested, &record(RunStatus::Failed, None)).unwrap();

        let entries: Vec<_> = fs::read_dir(&nested).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let loaded = load(&metadata_path(&nested)).unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert!(loaded.file_path.is_none());
    }

    #[test]
    fn failed_record_uses_none_sentinel() {
        let json = serde_json::to_value(record(RunStatus::Failed, None)).unwrap();
        assert_eq!(json["file_path"], "none");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_kind"], "tool_failed");
        assert_eq!(json["engine"], "postgres");
    }

    #[test]
    fn reads_minimal_legacy_record() {
        let raw = r#"{
            "engine": "mongodb",
            "database": "testdb1",
            "file_path": "/b/mongodb/testdb1/t-testdb1.archive.gz",
            "status": "success",
            "started_at": "2025-04-24T21:00:00Z",
            "completed_at": "2025-04-24T21:00:05Z",
            "duration_ms": 5000
        }"#;
        let rec: MetadataRecord = serde_json::from_str(raw).unwrap();
        assert!(rec.succeeded());
        assert!(rec.is_compressed());
        assert_eq!(rec.size_bytes, 0);
        assert!(rec.method.is_none());
    }

    #[test]
    fn native_gzip_dump_is_not_pipeline_compressed() {
        let mut rec = record(RunStatus::Success, Some("/b/mongodb/app/t-app.archive.gz"));
        rec.engine = Engine::MongoDb;
        rec.method = Some("archive-gzip".into());
        rec.compressed = false;
        assert!(!rec.is_compressed());

        rec.compressed = true;
        assert!(rec.is_compressed());
    }

    #[test]
    fn load_rejects_missing_and_invalid_files() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("metadata.json");
        assert!(matches!(load(&missing), Err(MetadataError::Io { .. })));

        fs::write(&missing, b"{\"engine\": \"postgres\",").unwrap();
        assert!(matches!(load(&missing), Err(MetadataError::Json { .. })));
    }
}
