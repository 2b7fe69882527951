//! On-disk run metadata: one JSON record per `(engine, database)` directory.

pub mod metadata;

pub use metadata::{METADATA_FILENAME, MetadataRecord, RunStatus};
