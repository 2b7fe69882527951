use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::CompressionError;

pub const COMPRESSED_EXT: &str = "gz";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn stream_err(path: &Path) -> impl FnOnce(io::Error) -> CompressionError {
    let path = path.to_path_buf();
    move |source| CompressionError::Io { path, source }
}

/// Gzip `path` into `path.gz` and remove the original.
///
/// Output goes to a `.partial` sibling first and is only renamed into place
/// once fully flushed; on any failure the partial file is discarded and the
/// original stays untouched.
pub fn compress(path: &Path) -> Result<PathBuf, CompressionError> {
    let meta = fs::metadata(path).map_err(|source| CompressionError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.is_dir() {
        return Err(CompressionError::NotAFile {
            path: path.to_path_buf(),
        });
    }

    let target = with_suffix(path, &format!(".{COMPRESSED_EXT}"));
    let partial = with_suffix(&target, ".partial");

    let result = (|| {
        let source = File::open(path).map_err(|source| CompressionError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let out = File::create(&partial).map_err(stream_err(&partial))?;
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        io::copy(&mut BufReader::new(source), &mut encoder).map_err(stream_err(path))?;
        let mut out = encoder.finish().map_err(stream_err(&partial))?;
        out.flush().map_err(stream_err(&partial))?;
        out.get_ref().sync_all().map_err(stream_err(&partial))?;
        fs::rename(&partial, &target).map_err(stream_err(&target))
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::remove_file(path).map_err(stream_err(path))?;
    debug!(source = %path.display(), path = %target.display(), "artifact compressed");
    Ok(target)
}

/// Inflate `path` (which must end in `.gz`) next to itself, suffix stripped.
/// The compressed source is kept; the caller owns the returned file.
pub fn decompress(path: &Path) -> Result<PathBuf, CompressionError> {
    let target = path
        .to_str()
        .and_then(|s| s.strip_suffix(&format!(".{COMPRESSED_EXT}")))
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| CompressionError::MissingSuffix {
            path: path.to_path_buf(),
            ext: COMPRESSED_EXT,
        })?;
    let partial = with_suffix(&target, ".partial");

    let source = File::open(path).map_err(|source| CompressionError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let result = (|| {
        let mut decoder = GzDecoder::new(BufReader::new(source));
        let mut out = BufWriter::new(File::create(&partial).map_err(stream_err(&partial))?);
        io::copy(&mut decoder, &mut out).map_err(stream_err(path))?;
        out.flush().map_err(stream_err(&partial))?;
        fs::rename(&partial, &target).map_err(stream_err(&target))
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    debug!(source = %path.display(), path = %target.display(), "artifact decompressed");
    Ok(target)
}

/// Size of a file, or the recursive sum for directory artifacts.
pub fn artifact_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    fs::read_dir(path)?.try_fold(0u64, |total, entry| {
        Ok(total + artifact_size(&entry?.path())?)
    })
}
