//! File helpers for job payloads.
//!
//! Jobs use these to stage output on local disk:
//! - `ensure_dir` creates a directory tree
//! - `write_file` streams any `AsyncRead` to a path
//! - `write_bytes` / `write_json` for in-memory content
//! - `resolve` keeps job-supplied relative paths inside a root
//!
//! Every failure is wrapped with the path it concerns.

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("invalid path {0}: must be relative and stay below the root")]
    InvalidPath(PathBuf),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Create `path` and any missing parents.
///
/// Fails if something other than a directory already exists there.
pub async fn ensure_dir(path: impl AsRef<Path>) -> Result<(), StorageError> {
    let path = path.as_ref();
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(StorageError::NotADirectory(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(StorageError::io(path, e)),
    }

    fs::create_dir_all(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    tracing::debug!("Created directory {}", path.display());
    Ok(())
}

/// Stream `reader` into a new file at `path`, creating the enclosing
/// directory first. Returns the number of bytes written.
pub async fn write_file<R>(reader: &mut R, path: impl AsRef<Path>) -> Result<u64, StorageError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent).await?;
    }

    let file = fs::File::create(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let written = tokio::io::copy(reader, &mut writer)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    writer
        .shutdown()
        .await
        .map_err(|e| StorageError::io(path, e))?;

    tracing::debug!("Wrote {} bytes to {}", written, path.display());
    Ok(written)
}

/// Write `bytes` to `path`, creating the enclosing directory first.
pub async fn write_bytes(
    path: impl AsRef<Path>,
    bytes: impl AsRef<[u8]>,
) -> Result<u64, StorageError> {
    let mut reader = bytes.as_ref();
    write_file(&mut reader, path).await
}

/// Write `value` as pretty-printed JSON.
pub async fn write_json<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<u64, StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes(path, bytes).await
}

/// Join a relative path onto `root`, rejecting absolute paths and any
/// `..` component.
pub fn resolve(root: impl AsRef<Path>, relative: impl AsRef<Path>) -> Result<PathBuf, StorageError> {
    let relative = relative.as_ref();
    let escapes = relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(StorageError::InvalidPath(relative.to_path_buf()));
    }
    Ok(root.as_ref().join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_paths_below_the_root() {
        let root = Path::new("/srv/out");
        assert_eq!(
            resolve(root, "a/b.txt").unwrap(),
            PathBuf::from("/srv/out/a/b.txt")
        );
        assert_eq!(
            resolve(root, "./c.txt").unwrap(),
            PathBuf::from("/srv/out/./c.txt")
        );

        for bad in ["", "../x", "a/../../x", "/etc/passwd"] {
            assert!(
                matches!(resolve(root, bad), Err(StorageError::InvalidPath(_))),
                "{bad}"
            );
        }
    }
}
