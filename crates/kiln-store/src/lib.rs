//! Filesystem side of kiln.
//!
//! `BuildLayout` describes one build invocation's work directory (layer
//! context, ephemeral mounts, generated build file). `StoreLayout` is the
//! shared store root holding the content-addressable `ObjectStore`, direct
//! backend image records (`ImageStore`) and the build `ResultCache`.

pub mod cache;
pub mod images;
pub mod layers;
pub mod layout;
pub mod objects;

pub use cache::ResultCache;
pub use images::{ImageRecord, ImageStore, LayerRecord, TagEntry};
pub use layers::{pack_layer, unpack_layer, LayerOptions, Ownership};
pub use layout::{BuildLayout, StoreLayout, STORE_FORMAT_VERSION};
pub use objects::ObjectStore;

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so a preceding rename survives power loss.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` through a temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for object '{hash}': got {actual}")]
    IntegrityFailure { hash: String, actual: String },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("work directory does not exist: {}", .0.display())]
    MissingWorkDir(PathBuf),
    #[error("layer {ordinal} has no source directory at {}", .path.display())]
    MissingLayer { ordinal: u32, path: PathBuf },
    #[error("invalid ownership '{0}', expected 'user[:group]' or 'uid[:gid]'")]
    InvalidOwnership(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn missing_layer_message_names_ordinal_and_path() {
        let e = StoreError::MissingLayer {
            ordinal: 3,
            path: PathBuf::from("/w/context/layer3"),
        };
        let msg = e.to_string();
        assert!(msg.contains("layer 3"));
        assert!(msg.contains("/w/context/layer3"));
    }
}
