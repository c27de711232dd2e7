use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use kiln_schema::ObjectHash;
use std::fs;
use std::path::PathBuf;

/// Content-addressable blob store keyed by blake3.
///
/// Blobs live under a two-character fan-out directory
/// (`objects/ab/abcdef...`). Reads recompute the hash.
pub struct ObjectStore {
    layout: StoreLayout,
}

impl ObjectStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let fan = hash.get(..2).unwrap_or(hash);
        self.layout.objects_dir().join(fan).join(hash)
    }

    /// Store data and return its hash. Existing blobs are not rewritten.
    pub fn put(&self, data: &[u8]) -> Result<ObjectHash, StoreError> {
        let hash = blake3::hash(data).to_hex().to_string();
        let dest = self.object_path(&hash);
        if !dest.exists() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&dest, data)?;
        }
        Ok(ObjectHash::new(hash))
    }

    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(hash.to_owned()));
        }
        let data = fs::read(&path)?;
        let actual = blake3::hash(&data).to_hex();
        if actual.as_str() != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.object_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ObjectHash>, StoreError> {
        let dir = self.layout.objects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for fan in fs::read_dir(dir)? {
            let fan = fan?;
            if !fan.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fan.path())? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        hashes.push(ObjectHash::new(name));
                    }
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, ObjectStore::new(layout))
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let hash = store.put(b"layer bytes").unwrap();
        assert_eq!(store.get(&hash).unwrap(), b"layer bytes");
        assert!(store.exists(&hash));
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = test_store();
        let h1 = store.put(b"same").unwrap();
        let h2 = store.put(b"same").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn blobs_are_fanned_out() {
        let (dir, store) = test_store();
        let hash = store.put(b"x").unwrap();
        let expected = dir
            .path()
            .join("store/objects")
            .join(&hash[..2])
            .join(hash.as_str());
        assert!(expected.is_file());
    }

    #[test]
    fn corrupted_blob_detected() {
        let (dir, store) = test_store();
        let hash = store.put(b"original").unwrap();
        let path = dir
            .path()
            .join("store/objects")
            .join(&hash[..2])
            .join(hash.as_str());
        fs::write(path, b"tampered").unwrap();
        assert!(matches!(
            store.get(&hash),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn missing_blob_reported() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get("ffff"),
            Err(StoreError::ObjectNotFound(_))
        ));
        store.remove("ffff").unwrap();
    }
}
