use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use kiln_schema::{DirectBase, HealthCheckSpec, ImageId, ImageTag, ObjectHash};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const ID_PREFIX: &str = "blake3:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub ordinal: u32,
    pub digest: ObjectHash,
    pub size: u64,
    pub destination: String,
}

/// Image assembled by the direct backend. Its id is the hash of this record,
/// so identical inputs always produce the same id regardless of tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub base: DirectBase,
    pub layers: Vec<LayerRecord>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub healthcheck: Option<HealthCheckSpec>,
}

impl ImageRecord {
    pub fn compute_id(&self) -> Result<ImageId, StoreError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(ImageId::new(format!(
            "{ID_PREFIX}{}",
            blake3::hash(&bytes).to_hex()
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub tag: ImageTag,
    pub image_id: ImageId,
}

/// Image records and the tags pointing at them.
pub struct ImageStore {
    layout: StoreLayout,
}

impl ImageStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn record_path(&self, id: &ImageId) -> PathBuf {
        let hex = id.strip_prefix(ID_PREFIX).unwrap_or(id.as_str());
        self.layout.images_dir().join(format!("{hex}.json"))
    }

    fn tag_path(&self, tag: &str) -> PathBuf {
        self.layout
            .tags_dir()
            .join(blake3::hash(tag.as_bytes()).to_hex().as_str())
    }

    /// Store a record and point `tag` at it. Retagging moves the tag.
    pub fn put(&self, record: &ImageRecord, tag: &ImageTag) -> Result<ImageId, StoreError> {
        let id = record.compute_id()?;
        let path = self.record_path(&id);
        if !path.exists() {
            write_atomic(&path, serde_json::to_string_pretty(record)?.as_bytes())?;
        }
        let entry = TagEntry {
            tag: tag.clone(),
            image_id: id.clone(),
        };
        write_atomic(
            &self.tag_path(tag),
            serde_json::to_string_pretty(&entry)?.as_bytes(),
        )?;
        Ok(id)
    }

    pub fn get(&self, id: &ImageId) -> Result<ImageRecord, StoreError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StoreError::ImageNotFound(id.to_string()));
        }
        let record: ImageRecord = serde_json::from_str(&fs::read_to_string(path)?)?;
        let actual = record.compute_id()?;
        if &actual != id {
            return Err(StoreError::IntegrityFailure {
                hash: id.to_string(),
                actual: actual.into_inner(),
            });
        }
        Ok(record)
    }

    pub fn exists(&self, id: &ImageId) -> bool {
        self.record_path(id).exists()
    }

    pub fn resolve_tag(&self, tag: &str) -> Result<Option<ImageId>, StoreError> {
        let path = self.tag_path(tag);
        if !path.exists() {
            return Ok(None);
        }
        let entry: TagEntry = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Some(entry.image_id))
    }

    /// Drop a tag. Returns whether it existed. The record itself stays so
    /// other tags sharing the content keep working.
    pub fn untag(&self, tag: &str) -> Result<bool, StoreError> {
        let path = self.tag_path(tag);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn list(&self) -> Result<Vec<TagEntry>, StoreError> {
        let dir = self.layout.tags_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            entries.push(serde_json::from_str::<TagEntry>(&fs::read_to_string(
                entry.path(),
            )?)?);
        }
        entries.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, ImageStore::new(layout))
    }

    fn record() -> ImageRecord {
        ImageRecord {
            base: DirectBase::Reference {
                reference: "ubuntu:20.04".to_owned(),
            },
            layers: vec![LayerRecord {
                ordinal: 0,
                digest: ObjectHash::new("ab".repeat(32)),
                size: 10,
                destination: "/".to_owned(),
            }],
            env: vec![("A".to_owned(), "1".to_owned())],
            user: Some("app".to_owned()),
            healthcheck: None,
        }
    }

    #[test]
    fn id_is_content_derived_and_tag_independent() {
        let (_dir, store) = store();
        let a = store.put(&record(), &ImageTag::new("x:1")).unwrap();
        let b = store.put(&record(), &ImageTag::new("y:1")).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("blake3:"));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn get_verifies_record() {
        let (_dir, store) = store();
        let id = store.put(&record(), &ImageTag::new("x:1")).unwrap();
        assert_eq!(store.get(&id).unwrap(), record());
    }

    #[test]
    fn tags_resolve_and_untag() {
        let (_dir, store) = store();
        let id = store.put(&record(), &ImageTag::new("x:1")).unwrap();
        assert_eq!(store.resolve_tag("x:1").unwrap(), Some(id.clone()));
        assert!(store.untag("x:1").unwrap());
        assert!(!store.untag("x:1").unwrap());
        assert_eq!(store.resolve_tag("x:1").unwrap(), None);
        assert!(store.exists(&id));
    }

    #[test]
    fn missing_image_reported() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get(&ImageId::new("blake3:00")),
            Err(StoreError::ImageNotFound(_))
        ));
    }
}
