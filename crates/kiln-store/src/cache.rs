use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use kiln_schema::{BuilderKind, ImageBuildResult};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Build results keyed by plan content, backend and tag.
///
/// This replaces the engine's own layer cache: builds always run with
/// caching disabled, and a hit here skips the backend entirely.
pub struct ResultCache {
    layout: StoreLayout,
}

impl ResultCache {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn key(plan_hash: &str, builder: BuilderKind, tag: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("plan:{plan_hash}\n").as_bytes());
        hasher.update(format!("builder:{builder}\n").as_bytes());
        hasher.update(format!("tag:{tag}\n").as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.layout.cache_dir().join(format!("{key}.json"))
    }

    pub fn get(&self, key: &str) -> Result<Option<ImageBuildResult>, StoreError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        match serde_json::from_str(&fs::read_to_string(&path)?) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                debug!("discarding unreadable cache entry {key}: {e}");
                fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &str, result: &ImageBuildResult) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(result)?;
        write_atomic(&self.entry_path(key), json.as_bytes())
    }

    pub fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
