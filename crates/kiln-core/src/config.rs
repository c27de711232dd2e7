use crate::CoreError;
use kiln_runtime::{BackendConfig, CancelFlag, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Tool configuration, `~/.config/kiln/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Container engine binary, looked up on `PATH` unless it holds a `/`.
    pub engine: String,
    /// Container path of the read-only ephemeral mount.
    pub ephemeral_target: String,
    /// Store root; `~/.local/share/kiln` when unset.
    pub store: Option<PathBuf>,
    pub min_engine_major: u32,
    /// Name of the local package repository used by isolated builds.
    pub repo_name: String,
    pub pull_retry: RetryPolicy,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_owned(),
            ephemeral_target: "/var/kiln-ephemeral".to_owned(),
            store: None,
            min_engine_major: 19,
            repo_name: "kiln-local".to_owned(),
            pull_retry: RetryPolicy::default(),
        }
    }
}

impl KilnConfig {
    /// Load from the default location. A missing file yields defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Configuration(format!("cannot serialize config: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }

    /// Store root from the config, else `$XDG_DATA_HOME/kiln`, else
    /// `~/.local/share/kiln`.
    pub fn store_root(&self) -> PathBuf {
        if let Some(store) = &self.store {
            return store.clone();
        }
        if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
            return PathBuf::from(data).join("kiln");
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/kiln"),
            None => PathBuf::from(".kiln"),
        }
    }

    pub fn backend_config(&self, store_root: &Path, cancel: CancelFlag) -> BackendConfig {
        BackendConfig {
            engine_binary: self.engine.clone(),
            store_root: store_root.to_path_buf(),
            min_engine_major: self.min_engine_major,
            pull_retry: self.pull_retry,
            cancel,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(config).join("kiln/config.toml"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/kiln/config.toml"))
}
