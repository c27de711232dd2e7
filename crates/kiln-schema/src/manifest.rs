use crate::distribution::{Architecture, OsDistribution};
use crate::instruction::{validate_instructions, BuildInstruction, InstructionError};
use crate::plan::BuilderKind;
use crate::types::{ImageTag, ProjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("image.tag must not be empty")]
    EmptyTag,
    #[error("invalid instruction list: {0}")]
    Instructions(#[from] InstructionError),
}

/// Execution backend requested by a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Daemon,
    Direct,
    /// In-process stand-in for the daemon, used by tests.
    Mock,
}

impl BackendKind {
    /// Shape of build plan this backend consumes.
    pub fn plan_kind(self) -> BuilderKind {
        match self {
            Self::Daemon | Self::Mock => BuilderKind::Daemon,
            Self::Direct => BuilderKind::Direct,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Direct => "direct",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    pub image: ImageSection,
    #[serde(default, rename = "instruction")]
    pub instructions: Vec<BuildInstruction>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub project: ProjectId,
    pub tag: ImageTag,
    pub distribution: OsDistribution,
    /// Defaults to the host architecture.
    #[serde(default)]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub backend: BackendKind,
    /// Lockfile path, relative to the manifest. Defaults to `kiln.lock`.
    #[serde(default)]
    pub lockfile: Option<PathBuf>,
    /// Work directory holding `context/layerN`, relative to the manifest.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl ManifestV1 {
    /// Packages requested by every `install` instruction, deduplicated.
    pub fn requested_packages(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .instructions
            .iter()
            .filter_map(|i| match i {
                BuildInstruction::Install { packages } => Some(packages.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    let manifest: ManifestV1 = toml::from_str(input)?;
    if manifest.manifest_version != 1 {
        return Err(ManifestError::UnsupportedVersion(manifest.manifest_version));
    }
    if manifest.image.tag.trim().is_empty() {
        return Err(ManifestError::EmptyTag);
    }
    validate_instructions(&manifest.instructions)?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}
