//! Compiled build plans and the result exchanged between chained builds.

use crate::types::{ImageId, ImageTag, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Directory under the work dir holding per-ordinal layer roots.
pub const CONTEXT_DIR: &str = "context";

pub const BUILD_FILE_BANNER: &str = "\
##########################################################
#                                                        #
#        Auto generated build file. Do not edit.         #
#              Regenerate with: kiln render              #
#                                                        #
##########################################################";

pub const BUILD_FILE_SYNTAX: &str = "# syntax = docker/dockerfile:1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuilderKind {
    Daemon,
    Direct,
}

impl BuilderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build-time-only directory bind-mounted into `RUN` steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralMount {
    pub name: String,
    /// Source relative to the work directory.
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonPlan {
    pub directives: Vec<String>,
    /// Logical mount name to source path relative to the work directory.
    pub mounts: BTreeMap<String, PathBuf>,
}

impl DaemonPlan {
    /// Full build-file text: banner, syntax directive, then one rendered
    /// block per directive in order.
    pub fn to_build_file(&self) -> String {
        let mut out = String::new();
        out.push_str(BUILD_FILE_BANNER);
        out.push('\n');
        out.push_str(BUILD_FILE_SYNTAX);
        out.push('\n');
        out.push_str(&self.directives.join("\n"));
        out.push('\n');
        out
    }

    /// Ignore manifest excluding everything except the layer context and
    /// the ephemeral mount sources.
    pub fn ignore_manifest(&self) -> String {
        let mut out = String::from("**\n");
        out.push('!');
        out.push_str(CONTEXT_DIR);
        out.push('\n');
        for source in self.mounts.values() {
            out.push('!');
            out.push_str(&source.to_string_lossy());
            out.push('\n');
        }
        out
    }
}

/// How file modes are written into a direct-backend layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PermissionPolicy {
    /// Keep the mode bits of the source files.
    Preserve,
    /// Force the given modes on every entry.
    Fixed { file_mode: u32, dir_mode: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub ordinal: u32,
    /// Source directory relative to the work directory.
    pub source: PathBuf,
    pub destination: String,
    /// `uid[:gid]` or `user[:group]`; `None` keeps root ownership.
    pub ownership: Option<String>,
    pub permissions: PermissionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub cmd: String,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectBase {
    /// Registry reference, `image:version[@digest]`.
    Reference { reference: String },
    /// Output of an earlier build in the same run.
    BuiltImage {
        project: ProjectId,
        tag: ImageTag,
        image_id: ImageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPlan {
    pub base: DirectBase,
    pub layers: Vec<LayerDescriptor>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub healthcheck: Option<HealthCheckSpec>,
}

/// Backend-specific compiler output. Only the compiler builds one;
/// backends consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BuildPlan {
    Daemon(DaemonPlan),
    Direct(DirectPlan),
}

impl BuildPlan {
    pub fn kind(&self) -> BuilderKind {
        match self {
            Self::Daemon(_) => BuilderKind::Daemon,
            Self::Direct(_) => BuilderKind::Direct,
        }
    }

    /// Blake3 over the canonical JSON encoding of the plan.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Identity of a materialized image. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildResult {
    pub tag: ImageTag,
    pub image_id: ImageId,
    pub builder: BuilderKind,
    pub created_at: DateTime<Utc>,
}
