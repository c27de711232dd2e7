//! The closed set of build steps an image is described with.

use crate::types::{ImageId, ImageTag, ProjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstructionError {
    #[error("instruction list is empty, expected a base image first")]
    Empty,
    #[error("first instruction must be a base image, found '{0}'")]
    MissingBase(&'static str),
    #[error("instruction {index} declares a second base image, only one is allowed")]
    MultipleBases { index: usize },
    #[error("instruction {index} ({kind}) is invalid: {reason}")]
    Invalid {
        index: usize,
        kind: &'static str,
        reason: String,
    },
}

/// One declarative step of image construction.
///
/// Serialized with an internal `kind` tag so manifests read as
/// `kind = "install"` followed by the variant fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildInstruction {
    From {
        image: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },
    /// Base image produced by another project earlier in the same run.
    /// `tag` and `image_id` are filled in by composition resolution.
    FromBuiltImage {
        project: ProjectId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<ImageTag>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_id: Option<ImageId>,
    },
    Copy {
        layer: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    Run {
        commands: Vec<String>,
    },
    Install {
        packages: BTreeSet<String>,
    },
    CreateUser {
        username: String,
        uid: u32,
        group: String,
        gid: u32,
    },
    SetUser {
        username: String,
    },
    Env {
        key: String,
        value: String,
    },
    HealthCheck {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_period: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retries: Option<u32>,
    },
    RepoConfigRun {
        commands: Vec<String>,
    },
}

impl BuildInstruction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::From { .. } => "from",
            Self::FromBuiltImage { .. } => "from_built_image",
            Self::Copy { .. } => "copy",
            Self::Run { .. } => "run",
            Self::Install { .. } => "install",
            Self::CreateUser { .. } => "create_user",
            Self::SetUser { .. } => "set_user",
            Self::Env { .. } => "env",
            Self::HealthCheck { .. } => "health_check",
            Self::RepoConfigRun { .. } => "repo_config_run",
        }
    }

    pub fn is_base(&self) -> bool {
        matches!(self, Self::From { .. } | Self::FromBuiltImage { .. })
    }

    /// Projects whose results this instruction depends on.
    pub fn referenced_project(&self) -> Option<&ProjectId> {
        match self {
            Self::FromBuiltImage { project, .. } => Some(project),
            _ => None,
        }
    }
}

/// Check the structural invariants of an instruction list: exactly one base
/// image, placed first, and no empty field that would render an invalid step.
pub fn validate_instructions(instructions: &[BuildInstruction]) -> Result<(), InstructionError> {
    let first = instructions.first().ok_or(InstructionError::Empty)?;
    if !first.is_base() {
        return Err(InstructionError::MissingBase(first.kind()));
    }

    for (index, instruction) in instructions.iter().enumerate().skip(1) {
        if instruction.is_base() {
            return Err(InstructionError::MultipleBases { index });
        }
    }

    for (index, instruction) in instructions.iter().enumerate() {
        let reason = match instruction {
            BuildInstruction::From { image, .. } if image.trim().is_empty() => {
                Some("base image name is empty")
            }
            BuildInstruction::Run { commands } | BuildInstruction::RepoConfigRun { commands }
                if commands.is_empty() =>
            {
                Some("no commands")
            }
            BuildInstruction::Install { packages } if packages.is_empty() => Some("no packages"),
            BuildInstruction::SetUser { username } if username.is_empty() => {
                Some("username is empty")
            }
            BuildInstruction::Env { key, .. } if key.is_empty() => Some("key is empty"),
            BuildInstruction::HealthCheck { cmd, .. } if cmd.is_empty() => Some("cmd is empty"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(InstructionError::Invalid {
                index,
                kind: instruction.kind(),
                reason: reason.to_owned(),
            });
        }
    }
    Ok(())
}
