//! Build orchestration for kiln.
//!
//! This crate ties the instruction model, the lockfile, the store, and the
//! image backends together: the [`compiler`] turns an ordered instruction
//! list into a backend-specific [`BuildPlan`](kiln_schema::BuildPlan), the
//! [`composition`] resolver threads image results between projects of one
//! run, and the [`Engine`] drives a full build from manifest to image.

pub mod compiler;
pub mod composition;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod render;

pub use compiler::{base_reference, compile, resolve_base_images, CompileOptions};
pub use composition::BuildRun;
pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use config::KilnConfig;
pub use engine::{BuildOutcome, Engine, ImageBuildSpec};

use kiln_runtime::RuntimeError;
use kiln_schema::{Architecture, DistributionError, LockError, OsDistribution, ProjectId};
use kiln_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "no lockfile pin for {} on {distribution}/{architecture}: {}. Regenerate the lockfile with 'kiln lock'.",
        noun(.packages),
        .packages.join(", ")
    )]
    UnresolvedPackage {
        distribution: OsDistribution,
        architecture: Architecture,
        packages: Vec<String>,
    },
    #[error("no image has been built for project '{project}' in this run; build it before the images based on it")]
    UnresolvedBaseImage { project: ProjectId },
    #[error("image build failed, engine output follows:\n{log}")]
    ImageBuild { log: String },
    #[error("pulling '{reference}' failed after {attempts} attempts: {message}")]
    TransientPull {
        reference: String,
        attempts: u32,
        message: String,
    },
    #[error("project '{0}' already registered a build result in this run")]
    DuplicateRegistration(ProjectId),
    #[error("manifest error: {0}")]
    Manifest(#[from] kiln_schema::ManifestError),
    #[error("instruction error: {0}")]
    Instruction(#[from] kiln_schema::InstructionError),
    #[error("lock error: {0}")]
    Lock(LockError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("config error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

fn noun(packages: &[String]) -> &'static str {
    if packages.len() == 1 {
        "package"
    } else {
        "packages"
    }
}

impl CoreError {
    /// Errors caused by user input that regenerating or editing fixes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnresolvedPackage { .. }
                | Self::UnresolvedBaseImage { .. }
                | Self::Manifest(_)
                | Self::Instruction(_)
                | Self::Lock(_)
                | Self::ConfigParse(_)
        )
    }
}

impl From<LockError> for CoreError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::UnresolvedPackages {
                distribution,
                architecture,
                packages,
            } => Self::UnresolvedPackage {
                distribution,
                architecture,
                packages,
            },
            other => Self::Lock(other),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingWorkDir(path) => Self::Configuration(format!(
                "work directory '{}' does not exist",
                path.display()
            )),
            StoreError::InvalidOwnership(spec) => {
                Self::Configuration(format!("invalid copy ownership '{spec}'"))
            }
            other => Self::Store(other),
        }
    }
}

impl From<RuntimeError> for CoreError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ImageBuild { log } => Self::ImageBuild { log },
            RuntimeError::TransientPull {
                reference,
                attempts,
                message,
            } => Self::TransientPull {
                reference,
                attempts,
                message,
            },
            RuntimeError::Store(store) => Self::from(store),
            other => Self::Runtime(other),
        }
    }
}

impl From<DistributionError> for CoreError {
    fn from(e: DistributionError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn lower_errors_map_into_taxonomy() {
        let e = CoreError::from(LockError::UnresolvedPackages {
            distribution: OsDistribution::Debian,
            architecture: Architecture::X86_64,
            packages: vec!["curl".to_owned(), "jq".to_owned()],
        });
        assert!(matches!(e, CoreError::UnresolvedPackage { ref packages, .. } if packages.len() == 2));
        assert!(e.to_string().contains("curl, jq"));
        assert!(e.is_configuration());

        let e = CoreError::from(StoreError::MissingWorkDir(PathBuf::from("/nope")));
        assert!(matches!(e, CoreError::Configuration(_)));

        let e = CoreError::from(RuntimeError::ImageBuild {
            log: "E: Unable to locate package".to_owned(),
        });
        assert!(matches!(e, CoreError::ImageBuild { ref log } if log.contains("locate")));
        assert!(!e.is_configuration());

        let e = CoreError::from(RuntimeError::Store(StoreError::MissingWorkDir(PathBuf::from(
            "/nope",
        ))));
        assert!(matches!(e, CoreError::Configuration(_)));
    }

    #[test]
    fn unsupported_isolation_is_configuration() {
        let e = CoreError::from(DistributionError::UnsupportedIsolation(OsDistribution::Alpine));
        assert!(matches!(e, CoreError::Configuration(_)));
    }
}
