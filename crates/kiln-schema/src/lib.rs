//! Schema layer for kiln: build instructions, OS distribution policy,
//! package pins and lockfiles, compiled build plans, and image manifests.
//!
//! Everything here is pure data plus the formatting rules other crates rely
//! on for byte-identical build-file output (`PackagePin::render`, the
//! per-distribution install and repository commands).

pub mod distribution;
pub mod instruction;
pub mod lock;
pub mod manifest;
pub mod plan;
pub mod types;

pub use distribution::{
    Architecture, DistributionError, OsDistribution, PackageManager, RepoConfig,
    META_MARKER, PACKAGES_MOUNT_TARGET,
};
pub use instruction::{validate_instructions, BuildInstruction, InstructionError};
pub use lock::{LockError, LockFile, PackagePin};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, BackendKind, ImageSection, ManifestError, ManifestV1,
};
pub use plan::{
    BuildPlan, BuilderKind, DaemonPlan, DirectBase, DirectPlan, EphemeralMount, HealthCheckSpec,
    ImageBuildResult, LayerDescriptor, PermissionPolicy, CONTEXT_DIR,
};
pub use types::{ImageId, ImageTag, ObjectHash, ProjectId};
