use crate::engine::CancelFlag;
use crate::retry::RetryPolicy;
use crate::RuntimeError;
use kiln_schema::{
    Architecture, BackendKind, BuildPlan, BuilderKind, ImageBuildResult, ImageId, ImageTag, OsDistribution,
    PackagePin,
};
use kiln_store::BuildLayout;
use std::path::PathBuf;

/// What the caller wants materialized besides the plan itself.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub tag: ImageTag,
    pub architecture: Architecture,
}

/// Settings shared by every backend constructor.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub engine_binary: String,
    pub store_root: PathBuf,
    pub min_engine_major: u32,
    pub pull_retry: RetryPolicy,
    pub cancel: CancelFlag,
}

impl BackendConfig {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            engine_binary: "docker".to_owned(),
            store_root: store_root.into(),
            min_engine_major: 19,
            pull_retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
        }
    }
}

/// Turns a compiled plan into an image.
///
/// Backends only consume plans; they never add or reorder steps.
pub trait ImageBackend: Send + Sync {
    fn kind(&self) -> BuilderKind;

    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Checks that must pass once before any build in a run.
    fn preflight(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// User the base image runs as when no `SetUser` has been seen.
    fn default_user(&self, base_reference: &str) -> Result<String, RuntimeError>;

    fn materialize(
        &self,
        plan: &BuildPlan,
        layout: &BuildLayout,
        request: &MaterializeRequest,
    ) -> Result<ImageBuildResult, RuntimeError>;

    fn image_exists(&self, id: &ImageId) -> Result<bool, RuntimeError>;

    /// Remove an image by tag. A missing image is not an error: whatever the
    /// backend reported is returned instead.
    fn remove(&self, tag: &str) -> Result<String, RuntimeError>;

    fn list_images(&self) -> Result<Vec<ImageTag>, RuntimeError>;

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported {
            backend: self.kind(),
            operation: format!("pull '{reference}'"),
        })
    }

    /// Query the package index of `base_reference` for the current version
    /// of each package. Network dependent; used only for lockfile generation.
    fn resolve_packages(
        &self,
        base_reference: &str,
        _distribution: OsDistribution,
        _architecture: Architecture,
        _packages: &[String],
    ) -> Result<Vec<PackagePin>, RuntimeError> {
        Err(RuntimeError::Unsupported {
            backend: self.kind(),
            operation: format!("resolve packages in '{base_reference}'"),
        })
    }
}

pub fn select_backend(
    kind: BackendKind,
    config: &BackendConfig,
) -> Result<Box<dyn ImageBackend>, RuntimeError> {
    let backend: Box<dyn ImageBackend> = match kind {
        BackendKind::Daemon => Box::new(crate::daemon::DaemonBackend::new(config)),
        BackendKind::Direct => Box::new(crate::direct::DirectBackend::new(&config.store_root)),
        BackendKind::Mock => Box::new(crate::mock::MockBackend::new()),
    };
    if !backend.available() {
        return Err(RuntimeError::BackendUnavailable(backend.name().to_owned()));
    }
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_in_process_backends() {
        let config = BackendConfig::new("/tmp/kiln-test-store");
        assert_eq!(
            select_backend(BackendKind::Mock, &config).unwrap().kind(),
            BuilderKind::Daemon
        );
        assert_eq!(
            select_backend(BackendKind::Direct, &config).unwrap().kind(),
            BuilderKind::Direct
        );
    }

    #[test]
    fn daemon_without_engine_is_unavailable() {
        let mut config = BackendConfig::new("/tmp/kiln-test-store");
        config.engine_binary = "kiln-no-such-engine-binary".to_owned();
        assert!(matches!(
            select_backend(BackendKind::Daemon, &config),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }
}
