use crate::backend::{ImageBackend, MaterializeRequest};
use crate::RuntimeError;
use chrono::Utc;
use kiln_schema::{
    Architecture, BuildPlan, BuilderKind, ImageBuildResult, ImageId, ImageTag, OsDistribution,
    PackagePin,
};
use kiln_store::BuildLayout;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-process stand-in for the daemon backend.
///
/// Consumes daemon plans, writes the same build file and ignore manifest the
/// daemon would, and derives image ids from the plan content. Records every
/// call so tests can assert on what reached the backend.
pub struct MockBackend {
    default_user: String,
    images: Mutex<BTreeMap<String, ImageId>>,
    materialized: Mutex<Vec<BuildPlan>>,
    probes: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            default_user: "root".to_owned(),
            images: Mutex::new(BTreeMap::new()),
            materialized: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
        }
    }
}

fn poisoned(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::ExecFailed(format!("mutex poisoned: {e}"))
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    /// Plans handed to `materialize`, in call order.
    pub fn materialized(&self) -> Vec<BuildPlan> {
        self.materialized
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Base references the default user was probed for.
    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl ImageBackend for MockBackend {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Daemon
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn default_user(&self, base_reference: &str) -> Result<String, RuntimeError> {
        self.probes
            .lock()
            .map_err(poisoned)?
            .push(base_reference.to_owned());
        Ok(self.default_user.clone())
    }

    fn materialize(
        &self,
        plan: &BuildPlan,
        layout: &BuildLayout,
        request: &MaterializeRequest,
    ) -> Result<ImageBuildResult, RuntimeError> {
        let BuildPlan::Daemon(daemon) = plan else {
            return Err(RuntimeError::PlanMismatch {
                backend: BuilderKind::Daemon,
                plan: plan.kind(),
            });
        };
        layout.write_build_file(&daemon.to_build_file())?;
        layout.write_ignore_manifest(&daemon.ignore_manifest())?;

        let content = plan
            .content_hash()
            .map_err(|e| RuntimeError::ExecFailed(format!("plan hash: {e}")))?;
        let image_id = ImageId::new(format!(
            "sha256:{}",
            blake3::hash(format!("{content}:{}", request.architecture).as_bytes()).to_hex()
        ));
        self.images
            .lock()
            .map_err(poisoned)?
            .insert(request.tag.to_string(), image_id.clone());
        self.materialized.lock().map_err(poisoned)?.push(plan.clone());

        Ok(ImageBuildResult {
            tag: request.tag.clone(),
            image_id,
            builder: BuilderKind::Daemon,
            created_at: Utc::now(),
        })
    }

    fn image_exists(&self, id: &ImageId) -> Result<bool, RuntimeError> {
        Ok(self
            .images
            .lock()
            .map_err(poisoned)?
            .values()
            .any(|existing| existing == id))
    }

    fn remove(&self, tag: &str) -> Result<String, RuntimeError> {
        match self.images.lock().map_err(poisoned)?.remove(tag) {
            Some(_) => Ok(String::new()),
            None => Ok(format!("Error: No such image: {tag}\n")),
        }
    }

    fn list_images(&self) -> Result<Vec<ImageTag>, RuntimeError> {
        Ok(self
            .images
            .lock()
            .map_err(poisoned)?
            .keys()
            .map(|t| ImageTag::new(t.as_str()))
            .collect())
    }

    fn pull(&self, _reference: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Every package resolves to version `1.0.0`, release `mock`.
    fn resolve_packages(
        &self,
        _base_reference: &str,
        distribution: OsDistribution,
        architecture: Architecture,
        packages: &[String],
    ) -> Result<Vec<PackagePin>, RuntimeError> {
        let arch = architecture.package_arch(distribution.package_manager());
        Ok(packages
            .iter()
            .map(|name| PackagePin::new(name.as_str(), "1.0.0", "mock", arch))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::DaemonPlan;

    fn plan(directive: &str) -> BuildPlan {
        BuildPlan::Daemon(DaemonPlan {
            directives: vec![directive.to_owned()],
            mounts: BTreeMap::new(),
        })
    }

    fn request() -> MaterializeRequest {
        MaterializeRequest {
            tag: ImageTag::new("m:1"),
            architecture: Architecture::X86_64,
        }
    }

    #[test]
    fn ids_follow_plan_content() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BuildLayout::new(dir.path());
        let backend = MockBackend::new();
        let a = backend.materialize(&plan("FROM a"), &layout, &request()).unwrap();
        let b = backend.materialize(&plan("FROM a"), &layout, &request()).unwrap();
        let c = backend.materialize(&plan("FROM c"), &layout, &request()).unwrap();
        assert_eq!(a.image_id, b.image_id);
        assert_ne!(a.image_id, c.image_id);
        assert_eq!(backend.materialized().len(), 3);
        assert!(layout.build_file().exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BuildLayout::new(dir.path());
        let backend = MockBackend::new();
        backend.materialize(&plan("FROM a"), &layout, &request()).unwrap();
        assert_eq!(backend.remove("m:1").unwrap(), "");
        assert!(backend.remove("m:1").unwrap().contains("No such image"));
        assert!(backend.list_images().unwrap().is_empty());
    }

    #[test]
    fn resolves_packages_for_architecture() {
        let backend = MockBackend::new();
        let pins = backend
            .resolve_packages(
                "ubuntu:20.04",
                OsDistribution::Ubuntu,
                Architecture::Aarch64,
                &["curl".to_owned()],
            )
            .unwrap();
        assert_eq!(pins, vec![PackagePin::new("curl", "1.0.0", "mock", "arm64")]);
    }

    #[test]
    fn default_user_is_configurable_and_recorded() {
        let backend = MockBackend::new().with_default_user("elastic");
        assert_eq!(backend.default_user("img:1").unwrap(), "elastic");
        assert_eq!(backend.probes(), vec!["img:1".to_owned()]);
    }
}
