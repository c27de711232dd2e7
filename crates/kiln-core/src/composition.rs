use crate::CoreError;
use kiln_schema::{ImageBuildResult, ProjectId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Image results produced so far in one invocation, keyed by project.
///
/// Entries are write-once and never persisted. A fresh `BuildRun` is created
/// per invocation and passed to every build, so parallel builds of
/// independent projects can share it.
#[derive(Debug, Default)]
pub struct BuildRun {
    results: RwLock<HashMap<ProjectId, ImageBuildResult>>,
}

impl BuildRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of `project`. Registering the same project twice is
    /// an orchestration bug and fails with `DuplicateRegistration`.
    pub fn register(&self, project: ProjectId, result: ImageBuildResult) -> Result<(), CoreError> {
        let mut results = self
            .results
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if results.contains_key(&project) {
            return Err(CoreError::DuplicateRegistration(project));
        }
        debug!("registered {project} -> {} ({})", result.tag, result.image_id);
        results.insert(project, result);
        Ok(())
    }

    pub fn resolve(&self, project: &ProjectId) -> Option<ImageBuildResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project)
            .cloned()
    }

    /// Like [`resolve`](Self::resolve), failing with `UnresolvedBaseImage`
    /// when the project has not produced a result yet.
    pub fn resolve_required(&self, project: &ProjectId) -> Result<ImageBuildResult, CoreError> {
        self.resolve(project)
            .ok_or_else(|| CoreError::UnresolvedBaseImage {
                project: project.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_schema::{BuilderKind, ImageId, ImageTag};
    use std::sync::Arc;

    fn result(tag: &str) -> ImageBuildResult {
        ImageBuildResult {
            tag: ImageTag::new(tag),
            image_id: ImageId::new(format!("sha256:{}", blake3::hash(tag.as_bytes()).to_hex())),
            builder: BuilderKind::Daemon,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn register_then_resolve() {
        let run = BuildRun::new();
        assert!(run.resolve(&ProjectId::new("a")).is_none());
        run.register(ProjectId::new("a"), result("a:1")).unwrap();
        let got = run.resolve(&ProjectId::new("a")).unwrap();
        assert_eq!(got.tag, "a:1");
        assert_eq!(run.len(), 1);
    }

    #[test]
    fn registration_is_write_once() {
        let run = BuildRun::new();
        run.register(ProjectId::new("a"), result("a:1")).unwrap();
        let err = run.register(ProjectId::new("a"), result("a:2")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRegistration(_)));
        assert_eq!(run.resolve(&ProjectId::new("a")).unwrap().tag, "a:1");
    }

    #[test]
    fn missing_project_is_unresolved_base() {
        let run = BuildRun::new();
        let err = run.resolve_required(&ProjectId::new("missing")).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let run = Arc::new(BuildRun::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let run = Arc::clone(&run);
                std::thread::spawn(move || {
                    run.register(ProjectId::new(format!("p{i}")), result(&format!("p{i}:1")))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(run.len(), 16);
        for i in 0..16 {
            assert!(run.resolve(&ProjectId::new(format!("p{i}"))).is_some());
        }
    }
}
