use crate::backend::{BackendConfig, ImageBackend, MaterializeRequest};
use crate::engine::ContainerEngine;
use crate::prereq::command_exists;
use crate::retry::{retry, RetryPolicy};
use crate::RuntimeError;
use chrono::Utc;
use kiln_schema::{
    Architecture, BuildPlan, BuilderKind, ImageBuildResult, ImageId, ImageTag, OsDistribution,
    PackagePin,
};
use kiln_store::BuildLayout;
use std::collections::BTreeSet;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Builds images by writing a build file and invoking an external container
/// engine. The engine's layer cache is always bypassed.
pub struct DaemonBackend {
    engine: ContainerEngine,
    min_major: u32,
    pull_retry: RetryPolicy,
    server_major: OnceLock<u32>,
}

impl DaemonBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            engine: ContainerEngine::new(config.engine_binary.clone())
                .with_cancel(config.cancel.clone()),
            min_major: config.min_engine_major,
            pull_retry: config.pull_retry,
            server_major: OnceLock::new(),
        }
    }

    pub fn engine(&self) -> &ContainerEngine {
        &self.engine
    }

    /// Query the engine's server version and fail if its major version is
    /// below the supported minimum. Only the first successful check talks to
    /// the engine.
    pub fn check_version(&self) -> Result<u32, RuntimeError> {
        if let Some(major) = self.server_major.get() {
            return Ok(*major);
        }
        let out = self
            .engine
            .run(["version", "--format", "{{.Server.Version}}"])?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "could not query engine version: {}",
                out.stderr.trim()
            )));
        }
        let reported = out.stdout.trim().replace('\'', "");
        let major = parse_major_version(&reported).ok_or_else(|| RuntimeError::EngineVersion {
            found: reported.clone(),
            minimum: self.min_major,
        })?;
        if major < self.min_major {
            return Err(RuntimeError::EngineVersion {
                found: reported,
                minimum: self.min_major,
            });
        }
        debug!("engine server version {reported}");
        Ok(*self.server_major.get_or_init(|| major))
    }

    /// Pull with an explicit sleeper, so callers can observe the backoff.
    pub fn pull_with(
        &self,
        reference: &str,
        sleep: &mut dyn FnMut(Duration),
    ) -> Result<(), RuntimeError> {
        let attempts = self.pull_retry.max_attempts.max(1);
        retry(&self.pull_retry, sleep, |attempt| {
            info!("pulling {reference} (attempt {})", attempt + 1);
            let out = self.engine.run(["pull", reference])?;
            if out.success() {
                Ok(())
            } else {
                Err(RuntimeError::ExecFailed(out.stderr.trim().to_owned()))
            }
        })
        .map_err(|e| match e {
            RuntimeError::Cancelled => RuntimeError::Cancelled,
            other => RuntimeError::TransientPull {
                reference: reference.to_owned(),
                attempts,
                message: other.to_string(),
            },
        })
    }
}

/// Major component of an engine version string such as `24.0.7` or `19.03.12`.
pub fn parse_major_version(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.trim().parse().ok()
}

impl ImageBackend for DaemonBackend {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Daemon
    }

    fn name(&self) -> &str {
        "daemon"
    }

    fn available(&self) -> bool {
        command_exists(self.engine.binary())
    }

    fn preflight(&self) -> Result<(), RuntimeError> {
        self.check_version().map(|_| ())
    }

    fn default_user(&self, base_reference: &str) -> Result<String, RuntimeError> {
        let out = self.engine.run([
            "run",
            "--rm",
            "--entrypoint",
            "/bin/sh",
            base_reference,
            "-c",
            "whoami",
        ])?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "could not determine default user of {base_reference}: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim().to_owned())
    }

    fn materialize(
        &self,
        plan: &BuildPlan,
        layout: &BuildLayout,
        request: &MaterializeRequest,
    ) -> Result<ImageBuildResult, RuntimeError> {
        let BuildPlan::Daemon(plan) = plan else {
            return Err(RuntimeError::PlanMismatch {
                backend: BuilderKind::Daemon,
                plan: plan.kind(),
            });
        };

        layout.write_build_file(&plan.to_build_file())?;
        layout.write_ignore_manifest(&plan.ignore_manifest())?;
        let iid = layout.image_id_file();
        if iid.exists() {
            fs::remove_file(&iid)?;
        }

        info!("building {} for {}", request.tag, request.architecture.platform());
        let iidfile = format!("--iidfile={}", iid.display());
        let out = self.engine.run_in(
            Some(layout.root()),
            [
                "image",
                "build",
                "--platform",
                request.architecture.platform(),
                "--quiet=false",
                "--no-cache",
                "--progress=plain",
                iidfile.as_str(),
                ".",
                "-t",
                request.tag.as_str(),
            ],
        )?;
        if !out.success() {
            return Err(RuntimeError::ImageBuild {
                log: out.combined(),
            });
        }

        let image_id = layout.read_image_id().map_err(|e| RuntimeError::ImageBuild {
            log: format!("{}\nengine did not write an image id: {e}", out.combined()),
        })?;
        Ok(ImageBuildResult {
            tag: request.tag.clone(),
            image_id: ImageId::new(image_id),
            builder: BuilderKind::Daemon,
            created_at: Utc::now(),
        })
    }

    fn image_exists(&self, id: &ImageId) -> Result<bool, RuntimeError> {
        Ok(self.engine.run(["image", "inspect", id.as_str()])?.success())
    }

    fn remove(&self, tag: &str) -> Result<String, RuntimeError> {
        let out = self.engine.run(["image", "rm", tag])?;
        if !out.success() {
            debug!("image rm {tag} exited with {:?}", out.code);
        }
        Ok(out.stderr)
    }

    fn list_images(&self) -> Result<Vec<ImageTag>, RuntimeError> {
        let out = self
            .engine
            .run(["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"])?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed(out.stderr.trim().to_owned()));
        }
        Ok(parse_image_list(&out.stdout))
    }

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        self.pull_with(reference, &mut std::thread::sleep)
    }

    fn resolve_packages(
        &self,
        base_reference: &str,
        distribution: OsDistribution,
        architecture: Architecture,
        packages: &[String],
    ) -> Result<Vec<PackagePin>, RuntimeError> {
        let query = distribution.query_command(packages);
        let out = self.engine.run([
            "run",
            "--rm",
            "--user",
            "root",
            "--platform",
            architecture.platform(),
            "--entrypoint",
            "/bin/sh",
            base_reference,
            "-c",
            query.as_str(),
        ])?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "package query in {base_reference} failed: {}",
                out.stderr.trim()
            )));
        }
        let wanted: BTreeSet<&str> = packages.iter().map(String::as_str).collect();
        Ok(distribution
            .parse_query_output(&out.stdout)
            .into_iter()
            .filter(|pin| wanted.contains(pin.name.as_str()))
            .collect())
    }
}

fn parse_image_list(output: &str) -> Vec<ImageTag> {
    let mut tags: Vec<ImageTag> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("<none>"))
        .map(ImageTag::from)
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Fake engine: a shell script answering the subcommands the backend uses.
    fn fake_engine(dir: &Path, script_body: &str) -> BackendConfig {
        let path = dir.join("fake-engine");
        fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = BackendConfig::new(dir.join("store"));
        config.engine_binary = path.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn parses_major_versions() {
        assert_eq!(parse_major_version("24.0.7"), Some(24));
        assert_eq!(parse_major_version("19.03.12"), Some(19));
        assert_eq!(parse_major_version("dev"), None);
    }

    #[test]
    fn old_engine_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_engine(dir.path(), "echo \"'18.09.1'\"");
        let backend = DaemonBackend::new(&config);
        assert!(matches!(
            backend.check_version(),
            Err(RuntimeError::EngineVersion { minimum: 19, .. })
        ));
    }

    #[test]
    fn supported_engine_passes_and_is_checked_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("calls");
        let config = fake_engine(
            dir.path(),
            &format!("echo x >> {}\necho 24.0.7", counter.display()),
        );
        let backend = DaemonBackend::new(&config);
        assert_eq!(backend.check_version().unwrap(), 24);
        assert_eq!(backend.check_version().unwrap(), 24);
        assert_eq!(fs::read_to_string(counter).unwrap().lines().count(), 1);
    }

    #[test]
    fn clean_of_missing_image_returns_engine_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_engine(
            dir.path(),
            "echo 'Error: No such image: ghost:1' >&2\nexit 1",
        );
        let backend = DaemonBackend::new(&config);
        let output = backend.remove("ghost:1").unwrap();
        assert!(output.contains("No such image"));
    }

    #[test]
    fn pull_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("calls");
        let config = fake_engine(
            dir.path(),
            &format!(
                "echo x >> {c}\nif [ $(wc -l < {c}) -lt 3 ]; then echo 'net/http: TLS handshake timeout' >&2; exit 1; fi",
                c = counter.display()
            ),
        );
        let backend = DaemonBackend::new(&config);
        let mut slept = Vec::new();
        backend
            .pull_with("ubuntu:20.04", &mut |d| slept.push(d))
            .unwrap();
        let total: Duration = slept.iter().sum();
        assert!(total >= Duration::from_secs(3));
    }

    #[test]
    fn pull_exhaustion_surfaces_last_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = fake_engine(dir.path(), "echo 'manifest unknown' >&2\nexit 1");
        let backend = DaemonBackend::new(&config);
        let err = backend.pull_with("nope:0", &mut |_| {}).unwrap_err();
        match err {
            RuntimeError::TransientPull {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("manifest unknown"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_build_carries_log_and_leaves_build_file() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let config = fake_engine(dir.path(), "echo 'step 3: apt-get: not found'\nexit 1");
        let backend = DaemonBackend::new(&config);
        let layout = BuildLayout::new(&work);
        layout.prepare().unwrap();
        let plan = BuildPlan::Daemon(kiln_schema::DaemonPlan {
            directives: vec!["FROM ubuntu:20.04".to_owned()],
            mounts: std::collections::BTreeMap::new(),
        });
        let request = MaterializeRequest {
            tag: ImageTag::new("t:1"),
            architecture: Architecture::X86_64,
        };
        let err = backend.materialize(&plan, &layout, &request).unwrap_err();
        match err {
            RuntimeError::ImageBuild { log } => assert!(log.contains("apt-get: not found")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(layout.build_file().exists());
        assert!(layout.ignore_file().exists());
    }

    #[test]
    fn successful_build_reads_image_id() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();
        // Writes the id to the path given by --iidfile=...
        let config = fake_engine(
            dir.path(),
            "for a in \"$@\"; do case $a in --iidfile=*) echo sha256:feed > \"${a#--iidfile=}\";; esac; done",
        );
        let backend = DaemonBackend::new(&config);
        let layout = BuildLayout::new(&work);
        layout.prepare().unwrap();
        let plan = BuildPlan::Daemon(kiln_schema::DaemonPlan {
            directives: vec!["FROM ubuntu:20.04".to_owned()],
            mounts: std::collections::BTreeMap::new(),
        });
        let request = MaterializeRequest {
            tag: ImageTag::new("t:1"),
            architecture: Architecture::X86_64,
        };
        let result = backend.materialize(&plan, &layout, &request).unwrap();
        assert_eq!(result.image_id, "sha256:feed");
        assert_eq!(result.builder, BuilderKind::Daemon);
    }

    #[test]
    fn image_list_skips_dangling() {
        let tags = parse_image_list("b:1\n<none>:<none>\na:2\nb:1\n");
        assert_eq!(tags, vec![ImageTag::new("a:2"), ImageTag::new("b:1")]);
    }
}
