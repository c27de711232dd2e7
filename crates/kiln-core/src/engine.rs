use crate::compiler::{
    base_reference, compile, needs_default_user, resolve_base_images, CompileOptions,
};
use crate::composition::BuildRun;
use crate::concurrency::StoreLock;
use crate::config::KilnConfig;
use crate::CoreError;
use kiln_runtime::{
    select_backend, CancelFlag, ImageBackend, MaterializeRequest, RuntimeError,
};
use kiln_schema::{
    parse_manifest_file, Architecture, BackendKind, BuildInstruction, BuildPlan, BuilderKind,
    ImageBuildResult, ImageTag, LockFile, ManifestV1, OsDistribution, ProjectId, META_MARKER,
};
use kiln_store::{pack_layer, BuildLayout, LayerOptions, ResultCache, StoreLayout};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Everything needed to build one image, resolved from a manifest.
#[derive(Debug, Clone)]
pub struct ImageBuildSpec {
    pub project: ProjectId,
    pub tag: ImageTag,
    pub distribution: OsDistribution,
    pub architecture: Architecture,
    pub isolate: bool,
    pub backend: BackendKind,
    pub instructions: Vec<BuildInstruction>,
    /// Work directory holding `context/layerN` and the generated files.
    pub workdir: PathBuf,
    pub lockfile: PathBuf,
}

impl ImageBuildSpec {
    /// Resolve a parsed manifest. Relative paths are taken from the
    /// manifest's directory.
    pub fn from_manifest(manifest: ManifestV1, manifest_path: &Path) -> Result<Self, CoreError> {
        let base_dir = manifest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let image = manifest.image;
        let architecture = match image.architecture {
            Some(arch) => arch,
            None => Architecture::host()?,
        };
        Ok(Self {
            project: image.project,
            tag: image.tag,
            distribution: image.distribution,
            architecture,
            isolate: image.isolate,
            backend: image.backend,
            instructions: manifest.instructions,
            workdir: base_dir.join(image.workdir.unwrap_or_else(|| PathBuf::from("."))),
            lockfile: base_dir.join(image.lockfile.unwrap_or_else(|| PathBuf::from("kiln.lock"))),
        })
    }

    pub fn load(manifest_path: &Path) -> Result<Self, CoreError> {
        let manifest = parse_manifest_file(manifest_path)?;
        Self::from_manifest(manifest, manifest_path)
    }

    /// Packages requested by every install, without index metadata
    /// artifacts.
    pub fn requested_packages(&self) -> Vec<String> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                BuildInstruction::Install { packages } => Some(packages.iter()),
                _ => None,
            })
            .flatten()
            .filter(|p| !p.contains(META_MARKER))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub result: ImageBuildResult,
    pub plan_hash: String,
    /// The result came from the build cache and the backend was not invoked.
    pub cached: bool,
}

/// Drives builds from spec to image.
///
/// Backends are created on first use and preflighted once per engine, so a
/// multi-image run checks the container engine version a single time.
pub struct Engine {
    layout: StoreLayout,
    config: KilnConfig,
    cancel: CancelFlag,
    cache: ResultCache,
    backends: Mutex<HashMap<&'static str, Arc<dyn ImageBackend>>>,
}

impl Engine {
    pub fn new(store_root: impl Into<PathBuf>, config: KilnConfig) -> Self {
        let layout = StoreLayout::new(store_root);
        debug!("engine store at {}", layout.root().display());
        Self {
            cache: ResultCache::new(layout.clone()),
            layout,
            config,
            cancel: CancelFlag::new(),
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Use `backend` for every request naming `kind`. Injected backends are
    /// not preflighted.
    #[must_use]
    pub fn with_backend(self, kind: BackendKind, backend: Arc<dyn ImageBackend>) -> Self {
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.as_str(), backend);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn ImageBackend>, CoreError> {
        let mut backends = self.backends.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = backends.get(kind.as_str()) {
            return Ok(Arc::clone(existing));
        }
        let config = self
            .config
            .backend_config(self.layout.root(), self.cancel.clone());
        let backend: Arc<dyn ImageBackend> = Arc::from(select_backend(kind, &config)?);
        backend.preflight()?;
        info!("using {} backend", backend.name());
        backends.insert(kind.as_str(), Arc::clone(&backend));
        Ok(backend)
    }

    fn load_lock(spec: &ImageBuildSpec) -> Result<LockFile, CoreError> {
        if spec.lockfile.exists() {
            Ok(LockFile::read_from_file(&spec.lockfile)?)
        } else {
            debug!("no lockfile at {}", spec.lockfile.display());
            Ok(LockFile::new())
        }
    }

    fn compile_options(
        &self,
        spec: &ImageBuildSpec,
        instructions: &[BuildInstruction],
        backend: &dyn ImageBackend,
    ) -> Result<CompileOptions, CoreError> {
        let default_user = if needs_default_user(instructions) {
            let reference = base_reference(instructions).ok_or_else(|| {
                CoreError::Configuration("instruction list has no base image reference".to_owned())
            })?;
            let user = backend.default_user(&reference)?;
            debug!("default user of {reference} is {user}");
            user
        } else {
            "root".to_owned()
        };
        Ok(CompileOptions {
            distribution: spec.distribution,
            architecture: spec.architecture,
            isolate: spec.isolate,
            backend: backend.kind(),
            default_user,
            ephemeral_target: self.config.ephemeral_target.clone(),
            repo_name: self.config.repo_name.clone(),
        })
    }

    /// Compile `spec` without materializing it.
    pub fn plan(&self, spec: &ImageBuildSpec, run: &BuildRun) -> Result<BuildPlan, CoreError> {
        let instructions = resolve_base_images(&spec.instructions, run)?;
        let backend = self.backend(spec.backend)?;
        let lock = Self::load_lock(spec)?;
        let options = self.compile_options(spec, &instructions, backend.as_ref())?;
        compile(&instructions, &lock, &options)
    }

    /// Build one image and register its result in `run`.
    pub fn build(&self, spec: &ImageBuildSpec, run: &BuildRun) -> Result<BuildOutcome, CoreError> {
        info!(
            "building {} ({}) for {}/{}",
            spec.tag, spec.project, spec.distribution, spec.architecture
        );
        let layout = BuildLayout::new(&spec.workdir);
        layout.prepare()?;
        self.layout.initialize()?;

        let instructions = resolve_base_images(&spec.instructions, run)?;
        let backend = self.backend(spec.backend)?;
        let lock = Self::load_lock(spec)?;
        let options = self.compile_options(spec, &instructions, backend.as_ref())?;

        if spec.isolate && options.backend == BuilderKind::Daemon {
            let repo = spec.distribution.local_repo_config(&self.config.repo_name)?;
            let path = layout.write_repo_config(&repo.file_name, &repo.contents)?;
            debug!("wrote local repository definition {}", path.display());
        }

        let plan = compile(&instructions, &lock, &options)?;
        let plan_hash = plan.content_hash()?;
        let context = context_digest(&layout, &instructions, &plan)?;
        let key = ResultCache::key(
            &format!("{plan_hash}:{context}"),
            plan.kind(),
            spec.tag.as_str(),
        );

        if let Some(hit) = self.cache.get(&key)? {
            if backend.image_exists(&hit.image_id)? {
                info!("{} is up to date ({})", hit.tag, hit.image_id.short());
                layout.write_build_info(&hit)?;
                run.register(spec.project.clone(), hit.clone())?;
                return Ok(BuildOutcome {
                    result: hit,
                    plan_hash,
                    cached: true,
                });
            }
            debug!("cached image {} is gone, rebuilding", hit.image_id);
            self.cache.invalidate(&key)?;
        }

        if self.cancel.is_cancelled() {
            return Err(CoreError::Runtime(RuntimeError::Cancelled));
        }

        let request = MaterializeRequest {
            tag: spec.tag.clone(),
            architecture: spec.architecture,
        };
        let result = {
            let _lock = if plan.kind() == BuilderKind::Direct {
                Some(StoreLock::acquire(&self.layout.lock_file())?)
            } else {
                None
            };
            backend.materialize(&plan, &layout, &request)?
        };

        layout.write_build_info(&result)?;
        if let Err(e) = self.cache.put(&key, &result) {
            warn!("failed to record build result in cache: {e}");
        }
        run.register(spec.project.clone(), result.clone())?;
        info!("built {} ({})", result.tag, result.image_id.short());
        Ok(BuildOutcome {
            result,
            plan_hash,
            cached: false,
        })
    }

    /// Build every spec in order, sharing one run so later images can use
    /// earlier ones as their base.
    pub fn build_all(
        &self,
        specs: &[ImageBuildSpec],
        run: &BuildRun,
    ) -> Result<Vec<BuildOutcome>, CoreError> {
        specs.iter().map(|spec| self.build(spec, run)).collect()
    }

    /// Resolve every requested package of `spec` to an exact pin, once per
    /// architecture, and write the lockfile.
    ///
    /// Pins for architectures not listed are kept from the existing
    /// lockfile.
    pub fn generate_lockfile(
        &self,
        spec: &ImageBuildSpec,
        run: &BuildRun,
        architectures: &[Architecture],
    ) -> Result<LockFile, CoreError> {
        let instructions = resolve_base_images(&spec.instructions, run)?;
        let reference = base_reference(&instructions).ok_or_else(|| {
            CoreError::Configuration("instruction list has no base image reference".to_owned())
        })?;
        let packages = spec.requested_packages();
        let mut lock = Self::load_lock(spec)?;

        if packages.is_empty() {
            info!("{} installs no packages", spec.project);
        } else {
            let backend = self.backend(spec.backend)?;
            for arch in architectures {
                info!(
                    "resolving {} packages for {}/{arch} in {reference}",
                    packages.len(),
                    spec.distribution
                );
                let pins =
                    backend.resolve_packages(&reference, spec.distribution, *arch, &packages)?;
                let missing: Vec<String> = packages
                    .iter()
                    .filter(|name| !pins.iter().any(|pin| &pin.name == *name))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(CoreError::UnresolvedPackage {
                        distribution: spec.distribution,
                        architecture: *arch,
                        packages: missing,
                    });
                }
                lock.replace_partition(spec.distribution, *arch, pins)?;
            }
        }

        lock.write_to_file(&spec.lockfile)?;
        info!("wrote {} pins to {}", lock.len(), spec.lockfile.display());
        Ok(lock)
    }

    pub fn pull(&self, kind: BackendKind, reference: &str) -> Result<(), CoreError> {
        info!("pulling {reference}");
        self.backend(kind)?.pull(reference)?;
        Ok(())
    }

    /// Remove the image tagged `tag`. A missing image is not an error; the
    /// engine's diagnostic output is returned instead.
    pub fn clean(&self, kind: BackendKind, tag: &str) -> Result<String, CoreError> {
        let output = self.backend(kind)?.remove(tag)?;
        if !output.trim().is_empty() {
            debug!("remove {tag}: {}", output.trim());
        }
        Ok(output)
    }

    pub fn images(&self, kind: BackendKind) -> Result<Vec<ImageTag>, CoreError> {
        Ok(self.backend(kind)?.list_images()?)
    }
}

/// Digest over everything a build reads besides the plan itself: the image
/// id behind every built-image base, every copied layer directory, and, when
/// the plan runs commands, every ephemeral mount source those commands see.
/// Feeds the build cache key alongside the plan hash.
fn context_digest(
    layout: &BuildLayout,
    instructions: &[BuildInstruction],
    plan: &BuildPlan,
) -> Result<String, CoreError> {
    let mut hasher = blake3::Hasher::new();
    let mut layers = BTreeSet::new();
    for instruction in instructions {
        match instruction {
            BuildInstruction::FromBuiltImage {
                project,
                image_id: Some(image_id),
                ..
            } => {
                hasher.update(format!("base {project} {image_id}\n").as_bytes());
            }
            BuildInstruction::Copy { layer, .. } => {
                layers.insert(*layer);
            }
            _ => {}
        }
    }
    for layer in layers {
        hasher.update(format!("layer{layer}\n").as_bytes());
        hash_source(&mut hasher, &layout.layer_dir(layer))?;
    }
    if let BuildPlan::Daemon(daemon) = plan {
        if daemon.directives.iter().any(|d| d.starts_with("RUN")) {
            for (name, source) in &daemon.mounts {
                hasher.update(format!("mount {name}\n").as_bytes());
                hash_source(&mut hasher, &layout.root().join(source))?;
            }
        }
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_source(hasher: &mut blake3::Hasher, path: &Path) -> Result<(), CoreError> {
    if path.is_dir() {
        hasher.update(&pack_layer(path, &LayerOptions::default())?);
    } else if path.is_file() {
        hasher.update(b"file\n");
        hasher.update(&std::fs::read(path)?);
    } else {
        hasher.update(b"missing\n");
    }
    Ok(())
}
