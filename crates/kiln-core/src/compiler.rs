//! Instruction compiler: ordered instructions in, backend-specific plan out.
//!
//! Compilation is pure. Everything that needs the outside world (the base
//! image's default user, results of other projects) is resolved by the
//! caller beforehand and passed in.

use crate::composition::BuildRun;
use crate::render;
use crate::CoreError;
use kiln_schema::{
    Architecture, BuildInstruction, BuildPlan, BuilderKind, DaemonPlan, DirectBase, DirectPlan,
    EphemeralMount, HealthCheckSpec, LayerDescriptor, LockFile, OsDistribution, PermissionPolicy,
    META_MARKER, PACKAGES_MOUNT_TARGET,
};
use kiln_store::BuildLayout;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub distribution: OsDistribution,
    pub architecture: Architecture,
    pub isolate: bool,
    pub backend: BuilderKind,
    /// User the base image runs as, restored after an install when no
    /// `set_user` preceded it.
    pub default_user: String,
    /// Container path the `docker` ephemeral mount is bound to.
    pub ephemeral_target: String,
    /// Name of the local package repository used when isolating.
    pub repo_name: String,
}

impl CompileOptions {
    pub fn new(distribution: OsDistribution, architecture: Architecture, backend: BuilderKind) -> Self {
        Self {
            distribution,
            architecture,
            isolate: false,
            backend,
            default_user: "root".to_owned(),
            ephemeral_target: "/var/kiln-ephemeral".to_owned(),
            repo_name: "kiln-local".to_owned(),
        }
    }
}

/// Fill every `from_built_image` with the tag and image id the referenced
/// project registered earlier in `run`.
pub fn resolve_base_images(
    instructions: &[BuildInstruction],
    run: &BuildRun,
) -> Result<Vec<BuildInstruction>, CoreError> {
    instructions
        .iter()
        .map(|instruction| match instruction {
            BuildInstruction::FromBuiltImage { project, .. } => {
                let result = run.resolve_required(project)?;
                debug!("{project} resolves to {} ({})", result.tag, result.image_id);
                Ok(BuildInstruction::FromBuiltImage {
                    project: project.clone(),
                    tag: Some(result.tag),
                    image_id: Some(result.image_id),
                })
            }
            other => Ok(other.clone()),
        })
        .collect()
}

/// Reference of the base image, usable with the engine. `None` when the
/// list has no base or a built-image base is still unresolved.
pub fn base_reference(instructions: &[BuildInstruction]) -> Option<String> {
    match instructions.first()? {
        BuildInstruction::From {
            image,
            version,
            digest,
        } => Some(render::image_reference(image, version, digest.as_deref())),
        BuildInstruction::FromBuiltImage { tag, .. } => tag.as_ref().map(ToString::to_string),
        _ => None,
    }
}

/// Whether the default user of the base image is needed: an install runs
/// before any explicit `set_user`.
pub fn needs_default_user(instructions: &[BuildInstruction]) -> bool {
    for instruction in instructions {
        match instruction {
            BuildInstruction::SetUser { .. } => return false,
            BuildInstruction::Install { .. } => return true,
            _ => {}
        }
    }
    false
}

/// Ephemeral mounts bound into every `RUN` of a daemon build.
pub fn ephemeral_mounts(options: &CompileOptions) -> Result<Vec<EphemeralMount>, CoreError> {
    let mut mounts = vec![EphemeralMount {
        name: "docker".to_owned(),
        source: PathBuf::from(BuildLayout::DOCKER_MOUNT),
        target: options.ephemeral_target.clone(),
        read_only: true,
    }];
    if options.isolate {
        let repo = options.distribution.local_repo_config(&options.repo_name)?;
        let source = if repo.mount_directory {
            PathBuf::from(BuildLayout::REPOS_MOUNT)
        } else {
            PathBuf::from(BuildLayout::REPOS_MOUNT).join(&repo.file_name)
        };
        mounts.push(EphemeralMount {
            name: "repos".to_owned(),
            source,
            target: repo.mount_target.to_owned(),
            read_only: true,
        });
        mounts.push(EphemeralMount {
            name: "packages".to_owned(),
            source: PathBuf::from(BuildLayout::PACKAGES_MOUNT),
            target: PACKAGES_MOUNT_TARGET.to_owned(),
            read_only: false,
        });
    }
    Ok(mounts)
}

/// Compile `instructions` into a plan for `options.backend`.
///
/// Every `from_built_image` must already be resolved, see
/// [`resolve_base_images`]. Installs are restricted to pins in `lock` for the
/// target architecture.
pub fn compile(
    instructions: &[BuildInstruction],
    lock: &LockFile,
    options: &CompileOptions,
) -> Result<BuildPlan, CoreError> {
    kiln_schema::validate_instructions(instructions)?;
    match options.backend {
        BuilderKind::Daemon => compile_daemon(instructions, lock, options).map(BuildPlan::Daemon),
        BuilderKind::Direct => compile_direct(instructions, options).map(BuildPlan::Direct),
    }
}

fn unresolved_base(project: &kiln_schema::ProjectId) -> CoreError {
    CoreError::UnresolvedBaseImage {
        project: project.clone(),
    }
}

fn install_commands(
    packages: &std::collections::BTreeSet<String>,
    lock: &LockFile,
    options: &CompileOptions,
) -> Result<Option<Vec<String>>, CoreError> {
    let wanted: Vec<&str> = packages
        .iter()
        .map(String::as_str)
        .filter(|p| !p.contains(META_MARKER))
        .collect();
    if wanted.is_empty() {
        return Ok(None);
    }
    let pins = lock.pins_for(wanted, options.distribution, options.architecture)?;
    let rendered: Vec<String> = pins
        .iter()
        .map(|pin| pin.render(options.distribution))
        .collect();
    let install = options.distribution.install_command(&rendered);
    Ok(Some(options.distribution.wrap_install(options.isolate, install)?))
}

fn compile_daemon(
    instructions: &[BuildInstruction],
    lock: &LockFile,
    options: &CompileOptions,
) -> Result<DaemonPlan, CoreError> {
    let mounts = ephemeral_mounts(options)?;
    let mut directives = Vec::with_capacity(instructions.len());
    let mut current_user = options.default_user.clone();

    for instruction in instructions {
        match instruction {
            BuildInstruction::From {
                image,
                version,
                digest,
            } => directives.push(render::from_image(image, version, digest.as_deref())),
            BuildInstruction::FromBuiltImage { project, tag, .. } => {
                let tag = tag.as_ref().ok_or_else(|| unresolved_base(project))?;
                directives.push(render::from_built_image(project, tag));
            }
            BuildInstruction::Copy { layer, owner } => {
                directives.push(render::copy(*layer, owner.as_deref()));
            }
            BuildInstruction::Run { commands } => directives.push(render::run(commands, &mounts)),
            BuildInstruction::Install { packages } => {
                let Some(commands) = install_commands(packages, lock, options)? else {
                    continue;
                };
                directives.push(render::user("root"));
                directives.push(render::run(&commands, &mounts));
                directives.push(render::user(&current_user));
            }
            BuildInstruction::CreateUser {
                username,
                uid,
                group,
                gid,
            } => directives.push(render::create_user(username, *uid, group, *gid)),
            BuildInstruction::SetUser { username } => {
                current_user.clone_from(username);
                directives.push(render::user(username));
            }
            BuildInstruction::Env { key, value } => directives.push(render::env(key, value)),
            BuildInstruction::HealthCheck {
                cmd,
                interval,
                timeout,
                start_period,
                retries,
            } => directives.push(render::healthcheck(
                cmd,
                interval.as_deref(),
                timeout.as_deref(),
                start_period.as_deref(),
                *retries,
            )),
            BuildInstruction::RepoConfigRun { commands } => {
                if !options.isolate {
                    directives.push(render::run(commands, &[]));
                }
            }
        }
    }

    let mounts = mounts
        .into_iter()
        .map(|m| (m.name, m.source))
        .collect::<BTreeMap<_, _>>();
    Ok(DaemonPlan { directives, mounts })
}

fn cannot_execute(index: usize, kind: &str) -> CoreError {
    CoreError::Configuration(format!(
        "instruction {index} ({kind}) runs commands inside the image, which the direct backend cannot do; use the daemon backend"
    ))
}

fn compile_direct(
    instructions: &[BuildInstruction],
    options: &CompileOptions,
) -> Result<DirectPlan, CoreError> {
    let mut base = None;
    let mut layers = Vec::new();
    let mut env = Vec::new();
    let mut user = None;
    let mut healthcheck = None;

    for (index, instruction) in instructions.iter().enumerate() {
        match instruction {
            BuildInstruction::From {
                image,
                version,
                digest,
            } => {
                base = Some(DirectBase::Reference {
                    reference: render::image_reference(image, version, digest.as_deref()),
                });
            }
            BuildInstruction::FromBuiltImage {
                project,
                tag,
                image_id,
            } => {
                let (Some(tag), Some(image_id)) = (tag, image_id) else {
                    return Err(unresolved_base(project));
                };
                base = Some(DirectBase::BuiltImage {
                    project: project.clone(),
                    tag: tag.clone(),
                    image_id: image_id.clone(),
                });
            }
            BuildInstruction::Copy { layer, owner } => layers.push(LayerDescriptor {
                ordinal: *layer,
                source: BuildLayout::layer_relative(*layer),
                destination: "/".to_owned(),
                ownership: owner.clone(),
                permissions: PermissionPolicy::Preserve,
            }),
            BuildInstruction::SetUser { username } => user = Some(username.clone()),
            BuildInstruction::Env { key, value } => env.push((key.clone(), value.clone())),
            BuildInstruction::HealthCheck {
                cmd,
                interval,
                timeout,
                start_period,
                retries,
            } => {
                healthcheck = Some(HealthCheckSpec {
                    cmd: cmd.clone(),
                    interval: interval.clone(),
                    timeout: timeout.clone(),
                    start_period: start_period.clone(),
                    retries: *retries,
                });
            }
            BuildInstruction::RepoConfigRun { .. } if options.isolate => {}
            BuildInstruction::Run { .. }
            | BuildInstruction::Install { .. }
            | BuildInstruction::CreateUser { .. }
            | BuildInstruction::RepoConfigRun { .. } => {
                return Err(cannot_execute(index, instruction.kind()));
            }
        }
    }

    let base = base.ok_or_else(|| {
        CoreError::Configuration("instruction list has no base image reference".to_owned())
    })?;
    Ok(DirectPlan {
        base,
        layers,
        env,
        user,
        healthcheck,
    })
}
