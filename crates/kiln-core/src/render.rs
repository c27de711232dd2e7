//! Build-file directive rendering, one function per instruction kind.
//!
//! Every function returns a complete directive (possibly spanning several
//! lines) without a trailing newline. The daemon plan joins them with `\n`.

use kiln_schema::{EphemeralMount, CONTEXT_DIR};

/// `image:version[@digest]`, the registry reference of a base image.
pub fn image_reference(image: &str, version: &str, digest: Option<&str>) -> String {
    match digest {
        Some(d) if !d.is_empty() => format!("{image}:{version}@{d}"),
        _ => format!("{image}:{version}"),
    }
}

pub fn from_image(image: &str, version: &str, digest: Option<&str>) -> String {
    format!("FROM {}", image_reference(image, version, digest))
}

/// Base produced by another project; the project id is kept as a comment so
/// the generated file stays traceable.
pub fn from_built_image(project: &str, tag: &str) -> String {
    format!("# {project}\nFROM {tag}")
}

pub fn copy(layer: u32, owner: Option<&str>) -> String {
    match owner {
        Some(o) if !o.is_empty() => format!("COPY --chown={o} {CONTEXT_DIR}/layer{layer} /"),
        _ => format!("COPY {CONTEXT_DIR}/layer{layer} /"),
    }
}

/// `--mount=type=bind,<mode>,target=<t>,source=<s>` for one ephemeral mount.
pub fn bind_mount(mount: &EphemeralMount) -> String {
    let mode = if mount.read_only {
        "readonly"
    } else {
        "readwrite"
    };
    format!(
        "--mount=type=bind,{mode},target={},source={}",
        mount.target,
        mount.source.to_string_lossy()
    )
}

fn join_commands(commands: &[String]) -> String {
    commands.join(" && \\\n\t")
}

/// `RUN` with every ephemeral mount bound for the duration of the step.
pub fn run(commands: &[String], mounts: &[EphemeralMount]) -> String {
    if mounts.is_empty() {
        return format!("RUN {}", join_commands(commands));
    }
    let flags: Vec<String> = mounts.iter().map(bind_mount).collect();
    format!("RUN {} \\\n {}", flags.join(" "), join_commands(commands))
}

pub fn user(username: &str) -> String {
    format!("USER {username}")
}

/// `ENV key=value`, quoting the value when it holds whitespace or quotes.
pub fn env(key: &str, value: &str) -> String {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("ENV {key}=\"{escaped}\"")
    } else {
        format!("ENV {key}={value}")
    }
}

/// `HEALTHCHECK` with a flag for each field that is present and nothing
/// for the ones that are not.
pub fn healthcheck(
    cmd: &str,
    interval: Option<&str>,
    timeout: Option<&str>,
    start_period: Option<&str>,
    retries: Option<u32>,
) -> String {
    let mut out = String::from("HEALTHCHECK ");
    if let Some(v) = interval {
        out.push_str(&format!("--interval={v} "));
    }
    if let Some(v) = timeout {
        out.push_str(&format!("--timeout={v} "));
    }
    if let Some(v) = start_period {
        out.push_str(&format!("--start-period={v} "));
    }
    if let Some(v) = retries {
        out.push_str(&format!("--retries={v} "));
    }
    out.push_str("CMD ");
    out.push_str(cmd);
    out
}

/// Group and system user creation that works with both shadow-utils and
/// busybox based images.
pub fn create_user(username: &str, uid: u32, group: &str, gid: u32) -> String {
    format!(
        "RUN if ! command -v busybox > /dev/null 2>&1; then \\\n\
         \tgroupadd -g {gid} {group} ; \\\n\
         \tuseradd -r -s /bin/false -g {gid} --uid {uid} {username} ; \\\n\
         else \\\n\
         \taddgroup -g {gid} {group} ; \\\n\
         \tadduser -S -s /bin/false -G {group} -H -D -u {uid} {username} ; \\\n\
         fi"
    )
}
