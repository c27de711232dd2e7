use super::{json_pretty, load_spec, spin_fail, spin_ok, spinner, CommandResult, EXIT_SUCCESS};
use kiln_core::{BuildRun, Engine};
use kiln_schema::Architecture;
use std::path::Path;

/// Regenerate the lockfile of `manifest` for the given architectures, or the
/// manifest's own architecture when none are given.
pub fn run(
    engine: &Engine,
    manifest: &Path,
    architectures: &[Architecture],
    json: bool,
) -> CommandResult {
    let spec = load_spec(manifest)?;
    let architectures = if architectures.is_empty() {
        vec![spec.architecture]
    } else {
        architectures.to_vec()
    };

    let pb = if json {
        None
    } else {
        Some(spinner(&format!("resolving packages for {}...", spec.project)))
    };
    let lock = match engine.generate_lockfile(&spec, &BuildRun::new(), &architectures) {
        Ok(lock) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("locked {} packages", lock.len()));
            }
            lock
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "package resolution failed");
            }
            return Err(e.into());
        }
    };

    if json {
        let pins: Vec<_> = lock
            .pins(spec.distribution)
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "version": p.version,
                    "release": p.release,
                    "architecture": p.architecture,
                    "rendered": p.render(spec.distribution),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "lockfile": spec.lockfile,
            "distribution": spec.distribution,
            "architectures": architectures,
            "pins": pins,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        for pin in lock.pins(spec.distribution) {
            println!("{}", pin.render(spec.distribution));
        }
        println!("wrote {}", spec.lockfile.display());
    }
    Ok(EXIT_SUCCESS)
}
