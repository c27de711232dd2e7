use super::{
    colorize_status, json_pretty, load_spec, spin_fail, spin_ok, spinner, CommandResult,
    EXIT_SUCCESS,
};
use kiln_core::{BuildRun, Engine};
use std::path::PathBuf;

/// Build every manifest in order. Later manifests may use earlier images as
/// their base.
pub fn run(engine: &Engine, manifests: &[PathBuf], json: bool) -> CommandResult {
    let specs = manifests
        .iter()
        .map(|m| load_spec(m))
        .collect::<Result<Vec<_>, _>>()?;

    let build_run = BuildRun::new();
    let mut outcomes = Vec::with_capacity(specs.len());
    for spec in &specs {
        if kiln_core::shutdown_requested() {
            return Err(format!("interrupted before building {}", spec.tag).into());
        }
        let pb = if json {
            None
        } else {
            Some(spinner(&format!("building {}...", spec.tag)))
        };
        match engine.build(spec, &build_run) {
            Ok(outcome) => {
                if let Some(ref pb) = pb {
                    let status = if outcome.cached { "cached" } else { "built" };
                    spin_ok(
                        pb,
                        &format!(
                            "{} {} ({})",
                            colorize_status(status),
                            outcome.result.tag,
                            outcome.result.image_id.short()
                        ),
                    );
                }
                outcomes.push((spec.project.clone(), outcome));
            }
            Err(e) => {
                if let Some(ref pb) = pb {
                    spin_fail(pb, &format!("{} {}", colorize_status("failed"), spec.tag));
                }
                return Err(e.into());
            }
        }
    }

    if json {
        let payload: Vec<_> = outcomes
            .iter()
            .map(|(project, o)| {
                serde_json::json!({
                    "project": project,
                    "tag": o.result.tag,
                    "image_id": o.result.image_id,
                    "builder": o.result.builder,
                    "created_at": o.result.created_at,
                    "plan_hash": o.plan_hash,
                    "cached": o.cached,
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (project, o) in &outcomes {
            println!("{project}: {} {}", o.result.tag, o.result.image_id);
        }
    }
    Ok(EXIT_SUCCESS)
}
