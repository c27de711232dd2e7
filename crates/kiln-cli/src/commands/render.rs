use super::{json_pretty, load_spec, CommandResult, EXIT_SUCCESS};
use kiln_core::{BuildRun, Engine};
use kiln_schema::BuildPlan;
use std::path::Path;

/// Print the compiled plan: the build file for daemon plans, JSON for
/// direct plans or when `--json` is set.
pub fn run(engine: &Engine, manifest: &Path, json: bool) -> CommandResult {
    let spec = load_spec(manifest)?;
    let plan = engine.plan(&spec, &BuildRun::new())?;
    match plan {
        BuildPlan::Daemon(ref daemon) if !json => print!("{}", daemon.to_build_file()),
        _ => println!("{}", json_pretty(&plan)?),
    }
    Ok(EXIT_SUCCESS)
}
