use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_schema::BackendKind;

/// Remove images by tag. Tags that do not exist are reported, not failed.
pub fn run(engine: &Engine, backend: BackendKind, tags: &[String], json: bool) -> CommandResult {
    let mut results = Vec::with_capacity(tags.len());
    for tag in tags {
        let output = engine.clean(backend, tag)?;
        results.push((tag, output));
    }

    if json {
        let payload: Vec<_> = results
            .iter()
            .map(|(tag, output)| {
                serde_json::json!({
                    "tag": tag,
                    "removed": output.trim().is_empty(),
                    "output": output.trim(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (tag, output) in &results {
            if output.trim().is_empty() {
                println!("removed {tag}");
            } else {
                eprintln!("{}", output.trim());
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
