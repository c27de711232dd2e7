use super::{json_pretty, spin_fail, spin_ok, spinner, CommandResult, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_schema::BackendKind;

pub fn run(engine: &Engine, backend: BackendKind, reference: &str, json: bool) -> CommandResult {
    let pb = if json {
        None
    } else {
        Some(spinner(&format!("pulling {reference}...")))
    };
    if let Err(e) = engine.pull(backend, reference) {
        if let Some(ref pb) = pb {
            spin_fail(pb, &format!("pull of {reference} failed"));
        }
        return Err(e.into());
    }
    if let Some(ref pb) = pb {
        spin_ok(pb, &format!("pulled {reference}"));
    }
    if json {
        let payload = serde_json::json!({ "reference": reference, "status": "pulled" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
