use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_schema::BackendKind;

pub fn run(engine: &Engine, backend: BackendKind, json: bool) -> CommandResult {
    let images = engine.images(backend)?;
    if json {
        println!("{}", json_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images");
    } else {
        for tag in &images {
            println!("{tag}");
        }
    }
    Ok(EXIT_SUCCESS)
}
