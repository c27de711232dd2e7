use super::{CommandResult, EXIT_FAILURE, EXIT_SUCCESS};
use kiln_core::KilnConfig;
use kiln_runtime::{CancelFlag, DaemonBackend};
use kiln_store::{ImageStore, ObjectStore, StoreLayout};
use std::path::Path;

pub fn run(config: &KilnConfig, store_path: &Path, json_output: bool) -> CommandResult {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_engine(config, store_path, &mut checks, &mut all_pass);

    let layout = StoreLayout::new(store_path);
    if layout.is_initialized() {
        checks.push(Check::pass("store_exists", "Store directory exists"));
        check_store(&layout, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "store_exists",
            "Store not initialized (will be created on first build)",
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_engine(
    config: &KilnConfig,
    store_path: &Path,
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    let missing = kiln_runtime::check_engine_prereqs(&config.engine);
    if !missing.is_empty() {
        *all_pass = false;
        checks.push(Check::fail(
            "engine_prereqs",
            &kiln_runtime::format_missing(&missing),
        ));
        return;
    }
    checks.push(Check::pass(
        "engine_prereqs",
        &format!("Container engine '{}' found", config.engine),
    ));

    let daemon = DaemonBackend::new(&config.backend_config(store_path, CancelFlag::new()));
    match daemon.check_version() {
        Ok(major) => checks.push(Check::pass(
            "engine_version",
            &format!(
                "Engine server major version {major} (minimum {})",
                config.min_engine_major
            ),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("engine_version", &e.to_string()));
        }
    }
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
        }
    }

    match ObjectStore::new(layout.clone()).list() {
        Ok(objects) => checks.push(Check::info(
            "objects",
            &format!("{} layer objects stored", objects.len()),
        )),
        Err(e) => checks.push(Check::warn("objects", &format!("Cannot list objects: {e}"))),
    }

    match ImageStore::new(layout.clone()).list() {
        Ok(images) => checks.push(Check::info(
            "images",
            &format!("{} direct images tagged", images.len()),
        )),
        Err(e) => checks.push(Check::warn("images", &format!("Cannot list images: {e}"))),
    }

    match kiln_core::StoreLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Store lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check store lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> CommandResult {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("kiln doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialized_store_passes_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut checks = Vec::new();
        let mut all_pass = true;
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        check_store(&layout, &mut checks, &mut all_pass);
        assert!(all_pass);
        assert!(checks.iter().any(|c| c.name == "store_lock" && c.status == "pass"));
        assert!(checks.iter().any(|c| c.message.contains("0 direct images")));
    }

    #[test]
    fn missing_engine_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig {
            engine: "kiln-no-such-engine-binary".to_owned(),
            ..KilnConfig::default()
        };
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_engine(&config, dir.path(), &mut checks, &mut all_pass);
        assert!(!all_pass);
        assert_eq!(checks[0].status, "fail");
    }
}
