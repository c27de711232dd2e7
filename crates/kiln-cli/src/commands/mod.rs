pub mod build;
pub mod clean;
pub mod completions;
pub mod doctor;
pub mod images;
pub mod lock;
pub mod pull;
pub mod render;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{CoreError, ImageBuildSpec};
use kiln_schema::BackendKind;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Error reported to the user together with the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl From<CoreError> for Failure {
    fn from(e: CoreError) -> Self {
        let code = if e.is_configuration() {
            EXIT_MANIFEST_ERROR
        } else if matches!(e, CoreError::Store(_)) {
            EXIT_STORE_ERROR
        } else {
            EXIT_FAILURE
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub type CommandResult = Result<u8, Failure>;

pub fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "daemon" => Ok(BackendKind::Daemon),
        "direct" => Ok(BackendKind::Direct),
        "mock" => Ok(BackendKind::Mock),
        other => Err(format!(
            "unknown backend '{other}', expected daemon, direct or mock"
        )),
    }
}

pub fn load_spec(manifest: &Path) -> Result<ImageBuildSpec, Failure> {
    Ok(ImageBuildSpec::load(manifest)?)
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Color a build status word for terminal output.
pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "built" => Style::new().green().apply_to(status).to_string(),
        "cached" => Style::new().cyan().apply_to(status).to_string(),
        "failed" => Style::new().red().bold().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}
