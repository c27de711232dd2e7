use std::fmt;
use std::path::Path;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub(crate) fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check what the daemon backend needs on this host.
pub fn check_engine_prereqs(engine_binary: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if !command_exists(engine_binary) {
        missing.push(MissingPrereq {
            name: engine_binary.to_owned(),
            purpose: "building images through the container engine",
            install_hint: "install Docker Engine 19 or newer, or set engine in ~/.config/kiln/config.toml",
        });
    }
    missing
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nThe daemon backend needs these tools; the direct backend does not.");
    msg
}
