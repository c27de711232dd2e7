//! CLI subprocess integration tests.
//!
//! These tests invoke the `kiln` binary as a subprocess and verify exit
//! codes, stdout content, and JSON output stability. Manifests use the mock
//! backend, so no container engine is needed.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn kiln(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
        cmd.env("KILN_SKIP_PREREQS", "1")
            .env("XDG_CONFIG_HOME", self.path().join("config"))
            .env_remove("KILN_LOG")
            .arg("--store")
            .arg(self.path().join("store"));
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.kiln().args(args).output().unwrap()
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn manifest(project: &str, tag: &str, base: &str, extra: &str) -> String {
    format!(
        r#"manifest_version = 1

[image]
project = "{project}"
tag = "{tag}"
distribution = "ubuntu"
architecture = "x86_64"
backend = "mock"

{base}
{extra}"#
    )
}

const FROM_UBUNTU: &str = "[[instruction]]\nkind = \"from\"\nimage = \"ubuntu\"\nversion = \"20.04\"\n";

const INSTALL_CURL: &str = "[[instruction]]\nkind = \"install\"\npackages = [\"curl\"]\n";

#[test]
fn cli_version_exits_zero() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("kiln"));
}

#[test]
fn cli_help_lists_commands() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["--help"]);
    assert!(output.status.success());
    let out = stdout(&output);
    for cmd in ["build", "lock", "render", "pull", "clean", "images", "doctor"] {
        assert!(out.contains(cmd), "help must list '{cmd}': {out}");
    }
}

#[test]
fn cli_build_json_reports_result() {
    let sandbox = Sandbox::new();
    let path = sandbox.write(
        "app/kiln.toml",
        &manifest("app", "example/app:1", FROM_UBUNTU, ""),
    );
    let output = sandbox.run(&["--json", "build", path.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let first = &json.as_array().unwrap()[0];
    assert_eq!(first["project"], "app");
    assert_eq!(first["tag"], "example/app:1");
    assert_eq!(first["builder"], "DAEMON");
    assert_eq!(first["cached"], false);
    assert!(first["image_id"].as_str().unwrap().starts_with("sha256:"));
    assert!(sandbox.path().join("app/Dockerfile").exists());
}

#[test]
fn cli_builds_chained_projects_in_order() {
    let sandbox = Sandbox::new();
    let base = sandbox.write(
        "base/kiln.toml",
        &manifest("base", "example/base:1", FROM_UBUNTU, ""),
    );
    let derived = sandbox.write(
        "derived/kiln.toml",
        &manifest(
            "derived",
            "example/derived:1",
            "[[instruction]]\nkind = \"from_built_image\"\nproject = \"base\"\n",
            "",
        ),
    );

    let output = sandbox.run(&["build", base.to_str().unwrap(), derived.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let build_file = std::fs::read_to_string(sandbox.path().join("derived/Dockerfile")).unwrap();
    assert!(build_file.contains("FROM example/base:1"));

    let reversed = sandbox.run(&["build", derived.to_str().unwrap(), base.to_str().unwrap()]);
    assert_eq!(reversed.status.code(), Some(2));
    assert!(stderr(&reversed).contains("'base'"));
}

#[test]
fn cli_missing_pin_exits_with_manifest_error() {
    let sandbox = Sandbox::new();
    let path = sandbox.write(
        "app/kiln.toml",
        &manifest("app", "example/app:1", FROM_UBUNTU, INSTALL_CURL),
    );
    let output = sandbox.run(&["build", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
    let err = stderr(&output);
    assert!(err.contains("curl"), "{err}");
    assert!(err.contains("kiln lock"), "{err}");
}

#[test]
fn cli_lock_then_build() {
    let sandbox = Sandbox::new();
    let path = sandbox.write(
        "app/kiln.toml",
        &manifest("app", "example/app:1", FROM_UBUNTU, INSTALL_CURL),
    );
    let lock = sandbox.run(&["lock", path.to_str().unwrap(), "--arch", "x86_64", "--arch", "aarch64"]);
    assert!(lock.status.success(), "stderr: {}", stderr(&lock));
    let lockfile = std::fs::read_to_string(sandbox.path().join("app/kiln.lock")).unwrap();
    assert!(lockfile.contains("lock_version = 1"));
    assert!(lockfile.contains("amd64"));
    assert!(lockfile.contains("arm64"));

    let build = sandbox.run(&["build", path.to_str().unwrap()]);
    assert!(build.status.success(), "stderr: {}", stderr(&build));
    let build_file = std::fs::read_to_string(sandbox.path().join("app/Dockerfile")).unwrap();
    assert!(build_file.contains("curl=1.0.0-mock"));
}

#[test]
fn cli_render_prints_build_file() {
    let sandbox = Sandbox::new();
    let path = sandbox.write(
        "app/kiln.toml",
        &manifest(
            "app",
            "example/app:1",
            FROM_UBUNTU,
            "[[instruction]]\nkind = \"health_check\"\ncmd = \"true\"\nretries = 3\n",
        ),
    );
    let output = sandbox.run(&["render", path.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Auto generated build file"));
    assert!(out.contains("FROM ubuntu:20.04"));
    assert!(out.contains("HEALTHCHECK --retries=3 CMD true"));
    assert!(!sandbox.path().join("app/Dockerfile").exists());
}

#[test]
fn cli_invalid_manifest_exits_with_manifest_error() {
    let sandbox = Sandbox::new();
    let path = sandbox.write(
        "app/kiln.toml",
        &manifest("app", "example/app:1", INSTALL_CURL, ""),
    );
    let output = sandbox.run(&["build", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("base image"));
}

#[test]
fn cli_clean_missing_image_succeeds() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["--json", "clean", "--backend", "mock", "example/none:1"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json[0]["removed"], false);
    assert!(json[0]["output"].as_str().unwrap().contains("No such image"));
}

#[test]
fn cli_images_on_empty_direct_store() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["--json", "images", "--backend", "direct"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(json.as_array().unwrap().is_empty());
}

#[test]
fn cli_unknown_backend_is_rejected() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["images", "--backend", "buildah"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("buildah"));
}

#[test]
fn cli_doctor_json_is_structured() {
    let sandbox = Sandbox::new();
    sandbox.write(
        "config/kiln/config.toml",
        "engine = \"kiln-no-such-engine-binary\"\n",
    );
    let output = sandbox.run(&["--json", "doctor"]);
    assert_eq!(output.status.code(), Some(1));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["healthy"], false);
    assert!(json["checks"].as_array().unwrap().len() >= 2);
}

#[test]
fn cli_bad_config_exits_with_manifest_error() {
    let sandbox = Sandbox::new();
    sandbox.write("config/kiln/config.toml", "engnie = \"docker\"\n");
    let output = sandbox.run(&["images", "--backend", "direct"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_completions_bash() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("kiln"));
}
