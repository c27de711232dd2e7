use crate::RuntimeError;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag. Setting it kills the engine process currently
/// being waited on.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured result of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, as a single log.
    pub fn combined(&self) -> String {
        let mut log = self.stdout.clone();
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&self.stderr);
        log
    }
}

/// External container engine reached through its command line.
///
/// Every invocation runs with a cleared environment holding only `LANG`,
/// `LC_ALL` and the BuildKit switch, so host settings cannot leak into
/// builds.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    binary: String,
    cancel: CancelFlag,
}

impl ContainerEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            cancel: CancelFlag::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Environment passed to every invocation.
    pub fn environment() -> [(&'static str, String); 3] {
        let lang = std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_owned());
        let lc_all = std::env::var("LC_ALL").unwrap_or_else(|_| lang.clone());
        [
            ("LANG", lang),
            ("LC_ALL", lc_all),
            ("DOCKER_BUILDKIT", "1".to_owned()),
        ]
    }

    pub fn run<I, S>(&self, args: I) -> Result<EngineOutput, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_in(None, args)
    }

    /// Run the engine and wait for it, optionally from `dir`. A non-zero
    /// exit is not an error here; callers inspect [`EngineOutput::success`].
    pub fn run_in<I, S>(&self, dir: Option<&Path>, args: I) -> Result<EngineOutput, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).env_clear().stdin(Stdio::null());
        for (key, value) in Self::environment() {
            cmd.env(key, value);
        }
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        // Output goes to unlinked temp files so the engine can never block on
        // a full pipe while this thread polls for cancellation.
        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;
        cmd.stdout(Stdio::from(stdout.try_clone()?));
        cmd.stderr(Stdio::from(stderr.try_clone()?));

        debug!("exec: {} {:?}", self.binary, cmd.get_args().collect::<Vec<_>>());
        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::ExecFailed(format!("failed to start '{}': {e}", self.binary))
        })?;

        let status = loop {
            if self.cancel.is_cancelled() {
                warn!("cancellation requested, killing {} (pid {})", self.binary, child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Cancelled);
            }
            if let Some(status) = child.try_wait()? {
                break status;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(EngineOutput {
            code: status.code(),
            stdout: read_back(&mut stdout)?,
            stderr: read_back(&mut stderr)?,
        })
    }
}

fn read_back(file: &mut File) -> Result<String, RuntimeError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let engine = ContainerEngine::new("sh");
        let out = engine.run(["-c", "echo hello; echo oops >&2; exit 3"]).unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.combined(), "hello\noops\n");
    }

    #[test]
    fn environment_is_minimized() {
        std::env::set_var("KILN_ENGINE_TEST_LEAK", "1");
        let engine = ContainerEngine::new("sh");
        let out = engine.run(["-c", "env"]).unwrap();
        assert!(out.success());
        assert!(!out.stdout.contains("KILN_ENGINE_TEST_LEAK"));
        assert!(out.stdout.contains("DOCKER_BUILDKIT=1"));
        assert!(out.stdout.contains("LANG="));
        assert!(out.stdout.contains("LC_ALL="));
    }

    #[test]
    fn runs_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ContainerEngine::new("sh");
        let out = engine.run_in(Some(dir.path()), ["-c", "pwd"]).unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn missing_binary_is_exec_failure() {
        let engine = ContainerEngine::new("kiln-no-such-engine-binary");
        assert!(matches!(
            engine.run(["version"]),
            Err(RuntimeError::ExecFailed(_))
        ));
    }

    #[test]
    fn cancellation_kills_the_process() {
        let cancel = CancelFlag::new();
        let engine = ContainerEngine::new("sh").with_cancel(cancel.clone());
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let result = engine.run(["-c", "sleep 30"]);
        handle.join().unwrap();
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
