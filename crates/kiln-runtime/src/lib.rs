//! Execution backends for kiln.
//!
//! A compiled `BuildPlan` is turned into an image by an [`ImageBackend`]:
//! the daemon backend writes the build file and drives an external container
//! engine through [`ContainerEngine`], the direct backend packs layer
//! directories into the store itself, and the mock backend stands in for the
//! daemon in tests. Pulls go through [`retry`] with exponential backoff.

pub mod backend;
pub mod daemon;
pub mod direct;
pub mod engine;
pub mod mock;
pub mod prereq;
pub mod retry;

pub use backend::{select_backend, BackendConfig, ImageBackend, MaterializeRequest};
pub use daemon::DaemonBackend;
pub use direct::DirectBackend;
pub use engine::{CancelFlag, ContainerEngine, EngineOutput};
pub use mock::MockBackend;
pub use prereq::{check_engine_prereqs, format_missing, MissingPrereq};
pub use retry::{retry, RetryPolicy};

use kiln_schema::BuilderKind;
use kiln_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("engine command failed: {0}")]
    ExecFailed(String),
    #[error("image build failed, engine output follows:\n{log}")]
    ImageBuild { log: String },
    #[error("pulling '{reference}' failed after {attempts} attempts: {message}")]
    TransientPull {
        reference: String,
        attempts: u32,
        message: String,
    },
    #[error("container engine server version {found} is too old, at least {minimum} is required")]
    EngineVersion { found: String, minimum: u32 },
    #[error("{backend} backend cannot {operation}")]
    Unsupported {
        backend: BuilderKind,
        operation: String,
    },
    #[error("{backend} backend received a {plan} build plan")]
    PlanMismatch {
        backend: BuilderKind,
        plan: BuilderKind,
    },
    #[error("engine invocation cancelled")]
    Cancelled,
}
