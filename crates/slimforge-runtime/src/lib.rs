//! Execution layer for slimforge: supervised external processes and the
//! platform backends that attach images and load configuration stores.
//!
//! This crate implements the `ProcessSupervisor` (polling wait with timeout,
//! heartbeat, and cooperative cancellation), typed `CommandSpec` invocation,
//! the shared `RetryPolicy`, pluggable `CancellationToken`s, and the
//! `SystemBackend` trait with a command-driven `dism` backend and an
//! in-memory `mock` backend for tests.

pub mod backend;
pub mod cancel;
pub mod command;
pub mod dism;
pub mod mock;
pub mod prereq;
pub mod retry;
pub mod supervisor;

pub use backend::{
    clear_dir_contents, same_path, select_backend, DetachMode, MountRecord, MountStatus,
    SystemBackend,
};
pub use cancel::{AnyCancel, CancelFlag, CancellationToken, KeystrokeCancel, NeverCancel};
pub use command::CommandSpec;
pub use prereq::{check_dism_prereqs, format_missing, MissingPrereq};
pub use retry::{Backoff, RetryPolicy};
pub use supervisor::{Outcome, ProcessSupervisor, SupervisedProcess, SupervisedRun, SupervisorPolicy};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("configuration store is corrupt: {0}")]
    StoreCorrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<RuntimeError>,
    },
    #[error("failed to launch '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with code {code}: {diagnostic}")]
    CommandFailed {
        program: String,
        code: i32,
        diagnostic: String,
    },
    #[error("'{program}' did not finish ({outcome})")]
    CommandInterrupted { program: String, outcome: Outcome },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("backend state unavailable: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// The innermost error, looking through `RetriesExhausted` wrappers.
    pub fn root(&self) -> &RuntimeError {
        match self {
            RuntimeError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_permission(&self) -> bool {
        match self.root() {
            RuntimeError::PermissionDenied(_) => true,
            RuntimeError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            RuntimeError::ResourceBusy(_)
            | RuntimeError::PermissionDenied(_)
            | RuntimeError::CommandFailed { .. }
            | RuntimeError::CommandInterrupted { .. } => true,
            RuntimeError::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
