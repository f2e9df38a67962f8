//! Lifecycle orchestration for slimforge image builds.
//!
//! This crate ties the profile schema and the runtime backends together:
//! `ResourceMountManager` attaches and detaches the image with stale-state
//! recovery, `HiveManager` loads and always unloads configuration stores,
//! `SettingApplier` writes typed records with per-record retry, and the
//! `Pipeline` sequences them behind a validated run-state machine so cleanup
//! runs on every exit path.

pub mod concurrency;
pub mod context;
pub mod hive;
pub mod lifecycle;
pub mod mount;
pub mod pipeline;
pub mod report;
pub mod settings;

pub use concurrency::install_signal_handler;
pub use context::{RunContext, StepToken};
pub use hive::{HiveHandle, HiveManager, HiveState, UnloadReport};
pub use lifecycle::{validate_transition, RunState, StateTracker};
pub use mount::{MountGuard, MountHandle, MountState, ResourceMountManager};
pub use pipeline::{
    CommandHook, HookContext, HiveStatus, MutationHook, Pipeline, RunOptions, StatusReport,
    SweepReport,
};
pub use report::{DetachReport, HookReport, HookStatus, Phase, RunReport};
pub use settings::{BatchResult, FailureClass, RecordStatus, SettingApplier};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("profile error: {0}")]
    Profile(#[from] slimforge_schema::ProfileError),
    #[error("runtime error: {0}")]
    Runtime(#[from] slimforge_runtime::RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("hook '{name}' failed: {error}")]
    HookFailed { name: String, error: String },
    #[error("{failed} setting(s) could not be applied to {store}")]
    SettingsFailed { store: String, failed: usize },
    #[error("interrupted by user")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
