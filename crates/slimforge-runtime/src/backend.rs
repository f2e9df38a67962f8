use crate::cancel::CancellationToken;
use crate::supervisor::{Outcome, ProcessSupervisor};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use slimforge_schema::{clean_path, HiveAlias, ImageRef, SettingValue};
use std::fmt;
use std::path::{Path, PathBuf};

/// Whether pending changes are written back when an image is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachMode {
    Commit,
    Discard,
}

impl fmt::Display for DetachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetachMode::Commit => f.write_str("commit"),
            DetachMode::Discard => f.write_str("discard"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Ok,
    NeedsRemount,
    Invalid,
}

/// One entry of the system-wide mount registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub image: PathBuf,
    pub index: u32,
    pub mount_dir: PathBuf,
    pub status: MountStatus,
    pub read_write: bool,
}

impl MountRecord {
    /// A record left behind by an interrupted run.
    pub fn is_dirty(&self) -> bool {
        self.status != MountStatus::Ok
    }

    pub fn touches(&self, image: &Path, mount_dir: &Path) -> bool {
        same_path(&self.image, image) || same_path(&self.mount_dir, mount_dir)
    }
}

/// Compare paths the way the image servicing tools do: case-insensitive,
/// with `/` and `\` treated alike. Comparison is by components, so trailing
/// separators and `.`/`..` segments do not matter.
pub fn same_path(a: &Path, b: &Path) -> bool {
    fn key(p: &Path) -> PathBuf {
        let s = p.to_string_lossy().replace('\\', "/").to_lowercase();
        clean_path(Path::new(&s))
    }
    key(a) == key(b)
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_dir_contents(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return std::fs::create_dir_all(dir);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Platform operations the lifecycle managers are built on.
///
/// Every method maps onto one external tool invocation (or a short fixed
/// sequence of them) in the command-driven backend. Callers own retry and
/// escalation; implementations report failures through `RuntimeError` so
/// retryable and fatal conditions can be told apart.
pub trait SystemBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Snapshot of the system-wide mount registry.
    fn list_mounts(&self) -> Result<Vec<MountRecord>, RuntimeError>;

    fn mount_image(&self, image: &ImageRef, mount_dir: &Path) -> Result<(), RuntimeError>;

    fn unmount_image(&self, mount_dir: &Path, mode: DetachMode) -> Result<(), RuntimeError>;

    /// Reclaim resources held by orphaned mounts. Long-running; the outcome
    /// reports whether it was skipped.
    fn cleanup_mountpoints(&self, cancel: &dyn CancellationToken) -> Result<Outcome, RuntimeError>;

    fn remove_contents(&self, dir: &Path) -> Result<(), RuntimeError> {
        clear_dir_contents(dir).map_err(RuntimeError::from)
    }

    /// Take ownership of `path` (recursively for directories) and grant
    /// administrators full control.
    fn take_ownership(&self, path: &Path) -> Result<(), RuntimeError>;

    /// Make `target` mirror the empty directory `empty`.
    fn mirror_empty(&self, empty: &Path, target: &Path) -> Result<(), RuntimeError>;

    fn is_hive_loaded(&self, alias: &HiveAlias) -> Result<bool, RuntimeError>;

    fn load_hive(&self, alias: &HiveAlias, file: &Path) -> Result<(), RuntimeError>;

    fn unload_hive(&self, alias: &HiveAlias) -> Result<(), RuntimeError>;

    /// Encourage release of lingering handles before an unload is retried.
    fn release_references(&self);

    fn create_key(&self, alias: &HiveAlias, path: &str) -> Result<(), RuntimeError>;

    fn set_value(
        &self,
        alias: &HiveAlias,
        path: &str,
        name: &str,
        value: &SettingValue,
    ) -> Result<(), RuntimeError>;
}

pub fn select_backend(
    name: &str,
    supervisor: ProcessSupervisor,
) -> Result<Box<dyn SystemBackend>, RuntimeError> {
    match name {
        "dism" => Ok(Box::new(crate::dism::DismBackend::new(supervisor))),
        "mock" => Ok(Box::new(crate::mock::MockBackend::from_env()?)),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
