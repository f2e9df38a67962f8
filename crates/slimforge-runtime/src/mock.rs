//! In-memory backend with fault injection, used by tests and `--backend mock`.
//!
//! Mount directories are real directories: mounting fills them with a
//! minimal image tree (sentinel plus hive files) and unmounting empties
//! them, so filesystem-level properties can be asserted. The mount and hive
//! registries live in memory, or in a JSON file named by
//! `SLIMFORGE_MOCK_STATE` so separate processes share one "system".

use crate::backend::{clear_dir_contents, same_path, DetachMode, MountRecord, MountStatus, SystemBackend};
use crate::cancel::CancellationToken;
use crate::supervisor::Outcome;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use slimforge_schema::{split_key_path, HiveAlias, ImageRef, SettingValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const STATE_ENV: &str = "SLIMFORGE_MOCK_STATE";

const IMAGE_TREE: &[&str] = &[
    "Windows/System32/config/SOFTWARE",
    "Windows/System32/config/SYSTEM",
    "Windows/System32/config/DEFAULT",
    "Windows/System32/config/COMPONENTS",
    "Windows/System32/config/DRIVERS",
    "Users/Default/NTUSER.DAT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockOp {
    ListMounts,
    Mount,
    Unmount,
    CleanupMountpoints,
    RemoveContents,
    TakeOwnership,
    MirrorEmpty,
    IsHiveLoaded,
    LoadHive,
    UnloadHive,
    ReleaseReferences,
    CreateKey,
    SetValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Busy,
    PermissionDenied,
    Corrupt,
    Transient,
    NotFound,
}

impl FaultKind {
    fn to_error(self, op: MockOp, target: &str) -> RuntimeError {
        let context = format!("injected {op:?} fault on '{target}'");
        match self {
            FaultKind::Busy => RuntimeError::ResourceBusy(context),
            FaultKind::PermissionDenied => RuntimeError::PermissionDenied(context),
            FaultKind::Corrupt => RuntimeError::StoreCorrupt(context),
            FaultKind::NotFound => RuntimeError::NotFound(context),
            FaultKind::Transient => RuntimeError::CommandFailed {
                program: "mock".to_owned(),
                code: 1,
                diagnostic: context,
            },
        }
    }
}

/// A scripted failure. `target` matches case-insensitively as a substring
/// of the call target; `remaining: None` fails forever.
#[derive(Debug, Clone)]
pub struct MockFault {
    pub op: MockOp,
    pub kind: FaultKind,
    pub target: Option<String>,
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockHive {
    alias: HiveAlias,
    file: PathBuf,
    /// Lowercased key path (root is "") to lowercased value name.
    keys: BTreeMap<String, BTreeMap<String, SettingValue>>,
}

impl MockHive {
    fn new(alias: HiveAlias, file: PathBuf) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(String::new(), BTreeMap::new());
        Self { alias, file, keys }
    }
}

fn default_populate() -> bool {
    true
}

fn default_cleanup() -> Outcome {
    Outcome::Completed { code: 0 }
}

#[derive(Debug, Serialize, Deserialize)]
struct MockState {
    #[serde(default)]
    mounts: Vec<MountRecord>,
    #[serde(default)]
    hives: BTreeMap<String, MockHive>,
    #[serde(default)]
    commits: Vec<PathBuf>,
    #[serde(skip)]
    calls: Vec<MockCall>,
    #[serde(skip)]
    faults: Vec<MockFault>,
    #[serde(skip, default = "default_populate")]
    populate: bool,
    #[serde(skip, default = "default_cleanup")]
    cleanup_outcome: Outcome,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            mounts: Vec::new(),
            hives: BTreeMap::new(),
            commits: Vec::new(),
            calls: Vec::new(),
            faults: Vec::new(),
            populate: default_populate(),
            cleanup_outcome: default_cleanup(),
        }
    }
}

impl MockState {
    fn take_fault(&mut self, op: MockOp, target: &str) -> Option<FaultKind> {
        let target = target.to_lowercase();
        let fault = self.faults.iter_mut().find(|f| {
            f.op == op
                && f.remaining != Some(0)
                && f.target
                    .as_ref()
                    .map_or(true, |t| target.contains(&t.to_lowercase()))
        })?;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.kind)
    }

    fn hive_mut(&mut self, alias: &HiveAlias) -> Result<&mut MockHive, RuntimeError> {
        self.hives
            .get_mut(&alias.to_lowercase())
            .ok_or_else(|| RuntimeError::NotFound(format!("hive {alias} is not loaded")))
    }

    fn is_mounted(&self, dir: &Path) -> bool {
        self.mounts.iter().any(|m| same_path(&m.mount_dir, dir))
    }
}

fn key_id(path: &str) -> String {
    split_key_path(path).join("\\").to_lowercase()
}

pub struct MockBackend {
    state: Mutex<MockState>,
    persist: Option<PathBuf>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            persist: None,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory unless `SLIMFORGE_MOCK_STATE` names a state file.
    pub fn from_env() -> Result<Self, RuntimeError> {
        match std::env::var_os(STATE_ENV) {
            Some(path) if !path.is_empty() => Self::persistent(PathBuf::from(path)),
            _ => Ok(Self::new()),
        }
    }

    /// Registries are loaded from `path` (if present) and written back after
    /// every change.
    pub fn persistent(path: PathBuf) -> Result<Self, RuntimeError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                RuntimeError::Internal(format!("invalid mock state {}: {e}", path.display()))
            })?
        } else {
            MockState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            persist: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::Internal(format!("mutex poisoned: {e}")))
    }

    fn peek(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and apply any matching fault.
    fn begin(&self, op: MockOp, target: String) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        let mut state = self.lock()?;
        let fault = state.take_fault(op, &target);
        state.calls.push(MockCall {
            op,
            target: target.clone(),
        });
        match fault {
            Some(kind) => Err(kind.to_error(op, &target)),
            None => Ok(state),
        }
    }

    fn save(&self, state: &MockState) -> Result<(), RuntimeError> {
        let Some(path) = &self.persist else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| RuntimeError::Internal(format!("failed to encode mock state: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn populate(dir: &Path) -> Result<(), RuntimeError> {
        for rel in IMAGE_TREE {
            let file = dir.join(rel);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&file, b"regf")?;
        }
        Ok(())
    }

    pub fn fail(&self, op: MockOp, kind: FaultKind) {
        self.fail_matching(op, kind, None, None);
    }

    pub fn fail_times(&self, op: MockOp, kind: FaultKind, times: u32) {
        self.fail_matching(op, kind, None, Some(times));
    }

    pub fn fail_matching(&self, op: MockOp, kind: FaultKind, target: Option<&str>, remaining: Option<u32>) {
        self.peek().faults.push(MockFault {
            op,
            kind,
            target: target.map(str::to_owned),
            remaining,
        });
    }

    pub fn clear_faults(&self) {
        self.peek().faults.clear();
    }

    /// When off, mounting leaves the directory empty (no sentinel).
    pub fn set_populate(&self, populate: bool) {
        self.peek().populate = populate;
    }

    pub fn set_cleanup_outcome(&self, outcome: Outcome) {
        self.peek().cleanup_outcome = outcome;
    }

    /// Simulate a mount left behind by a crashed run.
    pub fn add_stale_mount(
        &self,
        image: &Path,
        index: u32,
        mount_dir: &Path,
        status: MountStatus,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        std::fs::create_dir_all(mount_dir)?;
        Self::populate(mount_dir)?;
        state.mounts.push(MountRecord {
            image: image.to_path_buf(),
            index,
            mount_dir: mount_dir.to_path_buf(),
            status,
            read_write: true,
        });
        self.save(&state)
    }

    /// Simulate a hive left loaded by a crashed run.
    pub fn add_stale_hive(&self, alias: &HiveAlias, file: &Path) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state
            .hives
            .insert(alias.to_lowercase(), MockHive::new(alias.clone(), file.to_path_buf()));
        self.save(&state)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.peek().calls.clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.peek().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn count_matching(&self, op: MockOp, needle: &str) -> usize {
        let needle = needle.to_lowercase();
        self.peek()
            .calls
            .iter()
            .filter(|c| c.op == op && c.target.to_lowercase().contains(&needle))
            .count()
    }

    pub fn mounts(&self) -> Vec<MountRecord> {
        self.peek().mounts.clone()
    }

    pub fn loaded_hives(&self) -> Vec<HiveAlias> {
        self.peek().hives.values().map(|h| h.alias.clone()).collect()
    }

    pub fn commits(&self) -> Vec<PathBuf> {
        self.peek().commits.clone()
    }

    pub fn key_exists(&self, alias: &HiveAlias, path: &str) -> bool {
        self.peek()
            .hives
            .get(&alias.to_lowercase())
            .is_some_and(|h| h.keys.contains_key(&key_id(path)))
    }

    pub fn value(&self, alias: &HiveAlias, path: &str, name: &str) -> Option<SettingValue> {
        self.peek()
            .hives
            .get(&alias.to_lowercase())?
            .keys
            .get(&key_id(path))?
            .get(&name.to_lowercase())
            .cloned()
    }
}

impl SystemBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn list_mounts(&self) -> Result<Vec<MountRecord>, RuntimeError> {
        let state = self.begin(MockOp::ListMounts, String::new())?;
        Ok(state.mounts.clone())
    }

    fn mount_image(&self, image: &ImageRef, mount_dir: &Path) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Mount, format!("{image} -> {}", mount_dir.display()))?;
        if !image.path.is_file() {
            return Err(RuntimeError::NotFound(format!(
                "image file {} does not exist",
                image.path.display()
            )));
        }
        if state.is_mounted(mount_dir) {
            return Err(RuntimeError::ResourceBusy(format!(
                "{} is already a mount point",
                mount_dir.display()
            )));
        }
        if state
            .mounts
            .iter()
            .any(|m| same_path(&m.image, &image.path) && m.index == image.index)
        {
            return Err(RuntimeError::ResourceBusy(format!("{image} is already mounted")));
        }
        if !mount_dir.is_dir() {
            return Err(RuntimeError::NotFound(format!(
                "mount dir {} does not exist",
                mount_dir.display()
            )));
        }
        if std::fs::read_dir(mount_dir)?.next().is_some() {
            return Err(RuntimeError::ResourceBusy(format!(
                "mount dir {} is not empty",
                mount_dir.display()
            )));
        }
        if state.populate {
            Self::populate(mount_dir)?;
        }
        state.mounts.push(MountRecord {
            image: image.path.clone(),
            index: image.index,
            mount_dir: mount_dir.to_path_buf(),
            status: MountStatus::Ok,
            read_write: true,
        });
        self.save(&state)
    }

    fn unmount_image(&self, mount_dir: &Path, mode: DetachMode) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Unmount, format!("{} ({mode})", mount_dir.display()))?;
        let Some(pos) = state.mounts.iter().position(|m| same_path(&m.mount_dir, mount_dir)) else {
            return Err(RuntimeError::NotFound(format!(
                "no image is mounted at {}",
                mount_dir.display()
            )));
        };
        if let Some(hive) = state.hives.values().find(|h| h.file.starts_with(mount_dir)) {
            return Err(RuntimeError::ResourceBusy(format!(
                "hive {} is still loaded from {}",
                hive.alias,
                hive.file.display()
            )));
        }
        state.mounts.remove(pos);
        if mode == DetachMode::Commit {
            state.commits.push(mount_dir.to_path_buf());
        }
        if mount_dir.exists() {
            clear_dir_contents(mount_dir)?;
        }
        self.save(&state)
    }

    fn cleanup_mountpoints(&self, cancel: &dyn CancellationToken) -> Result<Outcome, RuntimeError> {
        let mut state = self.begin(MockOp::CleanupMountpoints, String::new())?;
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        let outcome = state.cleanup_outcome;
        if outcome.is_success() {
            state.mounts.retain(|m| m.status != MountStatus::Invalid);
            self.save(&state)?;
        }
        Ok(outcome)
    }

    fn remove_contents(&self, dir: &Path) -> Result<(), RuntimeError> {
        let state = self.begin(MockOp::RemoveContents, dir.display().to_string())?;
        if state.is_mounted(dir) {
            return Err(RuntimeError::PermissionDenied(format!(
                "{} is held by a mounted image",
                dir.display()
            )));
        }
        clear_dir_contents(dir)?;
        Ok(())
    }

    fn take_ownership(&self, path: &Path) -> Result<(), RuntimeError> {
        self.begin(MockOp::TakeOwnership, path.display().to_string())?;
        Ok(())
    }

    fn mirror_empty(&self, empty: &Path, target: &Path) -> Result<(), RuntimeError> {
        let state = self.begin(MockOp::MirrorEmpty, target.display().to_string())?;
        if !empty.is_dir() {
            return Err(RuntimeError::NotFound(format!(
                "staging dir {} does not exist",
                empty.display()
            )));
        }
        if state.is_mounted(target) {
            return Err(RuntimeError::ResourceBusy(format!(
                "{} is held by a mounted image",
                target.display()
            )));
        }
        clear_dir_contents(target)?;
        Ok(())
    }

    fn is_hive_loaded(&self, alias: &HiveAlias) -> Result<bool, RuntimeError> {
        let state = self.begin(MockOp::IsHiveLoaded, alias.to_string())?;
        Ok(state.hives.contains_key(&alias.to_lowercase()))
    }

    fn load_hive(&self, alias: &HiveAlias, file: &Path) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::LoadHive, format!("{alias} {}", file.display()))?;
        if state.hives.contains_key(&alias.to_lowercase()) {
            return Err(RuntimeError::ResourceBusy(format!("HKLM\\{alias} is already loaded")));
        }
        if !file.is_file() {
            return Err(RuntimeError::NotFound(format!(
                "hive file {} does not exist",
                file.display()
            )));
        }
        state
            .hives
            .insert(alias.to_lowercase(), MockHive::new(alias.clone(), file.to_path_buf()));
        self.save(&state)
    }

    fn unload_hive(&self, alias: &HiveAlias) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::UnloadHive, alias.to_string())?;
        if state.hives.remove(&alias.to_lowercase()).is_none() {
            return Err(RuntimeError::NotFound(format!("HKLM\\{alias} is not loaded")));
        }
        self.save(&state)
    }

    fn release_references(&self) {
        self.peek().calls.push(MockCall {
            op: MockOp::ReleaseReferences,
            target: String::new(),
        });
    }

    fn create_key(&self, alias: &HiveAlias, path: &str) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::CreateKey, format!("{alias}\\{path}"))?;
        let hive = state.hive_mut(alias)?;
        let segments = split_key_path(path);
        let id = key_id(path);
        if hive.keys.contains_key(&id) {
            return Err(RuntimeError::AlreadyExists(format!("{alias}\\{path}")));
        }
        let parent = segments[..segments.len().saturating_sub(1)]
            .join("\\")
            .to_lowercase();
        if !hive.keys.contains_key(&parent) {
            return Err(RuntimeError::NotFound(format!(
                "parent of {alias}\\{path} does not exist"
            )));
        }
        hive.keys.insert(id, BTreeMap::new());
        self.save(&state)
    }

    fn set_value(
        &self,
        alias: &HiveAlias,
        path: &str,
        name: &str,
        value: &SettingValue,
    ) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::SetValue, format!("{alias}\\{path}\\{name}"))?;
        let hive = state.hive_mut(alias)?;
        let key = hive
            .keys
            .get_mut(&key_id(path))
            .ok_or_else(|| RuntimeError::NotFound(format!("key {alias}\\{path} does not exist")))?;
        key.insert(name.to_lowercase(), value.clone());
        self.save(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelFlag, NeverCancel};

    fn alias(s: &str) -> HiveAlias {
        HiveAlias::parse(s).unwrap()
    }

    fn fixture() -> (tempfile::TempDir, ImageRef, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("install.wim");
        std::fs::write(&image, b"wim").unwrap();
        let mount = dir.path().join("scratch");
        std::fs::create_dir_all(&mount).unwrap();
        (dir, ImageRef::new(image, 1), mount)
    }

    #[test]
    fn mount_populates_and_unmount_empties() {
        let (_dir, image, mount) = fixture();
        let backend = MockBackend::new();
        backend.mount_image(&image, &mount).unwrap();
        assert!(mount.join("Windows/System32/config/SOFTWARE").is_file());
        assert_eq!(backend.mounts().len(), 1);

        backend.unmount_image(&mount, DetachMode::Discard).unwrap();
        assert!(backend.mounts().is_empty());
        assert!(backend.commits().is_empty());
        assert_eq!(std::fs::read_dir(&mount).unwrap().count(), 0);
    }

    #[test]
    fn mount_rejects_busy_targets() {
        let (_dir, image, mount) = fixture();
        let backend = MockBackend::new();
        std::fs::write(mount.join("leftover"), b"x").unwrap();
        assert!(matches!(
            backend.mount_image(&image, &mount),
            Err(RuntimeError::ResourceBusy(_))
        ));
        let missing = ImageRef::new(mount.join("nope.wim"), 1);
        assert!(matches!(
            backend.mount_image(&missing, &mount),
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[test]
    fn unmount_blocked_by_loaded_hive() {
        let (_dir, image, mount) = fixture();
        let backend = MockBackend::new();
        backend.mount_image(&image, &mount).unwrap();
        let a = alias("zSYSTEM");
        backend
            .load_hive(&a, &mount.join("Windows/System32/config/SYSTEM"))
            .unwrap();
        assert!(matches!(
            backend.unmount_image(&mount, DetachMode::Commit),
            Err(RuntimeError::ResourceBusy(_))
        ));
        backend.unload_hive(&a).unwrap();
        backend.unmount_image(&mount, DetachMode::Commit).unwrap();
        assert_eq!(backend.commits(), vec![mount]);
    }

    #[test]
    fn keys_need_parents() {
        let (_dir, image, mount) = fixture();
        let backend = MockBackend::new();
        backend.mount_image(&image, &mount).unwrap();
        let a = alias("zSOFTWARE");
        backend
            .load_hive(&a, &mount.join("Windows/System32/config/SOFTWARE"))
            .unwrap();

        assert!(matches!(
            backend.create_key(&a, "Policies\\Microsoft"),
            Err(RuntimeError::NotFound(_))
        ));
        backend.create_key(&a, "Policies").unwrap();
        backend.create_key(&a, "Policies\\Microsoft").unwrap();
        assert!(matches!(
            backend.create_key(&a, "policies"),
            Err(RuntimeError::AlreadyExists(_))
        ));
        backend
            .set_value(&a, "Policies\\Microsoft", "Flag", &SettingValue::Dword(1))
            .unwrap();
        assert_eq!(
            backend.value(&a, "policies\\microsoft", "flag"),
            Some(SettingValue::Dword(1))
        );
        assert!(backend
            .set_value(&a, "Missing", "x", &SettingValue::Dword(1))
            .is_err());
    }

    #[test]
    fn faults_are_consumed() {
        let backend = MockBackend::new();
        let a = alias("zNTUSER");
        backend.fail_times(MockOp::IsHiveLoaded, FaultKind::Busy, 1);
        assert!(backend.is_hive_loaded(&a).is_err());
        assert!(!backend.is_hive_loaded(&a).unwrap());
        assert_eq!(backend.count(MockOp::IsHiveLoaded), 2);

        backend.fail_matching(MockOp::UnloadHive, FaultKind::Busy, Some("zntuser"), None);
        backend.add_stale_hive(&a, Path::new("/x/NTUSER.DAT")).unwrap();
        assert!(backend.unload_hive(&a).is_err());
        assert!(backend.unload_hive(&a).is_err());
        backend.clear_faults();
        backend.unload_hive(&a).unwrap();
    }

    #[test]
    fn cleanup_honours_cancellation() {
        let backend = MockBackend::new();
        assert!(backend.cleanup_mountpoints(&NeverCancel).unwrap().is_success());
        let flag = CancelFlag::new();
        flag.cancel();
        assert_eq!(backend.cleanup_mountpoints(&flag).unwrap(), Outcome::Cancelled);
        backend.set_cleanup_outcome(Outcome::TimedOut);
        assert_eq!(backend.cleanup_mountpoints(&NeverCancel).unwrap(), Outcome::TimedOut);
    }

    #[test]
    fn persistent_state_is_shared() {
        let (dir, image, mount) = fixture();
        let state_file = dir.path().join("mock-state.json");
        {
            let backend = MockBackend::persistent(state_file.clone()).unwrap();
            backend.mount_image(&image, &mount).unwrap();
            backend
                .add_stale_hive(&alias("zSOFTWARE"), &mount.join("Windows/System32/config/SOFTWARE"))
                .unwrap();
        }
        let reopened = MockBackend::persistent(state_file).unwrap();
        assert_eq!(reopened.mounts().len(), 1);
        assert_eq!(reopened.loaded_hives(), vec![alias("zSOFTWARE")]);
        assert!(reopened.calls().is_empty());
    }
}
