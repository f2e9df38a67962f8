//! Attach and detach of the install image with stale-state recovery.

use crate::context::RunContext;
use serde::{Deserialize, Serialize};
use slimforge_runtime::{same_path, DetachMode, MountRecord, RuntimeError};
use slimforge_schema::ImageRef;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    /// A detach failed; the mount must be force-released before reuse.
    Dirty,
    Releasing,
}

#[derive(Debug, Clone)]
pub struct MountHandle {
    pub image: ImageRef,
    pub mount_dir: PathBuf,
    state: MountState,
}

impl MountHandle {
    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.state, MountState::Unmounted)
    }
}

#[derive(Debug, Clone, Copy)]
enum ClearStrategy {
    Delete,
    TakeOwnership,
    MirrorEmpty,
}

impl ClearStrategy {
    fn for_attempt(attempt: u32) -> Self {
        match attempt {
            1 => ClearStrategy::Delete,
            2 => ClearStrategy::TakeOwnership,
            _ => ClearStrategy::MirrorEmpty,
        }
    }
}

impl fmt::Display for ClearStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClearStrategy::Delete => f.write_str("delete contents"),
            ClearStrategy::TakeOwnership => f.write_str("take ownership and delete"),
            ClearStrategy::MirrorEmpty => f.write_str("mirror empty directory"),
        }
    }
}

fn dir_is_empty(dir: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

pub struct ResourceMountManager<'a> {
    ctx: &'a RunContext,
}

impl<'a> ResourceMountManager<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Attach `image` at `mount_dir`, recovering from whatever a previous
    /// run left behind. On any failure after the mount call the image is
    /// discarded again before the error is returned.
    pub fn attach(&self, image: &ImageRef, mount_dir: &Path) -> Result<MountHandle, RuntimeError> {
        info!("attaching {image} at {}", mount_dir.display());

        let released = self.release_stale(image, mount_dir)?;
        if released > 0 {
            info!("released {released} stale mount(s)");
        }
        self.cleanup_mountpoints();
        self.prepare_mount_dir(mount_dir)?;

        let mut handle = MountHandle {
            image: image.clone(),
            mount_dir: mount_dir.to_path_buf(),
            state: MountState::Mounting,
        };

        if let Err(e) = self.mount_and_verify(&handle) {
            warn!("attach of {image} failed: {e}; rolling back");
            self.rollback(&mut handle);
            return Err(e);
        }

        handle.state = MountState::Mounted;
        info!("{image} mounted at {}", mount_dir.display());
        Ok(handle)
    }

    /// Detach with an explicit commit or discard.
    ///
    /// Idempotent: a handle that is already unmounted, or whose mount dir
    /// the registry no longer lists, is left alone.
    pub fn detach(&self, handle: &mut MountHandle, mode: DetachMode) -> Result<(), RuntimeError> {
        if handle.state == MountState::Unmounted {
            info!("{} is already detached", handle.mount_dir.display());
            return Ok(());
        }

        let registered = match self.ctx.backend.list_mounts() {
            Ok(records) => records
                .iter()
                .any(|r| same_path(&r.mount_dir, &handle.mount_dir)),
            Err(e) => {
                debug!("could not read mount registry before detach: {e}");
                true
            }
        };
        if !registered {
            info!(
                "{} is not in the mount registry; treating as detached",
                handle.mount_dir.display()
            );
            handle.state = MountState::Unmounted;
            return Ok(());
        }

        handle.state = MountState::Releasing;
        info!("detaching {} ({mode})", handle.mount_dir.display());
        match self.ctx.backend.unmount_image(&handle.mount_dir, mode) {
            Ok(()) => {
                handle.state = MountState::Unmounted;
                Ok(())
            }
            Err(e) if matches!(e.root(), RuntimeError::NotFound(_)) => {
                handle.state = MountState::Unmounted;
                Ok(())
            }
            Err(e) => {
                warn!("detach ({mode}) of {} failed: {e}", handle.mount_dir.display());
                handle.state = MountState::Dirty;
                Err(e)
            }
        }
    }

    /// Registry records that refer to `image` or `mount_dir`.
    pub fn stale_records(&self, image: &ImageRef, mount_dir: &Path) -> Result<Vec<MountRecord>, RuntimeError> {
        Ok(self
            .ctx
            .backend
            .list_mounts()?
            .into_iter()
            .filter(|r| r.touches(&image.path, mount_dir))
            .collect())
    }

    /// Force-discard every registry record bound to `image` or `mount_dir`.
    /// Fails with `ResourceBusy` if any survive.
    pub fn release_stale(&self, image: &ImageRef, mount_dir: &Path) -> Result<usize, RuntimeError> {
        let stale = self.stale_records(image, mount_dir)?;
        if stale.is_empty() {
            return Ok(0);
        }

        for record in &stale {
            warn!(
                "releasing stale mount of {} at {} (status {:?})",
                record.image.display(),
                record.mount_dir.display(),
                record.status
            );
            match self
                .ctx
                .backend
                .unmount_image(&record.mount_dir, DetachMode::Discard)
            {
                Ok(()) => {}
                Err(e) if matches!(e.root(), RuntimeError::NotFound(_)) => {}
                Err(e) => warn!("failed to release {}: {e}", record.mount_dir.display()),
            }
        }

        let remaining = self.stale_records(image, mount_dir)?;
        if let Some(record) = remaining.first() {
            return Err(RuntimeError::ResourceBusy(format!(
                "{} is still mounted at {} after forced release",
                record.image.display(),
                record.mount_dir.display()
            )));
        }
        Ok(stale.len())
    }

    /// Run the backend's mount point cleanup. Skipped or failed cleanup is
    /// logged and never blocks the attach.
    fn cleanup_mountpoints(&self) {
        let token = self.ctx.step_token();
        match self.ctx.backend.cleanup_mountpoints(&token) {
            Ok(outcome) if outcome.is_success() => debug!("mount point cleanup finished"),
            Ok(outcome) => info!("mount point cleanup {outcome}; continuing"),
            Err(e) => warn!("mount point cleanup failed: {e}; continuing"),
        }
    }

    /// Make sure `mount_dir` exists and is empty, escalating from a plain
    /// delete to ownership takeover to mirroring an empty directory.
    pub fn prepare_mount_dir(&self, mount_dir: &Path) -> Result<(), RuntimeError> {
        if !mount_dir.exists() {
            std::fs::create_dir_all(mount_dir)?;
            return Ok(());
        }
        if dir_is_empty(mount_dir)? {
            return Ok(());
        }

        let staging = tempfile::Builder::new()
            .prefix("slimforge-empty-")
            .tempdir()?;
        let backend = &self.ctx.backend;

        self.ctx.clear_retry.run(
            &format!("clear {}", mount_dir.display()),
            |attempt| {
                let strategy = ClearStrategy::for_attempt(attempt);
                info!("clearing {} ({strategy})", mount_dir.display());
                match strategy {
                    ClearStrategy::Delete => backend.remove_contents(mount_dir)?,
                    ClearStrategy::TakeOwnership => {
                        backend.take_ownership(mount_dir)?;
                        backend.remove_contents(mount_dir)?;
                    }
                    ClearStrategy::MirrorEmpty => backend.mirror_empty(staging.path(), mount_dir)?,
                }
                if dir_is_empty(mount_dir)? {
                    Ok(())
                } else {
                    Err(RuntimeError::ResourceBusy(format!(
                        "{} is still not empty",
                        mount_dir.display()
                    )))
                }
            },
            |attempt, e| warn!("clear attempt {attempt} failed: {e}"),
        )
    }

    fn mount_and_verify(&self, handle: &MountHandle) -> Result<(), RuntimeError> {
        self.ctx
            .backend
            .mount_image(&handle.image, &handle.mount_dir)?;

        if !self.ctx.settle.is_zero() {
            debug!("settling for {}ms", self.ctx.settle.as_millis());
            std::thread::sleep(self.ctx.settle);
        }

        let sentinel = handle.mount_dir.join(&self.ctx.sentinel);
        if !sentinel.exists() {
            return Err(RuntimeError::VerificationFailed(format!(
                "{} missing after mounting {}",
                sentinel.display(),
                handle.image
            )));
        }
        Ok(())
    }

    fn rollback(&self, handle: &mut MountHandle) {
        handle.state = MountState::Releasing;
        match self
            .ctx
            .backend
            .unmount_image(&handle.mount_dir, DetachMode::Discard)
        {
            Ok(()) => handle.state = MountState::Unmounted,
            Err(e) if matches!(e.root(), RuntimeError::NotFound(_)) => {
                handle.state = MountState::Unmounted;
            }
            Err(e) => {
                warn!("rollback of {} failed: {e}", handle.mount_dir.display());
                handle.state = MountState::Dirty;
            }
        }
    }
}

/// Discards the mount on drop unless it was explicitly detached.
pub struct MountGuard<'a> {
    manager: ResourceMountManager<'a>,
    handle: MountHandle,
    armed: bool,
}

impl<'a> MountGuard<'a> {
    pub fn new(manager: ResourceMountManager<'a>, handle: MountHandle) -> Self {
        Self {
            manager,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> &MountHandle {
        &self.handle
    }

    /// Detach now. The guard is disarmed whatever the result; the caller
    /// decides how to handle a failed commit.
    pub fn detach(&mut self, mode: DetachMode) -> Result<(), RuntimeError> {
        self.armed = false;
        self.manager.detach(&mut self.handle, mode)
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.handle.is_attached() {
            warn!(
                "{} still attached at scope exit; discarding",
                self.handle.mount_dir.display()
            );
            if let Err(e) = self.manager.detach(&mut self.handle, DetachMode::Discard) {
                warn!("discard on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimforge_runtime::mock::{FaultKind, MockBackend, MockOp};
    use slimforge_runtime::MountStatus;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MockBackend>, RunContext, ImageRef, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("install.wim");
        std::fs::write(&image_path, b"wim").unwrap();
        let backend = Arc::new(MockBackend::new());
        let ctx = RunContext::new(backend.clone());
        let mount = dir.path().join("scratch");
        (dir, backend, ctx, ImageRef::new(image_path, 1), mount)
    }

    #[test]
    fn attach_creates_missing_mount_dir() {
        let (_dir, backend, ctx, image, mount) = setup();
        let mgr = ResourceMountManager::new(&ctx);
        let handle = mgr.attach(&image, &mount).unwrap();
        assert_eq!(handle.state(), MountState::Mounted);
        assert!(mount.join("Windows").is_dir());
        assert_eq!(backend.count(MockOp::CleanupMountpoints), 1);
    }

    #[test]
    fn clearing_escalates_to_mirror() {
        let (_dir, backend, ctx, image, mount) = setup();
        std::fs::create_dir_all(mount.join("leftover")).unwrap();
        backend.fail_times(MockOp::RemoveContents, FaultKind::PermissionDenied, 2);

        let mgr = ResourceMountManager::new(&ctx);
        mgr.attach(&image, &mount).unwrap();
        assert_eq!(backend.count(MockOp::RemoveContents), 2);
        assert_eq!(backend.count(MockOp::TakeOwnership), 1);
        assert_eq!(backend.count(MockOp::MirrorEmpty), 1);
        assert!(!mount.join("leftover").exists());
    }

    #[test]
    fn clearing_gives_up_after_budget() {
        let (_dir, backend, ctx, image, mount) = setup();
        std::fs::create_dir_all(mount.join("locked")).unwrap();
        backend.fail(MockOp::RemoveContents, FaultKind::PermissionDenied);
        backend.fail(MockOp::MirrorEmpty, FaultKind::Busy);

        let err = ResourceMountManager::new(&ctx).attach(&image, &mount).unwrap_err();
        assert!(matches!(err, RuntimeError::RetriesExhausted { attempts: 5, .. }));
        assert_eq!(backend.count(MockOp::Mount), 0);
    }

    #[test]
    fn missing_sentinel_rolls_back() {
        let (_dir, backend, ctx, image, mount) = setup();
        backend.set_populate(false);
        let err = ResourceMountManager::new(&ctx).attach(&image, &mount).unwrap_err();
        assert!(matches!(err, RuntimeError::VerificationFailed(_)));
        assert!(backend.mounts().is_empty());
        assert_eq!(backend.count(MockOp::Unmount), 1);
    }

    #[test]
    fn skipped_cleanup_does_not_block_attach() {
        let (_dir, backend, ctx, image, mount) = setup();
        backend.set_cleanup_outcome(slimforge_runtime::Outcome::TimedOut);
        assert!(ResourceMountManager::new(&ctx).attach(&image, &mount).is_ok());
    }

    #[test]
    fn dirty_stale_record_is_released() {
        let (_dir, backend, ctx, image, mount) = setup();
        backend
            .add_stale_mount(&image.path, 1, &mount, MountStatus::NeedsRemount)
            .unwrap();
        let mgr = ResourceMountManager::new(&ctx);
        let mut handle = mgr.attach(&image, &mount).unwrap();
        assert_eq!(backend.mounts().len(), 1);
        mgr.detach(&mut handle, DetachMode::Discard).unwrap();
        assert!(backend.mounts().is_empty());
    }

    #[test]
    fn failed_commit_marks_dirty() {
        let (_dir, backend, ctx, image, mount) = setup();
        let mgr = ResourceMountManager::new(&ctx);
        let mut handle = mgr.attach(&image, &mount).unwrap();
        backend.fail_times(MockOp::Unmount, FaultKind::Busy, 1);
        assert!(mgr.detach(&mut handle, DetachMode::Commit).is_err());
        assert_eq!(handle.state(), MountState::Dirty);
        mgr.detach(&mut handle, DetachMode::Discard).unwrap();
        assert_eq!(handle.state(), MountState::Unmounted);
    }

    #[test]
    fn guard_discards_on_drop() {
        let (_dir, backend, ctx, image, mount) = setup();
        {
            let mgr = ResourceMountManager::new(&ctx);
            let handle = mgr.attach(&image, &mount).unwrap();
            let _guard = MountGuard::new(ResourceMountManager::new(&ctx), handle);
        }
        assert!(backend.mounts().is_empty());
        assert!(backend.commits().is_empty());
    }
}
