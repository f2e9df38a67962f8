use slimforge_core::{
    CoreError, HookContext, HookStatus, MountState, MutationHook, Phase, Pipeline, RecordStatus,
    ResourceMountManager, RunContext, RunOptions, RunState,
};
use slimforge_runtime::mock::{FaultKind, MockBackend, MockOp};
use slimforge_runtime::{DetachMode, MountStatus};
use slimforge_schema::{parse_profile_str, HiveAlias, NormalizedProfile};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    backend: Arc<MockBackend>,
    profile: NormalizedProfile,
}

impl Fixture {
    fn new(extra: &str) -> Self {
        Self::normalized_against(extra, |dir| dir.to_path_buf())
    }

    fn normalized_against(extra: &str, base: fn(&Path) -> PathBuf) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("install.wim"), b"wim").unwrap();
        let toml = format!(
            r#"
profile_version = 1

[image]
path = "install.wim"
index = 1
mount_dir = "scratch"

[hives]
zSOFTWARE = "Windows/System32/config/SOFTWARE"
zSYSTEM = "Windows/System32/config/SYSTEM"
zNTUSER = "Users/Default/NTUSER.DAT"

[runtime]
backend = "mock"
settle_ms = 0
{extra}
"#
        );
        let profile = parse_profile_str(&toml)
            .unwrap()
            .normalize(&base(dir.path()))
            .unwrap();
        Self {
            dir,
            backend: Arc::new(MockBackend::new()),
            profile,
        }
    }

    fn ctx(&self) -> RunContext {
        RunContext::new(self.backend.clone())
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.ctx(), self.profile.clone())
    }

    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}

fn ten_settings() -> String {
    let mut s = String::new();
    for i in 1..=10 {
        s.push_str(&format!(
            "[[settings]]\nstore = \"zSOFTWARE\"\npath = \"Policies\\\\Test\"\nname = \"Setting{i:02}\"\ntype = \"dword\"\nvalue = {i}\n\n"
        ));
    }
    s
}

struct StaticHook {
    name: &'static str,
    result: fn() -> Result<HookStatus, CoreError>,
    calls: Arc<AtomicUsize>,
}

impl StaticHook {
    fn new(name: &'static str, result: fn() -> Result<HookStatus, CoreError>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                result,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl MutationHook for StaticHook {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, ctx: &HookContext<'_>) -> Result<HookStatus, CoreError> {
        assert!(ctx.mount_dir.join("Windows").is_dir() || self.name == "export");
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.result)()
    }
}

fn completed() -> Result<HookStatus, CoreError> {
    Ok(HookStatus::Completed { code: 0 })
}

fn failing() -> Result<HookStatus, CoreError> {
    Err(CoreError::HookFailed {
        name: "broken".into(),
        error: "exited with code 2".into(),
    })
}

fn skipped() -> Result<HookStatus, CoreError> {
    Ok(HookStatus::Skipped {
        reason: "timed out after 1s".into(),
    })
}

#[test]
fn clean_run_commits_and_walks_every_state() {
    let fx = Fixture::new(&ten_settings());
    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert!(report.succeeded(), "{report:?}");
    assert_eq!(report.final_state, RunState::Committed);
    let states: Vec<RunState> = report.history.iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            RunState::Idle,
            RunState::Attaching,
            RunState::Mounted,
            RunState::Loading,
            RunState::Configuring,
            RunState::Unloading,
            RunState::Detaching,
            RunState::Committed,
        ]
    );
    assert_eq!(report.settings_applied(), 10);
    assert_eq!(fx.backend.commits().len(), 1);
    assert!(fx.backend.mounts().is_empty());
    assert!(fx.backend.loaded_hives().is_empty());
    assert!(report.finished_at.is_some());
}

#[test]
fn discard_leaves_mount_dir_empty() {
    let fx = Fixture::new("");
    let report = fx
        .pipeline()
        .run(RunOptions {
            commit: false,
            export: false,
        })
        .unwrap();

    assert_eq!(report.final_state, RunState::Discarded);
    assert!(report.succeeded());
    assert!(fx.backend.commits().is_empty());
    assert_eq!(std::fs::read_dir(fx.scratch()).unwrap().count(), 0);
}

#[test]
fn detach_twice_is_a_no_op() {
    let fx = Fixture::new("");
    let ctx = fx.ctx();
    let manager = ResourceMountManager::new(&ctx);
    let mut handle = manager.attach(&fx.profile.image, &fx.profile.mount_dir).unwrap();

    manager.detach(&mut handle, DetachMode::Commit).unwrap();
    manager.detach(&mut handle, DetachMode::Commit).unwrap();

    assert_eq!(handle.state(), MountState::Unmounted);
    assert_eq!(fx.backend.count(MockOp::Unmount), 1);
    assert_eq!(fx.backend.commits().len(), 1);
}

#[test]
fn stale_mount_from_crashed_run_is_released_first() {
    let fx = Fixture::new("");
    fx.backend
        .add_stale_mount(&fx.profile.image.path, 1, &fx.scratch(), MountStatus::NeedsRemount)
        .unwrap();

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert!(report.succeeded(), "{report:?}");
    assert_eq!(fx.backend.count_matching(MockOp::Unmount, "(discard)"), 1);
    assert_eq!(fx.backend.count_matching(MockOp::Unmount, "(commit)"), 1);
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn one_bad_record_does_not_stop_the_batch() {
    let fx = Fixture::new(&ten_settings());
    fx.backend
        .fail_matching(MockOp::SetValue, FaultKind::Corrupt, Some("Setting04"), None);

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert_eq!(report.batches.len(), 1);
    let batch = &report.batches[0];
    assert_eq!(batch.statuses.len(), 10);
    assert_eq!(batch.success_count, 9);
    assert_eq!(batch.failure_count, 1);
    assert!(matches!(batch.statuses[3], RecordStatus::Failed { .. }));
    assert!(batch.statuses[4].is_applied());
    assert_eq!(report.final_state, RunState::Committed);
}

#[test]
fn strict_settings_turn_a_bad_record_into_a_discard() {
    let fx = Fixture::new(&format!("strict_settings = true\n\n{}", ten_settings()));
    fx.backend
        .fail_matching(MockOp::SetValue, FaultKind::Corrupt, Some("Setting04"), None);

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Configure));
    assert_eq!(report.final_state, RunState::Discarded);
    assert!(fx.backend.commits().is_empty());
    assert!(!report.processing_ok());
    assert!(report.cleanup_ok());
}

#[test]
fn stale_mount_is_found_when_profile_dir_has_dot_segments() {
    let fx = Fixture::normalized_against("", |dir| dir.join("."));
    let canonical = fx.dir.path();
    assert_eq!(fx.profile.mount_dir, canonical.join("scratch"));
    fx.backend
        .add_stale_mount(&canonical.join("install.wim"), 1, &canonical.join("scratch"), MountStatus::NeedsRemount)
        .unwrap();

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert!(report.succeeded(), "{report:?}");
    assert_eq!(fx.backend.count_matching(MockOp::Unmount, "(discard)"), 1);
    assert_eq!(fx.backend.count_matching(MockOp::Unmount, "(commit)"), 1);
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn stuck_hive_unload_attempts_are_all_reported() {
    let fx = Fixture::new("");
    fx.backend.fail(MockOp::UnloadHive, FaultKind::Busy);

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Unload));
    assert_eq!(report.unloads.len(), 3);
    assert!(report.unloads.iter().all(|u| !u.ok));
    let reported: u32 = report.unloads.iter().map(|u| u.attempts).sum();
    assert_eq!(fx.backend.count(MockOp::UnloadHive), reported as usize);
    fx.backend.clear_faults();
}

#[test]
fn failing_hook_still_unloads_every_hive_before_unmount() {
    let fx = Fixture::new("");
    let (hook, _) = StaticHook::new("broken", failing);
    let report = fx
        .pipeline()
        .with_hook(Box::new(hook))
        .run(RunOptions::default())
        .unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Configure));
    assert!(matches!(report.hooks[0].status, HookStatus::Failed { .. }));
    assert_eq!(report.unloads.len(), 3);
    assert!(report.unloads.iter().all(|u| u.ok));

    let calls = fx.backend.calls();
    let unloads: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.op == MockOp::UnloadHive)
        .map(|(i, _)| i)
        .collect();
    let unmount = calls
        .iter()
        .rposition(|c| c.op == MockOp::Unmount)
        .unwrap();
    assert_eq!(unloads.len(), 3);
    assert!(unloads.iter().all(|&i| i < unmount));
    assert!(calls[unmount].target.ends_with("(discard)"));
    assert!(fx.backend.loaded_hives().is_empty());
}

#[test]
fn skipped_hook_does_not_fail_the_run() {
    let fx = Fixture::new("");
    let (slow, _) = StaticHook::new("slow", skipped);
    let (after, after_calls) = StaticHook::new("after", completed);
    let report = fx
        .pipeline()
        .with_hook(Box::new(slow))
        .with_hook(Box::new(after))
        .run(RunOptions::default())
        .unwrap();

    assert!(report.succeeded(), "{report:?}");
    assert!(matches!(report.hooks[0].status, HookStatus::Skipped { .. }));
    assert_eq!(after_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn export_runs_only_after_a_clean_commit() {
    let fx = Fixture::new("");
    let (export, export_calls) = StaticHook::new("export", completed);
    let report = fx
        .pipeline()
        .with_export(Box::new(export))
        .run(RunOptions::default())
        .unwrap();
    assert_eq!(export_calls.load(Ordering::SeqCst), 1);
    assert!(report.export.is_some());

    let fx = Fixture::new("");
    let (export, export_calls) = StaticHook::new("export", completed);
    let (broken, _) = StaticHook::new("broken", failing);
    let report = fx
        .pipeline()
        .with_hook(Box::new(broken))
        .with_export(Box::new(export))
        .run(RunOptions::default())
        .unwrap();
    assert_eq!(export_calls.load(Ordering::SeqCst), 0);
    assert!(report.export.is_none());

    let fx = Fixture::new("");
    let (export, export_calls) = StaticHook::new("export", completed);
    fx.pipeline()
        .with_export(Box::new(export))
        .run(RunOptions {
            commit: true,
            export: false,
        })
        .unwrap();
    assert_eq!(export_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_export_is_a_processing_failure() {
    let fx = Fixture::new("");
    let (export, _) = StaticHook::new("export", failing);
    let report = fx
        .pipeline()
        .with_export(Box::new(export))
        .run(RunOptions::default())
        .unwrap();

    assert_eq!(report.final_state, RunState::Committed);
    assert_eq!(report.failed_phase, Some(Phase::Export));
    assert!(!report.processing_ok());
    assert!(report.cleanup_ok());
}

#[test]
fn failed_commit_falls_back_to_discard() {
    let fx = Fixture::new("");
    fx.backend
        .fail_matching(MockOp::Unmount, FaultKind::Busy, Some("(commit)"), Some(1));

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    let detach = report.detach.as_ref().unwrap();
    assert_eq!(detach.requested, DetachMode::Commit);
    assert_eq!(detach.performed, Some(DetachMode::Discard));
    assert!(detach.ok);
    assert_eq!(report.failed_phase, Some(Phase::Detach));
    assert_eq!(report.final_state, RunState::Discarded);
    assert!(!report.succeeded());
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn load_failure_discards_and_unloads_what_was_loaded() {
    let fx = Fixture::new("");
    // Hives load alphabetically: zNTUSER, zSOFTWARE, zSYSTEM.
    fx.backend
        .fail_matching(MockOp::LoadHive, FaultKind::Corrupt, Some("zSYSTEM"), None);

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Load));
    assert_eq!(report.unloads.len(), 2);
    assert_eq!(report.final_state, RunState::Discarded);
    assert!(fx.backend.loaded_hives().is_empty());
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn shutdown_skips_processing_but_still_cleans_up() {
    let fx = Fixture::new(&ten_settings());
    let ctx = fx.ctx();
    ctx.shutdown.cancel();

    let report = Pipeline::new(ctx, fx.profile.clone())
        .run(RunOptions::default())
        .unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Load));
    assert!(report.error.as_deref().unwrap().contains("interrupted"));
    assert_eq!(report.settings_applied(), 0);
    assert_eq!(report.final_state, RunState::Discarded);
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn attach_failure_never_reaches_detach() {
    let fx = Fixture::new("");
    fx.backend.fail(MockOp::Mount, FaultKind::Corrupt);

    let report = fx.pipeline().run(RunOptions::default()).unwrap();

    assert_eq!(report.failed_phase, Some(Phase::Attach));
    assert_eq!(report.final_state, RunState::Failed);
    assert!(report.detach.is_none());
    assert_eq!(fx.backend.count(MockOp::LoadHive), 0);
}

#[test]
fn orphan_sweep_releases_hives_then_mounts() {
    let fx = Fixture::new("");
    let scratch = fx.scratch();
    fx.backend
        .add_stale_mount(&fx.profile.image.path, 1, &scratch, MountStatus::Invalid)
        .unwrap();
    fx.backend
        .add_stale_hive(
            &HiveAlias::parse("zSYSTEM").unwrap(),
            &scratch.join("Windows/System32/config/SYSTEM"),
        )
        .unwrap();

    let sweep = fx.pipeline().sweep_orphans();

    assert!(sweep.is_clean(), "{sweep:?}");
    assert_eq!(sweep.hives.len(), 1);
    assert_eq!(sweep.mounts_released, 1);
    assert!(fx.backend.loaded_hives().is_empty());
    assert!(fx.backend.mounts().is_empty());
}

#[test]
fn status_reports_stale_hives() {
    let fx = Fixture::new("");
    fx.backend
        .add_stale_hive(&HiveAlias::parse("zSOFTWARE").unwrap(), &fx.scratch().join("x"))
        .unwrap();

    let status = fx.pipeline().status().unwrap();

    assert!(status.mounts.is_empty());
    let software = status.hives.iter().find(|h| h.alias == "zSOFTWARE").unwrap();
    assert_eq!(software.state, slimforge_core::HiveState::StaleLoaded);
}

#[cfg(unix)]
mod command_hooks {
    use super::*;
    use slimforge_core::CommandHook;
    use slimforge_runtime::{CommandSpec, NeverCancel, ProcessSupervisor};
    use slimforge_schema::ImageRef;
    use std::time::Duration;

    fn run(hook: &CommandHook) -> Result<HookStatus, CoreError> {
        let image = ImageRef::new("/images/install.wim", 1);
        let supervisor = ProcessSupervisor::default();
        hook.run(&HookContext {
            image: &image,
            mount_dir: std::path::Path::new("/tmp"),
            supervisor: &supervisor,
            cancel: &NeverCancel,
        })
    }

    #[test]
    fn zero_exit_completes() {
        let hook = CommandHook::new("ok", CommandSpec::new("true"));
        assert_eq!(run(&hook).unwrap(), HookStatus::Completed { code: 0 });
    }

    #[test]
    fn nonzero_exit_fails_with_diagnostic() {
        let hook = CommandHook::new(
            "bad",
            CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]),
        );
        let err = run(&hook).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[test]
    fn timeout_becomes_a_skip() {
        let hook = CommandHook::new("slow", CommandSpec::new("sleep").arg("10"))
            .with_timeout(Duration::from_secs(1));
        assert!(matches!(run(&hook).unwrap(), HookStatus::Skipped { .. }));
    }
}
