//! The build pipeline: attach, load, mutate, unload, detach, export.
//!
//! Processing runs as one fallible block; unload and detach always follow
//! it, whatever it returned. A `MountGuard` and the `HiveManager`'s own
//! `Drop` cover unwinding, and are declared so hives drop before the mount.

use crate::context::RunContext;
use crate::hive::{HiveHandle, HiveManager, HiveState, UnloadReport};
use crate::lifecycle::{RunState, StateTracker};
use crate::mount::{MountGuard, MountHandle, ResourceMountManager};
use crate::report::{DetachReport, HookReport, HookStatus, Phase, RunReport};
use crate::settings::SettingApplier;
use crate::CoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use slimforge_runtime::supervisor::format_duration;
use slimforge_runtime::{
    CancellationToken, CommandSpec, DetachMode, MountRecord, Outcome, ProcessSupervisor,
};
use slimforge_schema::{HiveAlias, ImageRef, NormalizedHook, NormalizedProfile};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// What a hook gets to see while it runs.
pub struct HookContext<'a> {
    pub image: &'a ImageRef,
    pub mount_dir: &'a Path,
    pub supervisor: &'a ProcessSupervisor,
    pub cancel: &'a dyn CancellationToken,
}

/// A step that mutates the mounted image.
///
/// `Ok(Skipped)` means the step was timed out or cancelled and the pipeline
/// moves on; `Err` aborts processing (cleanup still runs).
pub trait MutationHook: Send + Sync {
    fn name(&self) -> &str;

    /// Run after the settings batches instead of before them.
    fn after_settings(&self) -> bool {
        false
    }

    fn run(&self, ctx: &HookContext<'_>) -> Result<HookStatus, CoreError>;
}

/// An external command run under the supervisor.
pub struct CommandHook {
    name: String,
    spec: CommandSpec,
    timeout: Option<Duration>,
    after_settings: bool,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            timeout: None,
            after_settings: false,
        }
    }

    pub fn from_profile(hook: &NormalizedHook) -> Self {
        Self {
            name: hook.name.clone(),
            spec: CommandSpec::new(hook.program.clone()).args(hook.args.iter().cloned()),
            timeout: hook.timeout_secs.map(Duration::from_secs),
            after_settings: hook.after_settings,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl MutationHook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_settings(&self) -> bool {
        self.after_settings
    }

    fn run(&self, ctx: &HookContext<'_>) -> Result<HookStatus, CoreError> {
        let timeout = self.timeout.or(ctx.supervisor.policy().timeout);
        let run = ctx
            .supervisor
            .with_timeout(timeout)
            .run(&self.spec, ctx.cancel)
            .map_err(|e| CoreError::HookFailed {
                name: self.name.clone(),
                error: e.to_string(),
            })?;

        match run.outcome {
            Outcome::Completed { code: 0 } => Ok(HookStatus::Completed { code: 0 }),
            Outcome::Completed { code } => Err(CoreError::HookFailed {
                name: self.name.clone(),
                error: format!("exited with code {code}: {}", run.diagnostic()),
            }),
            Outcome::TimedOut => Ok(HookStatus::Skipped {
                reason: format!("timed out after {}", format_duration(run.elapsed)),
            }),
            Outcome::Cancelled => Ok(HookStatus::Skipped {
                reason: "cancelled".to_owned(),
            }),
            Outcome::StillRunning => Ok(HookStatus::Skipped {
                reason: "did not finish".to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Commit changes when processing succeeds. `false` always discards.
    pub commit: bool,
    pub export: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            commit: true,
            export: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub hives: Vec<UnloadReport>,
    pub mounts_released: usize,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.hives.iter().all(|h| h.ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveStatus {
    pub alias: String,
    pub state: HiveState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub mounts: Vec<MountRecord>,
    pub hives: Vec<HiveStatus>,
}

type StepResult = Result<(), (Phase, CoreError)>;

pub struct Pipeline {
    ctx: RunContext,
    profile: NormalizedProfile,
    hooks: Vec<Box<dyn MutationHook>>,
    export: Option<Box<dyn MutationHook>>,
}

impl Pipeline {
    pub fn new(ctx: RunContext, profile: NormalizedProfile) -> Self {
        let hooks = profile
            .hooks
            .iter()
            .map(|h| Box::new(CommandHook::from_profile(h)) as Box<dyn MutationHook>)
            .collect();
        let export = profile
            .export
            .as_ref()
            .map(|h| Box::new(CommandHook::from_profile(h)) as Box<dyn MutationHook>);
        Self {
            ctx,
            profile,
            hooks,
            export,
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Box<dyn MutationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn with_export(mut self, hook: Box<dyn MutationHook>) -> Self {
        self.export = Some(hook);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn profile(&self) -> &NormalizedProfile {
        &self.profile
    }

    fn aliases(&self) -> Vec<HiveAlias> {
        self.profile.hives.iter().map(|h| h.alias.clone()).collect()
    }

    /// Run the whole build. Processing and cleanup failures land in the
    /// report; only an internal state-machine violation is an `Err`.
    pub fn run(&self, options: RunOptions) -> Result<RunReport, CoreError> {
        let profile = &self.profile;
        let mut report = RunReport::new(
            profile.image.to_string(),
            profile.mount_dir.display().to_string(),
        );
        let mut states = StateTracker::new();

        report.swept = HiveManager::new(&self.ctx).sweep(&self.aliases());

        states.advance(RunState::Attaching)?;
        let handle = match ResourceMountManager::new(&self.ctx).attach(&profile.image, &profile.mount_dir) {
            Ok(handle) => handle,
            Err(e) => {
                report.fail(Phase::Attach, &e);
                states.advance(RunState::Failed)?;
                return Ok(Self::finish(report, &states));
            }
        };
        states.advance(RunState::Mounted)?;

        let mut guard = MountGuard::new(ResourceMountManager::new(&self.ctx), handle);
        let mut hives = HiveManager::new(&self.ctx);

        if let Err((phase, e)) = self.process(&mut hives, guard.handle(), &mut states, &mut report) {
            warn!("processing failed during {phase:?}: {e}");
            report.fail(phase, &e);
        }

        states.advance(RunState::Unloading)?;
        report.unloads = hives.unload_all();
        drop(hives);
        let unload_error = report.unloads.iter().find(|u| !u.ok).map(|failed| {
            format!(
                "{} could not be unloaded: {}",
                failed.alias,
                failed.error.as_deref().unwrap_or("unknown error")
            )
        });
        if let Some(msg) = unload_error {
            report.fail(Phase::Unload, msg);
        }

        states.advance(RunState::Detaching)?;
        let commit = options.commit && report.failed_phase.is_none();
        let requested = if commit {
            DetachMode::Commit
        } else {
            DetachMode::Discard
        };
        let detach = Self::detach(&mut guard, requested, &mut report);
        let final_state = match (detach.performed, detach.ok) {
            (Some(DetachMode::Commit), true) => RunState::Committed,
            (Some(DetachMode::Discard), true) => RunState::Discarded,
            _ => RunState::Failed,
        };
        report.detach = Some(detach);
        states.advance(final_state)?;

        if final_state == RunState::Committed && report.failed_phase.is_none() {
            if options.export {
                self.export(&mut report);
            }
        } else if self.export.is_some() && options.export {
            info!("export skipped: image was not committed cleanly");
        }

        Ok(Self::finish(report, &states))
    }

    fn process(
        &self,
        hives: &mut HiveManager<'_>,
        mount: &MountHandle,
        states: &mut StateTracker,
        report: &mut RunReport,
    ) -> StepResult {
        states
            .advance(RunState::Loading)
            .map_err(|e| (Phase::Load, e))?;

        let mut handles: Vec<HiveHandle> = Vec::with_capacity(self.profile.hives.len());
        for hive in &self.profile.hives {
            self.check_shutdown(Phase::Load)?;
            let handle = hives
                .load(&hive.alias, &hive.file)
                .map_err(|e| (Phase::Load, CoreError::from(e)))?;
            handles.push(handle);
        }

        states
            .advance(RunState::Configuring)
            .map_err(|e| (Phase::Configure, e))?;

        self.run_hooks(false, mount, report)?;

        let applier = SettingApplier::new(&self.ctx);
        for handle in &handles {
            self.check_shutdown(Phase::Configure)?;
            let records = self.profile.settings_for(&handle.alias);
            if records.is_empty() {
                continue;
            }
            let batch = applier.apply(handle, &records);
            let failed = batch.failure_count;
            info!(
                "{}: {} of {} setting(s) applied",
                handle.alias,
                batch.success_count,
                records.len()
            );
            report.batches.push(batch);
            if failed > 0 && self.profile.strict_settings {
                return Err((
                    Phase::Configure,
                    CoreError::SettingsFailed {
                        store: handle.alias.to_string(),
                        failed,
                    },
                ));
            }
        }

        self.run_hooks(true, mount, report)?;
        Ok(())
    }

    fn run_hooks(&self, after_settings: bool, mount: &MountHandle, report: &mut RunReport) -> StepResult {
        for hook in self.hooks.iter().filter(|h| h.after_settings() == after_settings) {
            self.check_shutdown(Phase::Configure)?;
            let status = self.run_hook(hook.as_ref(), mount);
            match status {
                Ok(status) => report.hooks.push(HookReport {
                    name: hook.name().to_owned(),
                    status,
                }),
                Err(e) => {
                    report.hooks.push(HookReport {
                        name: hook.name().to_owned(),
                        status: HookStatus::Failed {
                            error: e.to_string(),
                        },
                    });
                    return Err((Phase::Configure, e));
                }
            }
        }
        Ok(())
    }

    fn run_hook(&self, hook: &dyn MutationHook, mount: &MountHandle) -> Result<HookStatus, CoreError> {
        match self.profile.cancel_key {
            Some(key) => info!("running {} (press '{key}' to skip)", hook.name()),
            None => info!("running {}", hook.name()),
        }
        let token = self.ctx.step_token();
        let status = hook.run(&HookContext {
            image: &mount.image,
            mount_dir: &mount.mount_dir,
            supervisor: &self.ctx.supervisor,
            cancel: &token,
        })?;
        if let HookStatus::Skipped { reason } = &status {
            info!("{} skipped: {reason}", hook.name());
        }
        Ok(status)
    }

    fn check_shutdown(&self, phase: Phase) -> StepResult {
        if self.ctx.shutdown_requested() {
            Err((phase, CoreError::Interrupted))
        } else {
            Ok(())
        }
    }

    /// Detach as requested. A failed commit falls back to discard so the
    /// mount is not left behind.
    fn detach(guard: &mut MountGuard<'_>, requested: DetachMode, report: &mut RunReport) -> DetachReport {
        match guard.detach(requested) {
            Ok(()) => DetachReport {
                requested,
                performed: Some(requested),
                ok: true,
                error: None,
            },
            Err(e) if requested == DetachMode::Commit => {
                warn!("commit failed: {e}; discarding instead");
                report.fail(Phase::Detach, format!("commit failed: {e}"));
                match guard.detach(DetachMode::Discard) {
                    Ok(()) => DetachReport {
                        requested,
                        performed: Some(DetachMode::Discard),
                        ok: true,
                        error: Some(e.to_string()),
                    },
                    Err(discard) => DetachReport {
                        requested,
                        performed: None,
                        ok: false,
                        error: Some(format!("commit failed: {e}; discard failed: {discard}")),
                    },
                }
            }
            Err(e) => {
                report.fail(Phase::Detach, &e);
                DetachReport {
                    requested,
                    performed: None,
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn export(&self, report: &mut RunReport) {
        let Some(hook) = &self.export else {
            return;
        };
        info!("exporting with {}", hook.name());
        let token = self.ctx.step_token();
        let result = hook.run(&HookContext {
            image: &self.profile.image,
            mount_dir: &self.profile.mount_dir,
            supervisor: &self.ctx.supervisor,
            cancel: &token,
        });
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                report.fail(Phase::Export, &e);
                HookStatus::Failed {
                    error: e.to_string(),
                }
            }
        };
        report.export = Some(HookReport {
            name: hook.name().to_owned(),
            status,
        });
    }

    fn finish(mut report: RunReport, states: &StateTracker) -> RunReport {
        report.final_state = states.current();
        report.history = states.history().to_vec();
        report.finished_at = Some(Utc::now());
        info!("run finished: {}", report.final_state);
        report
    }

    /// Force-release anything a crashed run left behind for this profile:
    /// hives first, then mounts of the image or at the mount dir.
    pub fn sweep_orphans(&self) -> SweepReport {
        let hives = HiveManager::new(&self.ctx).sweep(&self.aliases());
        let mut errors = Vec::new();
        let mounts_released = match ResourceMountManager::new(&self.ctx)
            .release_stale(&self.profile.image, &self.profile.mount_dir)
        {
            Ok(n) => n,
            Err(e) => {
                errors.push(e.to_string());
                0
            }
        };
        SweepReport {
            hives,
            mounts_released,
            errors,
        }
    }

    pub fn status(&self) -> Result<StatusReport, CoreError> {
        let mounts = self.ctx.backend.list_mounts()?;
        let manager = HiveManager::new(&self.ctx);
        let mut hives = Vec::with_capacity(self.profile.hives.len());
        for hive in &self.profile.hives {
            hives.push(HiveStatus {
                alias: hive.alias.to_string(),
                state: manager.inspect(&hive.alias)?,
            });
        }
        Ok(StatusReport { mounts, hives })
    }
}
