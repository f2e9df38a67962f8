//! Load and guaranteed unload of configuration stores (registry hives).

use crate::context::RunContext;
use serde::{Deserialize, Serialize};
use slimforge_runtime::RuntimeError;
use slimforge_schema::HiveAlias;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiveState {
    Unloaded,
    Loaded,
    /// Loaded under our alias, but not by this run.
    StaleLoaded,
}

#[derive(Debug, Clone)]
pub struct HiveHandle {
    pub alias: HiveAlias,
    pub file: PathBuf,
    state: HiveState,
}

impl HiveHandle {
    pub fn state(&self) -> HiveState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == HiveState::Loaded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadReport {
    pub alias: String,
    pub attempts: u32,
    pub ok: bool,
    pub error: Option<String>,
}

/// Owns every hive this run opened. Whatever is still open when the
/// manager is dropped gets an unload attempt.
pub struct HiveManager<'a> {
    ctx: &'a RunContext,
    open: Vec<HiveHandle>,
}

impl<'a> HiveManager<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            open: Vec::new(),
        }
    }

    pub fn open_handles(&self) -> &[HiveHandle] {
        &self.open
    }

    /// Load `file` under `alias`, first evicting a stale hive bound to the
    /// same alias. Permission failures trigger an ownership takeover of the
    /// file before the next attempt.
    pub fn load(&mut self, alias: &HiveAlias, file: &Path) -> Result<HiveHandle, RuntimeError> {
        if self.open.iter().any(|h| h.alias == *alias) {
            return Err(RuntimeError::ResourceBusy(format!(
                "{alias} is already loaded by this run"
            )));
        }
        self.evict_stale(alias)?;

        let backend = &self.ctx.backend;
        self.ctx.load_retry.run(
            &format!("load {alias}"),
            |_| backend.load_hive(alias, file),
            |attempt, e| {
                warn!("loading {alias} failed (attempt {attempt}): {e}");
                if e.is_permission() {
                    info!("taking ownership of {}", file.display());
                    if let Err(err) = backend.take_ownership(file) {
                        warn!("ownership takeover of {} failed: {err}", file.display());
                    }
                }
            },
        )?;

        let handle = HiveHandle {
            alias: alias.clone(),
            file: file.to_path_buf(),
            state: HiveState::Loaded,
        };
        info!("loaded {} as {alias}", file.display());
        self.open.push(handle.clone());
        Ok(handle)
    }

    /// Unload one handle. Never fails; the report says what happened.
    pub fn unload(&mut self, handle: &mut HiveHandle) -> UnloadReport {
        let report = self.unload_alias(&handle.alias);
        if report.ok {
            handle.state = HiveState::Unloaded;
        }
        report
    }

    pub fn unload_alias(&mut self, alias: &HiveAlias) -> UnloadReport {
        let report = self.force_unload(alias);
        if report.ok {
            self.open.retain(|h| h.alias != *alias);
        }
        report
    }

    /// Attempt an unload of every open hive, most recently loaded first.
    ///
    /// Each hive gets exactly one retry cycle. Hives that stay loaded are
    /// reported and released from the manager, so `Drop` does not retry them.
    pub fn unload_all(&mut self) -> Vec<UnloadReport> {
        let aliases: Vec<HiveAlias> = self.open.iter().rev().map(|h| h.alias.clone()).collect();
        let reports = aliases.iter().map(|a| self.unload_alias(a)).collect();
        self.open.clear();
        reports
    }

    /// Unload any of `aliases` left loaded by an earlier run.
    pub fn sweep(&self, aliases: &[HiveAlias]) -> Vec<UnloadReport> {
        let mut reports = Vec::new();
        for alias in aliases {
            match self.ctx.backend.is_hive_loaded(alias) {
                Ok(true) => {
                    warn!("{alias} is still loaded from an earlier run; unloading");
                    reports.push(self.force_unload(alias));
                }
                Ok(false) => {}
                Err(e) => warn!("could not query {alias}: {e}"),
            }
        }
        reports
    }

    pub fn inspect(&self, alias: &HiveAlias) -> Result<HiveState, RuntimeError> {
        if self.open.iter().any(|h| h.alias == *alias) {
            return Ok(HiveState::Loaded);
        }
        if self.ctx.backend.is_hive_loaded(alias)? {
            Ok(HiveState::StaleLoaded)
        } else {
            Ok(HiveState::Unloaded)
        }
    }

    fn evict_stale(&self, alias: &HiveAlias) -> Result<(), RuntimeError> {
        if !self.ctx.backend.is_hive_loaded(alias)? {
            return Ok(());
        }
        warn!("{alias} is already loaded ({:?}); forcing unload", HiveState::StaleLoaded);
        let report = self.force_unload(alias);
        if report.ok {
            Ok(())
        } else {
            Err(RuntimeError::ResourceBusy(format!(
                "stale {alias} could not be unloaded: {}",
                report.error.unwrap_or_default()
            )))
        }
    }

    fn force_unload(&self, alias: &HiveAlias) -> UnloadReport {
        let backend = &self.ctx.backend;
        let mut attempts = 0;
        let result = self.ctx.unload_retry.run(
            &format!("unload {alias}"),
            |attempt| {
                attempts = attempt;
                match backend.unload_hive(alias) {
                    Err(e) if matches!(e, RuntimeError::NotFound(_)) => Ok(()),
                    other => other,
                }
            },
            |_, _| backend.release_references(),
        );

        match result {
            Ok(()) => {
                info!("unloaded {alias}");
                UnloadReport {
                    alias: alias.to_string(),
                    attempts,
                    ok: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{alias} could not be unloaded after {attempts} attempt(s): {e}");
                UnloadReport {
                    alias: alias.to_string(),
                    attempts,
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl Drop for HiveManager<'_> {
    fn drop(&mut self) {
        if !self.open.is_empty() {
            warn!("{} hive(s) still loaded at scope exit; unloading", self.open.len());
            self.unload_all();
        }
    }
}
