use crate::hive::UnloadReport;
use crate::lifecycle::{RunState, Transition};
use crate::settings::BatchResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slimforge_runtime::DetachMode;

/// Pipeline phase that produced the first processing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Attach,
    Load,
    Configure,
    Unload,
    Detach,
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HookStatus {
    Completed { code: i32 },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookReport {
    pub name: String,
    #[serde(flatten)]
    pub status: HookStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachReport {
    pub requested: DetachMode,
    pub performed: Option<DetachMode>,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub image: String,
    pub mount_dir: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_state: RunState,
    pub history: Vec<Transition>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    pub swept: Vec<UnloadReport>,
    pub hooks: Vec<HookReport>,
    pub batches: Vec<BatchResult>,
    pub unloads: Vec<UnloadReport>,
    pub detach: Option<DetachReport>,
    pub export: Option<HookReport>,
}

impl RunReport {
    pub fn new(image: String, mount_dir: String) -> Self {
        Self {
            image,
            mount_dir,
            started_at: Utc::now(),
            finished_at: None,
            final_state: RunState::Idle,
            history: Vec::new(),
            failed_phase: None,
            error: None,
            swept: Vec::new(),
            hooks: Vec::new(),
            batches: Vec::new(),
            unloads: Vec::new(),
            detach: None,
            export: None,
        }
    }

    /// Record the first processing failure; later ones are only logged.
    pub fn fail(&mut self, phase: Phase, error: impl ToString) {
        if self.failed_phase.is_none() {
            self.failed_phase = Some(phase);
            self.error = Some(error.to_string());
        }
    }

    /// Attach, load, configure, and export all went through.
    pub fn processing_ok(&self) -> bool {
        !matches!(
            self.failed_phase,
            Some(Phase::Attach | Phase::Load | Phase::Configure | Phase::Export)
        )
    }

    /// Every opened hive was unloaded and the image was detached.
    pub fn cleanup_ok(&self) -> bool {
        self.unloads.iter().all(|u| u.ok) && self.detach.as_ref().map_or(true, |d| d.ok)
    }

    /// Nothing failed and the image ended up in the requested state.
    pub fn succeeded(&self) -> bool {
        self.failed_phase.is_none()
            && self.cleanup_ok()
            && matches!(self.final_state, RunState::Committed | RunState::Discarded)
    }

    pub fn settings_applied(&self) -> usize {
        self.batches.iter().map(|b| b.success_count).sum()
    }

    pub fn settings_failed(&self) -> usize {
        self.batches.iter().map(|b| b.failure_count).sum()
    }
}
