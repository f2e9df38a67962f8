use crate::context::RunContext;
use crate::hive::HiveHandle;
use serde::{Deserialize, Serialize};
use slimforge_runtime::RuntimeError;
use slimforge_schema::{split_key_path, HiveAlias, SettingRecord};
use std::cell::Cell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    PermissionDenied,
    Transient,
    Fatal,
}

impl FailureClass {
    pub fn classify(err: &RuntimeError) -> Self {
        if err.is_permission() {
            FailureClass::PermissionDenied
        } else if err.is_retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Applied {
        attempts: u32,
        via_fallback: bool,
    },
    Failed {
        attempts: u32,
        class: FailureClass,
        error: String,
    },
}

impl RecordStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, RecordStatus::Applied { .. })
    }
}

/// Outcome of one batch: one status per record, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub store: String,
    pub success_count: usize,
    pub failure_count: usize,
    pub statuses: Vec<RecordStatus>,
}

impl BatchResult {
    pub fn all_applied(&self) -> bool {
        self.failure_count == 0
    }
}

/// Writes setting records into a loaded hive, one record at a time.
///
/// A failing record never stops the batch. Permission failures switch the
/// record to its fallback path (when it has one) for later attempts.
pub struct SettingApplier<'a> {
    ctx: &'a RunContext,
}

impl<'a> SettingApplier<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    pub fn apply(&self, handle: &HiveHandle, records: &[SettingRecord]) -> BatchResult {
        info!("applying {} setting(s) to {}", records.len(), handle.alias);
        let statuses: Vec<RecordStatus> = records
            .iter()
            .map(|record| self.apply_one(handle, record))
            .collect();
        let success_count = statuses.iter().filter(|s| s.is_applied()).count();
        let failure_count = statuses.len() - success_count;
        if failure_count > 0 {
            warn!(
                "{}: {success_count} setting(s) applied, {failure_count} failed",
                handle.alias
            );
        }
        BatchResult {
            store: handle.alias.to_string(),
            success_count,
            failure_count,
            statuses,
        }
    }

    pub fn apply_one(&self, handle: &HiveHandle, record: &SettingRecord) -> RecordStatus {
        if record.store != handle.alias {
            return RecordStatus::Failed {
                attempts: 0,
                class: FailureClass::Fatal,
                error: format!(
                    "record targets {} but the handle is {}",
                    record.store, handle.alias
                ),
            };
        }
        if !handle.is_loaded() {
            return RecordStatus::Failed {
                attempts: 0,
                class: FailureClass::Fatal,
                error: format!("{} is not loaded", handle.alias),
            };
        }

        let use_fallback = Cell::new(false);
        let mut attempts = 0;
        let policy = self
            .ctx
            .setting_retry
            .retry_if(|e| FailureClass::classify(e) != FailureClass::Fatal);

        let result = policy.run(
            &format!("set {}", record.display_name()),
            |attempt| {
                attempts = attempt;
                let path = match (&record.fallback_path, use_fallback.get()) {
                    (Some(fallback), true) => fallback.as_str(),
                    _ => record.path.as_str(),
                };
                self.write(&handle.alias, path, record)
            },
            |_, e| {
                if FailureClass::classify(e) == FailureClass::PermissionDenied
                    && record.fallback_path.is_some()
                    && !use_fallback.get()
                {
                    info!("{}: access denied, switching to fallback path", record.display_name());
                    use_fallback.set(true);
                }
            },
        );

        match result {
            Ok(()) => {
                debug!("set {}", record.display_name());
                RecordStatus::Applied {
                    attempts,
                    via_fallback: use_fallback.get(),
                }
            }
            Err(e) => {
                let class = FailureClass::classify(&e);
                warn!("{} failed ({class:?}): {e}", record.display_name());
                RecordStatus::Failed {
                    attempts,
                    class,
                    error: e.to_string(),
                }
            }
        }
    }

    fn write(&self, alias: &HiveAlias, path: &str, record: &SettingRecord) -> Result<(), RuntimeError> {
        self.ensure_key_chain(alias, path)?;
        self.ctx
            .backend
            .set_value(alias, path, &record.name, &record.value)
    }

    /// Create each level of `path`, root first. Existing levels are fine.
    fn ensure_key_chain(&self, alias: &HiveAlias, path: &str) -> Result<(), RuntimeError> {
        let segments = split_key_path(path);
        for depth in 1..=segments.len() {
            let partial = segments[..depth].join("\\");
            match self.ctx.backend.create_key(alias, &partial) {
                Ok(()) | Err(RuntimeError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
