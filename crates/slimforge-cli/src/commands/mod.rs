pub mod build;
pub mod cleanup;
pub mod completions;
pub mod status;
pub mod validate;

use indicatif::{ProgressBar, ProgressStyle};
use slimforge_core::RunContext;
use slimforge_runtime::{CancelFlag, SystemBackend};
use slimforge_schema::{clean_path, parse_profile_file, NormalizedProfile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PROFILE_ERROR: u8 = 2;
pub const EXIT_CLEANUP_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "committed" | "completed" | "loaded" | "ok" => {
            Style::new().green().apply_to(state).to_string()
        }
        "discarded" | "skipped" | "needs_remount" => {
            Style::new().yellow().apply_to(state).to_string()
        }
        "failed" | "invalid" | "stale_loaded" => Style::new().red().bold().apply_to(state).to_string(),
        "unloaded" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Relative profile paths resolve against the profile's own directory.
fn profile_dir(path: &Path) -> Result<PathBuf, String> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if parent.is_absolute() {
        Ok(clean_path(parent))
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| format!("cannot determine working directory: {e}"))?;
        Ok(clean_path(&cwd.join(parent)))
    }
}

/// Parse and normalize a profile, applying a `--backend` override.
pub fn load_profile(path: &Path, backend: Option<&str>) -> Result<NormalizedProfile, String> {
    let raw = parse_profile_file(path).map_err(|e| format!("profile error: {e}"))?;
    let mut profile = raw
        .normalize(&profile_dir(path)?)
        .map_err(|e| format!("profile error: {e}"))?;
    if let Some(name) = backend {
        profile.backend = name.trim().to_lowercase();
    }
    Ok(profile)
}

/// Refuse to start when the backend's tools are missing. The mock backend
/// needs nothing, and `SLIMFORGE_SKIP_PREREQS=1` disables the check.
pub fn ensure_prereqs(backend: &str) -> Result<(), String> {
    if backend != "dism" || std::env::var("SLIMFORGE_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    let missing = slimforge_runtime::check_dism_prereqs();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(slimforge_runtime::format_missing(&missing))
    }
}

pub fn open_backend(profile: &NormalizedProfile) -> Result<Arc<dyn SystemBackend>, String> {
    ensure_prereqs(&profile.backend)?;
    let backend = slimforge_runtime::select_backend(&profile.backend, RunContext::supervisor_for(profile))
        .map_err(|e| e.to_string())?;
    Ok(Arc::from(backend))
}

pub fn make_context(profile: &NormalizedProfile, shutdown: CancelFlag) -> Result<RunContext, String> {
    let backend = open_backend(profile)?;
    Ok(RunContext::from_profile(
        backend,
        profile,
        CancelFlag::new(),
        shutdown,
    ))
}
