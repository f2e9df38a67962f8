use super::{colorize_state, json_pretty, load_profile, make_context, EXIT_SUCCESS};
use slimforge_core::{HiveState, Pipeline};
use slimforge_runtime::{CancelFlag, MountStatus};
use std::path::Path;

fn status_label(status: MountStatus) -> &'static str {
    match status {
        MountStatus::Ok => "ok",
        MountStatus::NeedsRemount => "needs_remount",
        MountStatus::Invalid => "invalid",
    }
}

fn hive_label(state: HiveState) -> &'static str {
    match state {
        HiveState::Unloaded => "unloaded",
        HiveState::Loaded => "loaded",
        HiveState::StaleLoaded => "stale_loaded",
    }
}

pub fn run(profile_path: &Path, backend: Option<&str>, json: bool) -> Result<u8, String> {
    let profile = load_profile(profile_path, backend)?;
    let ctx = make_context(&profile, CancelFlag::new())?;
    let status = Pipeline::new(ctx, profile)
        .status()
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&status)?);
        return Ok(EXIT_SUCCESS);
    }

    if status.mounts.is_empty() {
        println!("no mounted images");
    } else {
        println!("{:<40} {:>5}  {:<14} MOUNT DIR", "IMAGE", "INDEX", "STATUS");
        for m in &status.mounts {
            println!(
                "{:<40} {:>5}  {:<14} {}",
                m.image.display(),
                m.index,
                colorize_state(status_label(m.status)),
                m.mount_dir.display()
            );
        }
    }
    for hive in &status.hives {
        println!("{}: {}", hive.alias, colorize_state(hive_label(hive.state)));
    }
    Ok(EXIT_SUCCESS)
}
