use super::{
    colorize_state, json_pretty, load_profile, make_context, spin_fail, spin_ok, spinner,
    EXIT_CLEANUP_ERROR, EXIT_FAILURE, EXIT_SUCCESS,
};
use slimforge_core::{HookStatus, Pipeline, RecordStatus, RunOptions, RunReport};
use slimforge_runtime::CancelFlag;
use std::path::Path;

/// Processing failures win over cleanup failures.
pub fn exit_code_for(report: &RunReport) -> u8 {
    if report.succeeded() {
        EXIT_SUCCESS
    } else if !report.processing_ok() {
        EXIT_FAILURE
    } else {
        EXIT_CLEANUP_ERROR
    }
}

pub fn run(
    profile_path: &Path,
    backend: Option<&str>,
    discard: bool,
    no_export: bool,
    shutdown: CancelFlag,
    json: bool,
) -> Result<u8, String> {
    let profile = load_profile(profile_path, backend)?;
    let ctx = make_context(&profile, shutdown)?;
    if let Some(key) = profile.cancel_key {
        if !json {
            eprintln!("press '{key}' to skip a running hook");
        }
    }

    let pipeline = Pipeline::new(ctx, profile);
    let pb = if json {
        None
    } else {
        Some(spinner(&format!("customizing {}...", pipeline.profile().image)))
    };

    let report = match pipeline.run(RunOptions {
        commit: !discard,
        export: !no_export,
    }) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.to_string());
        }
    };

    if let Some(ref pb) = pb {
        if report.succeeded() {
            spin_ok(pb, &format!("image {}", report.final_state));
        } else {
            spin_fail(pb, &format!("image {}", report.final_state));
        }
    }

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(exit_code_for(&report))
}

fn print_summary(report: &RunReport) {
    println!("image: {}", report.image);
    println!("state: {}", colorize_state(&report.final_state.to_string()));

    for hook in &report.hooks {
        let line = match &hook.status {
            HookStatus::Completed { .. } => colorize_state("completed"),
            HookStatus::Skipped { reason } => format!("{} ({reason})", colorize_state("skipped")),
            HookStatus::Failed { error } => format!("{} ({error})", colorize_state("failed")),
        };
        println!("hook {}: {line}", hook.name);
    }

    for batch in &report.batches {
        println!(
            "settings {}: {} applied, {} failed",
            batch.store, batch.success_count, batch.failure_count
        );
        for status in &batch.statuses {
            if let RecordStatus::Failed { error, .. } = status {
                println!("  {error}");
            }
        }
    }

    for unload in report.unloads.iter().filter(|u| !u.ok) {
        println!(
            "unload {}: {} after {} attempt(s)",
            unload.alias,
            colorize_state("failed"),
            unload.attempts
        );
    }

    if let Some(detach) = &report.detach {
        if let Some(err) = &detach.error {
            println!("detach: {err}");
        }
    }
    if let Some(export) = &report.export {
        println!("export {}: {:?}", export.name, export.status);
    }
    if let (Some(phase), Some(err)) = (report.failed_phase, &report.error) {
        println!("failed during {phase:?}: {err}");
    }
}
