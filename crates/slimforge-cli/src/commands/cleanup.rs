use super::{json_pretty, load_profile, make_context, EXIT_CLEANUP_ERROR, EXIT_SUCCESS};
use slimforge_core::Pipeline;
use slimforge_runtime::CancelFlag;
use std::path::Path;

pub fn run(
    profile_path: &Path,
    backend: Option<&str>,
    shutdown: CancelFlag,
    json: bool,
) -> Result<u8, String> {
    let profile = load_profile(profile_path, backend)?;
    let ctx = make_context(&profile, shutdown)?;
    let report = Pipeline::new(ctx, profile).sweep_orphans();

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        if report.hives.is_empty() && report.mounts_released == 0 && report.errors.is_empty() {
            println!("nothing to clean up");
        }
        for hive in &report.hives {
            if hive.ok {
                println!("unloaded {}", hive.alias);
            } else {
                println!(
                    "could not unload {}: {}",
                    hive.alias,
                    hive.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        if report.mounts_released > 0 {
            println!("released {} mount(s)", report.mounts_released);
        }
        for err in &report.errors {
            println!("error: {err}");
        }
    }

    Ok(if report.is_clean() {
        EXIT_SUCCESS
    } else {
        EXIT_CLEANUP_ERROR
    })
}
