use slimforge_runtime::{CancelFlag, CancellationToken};

/// First Ctrl-C sets `shutdown`; the pipeline stops processing and goes
/// straight to cleanup. A second Ctrl-C exits without cleaning up.
pub fn install_signal_handler(shutdown: CancelFlag) {
    let _ = ctrlc::set_handler(move || {
        if shutdown.is_cancelled() {
            std::process::exit(1);
        }
        shutdown.cancel();
        eprintln!("\nshutdown requested, cleaning up (press Ctrl-C again to abort)...");
    });
}
