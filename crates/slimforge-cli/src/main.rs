mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_PROFILE_ERROR};
use slimforge_core::install_signal_handler;
use slimforge_runtime::CancelFlag;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "slimforge",
    version,
    about = "Crash-tolerant OS image customizer: mount, edit hives, commit, export"
)]
struct Cli {
    /// Backend to use instead of the one named in the profile (dism, mock).
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Mount the image, apply the profile, unload, and commit.
    Build {
        /// Path to the profile TOML file.
        #[arg(default_value = "slimforge.toml")]
        profile: PathBuf,
        /// Discard all changes instead of committing them.
        #[arg(long, default_value_t = false)]
        discard: bool,
        /// Skip the export step even when the profile defines one.
        #[arg(long, default_value_t = false)]
        no_export: bool,
    },
    /// Release hives and mounts left behind by an interrupted run.
    Cleanup {
        /// Path to the profile TOML file.
        #[arg(default_value = "slimforge.toml")]
        profile: PathBuf,
    },
    /// Show mount records and hive state for a profile.
    Status {
        /// Path to the profile TOML file.
        #[arg(default_value = "slimforge.toml")]
        profile: PathBuf,
    },
    /// Parse and validate a profile without touching the system.
    Validate {
        /// Path to the profile TOML file.
        #[arg(default_value = "slimforge.toml")]
        profile: PathBuf,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SLIMFORGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let shutdown = CancelFlag::new();
    install_signal_handler(shutdown.clone());

    let backend = cli.backend.as_deref();
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Build {
            profile,
            discard,
            no_export,
        } => commands::build::run(&profile, backend, discard, no_export, shutdown, json_output),
        Commands::Cleanup { profile } => {
            commands::cleanup::run(&profile, backend, shutdown, json_output)
        }
        Commands::Status { profile } => commands::status::run(&profile, backend, json_output),
        Commands::Validate { profile } => commands::validate::run(&profile, backend, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("profile error:") {
                EXIT_PROFILE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
