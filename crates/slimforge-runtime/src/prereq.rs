use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    let locator = if cfg!(windows) { "where" } else { "which" };
    Command::new(locator)
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

const DISM_TOOLS: &[(&str, &str, &str)] = &[
    (
        "dism",
        "mounting, committing, and discarding install images",
        "part of Windows; or the Windows ADK Deployment Tools",
    ),
    (
        "reg",
        "loading, editing, and unloading offline registry hives",
        "part of Windows (System32)",
    ),
    (
        "takeown",
        "reclaiming ownership of locked mount directories and hive files",
        "part of Windows (System32)",
    ),
    (
        "icacls",
        "granting Administrators access after takeown",
        "part of Windows (System32)",
    ),
    (
        "robocopy",
        "emptying stubborn mount directories by mirroring an empty one",
        "part of Windows (System32)",
    ),
];

/// Check all prerequisites for the dism backend.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_dism_prereqs() -> Vec<MissingPrereq> {
    DISM_TOOLS
        .iter()
        .filter(|(name, _, _)| !command_exists(name))
        .map(|&(name, purpose, install_hint)| MissingPrereq {
            name,
            purpose,
            install_hint,
        })
        .collect()
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nslimforge needs these tools (run from an elevated prompt) to service offline images.");
    msg
}
