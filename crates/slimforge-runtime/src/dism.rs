//! Command-driven backend: `dism` for images, `reg` for hives, and
//! `takeown`/`icacls`/`robocopy` for stubborn mount directories.

use crate::backend::{DetachMode, MountRecord, MountStatus, SystemBackend};
use crate::cancel::{CancellationToken, NeverCancel};
use crate::command::CommandSpec;
use crate::supervisor::{Outcome, ProcessSupervisor, SupervisedRun};
use crate::RuntimeError;
use slimforge_schema::{HiveAlias, ImageRef, SettingValue};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const ADMINISTRATORS_SID: &str = "*S-1-5-32-544";
const RELEASE_PAUSE: Duration = Duration::from_millis(250);

pub struct DismBackend {
    supervisor: ProcessSupervisor,
}

impl DismBackend {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }

    fn dism() -> CommandSpec {
        CommandSpec::new("dism").arg("/English")
    }

    fn hive_key(alias: &HiveAlias, path: &str) -> String {
        if path.is_empty() {
            format!("HKLM\\{alias}")
        } else {
            format!("HKLM\\{alias}\\{path}")
        }
    }

    /// Run without a wall-clock limit. Image mount and commit must never
    /// be killed halfway; the heartbeat still reports progress.
    fn exec(&self, spec: &CommandSpec) -> Result<SupervisedRun, RuntimeError> {
        self.exec_with(spec, |code| code == 0)
    }

    fn exec_with(
        &self,
        spec: &CommandSpec,
        ok: impl Fn(i32) -> bool,
    ) -> Result<SupervisedRun, RuntimeError> {
        let run = self.supervisor.with_timeout(None).run(spec, &NeverCancel)?;
        match run.outcome {
            Outcome::Completed { code } if !ok(code) => {
                Err(classify_failure(spec.program(), code, &run.diagnostic()))
            }
            _ => run.into_success_with(ok),
        }
    }
}

impl SystemBackend for DismBackend {
    fn name(&self) -> &str {
        "dism"
    }

    fn available(&self) -> bool {
        crate::prereq::check_dism_prereqs().is_empty()
    }

    fn list_mounts(&self) -> Result<Vec<MountRecord>, RuntimeError> {
        let run = self.exec(&Self::dism().arg("/Get-MountedImageInfo"))?;
        let records = parse_mounted_images(&run.stdout);
        debug!("mount registry lists {} image(s)", records.len());
        Ok(records)
    }

    fn mount_image(&self, image: &ImageRef, mount_dir: &Path) -> Result<(), RuntimeError> {
        info!("mounting {image} at {}", mount_dir.display());
        self.exec(&Self::dism().args([
            "/Mount-Image".to_owned(),
            format!("/ImageFile:{}", image.path.display()),
            format!("/Index:{}", image.index),
            format!("/MountDir:{}", mount_dir.display()),
        ]))?;
        Ok(())
    }

    fn unmount_image(&self, mount_dir: &Path, mode: DetachMode) -> Result<(), RuntimeError> {
        let flag = match mode {
            DetachMode::Commit => "/Commit",
            DetachMode::Discard => "/Discard",
        };
        info!("unmounting {} ({mode})", mount_dir.display());
        self.exec(&Self::dism().args([
            "/Unmount-Image".to_owned(),
            format!("/MountDir:{}", mount_dir.display()),
            flag.to_owned(),
        ]))?;
        Ok(())
    }

    fn cleanup_mountpoints(&self, cancel: &dyn CancellationToken) -> Result<Outcome, RuntimeError> {
        let spec = Self::dism().arg("/Cleanup-Mountpoints");
        let run = self.supervisor.run(&spec, cancel)?;
        match run.outcome {
            Outcome::Completed { code } if code != 0 => {
                Err(classify_failure(spec.program(), code, &run.diagnostic()))
            }
            outcome => Ok(outcome),
        }
    }

    fn take_ownership(&self, path: &Path) -> Result<(), RuntimeError> {
        let target = path.display().to_string();
        let recursive = path.is_dir();
        debug!("taking ownership of {target}");

        let mut takeown = CommandSpec::new("takeown").args(["/F", target.as_str()]);
        if recursive {
            takeown = takeown.args(["/R", "/D", "Y"]);
        }
        self.exec(&takeown)?;

        let mut icacls = CommandSpec::new("icacls")
            .arg(target.as_str())
            .arg("/grant")
            .arg(format!("{ADMINISTRATORS_SID}:F"));
        if recursive {
            icacls = icacls.arg("/T");
        }
        self.exec(&icacls.arg("/C"))?;
        Ok(())
    }

    fn mirror_empty(&self, empty: &Path, target: &Path) -> Result<(), RuntimeError> {
        // robocopy reports success with any exit code below 8.
        self.exec_with(
            &CommandSpec::new("robocopy")
                .arg(empty.display().to_string())
                .arg(target.display().to_string())
                .args(["/MIR", "/R:1", "/W:1", "/NFL", "/NDL", "/NJH", "/NJS"]),
            |code| (0..8).contains(&code),
        )?;
        Ok(())
    }

    fn is_hive_loaded(&self, alias: &HiveAlias) -> Result<bool, RuntimeError> {
        let spec = CommandSpec::new("reg").args(["query".to_owned(), Self::hive_key(alias, "")]);
        let run = self.supervisor.with_timeout(None).run(&spec, &NeverCancel)?;
        match run.outcome {
            Outcome::Completed { code: 0 } => Ok(true),
            Outcome::Completed { code: 1 } => Ok(false),
            Outcome::Completed { code } => Err(classify_failure("reg", code, &run.diagnostic())),
            outcome => Err(RuntimeError::CommandInterrupted {
                program: "reg".to_owned(),
                outcome,
            }),
        }
    }

    fn load_hive(&self, alias: &HiveAlias, file: &Path) -> Result<(), RuntimeError> {
        self.exec(&CommandSpec::new("reg").args([
            "load".to_owned(),
            Self::hive_key(alias, ""),
            file.display().to_string(),
        ]))?;
        Ok(())
    }

    fn unload_hive(&self, alias: &HiveAlias) -> Result<(), RuntimeError> {
        self.exec(&CommandSpec::new("reg").args(["unload".to_owned(), Self::hive_key(alias, "")]))?;
        Ok(())
    }

    fn release_references(&self) {
        debug!("pausing {}ms for open hive handles to drain", RELEASE_PAUSE.as_millis());
        std::thread::sleep(RELEASE_PAUSE);
    }

    fn create_key(&self, alias: &HiveAlias, path: &str) -> Result<(), RuntimeError> {
        self.exec(&CommandSpec::new("reg").args([
            "add".to_owned(),
            Self::hive_key(alias, path),
            "/f".to_owned(),
        ]))?;
        Ok(())
    }

    fn set_value(
        &self,
        alias: &HiveAlias,
        path: &str,
        name: &str,
        value: &SettingValue,
    ) -> Result<(), RuntimeError> {
        let mut spec = CommandSpec::new("reg").args(["add".to_owned(), Self::hive_key(alias, path)]);
        spec = if name.is_empty() {
            spec.arg("/ve")
        } else {
            spec.args(["/v", name])
        };
        self.exec(&spec.args([
            "/t".to_owned(),
            value.value_type().reg_name().to_owned(),
            "/d".to_owned(),
            value.to_reg_data(),
            "/f".to_owned(),
        ]))?;
        Ok(())
    }
}

/// Map a failed tool invocation onto the error taxonomy using its exit code
/// and diagnostic text.
pub fn classify_failure(program: &str, code: i32, diagnostic: &str) -> RuntimeError {
    let lower = diagnostic.to_lowercase();
    let context = format!("{program}: {diagnostic}");
    if lower.contains("access is denied")
        || lower.contains("access denied")
        || lower.contains("0x80070005")
        || lower.contains("requires elevation")
    {
        RuntimeError::PermissionDenied(context)
    } else if lower.contains("being used by another process")
        || lower.contains("sharing violation")
        || lower.contains("0x80070020")
        || lower.contains("already mounted")
        || lower.contains("0x800700aa")
        || lower.contains("0xc1420127")
    {
        RuntimeError::ResourceBusy(context)
    } else if lower.contains("corrupt") || lower.contains("0x800703f1") {
        RuntimeError::StoreCorrupt(context)
    } else if lower.contains("cannot find")
        || lower.contains("unable to find")
        || lower.contains("0x80070002")
        || lower.contains("0x80070003")
    {
        RuntimeError::NotFound(context)
    } else {
        RuntimeError::CommandFailed {
            program: program.to_owned(),
            code,
            diagnostic: diagnostic.to_owned(),
        }
    }
}

/// Parse `dism /Get-MountedImageInfo` output.
///
/// Each record starts at a `Mount Dir :` line; unknown keys are ignored.
/// Incomplete records (no image file) are dropped.
pub fn parse_mounted_images(output: &str) -> Vec<MountRecord> {
    #[derive(Default)]
    struct Partial {
        mount_dir: Option<PathBuf>,
        image: Option<PathBuf>,
        index: u32,
        read_write: bool,
        status: Option<MountStatus>,
    }

    fn finish(p: Partial, out: &mut Vec<MountRecord>) {
        if let (Some(mount_dir), Some(image)) = (p.mount_dir, p.image) {
            out.push(MountRecord {
                image,
                index: p.index,
                mount_dir,
                status: p.status.unwrap_or(MountStatus::Invalid),
                read_write: p.read_write,
            });
        }
    }

    let mut records = Vec::new();
    let mut current: Option<Partial> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(" : ") else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        match key.as_str() {
            "mount dir" => {
                if let Some(done) = current.take() {
                    finish(done, &mut records);
                }
                current = Some(Partial {
                    mount_dir: Some(PathBuf::from(value)),
                    ..Partial::default()
                });
            }
            "image file" => {
                if let Some(p) = current.as_mut() {
                    let cleaned = value.strip_prefix("\\\\?\\").unwrap_or(value);
                    p.image = Some(PathBuf::from(cleaned));
                }
            }
            "image index" => {
                if let Some(p) = current.as_mut() {
                    p.index = value.parse().unwrap_or(0);
                }
            }
            "mounted read/write" => {
                if let Some(p) = current.as_mut() {
                    p.read_write = value.eq_ignore_ascii_case("yes");
                }
            }
            "status" => {
                if let Some(p) = current.as_mut() {
                    p.status = Some(match value.to_lowercase().as_str() {
                        "ok" => MountStatus::Ok,
                        "needs remount" | "remount" => MountStatus::NeedsRemount,
                        _ => MountStatus::Invalid,
                    });
                }
            }
            _ => {}
        }
    }
    if let Some(done) = current.take() {
        finish(done, &mut records);
    }
    records
}
