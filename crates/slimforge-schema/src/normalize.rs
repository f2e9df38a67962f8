use crate::profile::{
    HookSection, ProfileError, ProfileV1, RawValue, RetrySection, SettingSection,
    SupervisorSection,
};
use crate::types::{split_key_path, HiveAlias, ImageRef, SettingRecord, SettingValue, ValueType};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Validated profile with resolved paths and typed settings.
///
/// Relative paths are resolved against the profile's directory, hook
/// placeholders are substituted, and every setting value has been checked
/// against its declared type. This is the only input the pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedProfile {
    pub profile_version: u32,
    pub profile_dir: PathBuf,
    pub image: ImageRef,
    pub mount_dir: PathBuf,
    pub sentinel: String,
    pub hives: Vec<NormalizedHive>,
    pub backend: String,
    pub settle_ms: u64,
    pub strict_settings: bool,
    pub cancel_key: Option<char>,
    pub supervisor: SupervisorSection,
    pub retry: RetrySection,
    pub hooks: Vec<NormalizedHook>,
    pub settings: Vec<SettingRecord>,
    pub export: Option<NormalizedHook>,
}

/// A configuration store file (inside the mount) and the alias it loads under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedHive {
    pub alias: HiveAlias,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedHook {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub after_settings: bool,
}

impl ProfileV1 {
    /// Normalize the profile, resolving relative paths against `profile_dir`.
    pub fn normalize(&self, profile_dir: &Path) -> Result<NormalizedProfile, ProfileError> {
        let profile_dir = clean_path(profile_dir);
        let profile_dir = profile_dir.as_path();
        if self.profile_version != 1 {
            return Err(ProfileError::UnsupportedVersion(self.profile_version));
        }

        let image_path = self.image.path.trim();
        if image_path.is_empty() {
            return Err(ProfileError::EmptyImagePath);
        }
        let mount_dir = self.image.mount_dir.trim();
        if mount_dir.is_empty() {
            return Err(ProfileError::EmptyMountDir);
        }
        if self.image.index == 0 {
            return Err(ProfileError::InvalidIndex);
        }
        validate_nonzero(&self.supervisor, &self.retry)?;

        let image = ImageRef::new(resolve(profile_dir, image_path), self.image.index);
        let mount_dir = resolve(profile_dir, mount_dir);

        let mut hives = Vec::with_capacity(self.hives.len());
        for (alias, file) in &self.hives {
            let parsed =
                HiveAlias::parse(alias).ok_or_else(|| ProfileError::InvalidAlias(alias.clone()))?;
            let file = file.trim();
            if file.is_empty() {
                return Err(ProfileError::EmptyHiveFile {
                    alias: alias.clone(),
                });
            }
            hives.push(NormalizedHive {
                alias: parsed,
                file: mount_dir.join(file.trim_start_matches(['/', '\\'])),
            });
        }

        let placeholders = Placeholders {
            mount: mount_dir.to_string_lossy().into_owned(),
            image: image.path.to_string_lossy().into_owned(),
            index: image.index.to_string(),
            profile_dir: profile_dir.to_string_lossy().into_owned(),
        };

        let hooks = self
            .hooks
            .iter()
            .map(|h| normalize_hook(h, &placeholders))
            .collect::<Result<Vec<_>, _>>()?;

        let export = self
            .export
            .as_ref()
            .map(|e| {
                normalize_hook(
                    &HookSection {
                        name: "export".to_owned(),
                        program: e.program.clone(),
                        args: e.args.clone(),
                        timeout_secs: e.timeout_secs,
                        after_settings: false,
                    },
                    &placeholders,
                )
            })
            .transpose()?;

        let mut settings = Vec::with_capacity(self.settings.len());
        for (index, section) in self.settings.iter().enumerate() {
            settings.push(normalize_setting(index, section, &hives)?);
        }

        let cancel_key = match self.runtime.cancel_key.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(k) => {
                let mut chars = k.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c.to_ascii_lowercase()),
                    _ => return Err(ProfileError::InvalidCancelKey(k.to_owned())),
                }
            }
        };

        Ok(NormalizedProfile {
            profile_version: self.profile_version,
            profile_dir: profile_dir.to_path_buf(),
            image,
            mount_dir,
            sentinel: self.image.sentinel.trim().to_owned(),
            hives,
            backend: self.runtime.backend.trim().to_lowercase(),
            settle_ms: self.runtime.settle_ms,
            strict_settings: self.runtime.strict_settings,
            cancel_key,
            supervisor: self.supervisor.clone(),
            retry: self.retry.clone(),
            hooks,
            settings,
            export,
        })
    }
}

impl NormalizedProfile {
    pub fn hive(&self, alias: &str) -> Option<&NormalizedHive> {
        self.hives.iter().find(|h| h.alias == *alias)
    }

    /// Settings grouped by store, in hive declaration order.
    pub fn settings_for(&self, alias: &HiveAlias) -> Vec<SettingRecord> {
        self.settings
            .iter()
            .filter(|s| s.store == *alias)
            .cloned()
            .collect()
    }
}

fn validate_nonzero(supervisor: &SupervisorSection, retry: &RetrySection) -> Result<(), ProfileError> {
    let checks: [(&'static str, u64); 7] = [
        ("supervisor.poll_interval_ms", supervisor.poll_interval_ms),
        ("supervisor.heartbeat_secs", supervisor.heartbeat_secs),
        ("retry.clear_attempts", u64::from(retry.clear_attempts)),
        ("retry.load_attempts", u64::from(retry.load_attempts)),
        ("retry.unload_attempts", u64::from(retry.unload_attempts)),
        ("retry.setting_attempts", u64::from(retry.setting_attempts)),
        ("supervisor.timeout_secs", supervisor.timeout_secs.unwrap_or(1)),
    ];
    for (field, value) in checks {
        if value == 0 {
            return Err(ProfileError::ZeroValue { field });
        }
    }
    Ok(())
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        clean_path(p)
    } else {
        clean_path(&base.join(p))
    }
}

/// Lexically normalize `path`: drop `.` components and fold `..` into its
/// parent. The filesystem is not consulted, so symlinks are not resolved.
///
/// The mount registry reports canonical directories; a profile loaded as
/// `./slimforge.toml` must produce the same spelling.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

struct Placeholders {
    mount: String,
    image: String,
    index: String,
    profile_dir: String,
}

impl Placeholders {
    fn expand(&self, arg: &str) -> String {
        arg.replace("{mount}", &self.mount)
            .replace("{image}", &self.image)
            .replace("{index}", &self.index)
            .replace("{profile_dir}", &self.profile_dir)
    }
}

fn normalize_hook(hook: &HookSection, placeholders: &Placeholders) -> Result<NormalizedHook, ProfileError> {
    let name = hook.name.trim().to_owned();
    let invalid = |reason: &str| ProfileError::InvalidHook {
        name: hook.name.clone(),
        reason: reason.to_owned(),
    };
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    let program = hook.program.trim().to_owned();
    if program.is_empty() {
        return Err(invalid("program must not be empty"));
    }
    if hook.timeout_secs == Some(0) {
        return Err(invalid("timeout_secs must be greater than zero"));
    }

    let mut args = Vec::with_capacity(hook.args.len());
    for arg in &hook.args {
        let expanded = placeholders.expand(arg);
        if let Some(start) = expanded.find('{') {
            if expanded[start..].contains('}') {
                return Err(invalid(&format!("unknown placeholder in argument '{arg}'")));
            }
        }
        args.push(expanded);
    }

    Ok(NormalizedHook {
        name,
        program,
        args,
        timeout_secs: hook.timeout_secs,
        after_settings: hook.after_settings,
    })
}

fn normalize_setting(
    index: usize,
    section: &SettingSection,
    hives: &[NormalizedHive],
) -> Result<SettingRecord, ProfileError> {
    let store = hives
        .iter()
        .find(|h| h.alias == *section.store.trim())
        .map(|h| h.alias.clone())
        .ok_or_else(|| ProfileError::UnknownStore {
            index,
            store: section.store.clone(),
        })?;

    let path = canonical_key_path(&section.path).ok_or(ProfileError::EmptyKeyPath { index })?;
    let fallback_path = section
        .fallback_path
        .as_deref()
        .map(|p| canonical_key_path(p).ok_or(ProfileError::EmptyKeyPath { index }))
        .transpose()?;

    let value = typed_value(section.value_type, &section.value).map_err(|reason| {
        ProfileError::InvalidValue {
            index,
            value_type: section.value_type.to_string(),
            reason,
        }
    })?;

    Ok(SettingRecord {
        store,
        path,
        name: section.name.trim().to_owned(),
        value,
        fallback_path,
    })
}

fn canonical_key_path(raw: &str) -> Option<String> {
    let segments = split_key_path(raw);
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("\\"))
    }
}

fn typed_value(value_type: ValueType, raw: &RawValue) -> Result<SettingValue, String> {
    match (value_type, raw) {
        (ValueType::String, RawValue::Text(s)) => Ok(SettingValue::String(s.clone())),
        (ValueType::ExpandString, RawValue::Text(s)) => Ok(SettingValue::ExpandString(s.clone())),
        (ValueType::Dword, v) => {
            let n = integer_of(v)?;
            u32::try_from(n)
                .map(SettingValue::Dword)
                .map_err(|_| format!("{n} is out of range for a 32-bit value"))
        }
        (ValueType::Qword, v) => {
            let n = integer_of(v)?;
            u64::try_from(n)
                .map(SettingValue::Qword)
                .map_err(|_| format!("{n} is out of range for a 64-bit value"))
        }
        (ValueType::MultiString, RawValue::List(items)) => {
            Ok(SettingValue::MultiString(items.clone()))
        }
        (ValueType::MultiString, RawValue::Text(s)) => Ok(SettingValue::MultiString(vec![s.clone()])),
        (ValueType::Binary, RawValue::Text(hex)) => parse_hex(hex).map(SettingValue::Binary),
        (_, other) => Err(format!("unexpected value {other:?}")),
    }
}

fn integer_of(raw: &RawValue) -> Result<i128, String> {
    match raw {
        RawValue::Integer(n) => Ok(i128::from(*n)),
        RawValue::Text(s) => {
            let s = s.trim();
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                i128::from_str_radix(hex, 16)
            } else {
                s.parse::<i128>()
            };
            parsed.map_err(|e| format!("'{s}' is not an integer: {e}"))
        }
        RawValue::List(_) => Err("expected an integer, got a list".to_owned()),
    }
}

fn parse_hex(raw: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.len() % 2 != 0 {
        return Err("hex data must have an even number of digits".to_owned());
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|e| format!("invalid hex byte '{}': {e}", &cleaned[i..i + 2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::parse_profile_str;

    fn profile(extra: &str) -> ProfileV1 {
        parse_profile_str(&format!(
            r#"
profile_version = 1

[image]
path = "install.wim"
index = 2
mount_dir = "scratch"

[hives]
zSOFTWARE = "Windows/System32/config/SOFTWARE"
zSYSTEM = "Windows/System32/config/SYSTEM"
{extra}
"#
        ))
        .unwrap()
    }

    #[test]
    fn resolves_paths_against_profile_dir() {
        let n = profile("").normalize(Path::new("/work")).unwrap();
        assert_eq!(n.image.path, PathBuf::from("/work/install.wim"));
        assert_eq!(n.image.index, 2);
        assert_eq!(n.mount_dir, PathBuf::from("/work/scratch"));
        assert_eq!(
            n.hive("zSYSTEM").unwrap().file,
            PathBuf::from("/work/scratch/Windows/System32/config/SYSTEM")
        );
        assert_eq!(n.backend, "dism");
    }

    #[test]
    fn dot_components_are_folded_out_of_resolved_paths() {
        let n = profile("").normalize(Path::new("/work/./profiles/..")).unwrap();
        assert_eq!(n.profile_dir, PathBuf::from("/work"));
        assert_eq!(n.image.path, PathBuf::from("/work/install.wim"));
        assert_eq!(n.mount_dir, PathBuf::from("/work/scratch"));
    }

    #[test]
    fn clean_path_keeps_leading_parents_of_relative_paths() {
        assert_eq!(clean_path(Path::new("./a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new("/../a/./b/")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("./.")), PathBuf::from("."));
    }

    #[test]
    fn expands_hook_placeholders() {
        let n = profile(
            r#"
[[hooks]]
name = "cleanup"
program = "dism"
args = ["/Image:{mount}", "/Index:{index}"]
"#,
        )
        .normalize(Path::new("/work"))
        .unwrap();
        assert_eq!(n.hooks[0].args, vec!["/Image:/work/scratch", "/Index:2"]);
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = profile(
            r#"
[[hooks]]
name = "bad"
program = "dism"
args = ["{scratch}"]
"#,
        )
        .normalize(Path::new("/work"))
        .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidHook { .. }));
    }

    #[test]
    fn types_setting_values() {
        let n = profile(
            r#"
[[settings]]
store = "zSOFTWARE"
path = 'Policies\Microsoft\Windows\DataCollection'
name = "AllowTelemetry"
type = "dword"
value = "0x10"

[[settings]]
store = "zSYSTEM"
path = "Setup/LabConfig"
name = "BypassTPMCheck"
type = "qword"
value = 1

[[settings]]
store = "zSOFTWARE"
path = "Blob"
name = "Data"
type = "binary"
value = "0a ff 01"
"#,
        )
        .normalize(Path::new("/work"))
        .unwrap();
        assert_eq!(n.settings[0].value, SettingValue::Dword(16));
        assert_eq!(n.settings[0].path, "Policies\\Microsoft\\Windows\\DataCollection");
        assert_eq!(n.settings[1].path, "Setup\\LabConfig");
        assert_eq!(n.settings[1].value, SettingValue::Qword(1));
        assert_eq!(n.settings[2].value, SettingValue::Binary(vec![0x0a, 0xff, 0x01]));
        assert_eq!(n.settings_for(&HiveAlias::parse("zSOFTWARE").unwrap()).len(), 2);
    }

    #[test]
    fn rejects_out_of_range_dword() {
        let err = profile(
            r#"
[[settings]]
store = "zSOFTWARE"
path = "A"
name = "B"
type = "dword"
value = -1
"#,
        )
        .normalize(Path::new("/work"))
        .unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_setting_for_undeclared_store() {
        let err = profile(
            r#"
[[settings]]
store = "zDEFAULT"
path = "A"
type = "string"
value = "x"
"#,
        )
        .normalize(Path::new("/work"))
        .unwrap_err();
        assert!(matches!(err, ProfileError::UnknownStore { index: 0, .. }));
    }

    #[test]
    fn rejects_bad_alias_and_version() {
        let mut p = profile("");
        p.hives.insert("HKLM\\bad".to_owned(), "x".to_owned());
        assert!(matches!(
            p.normalize(Path::new("/w")),
            Err(ProfileError::InvalidAlias(_))
        ));

        let mut p = profile("");
        p.profile_version = 2;
        assert!(matches!(
            p.normalize(Path::new("/w")),
            Err(ProfileError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn cancel_key_must_be_single_char() {
        let mut p = profile("");
        p.runtime.cancel_key = Some("S".to_owned());
        assert_eq!(p.normalize(Path::new("/w")).unwrap().cancel_key, Some('s'));
        p.runtime.cancel_key = Some("skip".to_owned());
        assert!(p.normalize(Path::new("/w")).is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut p = profile("");
        p.retry.load_attempts = 0;
        assert!(matches!(
            p.normalize(Path::new("/w")),
            Err(ProfileError::ZeroValue {
                field: "retry.load_attempts"
            })
        ));
    }
}
