use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported profile_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("image.path must not be empty")]
    EmptyImagePath,
    #[error("image.mount_dir must not be empty")]
    EmptyMountDir,
    #[error("image.index must be at least 1")]
    InvalidIndex,
    #[error("invalid hive alias '{0}': use letters, digits, and '_' only")]
    InvalidAlias(String),
    #[error("hive '{alias}' has an empty file path")]
    EmptyHiveFile { alias: String },
    #[error("setting {index} references unknown hive '{store}'")]
    UnknownStore { index: usize, store: String },
    #[error("setting {index} has an empty key path")]
    EmptyKeyPath { index: usize },
    #[error("setting {index}: value does not fit type {value_type}: {reason}")]
    InvalidValue {
        index: usize,
        value_type: String,
        reason: String,
    },
    #[error("hook '{name}': {reason}")]
    InvalidHook { name: String, reason: String },
    #[error("runtime.cancel_key must be a single character, got '{0}'")]
    InvalidCancelKey(String),
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProfileV1 {
    pub profile_version: u32,
    pub image: ImageSection,
    #[serde(default)]
    pub hives: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub hooks: Vec<HookSection>,
    #[serde(default)]
    pub settings: Vec<SettingSection>,
    #[serde(default)]
    pub export: Option<ExportSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    pub path: String,
    #[serde(default = "default_index")]
    pub index: u32,
    pub mount_dir: String,
    #[serde(default = "default_sentinel")]
    pub sentinel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub strict_settings: bool,
    #[serde(default)]
    pub cancel_key: Option<String>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            settle_ms: default_settle_ms(),
            strict_settings: false,
            cancel_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_clear_attempts")]
    pub clear_attempts: u32,
    #[serde(default = "default_load_attempts")]
    pub load_attempts: u32,
    #[serde(default = "default_load_backoff_ms")]
    pub load_backoff_ms: u64,
    #[serde(default = "default_unload_attempts")]
    pub unload_attempts: u32,
    #[serde(default = "default_unload_backoff_ms")]
    pub unload_backoff_ms: u64,
    #[serde(default = "default_setting_attempts")]
    pub setting_attempts: u32,
    #[serde(default = "default_setting_backoff_ms")]
    pub setting_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            clear_attempts: default_clear_attempts(),
            load_attempts: default_load_attempts(),
            load_backoff_ms: default_load_backoff_ms(),
            unload_attempts: default_unload_attempts(),
            unload_backoff_ms: default_unload_backoff_ms(),
            setting_attempts: default_setting_attempts(),
            setting_backoff_ms: default_setting_backoff_ms(),
        }
    }
}

/// An external command run while the image is mounted.
///
/// `args` may reference `{mount}`, `{image}`, `{index}`, and `{profile_dir}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HookSection {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub after_settings: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExportSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Raw setting value as written in TOML; typed during normalization.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawValue {
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettingSection {
    pub store: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: crate::types::ValueType,
    pub value: RawValue,
    #[serde(default)]
    pub fallback_path: Option<String>,
}

fn default_index() -> u32 {
    1
}

fn default_sentinel() -> String {
    "Windows".to_owned()
}

fn default_backend() -> String {
    "dism".to_owned()
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    5
}

fn default_clear_attempts() -> u32 {
    5
}

fn default_load_attempts() -> u32 {
    3
}

fn default_load_backoff_ms() -> u64 {
    1000
}

fn default_unload_attempts() -> u32 {
    2
}

fn default_unload_backoff_ms() -> u64 {
    1000
}

fn default_setting_attempts() -> u32 {
    5
}

fn default_setting_backoff_ms() -> u64 {
    200
}

pub fn parse_profile_str(input: &str) -> Result<ProfileV1, ProfileError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_profile_file(path: impl AsRef<Path>) -> Result<ProfileV1, ProfileError> {
    let content = fs::read_to_string(path)?;
    parse_profile_str(&content)
}
