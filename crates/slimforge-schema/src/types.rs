//! Typed records shared by the schema, runtime, and core crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

/// Alias under which a configuration store is loaded (e.g. `zSOFTWARE`).
///
/// Restricted to ASCII alphanumerics and `_` so it can be spliced into a
/// registry path without quoting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HiveAlias(String);

impl HiveAlias {
    /// Validate and wrap an alias. Returns `None` for empty or non-identifier input.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        Some(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for HiveAlias {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HiveAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for HiveAlias {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// An image file plus the index of the sub-image to attach.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: PathBuf,
    pub index: u32,
}

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>, index: u32) -> Self {
        Self {
            path: path.into(),
            index,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    ExpandString,
    Dword,
    Qword,
    MultiString,
    Binary,
}

impl ValueType {
    pub fn reg_name(self) -> &'static str {
        match self {
            ValueType::String => "REG_SZ",
            ValueType::ExpandString => "REG_EXPAND_SZ",
            ValueType::Dword => "REG_DWORD",
            ValueType::Qword => "REG_QWORD",
            ValueType::MultiString => "REG_MULTI_SZ",
            ValueType::Binary => "REG_BINARY",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reg_name())
    }
}

/// A fully typed value, validated during profile normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SettingValue {
    String(String),
    ExpandString(String),
    Dword(u32),
    Qword(u64),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
}

impl SettingValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            SettingValue::String(_) => ValueType::String,
            SettingValue::ExpandString(_) => ValueType::ExpandString,
            SettingValue::Dword(_) => ValueType::Dword,
            SettingValue::Qword(_) => ValueType::Qword,
            SettingValue::MultiString(_) => ValueType::MultiString,
            SettingValue::Binary(_) => ValueType::Binary,
        }
    }

    /// Render the value as `reg add /d` expects it.
    pub fn to_reg_data(&self) -> String {
        match self {
            SettingValue::String(s) | SettingValue::ExpandString(s) => s.clone(),
            SettingValue::Dword(v) => v.to_string(),
            SettingValue::Qword(v) => v.to_string(),
            SettingValue::MultiString(items) => items.join("\\0"),
            SettingValue::Binary(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

/// One key/value write against a loaded store.
///
/// `path` is a backslash-separated key path relative to the store root.
/// An empty `name` addresses the key's default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingRecord {
    pub store: HiveAlias,
    pub path: String,
    pub name: String,
    pub value: SettingValue,
    pub fallback_path: Option<String>,
}

impl SettingRecord {
    /// Key path segments, root first.
    pub fn segments(&self) -> Vec<&str> {
        split_key_path(&self.path)
    }

    pub fn display_name(&self) -> String {
        let name = if self.name.is_empty() {
            "(default)"
        } else {
            &self.name
        };
        format!("{}\\{}\\{}", self.store, self.path, name)
    }
}

/// Split a key path on `\` or `/`, dropping empty segments.
pub fn split_key_path(path: &str) -> Vec<&str> {
    path.split(['\\', '/'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
