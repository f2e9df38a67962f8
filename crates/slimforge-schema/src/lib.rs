//! Profile parsing, normalization, and typed configuration records for slimforge.
//!
//! This crate defines the schema layer: TOML profile parsing (`ProfileV1`),
//! the normalized representation consumed by the pipeline (`NormalizedProfile`),
//! and the typed setting records (`SettingRecord`, `SettingValue`) that the
//! setting applier writes into loaded hives.

pub mod normalize;
pub mod profile;
pub mod types;

pub use normalize::{clean_path, NormalizedHive, NormalizedHook, NormalizedProfile};
pub use profile::{
    parse_profile_file, parse_profile_str, ExportSection, HookSection, ImageSection,
    ProfileError, ProfileV1, RawValue, RetrySection, RuntimeSection, SettingSection, SupervisorSection,
};
pub use types::{split_key_path, HiveAlias, ImageRef, SettingRecord, SettingValue, ValueType};
