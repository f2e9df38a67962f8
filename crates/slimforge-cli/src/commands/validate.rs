use super::{json_pretty, load_profile, EXIT_SUCCESS};
use serde::Serialize;
use slimforge_schema::NormalizedProfile;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ProfileSummary<'a> {
    valid: bool,
    image: String,
    mount_dir: String,
    backend: &'a str,
    hives: Vec<String>,
    hooks: Vec<&'a str>,
    settings: usize,
    export: bool,
}

impl<'a> ProfileSummary<'a> {
    fn from_profile(profile: &'a NormalizedProfile) -> Self {
        Self {
            valid: true,
            image: profile.image.to_string(),
            mount_dir: profile.mount_dir.display().to_string(),
            backend: &profile.backend,
            hives: profile.hives.iter().map(|h| h.alias.to_string()).collect(),
            hooks: profile.hooks.iter().map(|h| h.name.as_str()).collect(),
            settings: profile.settings.len(),
            export: profile.export.is_some(),
        }
    }
}

pub fn run(profile_path: &Path, backend: Option<&str>, json: bool) -> Result<u8, String> {
    let profile = load_profile(profile_path, backend)?;
    let summary = ProfileSummary::from_profile(&profile);

    if json {
        println!("{}", json_pretty(&summary)?);
    } else {
        println!("profile is valid");
        println!("image:     {}", summary.image);
        println!("mount dir: {}", summary.mount_dir);
        println!("backend:   {}", summary.backend);
        println!("hives:     {}", summary.hives.join(", "));
        println!("hooks:     {}", summary.hooks.len());
        println!("settings:  {}", summary.settings);
        println!("export:    {}", if summary.export { "yes" } else { "no" });
    }
    Ok(EXIT_SUCCESS)
}
