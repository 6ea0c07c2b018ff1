use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use apkup_backend::{CheckPreferences, UpdateSource};
use apkup_core::SourceRegistry;
use apkup_platform::AppPaths;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub selected_source_id: Option<String>,

    #[serde(default)]
    pub last_seen_tags: BTreeMap<String, String>,

    /// Extra sources appended to the built-in catalogue.
    #[serde(default)]
    pub custom_sources: Vec<UpdateSource>,

    /// API tokens keyed by source id, applied to GitHub sources only.
    #[serde(default)]
    pub source_tokens: BTreeMap<String, String>,

    #[serde(default)]
    pub adb_path: Option<PathBuf>,

    #[serde(default)]
    pub device_serial: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_watch_interval() -> u64 {
    60 * 60
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            selected_source_id: None,
            last_seen_tags: BTreeMap::new(),
            custom_sources: Vec::new(),
            source_tokens: BTreeMap::new(),
            adb_path: None,
            device_serial: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            watch_interval_secs: default_watch_interval(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    /// Reads `settings.json`, falling back to defaults when it is missing or
    /// unreadable.
    /// Reads `settings.json`; a missing file yields the defaults.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    /// Callers fall back to the defaults and report it once logging is up.
    pub fn load(paths: &AppPaths) -> Result<Self, AppError> {
        Self::load_from_path(&paths.settings_file())
    }

    fn load_from_path(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|error| AppError::settings("read", error))?;
        serde_json::from_str(&content).map_err(|error| AppError::settings("parse", error.into()))
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        paths.ensure_dirs()?;
        self.save_to_path(&paths.settings_file())
    }

    fn save_to_path(&self, path: &Path) -> Result<(), std::io::Error> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content)
    }

    /// Built-in and custom sources with their configured tokens applied.
    pub fn catalogue(&self) -> Vec<UpdateSource> {
        SourceRegistry::builtin_sources()
            .into_iter()
            .chain(self.custom_sources.iter().cloned())
            .map(|source| self.apply_token(source))
            .collect()
    }

    fn apply_token(&self, source: UpdateSource) -> UpdateSource {
        match self.source_tokens.get(&source.id) {
            Some(token) => source.with_token(token.clone()),
            None => source,
        }
    }
}

impl CheckPreferences for AppSettings {
    fn selected_source_id(&self) -> Option<String> {
        self.selected_source_id.clone()
    }

    fn last_seen_tag(&self, source_id: &str) -> Option<String> {
        self.last_seen_tags.get(source_id).cloned()
    }

    fn set_last_seen_tag(&mut self, source_id: &str, tag: &str) {
        self.last_seen_tags
            .insert(source_id.to_string(), tag.to_string());
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "settings path has no parent",
        )
    })?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("settings");
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                file.write_all(data)?;
                file.sync_all()?;
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "failed to create unique settings temp file",
        ));
    };

    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use apkup_backend::{CheckPreferences, UpdateSource};
    use apkup_platform::AppPaths;
    use serde_json::json;

    use super::AppSettings;
    use crate::error::AppError;

    #[test]
    fn defaults_match_expected_values() {
        let settings = AppSettings::default();

        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.read_timeout_secs, 30);
        assert_eq!(settings.watch_interval_secs, 3600);
        assert_eq!(settings.max_log_size_bytes, 5 * 1024 * 1024);
        assert!(!settings.debug_logging);
        assert!(settings.selected_source_id.is_none());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: AppSettings = serde_json::from_value(json!({
            "selected_source_id": "backend_main",
            "custom_sources": [
                {"id": "mirror", "display_name": "Mirror", "type": "backend", "base_url": "http://10.0.0.9:8088"}
            ]
        }))
        .expect("partial settings should deserialize");

        assert_eq!(settings.selected_source_id.as_deref(), Some("backend_main"));
        assert_eq!(settings.read_timeout_secs, 30);
        assert_eq!(
            settings.custom_sources,
            vec![UpdateSource::backend("mirror", "Mirror", "http://10.0.0.9:8088")]
        );
    }

    #[test]
    fn save_then_load_keeps_last_seen_tags() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());

        let mut settings = AppSettings::default();
        settings.set_last_seen_tag("github_cheatupdater", "v2.1.0");
        settings.save(&paths).expect("settings should be saved");

        let loaded = AppSettings::load(&paths).expect("settings should load");
        assert_eq!(
            loaded.last_seen_tag("github_cheatupdater").as_deref(),
            Some("v2.1.0")
        );

        let leftovers: Vec<_> = std::fs::read_dir(&paths.config_dir)
            .expect("config dir should be readable")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());

        assert_eq!(
            AppSettings::load(&paths).expect("missing settings should load"),
            AppSettings::default()
        );
    }

    #[test]
    fn corrupt_file_is_reported_to_the_caller() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());
        paths.ensure_dirs().expect("dirs should be created");
        std::fs::write(paths.settings_file(), "{not json").expect("settings should be written");

        let error = AppSettings::load(&paths).expect_err("corrupt settings should be reported");
        assert!(matches!(
            error,
            AppError::Settings {
                action: "parse",
                ..
            }
        ));
    }

    #[test]
    fn tokens_only_apply_to_matching_sources() {
        let mut settings = AppSettings::default();
        settings
            .source_tokens
            .insert("fork".to_string(), "ghp_secret".to_string());
        settings
            .custom_sources
            .push(UpdateSource::github("fork", "Fork", "someone", "fork"));
        settings
            .custom_sources
            .push(UpdateSource::github("other", "Other", "someone", "other"));

        let sources = settings.catalogue();
        let token_of = |id: &str| {
            sources
                .iter()
                .find(|source| source.id == id)
                .and_then(|source| source.token().map(str::to_string))
        };

        assert!(sources.len() > 2);
        assert_eq!(token_of("fork").as_deref(), Some("ghp_secret"));
        assert_eq!(token_of("other"), None);
    }
}
