use std::collections::HashSet;

use apkup_backend::UpdateSource;
use thiserror::Error;

pub const DEFAULT_SOURCE_ID: &str = "github_cheatupdater";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A source registry needs at least one source")]
    Empty,

    #[error("Source id {0} is registered twice")]
    DuplicateId(String),

    #[error("Default source {0} is not registered")]
    UnknownDefault(String),
}

/// Fixed catalogue of update sources with one designated default.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<UpdateSource>,
    default_id: String,
}

impl SourceRegistry {
    /// Build a registry, checking ids are unique and the default exists.
    ///
    /// # Errors
    /// Returns an error when `sources` is empty, contains a duplicate id, or
    /// does not contain `default_id`.
    pub fn new(
        sources: Vec<UpdateSource>,
        default_id: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let default_id = default_id.into();
        if sources.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.id.as_str()) {
                return Err(RegistryError::DuplicateId(source.id.clone()));
            }
        }
        if !seen.contains(default_id.as_str()) {
            return Err(RegistryError::UnknownDefault(default_id));
        }

        Ok(Self {
            sources,
            default_id,
        })
    }

    /// The sources shipped with the application.
    #[must_use]
    pub fn builtin_sources() -> Vec<UpdateSource> {
        vec![
            UpdateSource::github(
                DEFAULT_SOURCE_ID,
                "GitHub CheatUpdater releases",
                "Raph563",
                "CheatUpdater",
            ),
            UpdateSource::backend(
                "backend_main",
                "Self-hosted backend (this machine)",
                "http://127.0.0.1:8088/",
            ),
            UpdateSource::backend(
                "backend_lan",
                "Self-hosted backend (LAN)",
                "http://192.168.0.56:8088/",
            ),
            UpdateSource::github(
                "github_debug",
                "GitHub debug repository",
                "inotia00",
                "rvx-builder",
            ),
        ]
    }

    /// Built-in sources followed by `extra` ones, which must use new ids.
    ///
    /// # Errors
    /// Returns an error when an extra source reuses an existing id.
    pub fn with_builtin(extra: Vec<UpdateSource>) -> Result<Self, RegistryError> {
        let mut sources = Self::builtin_sources();
        sources.extend(extra);
        Self::new(sources, DEFAULT_SOURCE_ID)
    }

    #[must_use]
    pub fn all(&self) -> &[UpdateSource] {
        &self.sources
    }

    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&UpdateSource> {
        self.sources.iter().find(|source| source.id == id)
    }

    #[must_use]
    pub fn default_source(&self) -> &UpdateSource {
        self.find_by_id(&self.default_id)
            .unwrap_or(&self.sources[0])
    }

    /// The source for `selected`, or the default when it is missing or unknown.
    #[must_use]
    pub fn resolve(&self, selected: Option<&str>) -> &UpdateSource {
        selected
            .and_then(|id| self.find_by_id(id))
            .unwrap_or_else(|| self.default_source())
    }
}
