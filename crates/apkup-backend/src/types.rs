use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Size reported for assets whose host did not advertise one.
pub const UNKNOWN_SIZE: i64 = -1;

/// Tag carried by the placeholder release returned when nothing is published.
pub const NO_RELEASE_TAG: &str = "no-release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ApiWithToken,
    SelfHostedBackend,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiWithToken => write!(f, "github"),
            Self::SelfHostedBackend => write!(f, "backend"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConnection {
    Github {
        owner: String,
        repo: String,
        #[serde(default)]
        token: Option<String>,
    },
    Backend {
        base_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSource {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub connection: SourceConnection,
}

impl UpdateSource {
    #[must_use]
    pub fn github(
        id: impl Into<String>,
        display_name: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            connection: SourceConnection::Github {
                owner: owner.into(),
                repo: repo.into(),
                token: None,
            },
        }
    }

    #[must_use]
    pub fn backend(
        id: impl Into<String>,
        display_name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            connection: SourceConnection::Backend {
                base_url: base_url.into(),
            },
        }
    }

    #[must_use]
    pub fn with_token(mut self, value: impl Into<String>) -> Self {
        if let SourceConnection::Github { token, .. } = &mut self.connection {
            *token = Some(value.into());
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> SourceKind {
        match self.connection {
            SourceConnection::Github { .. } => SourceKind::ApiWithToken,
            SourceConnection::Backend { .. } => SourceKind::SelfHostedBackend,
        }
    }

    /// Bearer token for authenticated downloads, ignoring blank values.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match &self.connection {
            SourceConnection::Github { token, .. } => token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty()),
            SourceConnection::Backend { .. } => None,
        }
    }
}

/// Labels a self-hosted backend attaches to each published package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLabel {
    pub package_name: String,
    pub app_name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: u64,
    pub name: String,
    /// Advertised size in bytes, [`UNKNOWN_SIZE`] when the host gave none.
    pub size: i64,
    pub download_url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub app: Option<AppLabel>,
}

impl AssetDescriptor {
    #[must_use]
    pub fn new(
        id: u64,
        name: impl Into<String>,
        size: i64,
        download_url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            download_url: download_url.into(),
            sha256: None,
            app: None,
        }
    }

    #[must_use]
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub id: String,
    pub tag: String,
    pub name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<AssetDescriptor>,
}

impl ReleaseDescriptor {
    #[must_use]
    pub fn no_release() -> Self {
        Self {
            id: "0".to_string(),
            tag: NO_RELEASE_TAG.to_string(),
            name: Some(NO_RELEASE_TAG.to_string()),
            published_at: None,
            assets: Vec::new(),
        }
    }

    /// Release known only by its tag, as found when a repository has tags but
    /// no formal release.
    #[must_use]
    pub fn tag_only(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            id: "0".to_string(),
            name: Some(tag.clone()),
            tag,
            published_at: None,
            assets: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.tag == NO_RELEASE_TAG && self.assets.is_empty()
    }
}

/// Package identity read from an archive without installing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub package_name: String,
    pub version_code: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Install,
    Update,
    UpToDate,
}

impl UpdateAction {
    /// Decides what to do with an archive given what the device reports.
    #[must_use]
    pub fn decide(installed_version_code: Option<u64>, archive_version_code: Option<u64>) -> Self {
        match (installed_version_code, archive_version_code) {
            (None, _) | (Some(_), None) => Self::Install,
            (Some(installed), Some(archive)) if archive > installed => Self::Update,
            (Some(_), Some(_)) => Self::UpToDate,
        }
    }

    #[must_use]
    pub fn is_actionable(self) -> bool {
        matches!(self, Self::Install | Self::Update)
    }
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Update => write!(f, "update"),
            Self::UpToDate => write!(f, "up to date"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedCandidate {
    pub asset: AssetDescriptor,
    pub local_file: PathBuf,
    pub package_name: Option<String>,
    pub archive_version_code: Option<u64>,
    pub installed_version_code: Option<u64>,
    pub action: UpdateAction,
}

impl DownloadedCandidate {
    #[must_use]
    pub fn new(
        asset: AssetDescriptor,
        local_file: PathBuf,
        manifest: Option<ArchiveManifest>,
        installed_version_code: Option<u64>,
    ) -> Self {
        let (package_name, archive_version_code) = match manifest {
            Some(manifest) => (Some(manifest.package_name), Some(manifest.version_code)),
            None => (asset.app.as_ref().map(|app| app.package_name.clone()), None),
        };
        Self {
            asset,
            local_file,
            package_name,
            archive_version_code,
            installed_version_code,
            action: UpdateAction::decide(installed_version_code, archive_version_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub source_id: String,
    pub release: ReleaseDescriptor,
    pub candidates: Vec<DownloadedCandidate>,
    pub is_new_release: bool,
}

impl CheckResult {
    #[must_use]
    pub fn actionable(&self) -> Vec<&DownloadedCandidate> {
        self.candidates
            .iter()
            .filter(|candidate| candidate.action.is_actionable())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStatus {
    Success,
    Failure { message: Option<String> },
}

/// Outcome of a committed install session, delivered asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub session: SessionId,
    pub package_name: Option<String>,
    pub file_path: PathBuf,
    pub status: InstallStatus,
}

/// Context handed to the install backend when a session is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub package_hint: Option<String>,
    pub file_path: PathBuf,
}
