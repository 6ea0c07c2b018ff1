use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::{DownloadError, FetchError, InstallError, PackageQueryError};
use crate::types::{
    InstallReport, InstallTarget, ReleaseDescriptor, SessionId, SourceKind, UpdateSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub bearer: Option<String>,
    pub accept: Option<&'static str>,
}

impl HttpRequest {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer: None,
            accept: None,
        }
    }

    #[must_use]
    pub fn with_bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_accept(mut self, accept: &'static str) -> Self {
        self.accept = Some(accept);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// URL after redirects were followed.
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    /// Returns the parse error when the body is not the expected document.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResponse {
    pub status: u16,
    pub bytes_written: u64,
}

/// Minimal HTTP surface the fetchers and the asset cache need.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;

    /// Streams the response body into `dest`, truncating it first. Nothing is
    /// written for non-success statuses.
    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadResponse, DownloadError>;
}

#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_latest(&self, source: &UpdateSource) -> Result<ReleaseDescriptor, FetchError>;

    /// Human-readable summary of whether the source is reachable.
    async fn test_connection(&self, source: &UpdateSource) -> Result<String, FetchError>;
}

#[async_trait]
pub trait PackageQuery: Send + Sync {
    async fn installed_version_code(&self, package: &str)
    -> Result<Option<u64>, PackageQueryError>;

    async fn is_installed(&self, package: &str) -> Result<bool, PackageQueryError> {
        Ok(self.installed_version_code(package).await?.is_some())
    }
}

pub type InstallResultSender = mpsc::UnboundedSender<InstallReport>;

#[async_trait]
pub trait InstallBackend: Send + Sync {
    async fn create_session(
        &self,
        size: u64,
        package_hint: Option<&str>,
    ) -> Result<SessionId, InstallError>;

    async fn write_session(
        &self,
        session: SessionId,
        file: &Path,
        size: u64,
    ) -> Result<(), InstallError>;

    /// Commits the session. The outcome is delivered through `results` once
    /// the platform reports it.
    async fn commit_session(
        &self,
        session: SessionId,
        target: InstallTarget,
        results: InstallResultSender,
    ) -> Result<(), InstallError>;

    async fn abandon_session(&self, session: SessionId);

    async fn request_uninstall(&self, package: &str) -> Result<(), InstallError>;
}

/// Caller-owned storage for the selected source and last-seen tags.
pub trait CheckPreferences {
    fn selected_source_id(&self) -> Option<String>;

    fn last_seen_tag(&self, source_id: &str) -> Option<String>;

    fn set_last_seen_tag(&mut self, source_id: &str, tag: &str);
}
