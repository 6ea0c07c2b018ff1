use std::sync::Arc;

use apkup_backend::{
    AppLabel, AssetDescriptor, FetchError, HttpRequest, HttpTransport, ReleaseDescriptor,
    ReleaseFetcher, SourceConnection, SourceKind, UNKNOWN_SIZE, UpdateSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::{Host, Url};

use crate::dto::{CurrentReleaseDto, DebugDto};

const JSON: &str = "application/json";

const SOURCE_ID_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-').remove(b'.');

/// Reads the current release straight from a self-hosted backend.
pub struct SelfHostedFetcher {
    transport: Arc<dyn HttpTransport>,
}

/// Base URL of a backend source, always ending with `/`.
fn base_url(source: &UpdateSource) -> Result<String, FetchError> {
    let SourceConnection::Backend { base_url } = &source.connection else {
        return Err(FetchError::WrongSourceKind {
            id: source.id.clone(),
            expected: SourceKind::SelfHostedBackend,
        });
    };

    let trimmed = base_url.trim();
    if Url::parse(trimmed).is_err() {
        return Err(FetchError::InvalidSource {
            id: source.id.clone(),
            details: format!("invalid base URL {trimmed}"),
        });
    }

    if trimmed.ends_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/"))
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(address)) => address.is_loopback(),
        Some(Host::Ipv6(address)) => address.is_loopback(),
        None => false,
    }
}

/// Points loopback download links at the backend's scheme, host and port.
fn resolve_download_url(download_url: &str, base: &str) -> String {
    let (Ok(app_url), Ok(base)) = (Url::parse(download_url), Url::parse(base)) else {
        return download_url.to_string();
    };
    if !is_loopback(&app_url) {
        return download_url.to_string();
    }

    let mut rewritten = app_url;
    let moved = rewritten.set_scheme(base.scheme()).is_ok()
        && rewritten.set_host(base.host_str()).is_ok()
        && rewritten.set_port(base.port()).is_ok();
    if moved {
        debug!("Rewrote loopback download {download_url} to {rewritten}");
        rewritten.to_string()
    } else {
        download_url.to_string()
    }
}

fn parse_published_at(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(error) => {
            warn!("Ignoring unparseable publish date {value:?}: {error}");
            None
        }
    }
}

impl SelfHostedFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    fn into_descriptor(dto: CurrentReleaseDto, base: &str) -> ReleaseDescriptor {
        let assets = dto
            .apps
            .into_iter()
            .enumerate()
            .map(|(index, app)| AssetDescriptor {
                id: index as u64 + 1,
                size: app.size.unwrap_or(UNKNOWN_SIZE),
                download_url: resolve_download_url(&app.download_url, base),
                sha256: app.sha256.filter(|hash| !hash.trim().is_empty()),
                app: Some(AppLabel {
                    package_name: app.package_name,
                    app_name: app.app_name,
                    version: app.version,
                }),
                name: app.file_name,
            })
            .collect();

        ReleaseDescriptor {
            published_at: parse_published_at(dto.published_at.as_deref()),
            name: Some(dto.release_id.clone()),
            id: dto.release_id,
            tag: dto.tag,
            assets,
        }
    }
}

#[async_trait]
impl ReleaseFetcher for SelfHostedFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::SelfHostedBackend
    }

    async fn fetch_latest(&self, source: &UpdateSource) -> Result<ReleaseDescriptor, FetchError> {
        let base = base_url(source)?;
        let request = HttpRequest::get(format!("{base}mobile/current")).with_accept(JSON);
        let response = self.transport.get(&request).await?;

        if response.status == 404 {
            debug!("{} has no current release", source.id);
            return Ok(ReleaseDescriptor::no_release());
        }
        if !response.is_success() {
            return Err(FetchError::http(
                "current release",
                response.status,
                &response.text(),
            ));
        }

        let dto: CurrentReleaseDto = response
            .json()
            .map_err(|error| FetchError::network_parse_from("current release", error))?;
        Ok(Self::into_descriptor(dto, &base))
    }

    async fn test_connection(&self, source: &UpdateSource) -> Result<String, FetchError> {
        let base = base_url(source)?;
        let id = utf8_percent_encode(&source.id, SOURCE_ID_SEGMENT);
        let request =
            HttpRequest::get(format!("{base}mobile/debug/repository/{id}")).with_accept(JSON);
        let response = self.transport.get(&request).await?;

        if !response.is_success() {
            return Err(FetchError::http(
                "repository debug",
                response.status,
                &response.text(),
            ));
        }

        let dto: DebugDto = response
            .json()
            .map_err(|error| FetchError::network_parse_from("repository debug", error))?;
        Ok(dto.summary())
    }
}
