use std::sync::Arc;

use apkup_backend::{
    FetchError, HttpRequest, HttpResponse, HttpTransport, ReleaseDescriptor, ReleaseFetcher,
    SourceConnection, SourceKind, UpdateSource,
};
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::api::{ReleaseDto, RepositoryDto, TagDto};
use crate::scrape::{encode_segment, extract_apk_assets, extract_tag};

const GITHUB_JSON: &str = "application/vnd.github+json";

/// Base addresses of the REST API and of the public web pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubEndpoints {
    pub api_base: String,
    pub web_base: String,
}

impl Default for GithubEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            web_base: "https://github.com".to_string(),
        }
    }
}

struct Repository<'a> {
    owner: &'a str,
    repo: &'a str,
    token: Option<&'a str>,
}

/// Fetches releases through the REST API, falling back to the public pages
/// when the API is rate limited.
pub struct GithubFetcher {
    transport: Arc<dyn HttpTransport>,
    endpoints: GithubEndpoints,
}

fn is_rate_limited(status: u16) -> bool {
    matches!(status, 403 | 429)
}

impl GithubFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_endpoints(transport, GithubEndpoints::default())
    }

    pub fn with_endpoints(transport: Arc<dyn HttpTransport>, endpoints: GithubEndpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    fn repository(source: &UpdateSource) -> Result<Repository<'_>, FetchError> {
        let SourceConnection::Github { owner, repo, .. } = &source.connection else {
            return Err(FetchError::WrongSourceKind {
                id: source.id.clone(),
                expected: SourceKind::ApiWithToken,
            });
        };

        let (owner, repo) = (owner.trim(), repo.trim());
        if owner.is_empty() || repo.is_empty() {
            return Err(FetchError::InvalidSource {
                id: source.id.clone(),
                details: "owner and repository are required".to_string(),
            });
        }

        Ok(Repository {
            owner,
            repo,
            token: source.token(),
        })
    }

    async fn api_get(&self, path: &str, token: Option<&str>) -> Result<HttpResponse, FetchError> {
        let request = HttpRequest::get(format!("{}/{path}", self.endpoints.api_base))
            .with_bearer(token)
            .with_accept(GITHUB_JSON);
        self.transport.get(&request).await
    }

    async fn latest_from_tags(
        &self,
        repository: &Repository<'_>,
    ) -> Result<ReleaseDescriptor, FetchError> {
        let Repository { owner, repo, token } = repository;

        let metadata = self.api_get(&format!("repos/{owner}/{repo}"), *token).await?;
        if is_rate_limited(metadata.status) {
            return self.scrape_latest(repository).await;
        }
        if !metadata.is_success() {
            return Err(FetchError::http(
                "repository metadata",
                metadata.status,
                &metadata.text(),
            ));
        }
        let metadata: RepositoryDto = metadata
            .json()
            .map_err(|error| FetchError::network_parse_from("repository metadata", error))?;
        debug!(
            "{} has no formal release (default branch {})",
            metadata.full_name,
            metadata.default_branch.as_deref().unwrap_or("unknown")
        );

        let tags = self.api_get(&format!("repos/{owner}/{repo}/tags"), *token).await?;
        if is_rate_limited(tags.status) {
            return self.scrape_latest(repository).await;
        }
        if !tags.is_success() {
            return Err(FetchError::http("tag list", tags.status, &tags.text()));
        }
        let tags: Vec<TagDto> = tags
            .json()
            .map_err(|error| FetchError::network_parse_from("tag list", error))?;

        Ok(tags
            .into_iter()
            .next()
            .map_or_else(ReleaseDescriptor::no_release, |tag| {
                ReleaseDescriptor::tag_only(tag.name)
            }))
    }

    async fn scrape_latest(
        &self,
        repository: &Repository<'_>,
    ) -> Result<ReleaseDescriptor, FetchError> {
        let Repository { owner, repo, .. } = *repository;
        let web = &self.endpoints.web_base;
        info!("GitHub API rate limited for {owner}/{repo}, reading the public release page");

        let page = self
            .transport
            .get(&HttpRequest::get(format!("{web}/{owner}/{repo}/releases/latest")))
            .await
            .map_err(|error| FetchError::fallback_failed("release page", error.to_string()))?;

        if page.status == 404 {
            return Ok(ReleaseDescriptor::no_release());
        }
        if !page.is_success() {
            return Err(FetchError::fallback_failed(
                "release page",
                format!("HTTP {}", page.status),
            ));
        }

        let body = page.text();
        let tag = extract_tag(&page.final_url, &body, owner, repo)?.ok_or_else(|| {
            FetchError::fallback_failed("release page", "no release tag on the page")
        })?;

        let mut assets = extract_apk_assets(&body, web, owner, repo, &tag)?;
        if assets.is_empty() {
            debug!("No package links on the release page, loading expanded assets for {tag}");
            let expanded_url = format!(
                "{web}/{owner}/{repo}/releases/expanded_assets/{}",
                encode_segment(&tag)
            );
            let expanded = self
                .transport
                .get(&HttpRequest::get(expanded_url))
                .await
                .map_err(|error| {
                    FetchError::fallback_failed("expanded assets", error.to_string())
                })?;
            if !expanded.is_success() {
                return Err(FetchError::fallback_failed(
                    "expanded assets",
                    format!("HTTP {}", expanded.status),
                ));
            }
            assets = extract_apk_assets(&expanded.text(), web, owner, repo, &tag)?;
        }

        if assets.is_empty() {
            warn!("Release {tag} of {owner}/{repo} lists no package files");
        }

        Ok(ReleaseDescriptor {
            assets,
            ..ReleaseDescriptor::tag_only(tag)
        })
    }
}

#[async_trait]
impl ReleaseFetcher for GithubFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::ApiWithToken
    }

    async fn fetch_latest(&self, source: &UpdateSource) -> Result<ReleaseDescriptor, FetchError> {
        let repository = Self::repository(source)?;
        let Repository { owner, repo, token } = &repository;

        let response = self
            .api_get(&format!("repos/{owner}/{repo}/releases/latest"), *token)
            .await?;

        match response.status {
            status if (200..300).contains(&status) => {
                let release: ReleaseDto = response
                    .json()
                    .map_err(|error| FetchError::network_parse_from("latest release", error))?;
                Ok(release.into_descriptor())
            }
            404 => self.latest_from_tags(&repository).await,
            status if is_rate_limited(status) => self.scrape_latest(&repository).await,
            status => Err(FetchError::http("latest release", status, &response.text())),
        }
    }

    async fn test_connection(&self, source: &UpdateSource) -> Result<String, FetchError> {
        let Repository { owner, repo, token } = Self::repository(source)?;

        let response = self.api_get(&format!("repos/{owner}/{repo}"), token).await?;
        if is_rate_limited(response.status) {
            return Err(FetchError::RateLimited {
                operation: "repository metadata",
            });
        }
        if !response.is_success() {
            return Err(FetchError::http(
                "repository metadata",
                response.status,
                &response.text(),
            ));
        }

        let metadata: RepositoryDto = response
            .json()
            .map_err(|error| FetchError::network_parse_from("repository metadata", error))?;
        Ok(format!(
            "Connection OK: {} (default branch: {})",
            metadata.full_name,
            metadata.default_branch.as_deref().unwrap_or("unknown")
        ))
    }
}
