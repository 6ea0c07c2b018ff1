use apkup_backend::{AssetDescriptor, ReleaseDescriptor};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ReleaseDto {
    pub id: u64,
    pub tag_name: String,
    pub name: Option<String>,
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<AssetDto>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssetDto {
    pub id: u64,
    pub name: String,
    pub size: i64,
    pub browser_download_url: String,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryDto {
    pub full_name: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagDto {
    pub name: String,
}

impl ReleaseDto {
    /// Keeps only package assets, in the order the API listed them.
    pub(crate) fn into_descriptor(self) -> ReleaseDescriptor {
        let assets = self
            .assets
            .into_iter()
            .filter(|asset| is_package_file(&asset.name))
            .map(|asset| AssetDescriptor {
                sha256: asset.digest.as_deref().and_then(parse_sha256_digest),
                ..AssetDescriptor::new(asset.id, asset.name, asset.size, asset.browser_download_url)
            })
            .collect();

        ReleaseDescriptor {
            id: self.id.to_string(),
            tag: self.tag_name,
            name: self.name,
            published_at: self
                .published_at
                .as_deref()
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc)),
            assets,
        }
    }
}

pub(crate) fn is_package_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".apk")
}

fn parse_sha256_digest(digest: &str) -> Option<String> {
    let (algorithm, hash) = digest.split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return None;
    }
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}
