use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkup_backend::{AssetDescriptor, DownloadError, HttpRequest, HttpTransport};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

const TEMP_PREFIX: &str = ".apkup-";
const TEMP_SUFFIX: &str = ".part";

/// Folds a release tag into a directory name made of `[a-z0-9._-]`.
#[must_use]
pub fn sanitize_tag(tag: &str) -> String {
    let sanitized: String = tag
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    match sanitized.as_str() {
        "" | "." | ".." => "_".repeat(sanitized.len().max(1)),
        _ => sanitized,
    }
}

/// Keeps only the final path component of an asset name.
fn local_file_name(asset: &AssetDescriptor) -> String {
    Path::new(&asset.name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && !n.contains(".."))
        .map_or_else(|| format!("asset-{}.apk", asset.id), str::to_string)
}

/// File names for every asset of one release, in order. The first asset
/// keeps its plain name; later assets reducing to the same name are prefixed
/// with their id.
#[must_use]
pub(crate) fn local_file_names(assets: &[AssetDescriptor]) -> Vec<String> {
    let mut taken = HashSet::new();
    assets
        .iter()
        .map(|asset| {
            let plain = local_file_name(asset);
            let name = if taken.contains(&plain) {
                format!("asset-{}-{plain}", asset.id)
            } else {
                plain
            };
            taken.insert(name.clone());
            name
        })
        .collect()
}

/// Idempotent on-disk store of downloaded release assets.
pub struct AssetCache {
    transport: Arc<dyn HttpTransport>,
    root: PathBuf,
}

impl AssetCache {
    pub fn new(transport: Arc<dyn HttpTransport>, root: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            root: root.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn release_dir(&self, tag: &str) -> PathBuf {
        self.root.join(sanitize_tag(tag))
    }

    /// Make sure `asset` exists under `destination_dir`, downloading it only
    /// when no complete copy is present.
    ///
    /// # Errors
    /// Returns an error when the host answers with a non-success status or an
    /// empty body, the checksum does not match, or the file cannot be written.
    pub async fn ensure_local(
        &self,
        asset: &AssetDescriptor,
        destination_dir: &Path,
        bearer: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        self.ensure_local_as(asset, destination_dir, &local_file_name(asset), bearer)
            .await
    }

    /// Like [`Self::ensure_local`] but stores the asset under `file_name`.
    /// A check cycle picks one name per asset so colliding names never share
    /// a path.
    ///
    /// # Errors
    /// Same as [`Self::ensure_local`].
    pub async fn ensure_local_as(
        &self,
        asset: &AssetDescriptor,
        destination_dir: &Path,
        file_name: &str,
        bearer: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        let local_path = destination_dir.join(file_name);

        if is_complete(&local_path, asset.known_size()).await {
            debug!("Cache hit for {}", local_path.display());
            return Ok(local_path);
        }

        tokio::fs::create_dir_all(destination_dir)
            .await
            .map_err(|error| DownloadError::io(destination_dir, &error))?;

        let temp_path = create_temp_path(destination_dir).await?;

        info!("Downloading {} from {}", asset.name, asset.download_url);
        let request = HttpRequest::get(&asset.download_url).with_bearer(bearer);
        let response = self.transport.download(&request, &temp_path).await?;

        if !(200..300).contains(&response.status) {
            return Err(DownloadError::Status {
                file: asset.name.clone(),
                status: response.status,
            });
        }
        if response.bytes_written == 0 {
            return Err(DownloadError::EmptyBody {
                file: asset.name.clone(),
            });
        }
        if let Some(expected) = asset.known_size()
            && expected != response.bytes_written
        {
            warn!(
                "{} advertised {expected} bytes but {} were received",
                asset.name, response.bytes_written
            );
        }

        if let Some(expected) = asset.sha256.as_deref() {
            let actual = hash_file(temp_path.to_path_buf()).await?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(DownloadError::ChecksumMismatch {
                    file: asset.name.clone(),
                    expected: expected.trim().to_ascii_lowercase(),
                    actual,
                });
            }
            debug!("Checksum verified for {}", asset.name);
        }

        temp_path
            .persist(&local_path)
            .map_err(|error| DownloadError::io(&local_path, &error.error))?;

        Ok(local_path)
    }

    /// Removes temporary download files left behind by an interrupted run.
    pub fn purge_stale_temp_files(&self) -> usize {
        let Ok(release_dirs) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for release_dir in release_dirs.flatten() {
            let Ok(entries) = std::fs::read_dir(release_dir.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(TEMP_PREFIX)
                    && name.ends_with(TEMP_SUFFIX)
                    && std::fs::remove_file(entry.path()).is_ok()
                {
                    debug!("Removed stale download {}", entry.path().display());
                    removed += 1;
                }
            }
        }
        removed
    }
}

async fn is_complete(path: &Path, advertised_size: Option<u64>) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => {
            advertised_size.is_none_or(|size| metadata.len() == size)
        }
        _ => false,
    }
}

async fn create_temp_path(dir: &Path) -> Result<tempfile::TempPath, DownloadError> {
    let owned = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&owned)
            .map(tempfile::NamedTempFile::into_temp_path)
    })
    .await
    .map_err(|error| DownloadError::io(dir, &std::io::Error::other(error)))?
    .map_err(|error| DownloadError::io(dir, &error))
}

async fn hash_file(path: PathBuf) -> Result<String, DownloadError> {
    let display = path.clone();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|error| DownloadError::io(&display, &std::io::Error::other(error)))?
}

fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = std::fs::File::open(path).map_err(|error| DownloadError::io(path, &error))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| DownloadError::io(path, &error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apkup_backend::{AssetDescriptor, DownloadError, UNKNOWN_SIZE};

    use super::{AssetCache, local_file_names, sanitize_tag};
    use crate::testing::FakeTransport;

    const URL: &str = "https://example.invalid/v2/app.apk";

    fn asset(size: i64) -> AssetDescriptor {
        AssetDescriptor::new(1, "app.apk", size, URL)
    }

    fn temp_entries(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn sanitize_tag_folds_case_and_replaces_symbols() {
        assert_eq!(sanitize_tag("V1.2.0 Beta!"), "v1.2.0_beta_");
        assert_eq!(sanitize_tag("release/2024-01"), "release_2024-01");
        assert_eq!(sanitize_tag(".."), "__");
        assert_eq!(sanitize_tag(""), "_");
        assert!(
            sanitize_tag("Ünïcode tag")
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
        );
    }

    #[tokio::test]
    async fn existing_file_with_matching_size_skips_network() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(temp.path().join("app.apk"), [7_u8; 100]).expect("seed file");
        let transport = Arc::new(FakeTransport::new());
        let cache = AssetCache::new(transport.clone(), temp.path());

        let path = cache
            .ensure_local(&asset(100), temp.path(), None)
            .await
            .expect("cache hit should succeed");

        assert_eq!(path, temp.path().join("app.apk"));
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn existing_file_with_unknown_size_skips_network() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(temp.path().join("app.apk"), b"anything").expect("seed file");
        let transport = Arc::new(FakeTransport::new());
        let cache = AssetCache::new(transport.clone(), temp.path());

        cache
            .ensure_local(&asset(UNKNOWN_SIZE), temp.path(), None)
            .await
            .expect("cache hit should succeed");

        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn size_mismatch_redownloads_and_overwrites() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(temp.path().join("app.apk"), b"truncated").expect("seed file");
        let transport = Arc::new(FakeTransport::new().with_response(URL, 200, vec![1_u8; 100]));
        let cache = AssetCache::new(transport.clone(), temp.path());

        let path = cache
            .ensure_local(&asset(100), temp.path(), None)
            .await
            .expect("download should succeed");

        assert_eq!(transport.call_count(URL), 1);
        assert_eq!(std::fs::read(path).expect("file readable"), vec![1_u8; 100]);
        assert_eq!(temp_entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn failed_status_leaves_no_cache_entry() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let transport = Arc::new(FakeTransport::new().with_response(URL, 500, b"oops".to_vec()));
        let cache = AssetCache::new(transport, temp.path());

        let error = cache
            .ensure_local(&asset(100), temp.path(), None)
            .await
            .expect_err("500 should fail");

        assert!(matches!(error, DownloadError::Status { status: 500, .. }));
        assert!(!temp.path().join("app.apk").exists());
        assert_eq!(temp_entries(temp.path()), 0);
    }

    #[tokio::test]
    async fn empty_body_is_a_download_error() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let transport = Arc::new(FakeTransport::new().with_response(URL, 200, Vec::new()));
        let cache = AssetCache::new(transport, temp.path());

        let error = cache
            .ensure_local(&asset(UNKNOWN_SIZE), temp.path(), None)
            .await
            .expect_err("empty body should fail");

        assert!(matches!(error, DownloadError::EmptyBody { .. }));
        assert!(!temp.path().join("app.apk").exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let transport = Arc::new(FakeTransport::new().with_response(URL, 200, b"apkup".to_vec()));
        let cache = AssetCache::new(transport, temp.path());
        let mut asset = asset(UNKNOWN_SIZE);
        asset.sha256 = Some("0".repeat(64));

        let error = cache
            .ensure_local(&asset, temp.path(), None)
            .await
            .expect_err("checksum mismatch should fail");

        assert!(matches!(error, DownloadError::ChecksumMismatch { .. }));
        assert!(!temp.path().join("app.apk").exists());
    }

    #[tokio::test]
    async fn matching_checksum_is_accepted() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        use sha2::{Digest, Sha256};

        let transport = Arc::new(FakeTransport::new().with_response(URL, 200, b"apkup".to_vec()));
        let cache = AssetCache::new(transport, temp.path());
        let mut asset = asset(5);
        asset.sha256 = Some(format!("{:X}", Sha256::digest(b"apkup")));

        let path = cache
            .ensure_local(&asset, temp.path(), None)
            .await
            .expect("checksum should verify");

        assert_eq!(std::fs::read(path).expect("file readable"), b"apkup");
    }

    #[tokio::test]
    async fn unsafe_asset_names_stay_inside_destination() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let transport = Arc::new(FakeTransport::new().with_response(URL, 200, b"data".to_vec()));
        let cache = AssetCache::new(transport, temp.path());
        let asset = AssetDescriptor::new(9, "../../evil.apk", UNKNOWN_SIZE, URL);

        let path = cache
            .ensure_local(&asset, temp.path(), None)
            .await
            .expect("download should succeed");

        assert_eq!(path, temp.path().join("evil.apk"));
    }

    #[test]
    fn colliding_names_get_distinct_files() {
        let assets = vec![
            AssetDescriptor::new(1, "a/app.apk", UNKNOWN_SIZE, URL),
            AssetDescriptor::new(2, "b/app.apk", UNKNOWN_SIZE, URL),
            AssetDescriptor::new(3, "tool.apk", UNKNOWN_SIZE, URL),
        ];

        assert_eq!(
            local_file_names(&assets),
            vec!["app.apk", "asset-2-app.apk", "tool.apk"]
        );
    }

    #[tokio::test]
    async fn assets_sharing_a_name_are_stored_apart() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let first_url = "https://example.invalid/a/app.apk";
        let second_url = "https://example.invalid/b/app.apk";
        let transport = Arc::new(
            FakeTransport::new()
                .with_response(first_url, 200, b"first".to_vec())
                .with_response(second_url, 200, b"second".to_vec()),
        );
        let cache = AssetCache::new(transport, temp.path());
        let assets = vec![
            AssetDescriptor::new(1, "a/app.apk", UNKNOWN_SIZE, first_url),
            AssetDescriptor::new(2, "b/app.apk", UNKNOWN_SIZE, second_url),
        ];
        let names = local_file_names(&assets);

        let (first, second) = tokio::join!(
            cache.ensure_local_as(&assets[0], temp.path(), &names[0], None),
            cache.ensure_local_as(&assets[1], temp.path(), &names[1], None),
        );
        let first = first.expect("first download should succeed");
        let second = second.expect("second download should succeed");

        assert_ne!(first, second);
        assert_eq!(std::fs::read(first).expect("file readable"), b"first");
        assert_eq!(std::fs::read(second).expect("file readable"), b"second");
    }

    #[test]
    fn purge_removes_only_partial_downloads() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let release = temp.path().join("v1");
        std::fs::create_dir_all(&release).expect("release dir");
        std::fs::write(release.join(".apkup-abc.part"), b"partial").expect("seed partial");
        std::fs::write(release.join("app.apk"), b"complete").expect("seed complete");
        let cache = AssetCache::new(Arc::new(FakeTransport::new()), temp.path());

        assert_eq!(cache.purge_stale_temp_files(), 1);
        assert!(release.join("app.apk").exists());
        assert!(!release.join(".apkup-abc.part").exists());
    }
}
