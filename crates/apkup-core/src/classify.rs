use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkup_backend::{
    ArchiveManifest, AssetDescriptor, DownloadedCandidate, PackageQuery, PackageQueryError,
};
use log::{debug, warn};

use crate::manifest::read_archive_manifest;

/// Decides whether a downloaded archive is an install, an update or already
/// present on the device.
pub struct CandidateClassifier {
    packages: Arc<dyn PackageQuery>,
}

impl CandidateClassifier {
    pub fn new(packages: Arc<dyn PackageQuery>) -> Self {
        Self { packages }
    }

    /// Classify one local archive.
    ///
    /// # Errors
    /// Returns an error only when the installed-package lookup fails. An
    /// unreadable archive is classified as an install.
    pub async fn classify(
        &self,
        asset: AssetDescriptor,
        local_file: PathBuf,
    ) -> Result<DownloadedCandidate, PackageQueryError> {
        let manifest = inspect(&local_file).await;

        let package_name = manifest
            .as_ref()
            .map(|manifest| manifest.package_name.clone())
            .or_else(|| asset.app.as_ref().map(|app| app.package_name.clone()));

        let installed = match package_name.as_deref() {
            Some(package) => self.packages.installed_version_code(package).await?,
            None => None,
        };

        let candidate = DownloadedCandidate::new(asset, local_file, manifest, installed);
        debug!(
            "{} -> {} (archive {:?}, installed {:?})",
            candidate.asset.name,
            candidate.action,
            candidate.archive_version_code,
            candidate.installed_version_code
        );
        Ok(candidate)
    }
}

async fn inspect(local_file: &Path) -> Option<ArchiveManifest> {
    let path = local_file.to_path_buf();
    match tokio::task::spawn_blocking(move || read_archive_manifest(&path)).await {
        Ok(Ok(manifest)) => Some(manifest),
        Ok(Err(error)) => {
            warn!("Could not read manifest of {}: {error}", local_file.display());
            None
        }
        Err(error) => {
            warn!("Manifest reader for {} panicked: {error}", local_file.display());
            None
        }
    }
}
