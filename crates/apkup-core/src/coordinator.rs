use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use apkup_backend::{
    CheckError, CheckPreferences, CheckResult, DownloadedCandidate, ReleaseDescriptor,
    ReleaseFetcher, SourceKind, UpdateSource,
};
use futures_util::future::try_join_all;
use log::{debug, info};

use crate::cache::{AssetCache, local_file_names};
use crate::classify::CandidateClassifier;
use crate::sources::SourceRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Completed(CheckResult),
    /// Another check cycle was already running; this request was dropped.
    Skipped,
}

/// Runs one fetch, download and classify cycle against the active source.
pub struct UpdateCoordinator {
    registry: SourceRegistry,
    fetchers: HashMap<SourceKind, Arc<dyn ReleaseFetcher>>,
    cache: AssetCache,
    classifier: CandidateClassifier,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UpdateCoordinator {
    pub fn new(
        registry: SourceRegistry,
        cache: AssetCache,
        classifier: CandidateClassifier,
    ) -> Self {
        Self {
            registry,
            fetchers: HashMap::new(),
            cache,
            classifier,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Registers the fetcher serving sources of its kind, replacing any
    /// previous one.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ReleaseFetcher>) -> Self {
        self.fetchers.insert(fetcher.kind(), fetcher);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    #[must_use]
    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one check cycle, or return [`CheckOutcome::Skipped`] when a cycle
    /// is already in progress.
    ///
    /// # Errors
    /// Returns an error when the release cannot be fetched, any asset fails
    /// to download, or the installed-package lookup fails.
    pub async fn check<P>(&self, preferences: &P) -> Result<CheckOutcome, CheckError>
    where
        P: CheckPreferences + Sync,
    {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Check already in progress, dropping request");
            return Ok(CheckOutcome::Skipped);
        };

        let source = self
            .registry
            .resolve(preferences.selected_source_id().as_deref());
        info!("Checking {} ({})", source.id, source.kind());

        let release = self.fetcher_for(source)?.fetch_latest(source).await?;
        debug!(
            "Release {} has {} asset(s)",
            release.tag,
            release.assets.len()
        );

        let candidates = self.collect_candidates(source, &release).await?;
        let last_seen = preferences.last_seen_tag(&source.id);
        let is_new_release = !release.is_placeholder()
            && last_seen.as_deref() != Some(release.tag.as_str());

        Ok(CheckOutcome::Completed(CheckResult {
            source_id: source.id.clone(),
            release,
            candidates,
            is_new_release,
        }))
    }

    async fn collect_candidates(
        &self,
        source: &UpdateSource,
        release: &ReleaseDescriptor,
    ) -> Result<Vec<DownloadedCandidate>, CheckError> {
        let destination = self.cache.release_dir(&release.tag);
        let bearer = source.token();

        let file_names = local_file_names(&release.assets);

        let work = release.assets.iter().zip(&file_names).map(|(asset, file_name)| {
            let destination = destination.as_path();
            async move {
                let local_file = self
                    .cache
                    .ensure_local_as(asset, destination, file_name, bearer)
                    .await?;
                let candidate = self.classifier.classify(asset.clone(), local_file).await?;
                Ok::<_, CheckError>(candidate)
            }
        });

        try_join_all(work).await
    }

    /// Stores the fetched tag as last seen when the check found a new release.
    pub fn remember_release<P: CheckPreferences>(preferences: &mut P, result: &CheckResult) {
        if result.is_new_release {
            preferences.set_last_seen_tag(&result.source_id, &result.release.tag);
        }
    }

    /// Contact a source and describe what it answered.
    ///
    /// # Errors
    /// Returns an error when no fetcher serves the source or the request fails.
    pub async fn test_connection(&self, source_id: Option<&str>) -> Result<String, CheckError> {
        let source = self.registry.resolve(source_id);
        Ok(self.fetcher_for(source)?.test_connection(source).await?)
    }

    fn fetcher_for(&self, source: &UpdateSource) -> Result<&Arc<dyn ReleaseFetcher>, CheckError> {
        self.fetchers
            .get(&source.kind())
            .ok_or(CheckError::NoFetcher(source.kind()))
    }
}
