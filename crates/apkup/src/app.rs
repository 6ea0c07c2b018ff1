use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use apkup_adb::{AdbDevice, locate_adb};
use apkup_backend::{CheckResult, HttpTransport, PackageQuery, UpdateAction};
use apkup_core::{
    AssetCache, CandidateClassifier, CheckOutcome, DEFAULT_SOURCE_ID, InstallState,
    ReqwestTransport, SourceRegistry, UpdateCoordinator, read_archive_manifest,
};
use apkup_github::GithubFetcher;
use apkup_platform::AppPaths;
use apkup_selfhosted::SelfHostedFetcher;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::cli::Command;
use crate::error::AppError;
use crate::flow::{AssumeYes, Consent, Installer, TerminalConsent};
use crate::settings::AppSettings;

const MIN_WATCH_INTERVAL_SECS: u64 = 5;

pub struct App {
    paths: AppPaths,
    settings: AppSettings,
    registry: SourceRegistry,
    transport: Arc<dyn HttpTransport>,
}

impl App {
    pub fn new(paths: AppPaths, settings: AppSettings) -> Result<Self, AppError> {
        let registry = SourceRegistry::new(settings.catalogue(), DEFAULT_SOURCE_ID)?;
        let transport = ReqwestTransport::new(
            Duration::from_secs(settings.connect_timeout_secs),
            Duration::from_secs(settings.read_timeout_secs),
        )
        .map_err(|error| AppError::HttpClient {
            details: error.to_string(),
        })?;

        Ok(Self {
            paths,
            settings,
            registry,
            transport: Arc::new(transport),
        })
    }

    /// Deletes partial downloads left by an interrupted run.
    pub fn purge_stale_downloads(&self) {
        let cache = AssetCache::new(Arc::clone(&self.transport), self.paths.apk_cache_dir());
        let removed = cache.purge_stale_temp_files();
        if removed > 0 {
            info!("Removed {removed} stale partial download(s)");
        }
    }

    pub async fn run(&mut self, command: Command) -> Result<(), AppError> {
        match command {
            Command::Sources => {
                self.list_sources();
                Ok(())
            }
            Command::Select { id } => self.select_source(&id),
            Command::Check => self.check().await,
            Command::Sync { yes } => self.sync(yes).await,
            Command::Install { file, package, yes } => {
                self.install_file(&file, package.as_deref(), yes).await
            }
            Command::TestConnection { id } => self.test_connection(id.as_deref()).await,
            Command::Watch { interval } => self.watch(interval).await,
        }
    }

    fn list_sources(&self) {
        let active = self
            .registry
            .resolve(self.settings.selected_source_id.as_deref());
        for source in self.registry.all() {
            let marker = if source.id == active.id { '*' } else { ' ' };
            println!(
                "{marker} {:<22} {:<8} {}",
                source.id,
                source.kind().to_string(),
                source.display_name
            );
        }
    }

    fn select_source(&mut self, id: &str) -> Result<(), AppError> {
        let Some(source) = self.registry.find_by_id(id) else {
            return Err(AppError::UnknownSource { id: id.to_string() });
        };
        println!("Active source: {} ({})", source.id, source.display_name);
        self.settings.selected_source_id = Some(source.id.clone());
        self.save_settings()
    }

    async fn check(&mut self) -> Result<(), AppError> {
        let device = Arc::new(self.adb_device(true).await?);
        let coordinator = self.coordinator(device);

        if let Some(result) = run_check(&coordinator, &mut self.settings).await? {
            print_result(&result);
            self.save_settings()?;
        }
        Ok(())
    }

    async fn sync(&mut self, yes: bool) -> Result<(), AppError> {
        let device = Arc::new(self.adb_device(true).await?);
        let coordinator = self.coordinator(device.clone());

        let Some(result) = run_check(&coordinator, &mut self.settings).await? else {
            return Ok(());
        };
        print_result(&result);
        self.save_settings()?;

        let actionable = result.actionable();
        if actionable.is_empty() {
            println!("Everything is up to date");
            return Ok(());
        }

        let mut installer = Installer::new(device.clone(), device);
        let mut consent = consent_for(yes);
        let mut recheck = false;
        let mut failures = 0_usize;

        for candidate in actionable {
            let label = candidate
                .package_name
                .clone()
                .unwrap_or_else(|| candidate.asset.name.clone());
            println!("Installing {label} ({})", candidate.action);

            match installer
                .install(
                    &candidate.local_file,
                    candidate.package_name.as_deref(),
                    consent.as_mut(),
                )
                .await
            {
                Ok(outcome) => {
                    recheck |= outcome.recheck_requested;
                    if !report_outcome(&label, &outcome.state) {
                        failures += 1;
                    }
                }
                Err(error) => {
                    error!("{error}");
                    println!("  {error}");
                    failures += 1;
                }
            }
        }

        if recheck && let Some(result) = run_check(&coordinator, &mut self.settings).await? {
            print_result(&result);
            self.save_settings()?;
        }

        if failures > 0 {
            return Err(AppError::from(format!("{failures} package(s) failed to install")));
        }
        Ok(())
    }

    async fn install_file(
        &self,
        file: &Path,
        package: Option<&str>,
        yes: bool,
    ) -> Result<(), AppError> {
        let device = Arc::new(self.adb_device(true).await?);
        let mut installer = Installer::new(device.clone(), device);
        let mut consent = consent_for(yes);

        let package = package_for(file, package).await;
        let label = package
            .clone()
            .unwrap_or_else(|| file.display().to_string());
        let outcome = installer
            .install(file, package.as_deref(), consent.as_mut())
            .await?;

        if report_outcome(&label, &outcome.state) {
            Ok(())
        } else {
            Err(AppError::from(format!("{label}: {}", outcome.state)))
        }
    }

    async fn test_connection(&self, id: Option<&str>) -> Result<(), AppError> {
        if let Some(id) = id
            && self.registry.find_by_id(id).is_none()
        {
            return Err(AppError::UnknownSource { id: id.to_string() });
        }
        let id = id.or(self.settings.selected_source_id.as_deref());

        // Connection tests never touch the device.
        let device = Arc::new(self.adb_device(false).await?);
        let summary = self.coordinator(device).test_connection(id).await?;
        println!("{summary}");
        Ok(())
    }

    async fn watch(&mut self, interval: Option<u64>) -> Result<(), AppError> {
        let interval_secs = interval
            .unwrap_or(self.settings.watch_interval_secs)
            .max(MIN_WATCH_INTERVAL_SECS);
        let device = Arc::new(self.adb_device(true).await?);
        let coordinator = Arc::new(self.coordinator(device));
        let settings = Arc::new(Mutex::new(self.settings.clone()));

        info!("Checking every {interval_secs}s");
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;

            let coordinator = Arc::clone(&coordinator);
            let settings = Arc::clone(&settings);
            let paths = self.paths.clone();
            tokio::spawn(async move {
                let snapshot = settings.lock().await.clone();
                match coordinator.check(&snapshot).await {
                    Ok(CheckOutcome::Skipped) => {
                        info!("Previous check still running, skipping this tick");
                    }
                    Ok(CheckOutcome::Completed(result)) => {
                        print_result(&result);
                        log_actionable(&result);
                        let mut settings = settings.lock().await;
                        UpdateCoordinator::remember_release(&mut *settings, &result);
                        if let Err(error) = settings.save(&paths) {
                            warn!("Failed to save settings: {error}");
                        }
                    }
                    Err(error) => error!("Scheduled check failed: {error}"),
                }
            });
        }
    }

    async fn adb_device(&self, required: bool) -> Result<AdbDevice, AppError> {
        let serial = self.settings.device_serial.clone();
        match locate_adb(self.settings.adb_path.as_deref()).await {
            Some(detection) => {
                debug!(
                    "adb {} at {} (in PATH: {})",
                    detection.version.as_deref().unwrap_or("unknown"),
                    detection.path.display(),
                    detection.in_path
                );
                Ok(AdbDevice::new(detection.path).with_serial(serial))
            }
            None if required => Err(AppError::AdbNotFound),
            None => Ok(AdbDevice::new(PathBuf::from("adb")).with_serial(serial)),
        }
    }

    fn coordinator(&self, packages: Arc<dyn PackageQuery>) -> UpdateCoordinator {
        build_coordinator(
            self.registry.clone(),
            Arc::clone(&self.transport),
            self.paths.apk_cache_dir(),
            packages,
        )
    }

    fn save_settings(&self) -> Result<(), AppError> {
        self.settings
            .save(&self.paths)
            .map_err(|error| AppError::settings("save", error))
    }
}

fn build_coordinator(
    registry: SourceRegistry,
    transport: Arc<dyn HttpTransport>,
    cache_dir: PathBuf,
    packages: Arc<dyn PackageQuery>,
) -> UpdateCoordinator {
    let cache = AssetCache::new(Arc::clone(&transport), cache_dir);
    UpdateCoordinator::new(registry, cache, CandidateClassifier::new(packages))
        .with_fetcher(Arc::new(GithubFetcher::new(Arc::clone(&transport))))
        .with_fetcher(Arc::new(SelfHostedFetcher::new(transport)))
}

/// One check cycle; a new tag is stored as last seen. `None` when another
/// cycle was already running.
async fn run_check(
    coordinator: &UpdateCoordinator,
    settings: &mut AppSettings,
) -> Result<Option<CheckResult>, AppError> {
    match coordinator.check(&*settings).await? {
        CheckOutcome::Skipped => {
            info!("A check is already running");
            Ok(None)
        }
        CheckOutcome::Completed(result) => {
            UpdateCoordinator::remember_release(settings, &result);
            log_actionable(&result);
            Ok(Some(result))
        }
    }
}

/// The explicit package name, or the one declared in the archive manifest.
async fn package_for(file: &Path, explicit: Option<&str>) -> Option<String> {
    if let Some(package) = explicit {
        return Some(package.to_string());
    }

    let path = file.to_path_buf();
    match tokio::task::spawn_blocking(move || read_archive_manifest(&path)).await {
        Ok(Ok(manifest)) => {
            debug!("{} declares {}", file.display(), manifest.package_name);
            Some(manifest.package_name)
        }
        Ok(Err(error)) => {
            warn!("Could not read the package name of {}: {error}", file.display());
            None
        }
        Err(error) => {
            warn!("Manifest reader for {} panicked: {error}", file.display());
            None
        }
    }
}

fn log_actionable(result: &CheckResult) {
    info!(
        "{}: release {} has {} actionable package(s) of {}",
        result.source_id,
        result.release.tag,
        result.actionable().len(),
        result.candidates.len()
    );
}

fn consent_for(yes: bool) -> Box<dyn Consent> {
    if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalConsent)
    }
}

/// Prints how an install settled; returns whether it succeeded.
fn report_outcome(label: &str, state: &InstallState) -> bool {
    match state {
        InstallState::Completed => {
            println!("  {label}: installed");
            true
        }
        other => {
            println!("  {label}: {other}");
            false
        }
    }
}

fn print_result(result: &CheckResult) {
    let release = &result.release;
    if release.is_placeholder() {
        println!("{}: nothing published yet", result.source_id);
        return;
    }

    let published = release
        .published_at
        .map(|at| format!(", published {}", at.format("%Y-%m-%d %H:%M UTC")))
        .unwrap_or_default();
    let new_marker = if result.is_new_release { " [new]" } else { "" };
    println!(
        "{}: {}{published}{new_marker}",
        result.source_id, release.tag
    );

    for candidate in &result.candidates {
        let installed = candidate
            .installed_version_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        let archive = candidate
            .archive_version_code
            .map_or_else(|| "?".to_string(), |code| code.to_string());
        let marker = match candidate.action {
            UpdateAction::Install | UpdateAction::Update => '+',
            UpdateAction::UpToDate => ' ',
        };
        println!(
            "{marker} {:<40} {installed:>10} -> {archive:<10} {}",
            candidate
                .package_name
                .as_deref()
                .unwrap_or(candidate.asset.name.as_str()),
            candidate.action
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apkup_backend::{CheckPreferences, UpdateAction, UpdateSource};
    use apkup_core::SourceRegistry;
    use apkup_core::testing::{FakeDevice, FakeTransport, test_apk_bytes, write_test_apk};

    use super::{build_coordinator, package_for, run_check};
    use crate::settings::AppSettings;

    const CURRENT: &str = "http://10.1.1.1:8088/mobile/current";
    const DOWNLOAD: &str = "http://10.1.1.1:8088/files/app.apk";

    fn transport(tag: &str) -> FakeTransport {
        let body = format!(
            r#"{{"releaseId": "r-{tag}", "tag": "{tag}", "apps": [
                {{"packageName": "com.example.app", "fileName": "app.apk", "downloadUrl": "{DOWNLOAD}"}}
            ]}}"#
        );
        FakeTransport::new()
            .with_response(CURRENT, 200, body)
            .with_response(
                DOWNLOAD,
                200,
                test_apk_bytes("com.example.app", 12).expect("test apk should build"),
            )
    }

    fn registry() -> SourceRegistry {
        SourceRegistry::new(
            vec![UpdateSource::backend("lab", "Lab backend", "http://10.1.1.1:8088")],
            "lab",
        )
        .expect("registry should build")
    }

    #[tokio::test]
    async fn check_stores_new_tag_once() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let transport = Arc::new(transport("2024.07.01"));
        let device = Arc::new(FakeDevice::new().with_installed("com.example.app", 10));
        let coordinator = build_coordinator(
            registry(),
            transport.clone(),
            temp_dir.path().join("apk_cache"),
            device,
        );
        let mut settings = AppSettings::default();

        let first = run_check(&coordinator, &mut settings)
            .await
            .expect("check should succeed")
            .expect("check should not be skipped");
        assert!(first.is_new_release);
        assert_eq!(first.candidates[0].action, UpdateAction::Update);
        assert_eq!(settings.last_seen_tag("lab").as_deref(), Some("2024.07.01"));

        let second = run_check(&coordinator, &mut settings)
            .await
            .expect("check should succeed")
            .expect("check should not be skipped");
        assert!(!second.is_new_release);
        assert_eq!(transport.call_count(DOWNLOAD), 1);
    }

    #[tokio::test]
    async fn up_to_date_device_has_nothing_actionable() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let device = Arc::new(FakeDevice::new().with_installed("com.example.app", 12));
        let coordinator = build_coordinator(
            registry(),
            Arc::new(transport("2024.07.02")),
            temp_dir.path().join("apk_cache"),
            device,
        );
        let mut settings = AppSettings::default();

        let result = run_check(&coordinator, &mut settings)
            .await
            .expect("check should succeed")
            .expect("check should not be skipped");

        assert!(result.actionable().is_empty());
        assert_eq!(result.candidates[0].action, UpdateAction::UpToDate);
    }

    #[tokio::test]
    async fn fetch_failures_leave_last_seen_untouched() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let transport = Arc::new(FakeTransport::new().with_response(CURRENT, 500, "down"));
        let coordinator = build_coordinator(
            registry(),
            transport,
            temp_dir.path().join("apk_cache"),
            Arc::new(FakeDevice::new()),
        );
        let mut settings = AppSettings::default();

        assert!(run_check(&coordinator, &mut settings).await.is_err());
        assert!(settings.last_seen_tags.is_empty());
    }

    #[tokio::test]
    async fn package_name_is_read_from_the_archive_when_missing() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let file = temp_dir.path().join("app.apk");
        write_test_apk(&file, "com.example.sideload", 3).expect("test apk should be written");

        assert_eq!(
            package_for(&file, None).await.as_deref(),
            Some("com.example.sideload")
        );
        assert_eq!(
            package_for(&file, Some("com.example.override")).await.as_deref(),
            Some("com.example.override")
        );
    }

    #[tokio::test]
    async fn unreadable_archive_leaves_package_unknown() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let file = temp_dir.path().join("broken.apk");
        std::fs::write(&file, b"not a zip").expect("file should be written");

        assert_eq!(package_for(&file, None).await, None);
    }
}
