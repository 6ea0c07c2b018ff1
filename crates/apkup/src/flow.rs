use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use apkup_backend::{InstallBackend, PackageQuery};
use apkup_core::{InstallOrchestrator, InstallState, OrchestratorChannels, OrchestratorEvent};
use async_trait::async_trait;
use log::{debug, info, warn};

use crate::error::AppError;

/// Answers the uninstall question raised when an install collides with an
/// older copy of the package.
#[async_trait]
pub trait Consent: Send {
    async fn confirm_uninstall(&mut self, package: &str, file: &Path) -> Result<bool, AppError>;
}

/// Consent given up front with `--yes`.
pub struct AssumeYes;

#[async_trait]
impl Consent for AssumeYes {
    async fn confirm_uninstall(&mut self, package: &str, _file: &Path) -> Result<bool, AppError> {
        info!("Uninstalling {package} without prompting");
        Ok(true)
    }
}

/// Asks on the terminal.
pub struct TerminalConsent;

#[async_trait]
impl Consent for TerminalConsent {
    async fn confirm_uninstall(&mut self, package: &str, file: &Path) -> Result<bool, AppError> {
        let question = format!(
            "{package} could not be updated in place with {}.\nUninstall the current copy and retry? [y/N] ",
            file.display()
        );
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            write!(stderr, "{question}")?;
            stderr.flush()?;

            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            Ok::<_, std::io::Error>(matches!(
                answer.trim().to_ascii_lowercase().as_str(),
                "y" | "yes"
            ))
        })
        .await
        .map_err(|error| AppError::from(format!("Prompt task failed: {error}")))?
        .map_err(|error| AppError::io("Failed to read answer", error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub state: InstallState,
    /// At least one install finished and a fresh check was requested.
    pub recheck_requested: bool,
}

/// Drives the orchestrator through one install, feeding back device reports
/// and uninstall answers until the package settles.
pub struct Installer {
    orchestrator: InstallOrchestrator,
    channels: OrchestratorChannels,
}

impl Installer {
    pub fn new(backend: Arc<dyn InstallBackend>, packages: Arc<dyn PackageQuery>) -> Self {
        let (orchestrator, channels) = InstallOrchestrator::new(backend, packages);
        Self {
            orchestrator,
            channels,
        }
    }

    pub async fn install<C>(
        &mut self,
        file: &Path,
        package: Option<&str>,
        consent: &mut C,
    ) -> Result<InstallOutcome, AppError>
    where
        C: Consent + ?Sized,
    {
        let key = package.map_or_else(|| file.display().to_string(), str::to_string);
        self.orchestrator
            .install(file, package)
            .await
            .map_err(|error| AppError::install(&key, error))?;

        let mut recheck_requested = false;
        loop {
            recheck_requested |= self.handle_events(consent).await?;

            let state = self.orchestrator.state(&key);
            match state {
                InstallState::AwaitingInstallResult { session } => {
                    debug!("Waiting for session {session} of {key}");
                    let Some(report) = self.channels.reports.recv().await else {
                        return Err(AppError::from("Install result channel closed"));
                    };
                    if let Err(error) = self.orchestrator.on_install_result(report).await {
                        warn!("Ignoring install report: {error}");
                    }
                }
                InstallState::Completed | InstallState::Failed { .. } | InstallState::Idle => {
                    self.orchestrator.reset();
                    return Ok(InstallOutcome {
                        state,
                        recheck_requested,
                    });
                }
                InstallState::UninstallPrompted
                | InstallState::AwaitingUninstallResult
                | InstallState::ReinstallRequested => {
                    return Err(AppError::from(format!("{key} is stuck: {state}")));
                }
            }
        }
    }

    /// Handles queued events; returns whether a recheck was requested.
    async fn handle_events<C>(&mut self, consent: &mut C) -> Result<bool, AppError>
    where
        C: Consent + ?Sized,
    {
        let mut recheck_requested = false;
        while let Ok(event) = self.channels.events.try_recv() {
            match event {
                OrchestratorEvent::StateChanged { target, state } => {
                    debug!("{target}: {state}");
                }
                OrchestratorEvent::RecheckRequested { target } => {
                    debug!("{target} installed, recheck requested");
                    recheck_requested = true;
                }
                OrchestratorEvent::PromptUninstall { package, file_path } => {
                    if consent.confirm_uninstall(&package, &file_path).await? {
                        self.uninstall_and_reinstall(&package).await?;
                    } else {
                        self.orchestrator
                            .decline_uninstall(&package)
                            .map_err(|error| AppError::install(&package, error))?;
                    }
                }
            }
        }
        Ok(recheck_requested)
    }

    async fn uninstall_and_reinstall(&mut self, package: &str) -> Result<(), AppError> {
        if let Err(error) = self.orchestrator.confirm_uninstall(package).await {
            warn!("Uninstall of {package} failed: {error}");
            return Ok(());
        }
        // adb reports the uninstall result synchronously.
        self.orchestrator
            .on_uninstall_completed(package)
            .await
            .map_err(|error| AppError::install(package, error))
    }
}
