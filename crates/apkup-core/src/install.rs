use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apkup_backend::{
    InstallBackend, InstallError, InstallReport, InstallResultSender, InstallStatus, InstallTarget,
    PackageQuery, SessionId,
};
use log::{debug, info, warn};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstallState {
    #[default]
    Idle,
    AwaitingInstallResult {
        session: SessionId,
    },
    UninstallPrompted,
    AwaitingUninstallResult,
    ReinstallRequested,
    Failed {
        reason: String,
    },
    Completed,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingInstallResult { session } => {
                write!(f, "awaiting install result (session {session})")
            }
            Self::UninstallPrompted => write!(f, "waiting for uninstall consent"),
            Self::AwaitingUninstallResult => write!(f, "awaiting uninstall result"),
            Self::ReinstallRequested => write!(f, "reinstalling"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    StateChanged {
        target: String,
        state: InstallState,
    },
    /// The install failed while an older copy is still present; the caller
    /// should ask the user whether to remove it.
    PromptUninstall {
        package: String,
        file_path: PathBuf,
    },
    /// An install completed; the caller should run a fresh check.
    RecheckRequested {
        target: String,
    },
}

/// Receiving ends handed to the caller when an orchestrator is created.
pub struct OrchestratorChannels {
    /// Install outcomes from the backend, to be fed into
    /// [`InstallOrchestrator::on_install_result`].
    pub reports: mpsc::UnboundedReceiver<InstallReport>,
    pub events: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

/// Per-package install, uninstall and reinstall state machine.
pub struct InstallOrchestrator {
    backend: Arc<dyn InstallBackend>,
    packages: Arc<dyn PackageQuery>,
    report_tx: InstallResultSender,
    event_tx: mpsc::UnboundedSender<OrchestratorEvent>,
    states: HashMap<String, InstallState>,
    pending_reinstall: HashMap<String, PathBuf>,
}

fn target_key(package: Option<&str>, file: &Path) -> String {
    package.map_or_else(|| file.display().to_string(), str::to_string)
}

impl InstallOrchestrator {
    pub fn new(
        backend: Arc<dyn InstallBackend>,
        packages: Arc<dyn PackageQuery>,
    ) -> (Self, OrchestratorChannels) {
        let (report_tx, reports) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                packages,
                report_tx,
                event_tx,
                states: HashMap::new(),
                pending_reinstall: HashMap::new(),
            },
            OrchestratorChannels { reports, events },
        )
    }

    /// Current state of a package, or of a file when the package is unknown.
    #[must_use]
    pub fn state(&self, target: &str) -> InstallState {
        self.states.get(target).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn pending_reinstall_path(&self, package: &str) -> Option<&Path> {
        self.pending_reinstall.get(package).map(PathBuf::as_path)
    }

    /// Forget every tracked state and pending reinstall.
    pub fn reset(&mut self) {
        self.states.clear();
        self.pending_reinstall.clear();
    }

    /// Open a session for `file`, stream it and commit it. The outcome arrives
    /// later on the reports channel.
    ///
    /// # Errors
    /// Returns an error when the file is missing, the target is mid-flow, or
    /// any session step fails. The session is abandoned and the target returns
    /// to idle.
    pub async fn install(
        &mut self,
        file: &Path,
        package_hint: Option<&str>,
    ) -> Result<SessionId, InstallError> {
        let key = target_key(package_hint, file);
        let current = self.state(&key);
        if matches!(
            current,
            InstallState::AwaitingInstallResult { .. }
                | InstallState::UninstallPrompted
                | InstallState::AwaitingUninstallResult
        ) {
            return Err(InstallError::InvalidState {
                target: key,
                action: "install",
                state: current.to_string(),
            });
        }

        let size = match tokio::fs::metadata(file).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                self.transition(&key, InstallState::Idle);
                return Err(InstallError::MissingFile {
                    path: file.display().to_string(),
                });
            }
        };

        let session = match self.backend.create_session(size, package_hint).await {
            Ok(session) => session,
            Err(error) => {
                self.transition(&key, InstallState::Idle);
                return Err(error);
            }
        };
        debug!("Opened install session {session} for {key} ({size} bytes)");

        let target = InstallTarget {
            package_hint: package_hint.map(str::to_string),
            file_path: file.to_path_buf(),
        };
        let staged = match self.backend.write_session(session, file, size).await {
            Ok(()) => {
                self.backend
                    .commit_session(session, target, self.report_tx.clone())
                    .await
            }
            Err(error) => Err(error),
        };

        if let Err(error) = staged {
            warn!("Install of {key} failed: {error}");
            self.backend.abandon_session(session).await;
            self.transition(&key, InstallState::Idle);
            return Err(error);
        }

        if let Some(package) = package_hint {
            self.pending_reinstall
                .insert(package.to_string(), file.to_path_buf());
        }
        self.transition(&key, InstallState::AwaitingInstallResult { session });
        Ok(session)
    }

    /// Feed an install outcome received on the reports channel.
    ///
    /// # Errors
    /// Returns an error when the target was not waiting for an install result.
    pub async fn on_install_result(&mut self, report: InstallReport) -> Result<(), InstallError> {
        let key = target_key(report.package_name.as_deref(), &report.file_path);
        self.expect_state(&key, "accept an install result for", |state| {
            matches!(state, InstallState::AwaitingInstallResult { session } if *session == report.session)
        })?;

        match report.status {
            InstallStatus::Success => {
                info!("Installed {key}");
                self.complete(&key);
                let _ = self
                    .event_tx
                    .send(OrchestratorEvent::RecheckRequested { target: key });
            }
            InstallStatus::Failure { message } => {
                let reason = message.unwrap_or_else(|| "Installation failed".to_string());
                warn!("Install of {key} failed: {reason}");

                let Some(package) = report.package_name else {
                    self.transition(&key, InstallState::Failed { reason });
                    return Ok(());
                };

                match self.packages.is_installed(&package).await {
                    Ok(true) => {
                        self.transition(&key, InstallState::UninstallPrompted);
                        let _ = self.event_tx.send(OrchestratorEvent::PromptUninstall {
                            package,
                            file_path: report.file_path,
                        });
                    }
                    Ok(false) => self.transition(&key, InstallState::Failed { reason }),
                    Err(error) => self.transition(
                        &key,
                        InstallState::Failed {
                            reason: format!("{reason} ({error})"),
                        },
                    ),
                }
            }
        }
        Ok(())
    }

    /// The user agreed to remove the installed copy of `package`.
    ///
    /// # Errors
    /// Returns an error when no uninstall was prompted or the backend refuses
    /// the request.
    pub async fn confirm_uninstall(&mut self, package: &str) -> Result<(), InstallError> {
        self.expect_state(package, "uninstall", |state| {
            *state == InstallState::UninstallPrompted
        })?;

        if let Err(error) = self.backend.request_uninstall(package).await {
            self.transition(
                package,
                InstallState::Failed {
                    reason: error.to_string(),
                },
            );
            return Err(error);
        }

        self.transition(package, InstallState::AwaitingUninstallResult);
        Ok(())
    }

    /// The user refused to remove the installed copy of `package`.
    ///
    /// # Errors
    /// Returns an error when no uninstall was prompted.
    pub fn decline_uninstall(&mut self, package: &str) -> Result<(), InstallError> {
        self.expect_state(package, "decline uninstall of", |state| {
            *state == InstallState::UninstallPrompted
        })?;
        self.transition(
            package,
            InstallState::Failed {
                reason: "Uninstall declined".to_string(),
            },
        );
        Ok(())
    }

    /// The platform reports that the uninstall of `package` finished.
    ///
    /// # Errors
    /// Returns an error when the package was not being uninstalled or the
    /// follow-up reinstall cannot be started.
    pub async fn on_uninstall_completed(&mut self, package: &str) -> Result<(), InstallError> {
        self.expect_state(package, "complete uninstall of", |state| {
            matches!(
                state,
                InstallState::AwaitingUninstallResult | InstallState::UninstallPrompted
            )
        })?;

        match self.packages.is_installed(package).await {
            Ok(false) => {}
            Ok(true) => {
                self.transition(
                    package,
                    InstallState::Failed {
                        reason: "Package is still installed".to_string(),
                    },
                );
                return Ok(());
            }
            Err(error) => {
                self.transition(
                    package,
                    InstallState::Failed {
                        reason: error.to_string(),
                    },
                );
                return Ok(());
            }
        }

        let Some(file) = self.pending_reinstall.get(package).cloned() else {
            info!("{package} removed; no pending file to reinstall");
            self.transition(package, InstallState::Completed);
            return Ok(());
        };

        self.transition(package, InstallState::ReinstallRequested);
        self.install(&file, Some(package)).await.map(|_| ())
    }

    fn complete(&mut self, key: &str) {
        self.pending_reinstall.remove(key);
        self.transition(key, InstallState::Completed);
    }

    fn expect_state(
        &self,
        target: &str,
        action: &'static str,
        allowed: impl Fn(&InstallState) -> bool,
    ) -> Result<(), InstallError> {
        let current = self.state(target);
        if allowed(&current) {
            Ok(())
        } else {
            Err(InstallError::InvalidState {
                target: target.to_string(),
                action,
                state: current.to_string(),
            })
        }
    }

    fn transition(&mut self, target: &str, state: InstallState) {
        debug!("{target}: {state}");
        self.states.insert(target.to_string(), state.clone());
        let _ = self.event_tx.send(OrchestratorEvent::StateChanged {
            target: target.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use apkup_backend::{InstallError, InstallPhase, InstallStatus};

    use super::{InstallOrchestrator, InstallState, OrchestratorChannels, OrchestratorEvent};
    use crate::testing::FakeDevice;

    const PACKAGE: &str = "com.example.app";

    fn orchestrator(device: &Arc<FakeDevice>) -> (InstallOrchestrator, OrchestratorChannels) {
        InstallOrchestrator::new(device.clone(), device.clone())
    }

    fn apk(dir: &Path) -> PathBuf {
        let path = dir.join("app.apk");
        std::fs::write(&path, b"package bytes").expect("fixture written");
        path
    }

    fn drain(channels: &mut OrchestratorChannels) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = channels.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[OrchestratorEvent]) -> Vec<InstallState> {
        events
            .iter()
            .filter_map(|event| match event {
                OrchestratorEvent::StateChanged { state, .. } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_install_completes_and_requests_recheck() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, mut channels) = orchestrator(&device);

        let session = orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        assert_eq!(
            orchestrator.state(PACKAGE),
            InstallState::AwaitingInstallResult { session }
        );
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), Some(file.as_path()));

        let report = channels.reports.recv().await.expect("report should arrive");
        orchestrator
            .on_install_result(report)
            .await
            .expect("result should be accepted");

        assert_eq!(orchestrator.state(PACKAGE), InstallState::Completed);
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), None);
        assert_eq!(device.written_bytes(), vec![13]);
        let events = drain(&mut channels);
        assert!(events.contains(&OrchestratorEvent::RecheckRequested {
            target: PACKAGE.to_string()
        }));
    }

    #[tokio::test]
    async fn failure_with_package_present_prompts_once_then_reinstalls() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(
            FakeDevice::new()
                .with_installed(PACKAGE, 5)
                .with_commit_status(InstallStatus::Failure {
                    message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
                }),
        );
        let (mut orchestrator, mut channels) = orchestrator(&device);

        orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        let report = channels.reports.recv().await.expect("report should arrive");
        orchestrator
            .on_install_result(report)
            .await
            .expect("result should be accepted");

        assert_eq!(orchestrator.state(PACKAGE), InstallState::UninstallPrompted);
        let events = drain(&mut channels);
        let prompts = events
            .iter()
            .filter(|event| matches!(event, OrchestratorEvent::PromptUninstall { .. }))
            .count();
        assert_eq!(prompts, 1);

        orchestrator
            .confirm_uninstall(PACKAGE)
            .await
            .expect("uninstall should be requested");
        assert_eq!(device.uninstalled(), vec![PACKAGE.to_string()]);
        assert_eq!(orchestrator.state(PACKAGE), InstallState::AwaitingUninstallResult);

        device.set_commit_status(InstallStatus::Success);
        orchestrator
            .on_uninstall_completed(PACKAGE)
            .await
            .expect("reinstall should start");

        assert!(matches!(
            orchestrator.state(PACKAGE),
            InstallState::AwaitingInstallResult { .. }
        ));
        assert!(states(&drain(&mut channels)).contains(&InstallState::ReinstallRequested));
        assert_eq!(device.created_sessions(), 2);
    }

    #[tokio::test]
    async fn uninstall_that_left_package_installed_fails_without_reinstall() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(
            FakeDevice::new()
                .with_installed(PACKAGE, 5)
                .with_commit_status(InstallStatus::Failure { message: None })
                .uninstall_keeps_package(),
        );
        let (mut orchestrator, mut channels) = orchestrator(&device);

        orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        let report = channels.reports.recv().await.expect("report should arrive");
        orchestrator
            .on_install_result(report)
            .await
            .expect("result should be accepted");
        orchestrator
            .confirm_uninstall(PACKAGE)
            .await
            .expect("uninstall should be requested");
        orchestrator
            .on_uninstall_completed(PACKAGE)
            .await
            .expect("completion should be accepted");

        assert!(matches!(
            orchestrator.state(PACKAGE),
            InstallState::Failed { .. }
        ));
        assert!(!states(&drain(&mut channels)).contains(&InstallState::ReinstallRequested));
        assert_eq!(device.created_sessions(), 1);
    }

    #[tokio::test]
    async fn failure_without_installed_package_is_terminal() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new().with_commit_status(InstallStatus::Failure {
            message: Some("INSTALL_FAILED_INSUFFICIENT_STORAGE".to_string()),
        }));
        let (mut orchestrator, mut channels) = orchestrator(&device);

        orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        let report = channels.reports.recv().await.expect("report should arrive");
        orchestrator
            .on_install_result(report)
            .await
            .expect("result should be accepted");

        assert_eq!(
            orchestrator.state(PACKAGE),
            InstallState::Failed {
                reason: "INSTALL_FAILED_INSUFFICIENT_STORAGE".to_string()
            }
        );
    }

    #[tokio::test]
    async fn write_failure_abandons_session_and_returns_to_idle() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new().failing_at(InstallPhase::Write));
        let (mut orchestrator, _channels) = orchestrator(&device);

        let error = orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect_err("write should fail");

        assert!(matches!(
            error,
            InstallError::Session {
                phase: InstallPhase::Write,
                ..
            }
        ));
        assert_eq!(device.abandoned_sessions().len(), 1);
        assert_eq!(orchestrator.state(PACKAGE), InstallState::Idle);
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), None);
    }

    #[tokio::test]
    async fn create_failure_leaves_nothing_to_abandon() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new().failing_at(InstallPhase::Create));
        let (mut orchestrator, mut channels) = orchestrator(&device);

        let error = orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect_err("create should fail");

        assert!(matches!(
            error,
            InstallError::Session {
                phase: InstallPhase::Create,
                ..
            }
        ));
        assert_eq!(device.created_sessions(), 0);
        assert!(device.abandoned_sessions().is_empty());
        assert_eq!(orchestrator.state(PACKAGE), InstallState::Idle);
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), None);
        assert_eq!(states(&drain(&mut channels)), vec![InstallState::Idle]);
    }

    #[tokio::test]
    async fn commit_failure_abandons_session_and_returns_to_idle() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new().failing_at(InstallPhase::Commit));
        let (mut orchestrator, mut channels) = orchestrator(&device);

        let error = orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect_err("commit should fail");

        assert!(matches!(
            error,
            InstallError::Session {
                phase: InstallPhase::Commit,
                ..
            }
        ));
        assert_eq!(device.created_sessions(), 1);
        assert_eq!(device.written_bytes().len(), 1);
        assert_eq!(device.abandoned_sessions().len(), 1);
        assert_eq!(orchestrator.state(PACKAGE), InstallState::Idle);
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), None);
        assert!(channels.reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_file_is_rejected_before_opening_a_session() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, _channels) = orchestrator(&device);

        let error = orchestrator
            .install(&temp.path().join("absent.apk"), None)
            .await
            .expect_err("missing file should fail");

        assert!(matches!(error, InstallError::MissingFile { .. }));
        assert_eq!(device.created_sessions(), 0);
    }

    #[tokio::test]
    async fn install_while_awaiting_result_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, _channels) = orchestrator(&device);

        orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        let error = orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect_err("second install should be rejected");

        assert!(matches!(error, InstallError::InvalidState { .. }));
        assert_eq!(device.created_sessions(), 1);
    }

    #[tokio::test]
    async fn declining_uninstall_fails_the_package() {
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, _channels) = orchestrator(&device);
        orchestrator
            .states
            .insert(PACKAGE.to_string(), InstallState::UninstallPrompted);

        orchestrator
            .decline_uninstall(PACKAGE)
            .expect("decline should be accepted");

        assert_eq!(
            orchestrator.state(PACKAGE),
            InstallState::Failed {
                reason: "Uninstall declined".to_string()
            }
        );
        assert!(device.uninstalled().is_empty());
    }

    #[tokio::test]
    async fn uninstall_without_pending_file_completes() {
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, _channels) = orchestrator(&device);
        orchestrator
            .states
            .insert(PACKAGE.to_string(), InstallState::AwaitingUninstallResult);

        orchestrator
            .on_uninstall_completed(PACKAGE)
            .await
            .expect("completion should be accepted");

        assert_eq!(orchestrator.state(PACKAGE), InstallState::Completed);
        assert_eq!(device.created_sessions(), 0);
    }

    #[tokio::test]
    async fn unknown_package_is_tracked_by_file_path() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new().with_commit_status(InstallStatus::Failure {
            message: None,
        }));
        let (mut orchestrator, mut channels) = orchestrator(&device);

        orchestrator
            .install(&file, None)
            .await
            .expect("install should start");
        let report = channels.reports.recv().await.expect("report should arrive");
        orchestrator
            .on_install_result(report)
            .await
            .expect("result should be accepted");

        assert_eq!(
            orchestrator.state(&file.display().to_string()),
            InstallState::Failed {
                reason: "Installation failed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn reset_forgets_states_and_pending_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file = apk(temp.path());
        let device = Arc::new(FakeDevice::new());
        let (mut orchestrator, _channels) = orchestrator(&device);

        orchestrator
            .install(&file, Some(PACKAGE))
            .await
            .expect("install should start");
        orchestrator.reset();

        assert_eq!(orchestrator.state(PACKAGE), InstallState::Idle);
        assert_eq!(orchestrator.pending_reinstall_path(PACKAGE), None);
    }
}
