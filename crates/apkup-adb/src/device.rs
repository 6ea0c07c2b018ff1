use std::path::{Path, PathBuf};
use std::process::Stdio;

use apkup_backend::{
    InstallBackend, InstallError, InstallPhase, InstallReport, InstallResultSender, InstallStatus,
    InstallTarget, PackageQuery, PackageQueryError, SessionId,
};
use apkup_platform::helper_command;
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::process::Command;

use crate::error::AdbError;
use crate::parse::{is_valid_package_name, parse_pm_outcome, parse_session_id, parse_version_code};

const SESSION_ENTRY_NAME: &str = "base.apk";

struct CommandOutput {
    stdout: String,
    stderr: String,
}

/// A device reached through the `adb` command line tool.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: PathBuf,
    serial: Option<String>,
}

impl AdbDevice {
    #[must_use]
    pub fn new(adb: PathBuf) -> Self {
        Self { adb, serial: None }
    }

    /// Targets one device when several are attached.
    #[must_use]
    pub fn with_serial(mut self, serial: Option<String>) -> Self {
        self.serial = serial.filter(|serial| !serial.trim().is_empty());
        self
    }

    #[must_use]
    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    fn build_command(&self, args: &[&str]) -> Command {
        debug!("Building adb command: {} {}", self.adb.display(), args.join(" "));

        let mut cmd = helper_command(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd.args(args);
        cmd
    }

    async fn execute(&self, args: &[&str]) -> Result<CommandOutput, AdbError> {
        info!("Executing adb command: {}", args.join(" "));

        let output = self.build_command(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!("adb command exit status: {:?}", output.status);
        trace!("adb stdout: {stdout}");
        if !stderr.is_empty() {
            trace!("adb stderr: {stderr}");
        }

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            error!("adb command failed: args={args:?}, stderr='{stderr}'");
            Err(AdbError::from_stderr(stderr))
        }
    }

    fn checked_package<'a>(package: &'a str) -> Result<&'a str, AdbError> {
        if is_valid_package_name(package) {
            Ok(package)
        } else {
            Err(AdbError::InvalidPackageName(package.to_string()))
        }
    }

    async fn stream_into_session(
        &self,
        session: SessionId,
        file: &Path,
        size: u64,
    ) -> Result<(), AdbError> {
        let size_arg = size.to_string();
        let session_arg = session.to_string();
        let args = [
            "exec-in",
            "cmd",
            "package",
            "install-write",
            "-S",
            size_arg.as_str(),
            session_arg.as_str(),
            SESSION_ENTRY_NAME,
            "-",
        ];
        info!("Executing adb command: {}", args.join(" "));

        let mut child = self
            .build_command(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut source = tokio::fs::File::open(file).await?;
        if let Some(mut stdin) = child.stdin.take() {
            let copied = tokio::io::copy(&mut source, &mut stdin).await?;
            debug!("Streamed {copied} of {size} bytes into session {session}");
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        trace!("adb install-write stdout: {stdout}");

        if output.status.success() && !stdout.contains("Failure") && !stderr.contains("Failure") {
            Ok(())
        } else if stderr.trim().is_empty() {
            Err(AdbError::CommandFailed { stderr: stdout })
        } else {
            Err(AdbError::from_stderr(stderr))
        }
    }
}

#[async_trait]
impl PackageQuery for AdbDevice {
    async fn installed_version_code(
        &self,
        package: &str,
    ) -> Result<Option<u64>, PackageQueryError> {
        let package = Self::checked_package(package).map_err(|e| e.into_query_error(package))?;
        let output = self
            .execute(&["shell", "dumpsys", "package", package])
            .await
            .map_err(|e| e.into_query_error(package))?;
        Ok(parse_version_code(&output.stdout))
    }
}

#[async_trait]
impl InstallBackend for AdbDevice {
    async fn create_session(
        &self,
        size: u64,
        package_hint: Option<&str>,
    ) -> Result<SessionId, InstallError> {
        let size_arg = size.to_string();
        let mut args = vec!["shell", "pm", "install-create", "-r", "-S", size_arg.as_str()];
        if let Some(package) = package_hint {
            let package = Self::checked_package(package)
                .map_err(|e| e.into_install_error(InstallPhase::Create))?;
            args.extend(["--pkg", package]);
        }

        let output = self
            .execute(&args)
            .await
            .map_err(|e| e.into_install_error(InstallPhase::Create))?;

        parse_session_id(&output.stdout).map(SessionId).ok_or_else(|| {
            AdbError::UnexpectedOutput(output.stdout.trim().to_string())
                .into_install_error(InstallPhase::Create)
        })
    }

    async fn write_session(
        &self,
        session: SessionId,
        file: &Path,
        size: u64,
    ) -> Result<(), InstallError> {
        self.stream_into_session(session, file, size)
            .await
            .map_err(|e| e.into_install_error(InstallPhase::Write))
    }

    async fn commit_session(
        &self,
        session: SessionId,
        target: InstallTarget,
        results: InstallResultSender,
    ) -> Result<(), InstallError> {
        let session_arg = session.to_string();
        let build = self.build_command(&["shell", "pm", "install-commit", session_arg.as_str()]);
        let output = run(build)
            .await
            .map_err(|e| e.into_install_error(InstallPhase::Commit))?;

        let status = parse_pm_outcome(&output.stdout, &output.stderr);
        if let InstallStatus::Failure { message } = &status {
            warn!("Session {session} was rejected: {message:?}");
        }

        let _ = results.send(InstallReport {
            session,
            package_name: target.package_hint,
            file_path: target.file_path,
            status,
        });
        Ok(())
    }

    async fn abandon_session(&self, session: SessionId) {
        let session_arg = session.to_string();
        if let Err(error) = self
            .execute(&["shell", "pm", "install-abandon", session_arg.as_str()])
            .await
        {
            warn!("Failed to abandon install session {session}: {error}");
        }
    }

    async fn request_uninstall(&self, package: &str) -> Result<(), InstallError> {
        let checked = Self::checked_package(package)
            .map_err(|e| InstallError::uninstall(package, e.to_string()))?;
        let output = self
            .execute(&["shell", "pm", "uninstall", checked])
            .await
            .map_err(|e| InstallError::uninstall(package, e.to_string()))?;

        match parse_pm_outcome(&output.stdout, &output.stderr) {
            InstallStatus::Success => Ok(()),
            InstallStatus::Failure { message } => Err(InstallError::uninstall(
                package,
                message.unwrap_or_else(|| "uninstall rejected".to_string()),
            )),
        }
    }
}

/// Runs a prepared command, keeping stdout and stderr even when `pm`
/// reports a failure with a zero exit status.
async fn run(mut command: Command) -> Result<CommandOutput, AdbError> {
    let output = command.output().await?;
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!("adb stdout: {stdout}");

    if output.status.success() || stdout.contains("Failure") {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(AdbError::from_stderr(stderr))
    }
}
