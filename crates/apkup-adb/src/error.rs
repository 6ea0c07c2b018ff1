use apkup_backend::{InstallError, InstallPhase, PackageQueryError};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AdbError {
    #[error("adb not found")]
    NotFound,

    #[error("Command failed: {stderr}")]
    CommandFailed { stderr: String },

    #[error("No device available: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("Unexpected adb output: {0}")]
    UnexpectedOutput(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for AdbError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            AdbError::NotFound
        } else {
            AdbError::IoError(err.to_string())
        }
    }
}

impl AdbError {
    /// Classifies a failed adb invocation by its error text.
    pub(crate) fn from_stderr(stderr: String) -> Self {
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("no devices")
            || lowered.contains("device offline")
            || lowered.contains("device unauthorized")
            || (lowered.contains("device") && lowered.contains("not found"))
            || lowered.contains("more than one device")
        {
            AdbError::DeviceUnavailable(stderr.trim().to_string())
        } else {
            AdbError::CommandFailed { stderr }
        }
    }

    pub(crate) fn into_install_error(self, phase: InstallPhase) -> InstallError {
        match self {
            AdbError::DeviceUnavailable(details) => InstallError::Device { details },
            AdbError::NotFound => InstallError::Device {
                details: AdbError::NotFound.to_string(),
            },
            other => InstallError::session(phase, other.to_string()),
        }
    }

    pub(crate) fn into_query_error(self, package: &str) -> PackageQueryError {
        match self {
            AdbError::DeviceUnavailable(details) => {
                PackageQueryError::DeviceUnavailable { details }
            }
            AdbError::NotFound => PackageQueryError::DeviceUnavailable {
                details: AdbError::NotFound.to_string(),
            },
            other => PackageQueryError::Failed {
                package: package.to_string(),
                details: other.to_string(),
            },
        }
    }
}
