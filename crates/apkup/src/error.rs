use apkup_backend::{CheckError, InstallError};
use apkup_core::RegistryError;
use thiserror::Error;

use crate::single_instance::AcquireError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),

    #[error("Failed to resolve application paths: {0}")]
    Paths(#[from] apkup_platform::AppPathsError),

    #[error(transparent)]
    Instance(#[from] AcquireError),

    #[error("Invalid source catalogue: {0}")]
    Registry(#[from] RegistryError),

    #[error("Unknown source: {id}")]
    UnknownSource { id: String },

    #[error("adb was not found; set adb_path in settings or add it to PATH")]
    AdbNotFound,

    #[error("Failed to build HTTP client: {details}")]
    HttpClient { details: String },

    #[error("Update check failed: {0}")]
    Check(#[from] CheckError),

    #[error("Install of {target} failed: {source}")]
    Install {
        target: String,
        #[source]
        source: InstallError,
    },

    #[error("Failed to {action} settings: {source}")]
    Settings {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    pub fn install(target: impl Into<String>, source: InstallError) -> Self {
        Self::Install {
            target: target.into(),
            source,
        }
    }

    pub fn settings(action: &'static str, source: std::io::Error) -> Self {
        Self::Settings { action, source }
    }

    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}
