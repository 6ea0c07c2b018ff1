use thiserror::Error;

use crate::types::SourceKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Rate limited during {operation}")]
    RateLimited { operation: &'static str },

    #[error("Network error during {operation} ({stage}): {details}")]
    Network {
        operation: &'static str,
        stage: NetworkStage,
        details: String,
    },

    #[error("{operation} failed with HTTP {status}{body_snippet}")]
    Http {
        operation: &'static str,
        status: u16,
        body_snippet: String,
    },

    #[error("Source {id} cannot be served by the {expected:?} fetcher")]
    WrongSourceKind { id: String, expected: SourceKind },

    #[error("Invalid source configuration for {id}: {details}")]
    InvalidSource { id: String, details: String },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    #[error("request")]
    Request,
    #[error("response parse")]
    ResponseParse,
    #[error("fallback")]
    Fallback,
}

impl FetchError {
    pub fn network_request(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Network {
            operation,
            stage: NetworkStage::Request,
            details: details.into(),
        }
    }

    pub fn network_request_from<E>(operation: &'static str, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::network_request(operation, error.to_string())
    }

    pub fn network_parse(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Network {
            operation,
            stage: NetworkStage::ResponseParse,
            details: details.into(),
        }
    }

    pub fn network_parse_from<E>(operation: &'static str, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::network_parse(operation, error.to_string())
    }

    pub fn fallback_failed(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Network {
            operation,
            stage: NetworkStage::Fallback,
            details: details.into(),
        }
    }

    pub fn http(operation: &'static str, status: u16, body: &str) -> Self {
        Self::Http {
            operation,
            status,
            body_snippet: response_snippet(body, 160),
        }
    }
}

/// Trims a response body to something short enough for an error message.
#[must_use]
pub fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.trim().chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Download of {file} failed with HTTP {status}")]
    Status { file: String, status: u16 },

    #[error("Download of {file} returned an empty body")]
    EmptyBody { file: String },

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Download of {file} failed: {details}")]
    Transfer { file: String, details: String },

    #[error("IO error ({kind}) at {path}: {message}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
        message: String,
    },
}

impl DownloadError {
    pub fn transfer(file: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::Transfer {
            file: file.into(),
            details: details.to_string(),
        }
    }

    pub fn io(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    #[error("session create")]
    Create,
    #[error("session write")]
    Write,
    #[error("session commit")]
    Commit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("Package file not found: {path}")]
    MissingFile { path: String },

    #[error("Installation failed during {phase}: {details}")]
    Session {
        phase: InstallPhase,
        details: String,
    },

    #[error("Uninstall of {package} failed: {details}")]
    Uninstall { package: String, details: String },

    #[error("Device unavailable: {details}")]
    Device { details: String },

    #[error("Cannot {action} {target} while it is {state}")]
    InvalidState {
        target: String,
        action: &'static str,
        state: String,
    },
}

impl InstallError {
    pub fn session(phase: InstallPhase, details: impl Into<String>) -> Self {
        Self::Session {
            phase,
            details: details.into(),
        }
    }

    pub fn uninstall(package: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Uninstall {
            package: package.into(),
            details: details.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageQueryError {
    #[error("Package query for {package} failed: {details}")]
    Failed { package: String, details: String },

    #[error("Device unavailable: {details}")]
    DeviceUnavailable { details: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    PackageQuery(#[from] PackageQueryError),

    #[error("No fetcher registered for {0:?} sources")]
    NoFetcher(SourceKind),
}
