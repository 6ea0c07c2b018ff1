//! Release check and install orchestration for apkup.
//!
//! This crate composes the pieces that do not depend on a particular release
//! host or device connection:
//! - The source catalogue and the check-cycle coordinator.
//! - The on-disk asset cache and the HTTP transport feeding it.
//! - Archive manifest reading and candidate classification.
//! - The install/uninstall/reinstall state machine.

mod cache;
mod classify;
mod coordinator;
mod http;
mod install;
pub mod manifest;
mod sources;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

/// Idempotent download cache and release-tag sanitising.
pub use cache::{AssetCache, sanitize_tag};
/// Archive-versus-device classification.
pub use classify::CandidateClassifier;
/// One check cycle guarded against overlapping runs.
pub use coordinator::{CheckOutcome, UpdateCoordinator};
/// `reqwest`-backed transport and its default timeouts.
pub use http::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, ReqwestTransport};
/// Install state machine and the events it publishes.
pub use install::{InstallOrchestrator, InstallState, OrchestratorChannels, OrchestratorEvent};
pub use manifest::{ManifestError, read_archive_manifest};
pub use sources::{DEFAULT_SOURCE_ID, RegistryError, SourceRegistry};
