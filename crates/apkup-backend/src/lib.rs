mod error;
mod traits;
mod types;

pub use error::{
    CheckError, DownloadError, FetchError, InstallError, InstallPhase, NetworkStage,
    PackageQueryError, response_snippet,
};
pub use traits::{
    CheckPreferences, DownloadResponse, HttpRequest, HttpResponse, HttpTransport, InstallBackend,
    InstallResultSender, PackageQuery, ReleaseFetcher,
};
pub use types::{
    AppLabel, ArchiveManifest, AssetDescriptor, CheckResult, DownloadedCandidate, InstallReport,
    InstallStatus, InstallTarget, NO_RELEASE_TAG, ReleaseDescriptor, SessionId, SourceConnection,
    SourceKind, UNKNOWN_SIZE, UpdateAction, UpdateSource,
};
