//! In-memory fakes for the transport and device capabilities.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use apkup_backend::{
    CheckPreferences, DownloadError, DownloadResponse, FetchError, HttpRequest, HttpResponse,
    HttpTransport, InstallBackend, InstallError, InstallPhase, InstallReport, InstallResultSender,
    InstallStatus, InstallTarget, PackageQuery, PackageQueryError, SessionId,
};
use async_trait::async_trait;

#[derive(Clone)]
struct CannedResponse {
    status: u16,
    final_url: Option<String>,
    body: Vec<u8>,
}

/// Serves canned responses keyed by exact URL; anything else is a 404.
#[derive(Default)]
pub struct FakeTransport {
    routes: HashMap<String, CannedResponse>,
    failures: HashMap<String, String>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(mut self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.routes.insert(
            url.to_string(),
            CannedResponse {
                status,
                final_url: None,
                body: body.into(),
            },
        );
        self
    }

    /// Like [`Self::with_response`] but reports `final_url` as the address
    /// reached after redirects.
    #[must_use]
    pub fn with_redirect(
        mut self,
        url: &str,
        final_url: &str,
        status: u16,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.routes.insert(
            url.to_string(),
            CannedResponse {
                status,
                final_url: Some(final_url.to_string()),
                body: body.into(),
            },
        );
        self
    }

    /// Requests to `url` fail at the transport level.
    #[must_use]
    pub fn with_failure(mut self, url: &str, details: &str) -> Self {
        self.failures.insert(url.to_string(), details.to_string());
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.requests().len()
    }

    fn respond(&self, request: &HttpRequest) -> Result<CannedResponse, String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(details) = self.failures.get(&request.url) {
            return Err(details.clone());
        }
        Ok(self
            .routes
            .get(&request.url)
            .cloned()
            .unwrap_or(CannedResponse {
                status: 404,
                final_url: None,
                body: Vec::new(),
            }))
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let canned = self
            .respond(request)
            .map_err(|details| FetchError::network_request("http get", details))?;
        Ok(HttpResponse {
            status: canned.status,
            final_url: canned.final_url.unwrap_or_else(|| request.url.clone()),
            body: canned.body,
        })
    }

    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadResponse, DownloadError> {
        let canned = self
            .respond(request)
            .map_err(|details| DownloadError::transfer(request.url.clone(), details))?;
        if !(200..300).contains(&canned.status) {
            return Ok(DownloadResponse {
                status: canned.status,
                bytes_written: 0,
            });
        }
        tokio::fs::write(dest, &canned.body)
            .await
            .map_err(|error| DownloadError::io(dest, &error))?;
        Ok(DownloadResponse {
            status: canned.status,
            bytes_written: canned.body.len() as u64,
        })
    }
}

/// A scriptable device implementing both package query and install.
pub struct FakeDevice {
    installed: Mutex<HashMap<String, u64>>,
    fail_queries: bool,
    fail_phase: Option<InstallPhase>,
    commit_status: Mutex<InstallStatus>,
    uninstall_removes: bool,
    next_session: AtomicU32,
    written: Mutex<Vec<u64>>,
    abandoned: Mutex<Vec<SessionId>>,
    uninstalled: Mutex<Vec<String>>,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            installed: Mutex::new(HashMap::new()),
            fail_queries: false,
            fail_phase: None,
            commit_status: Mutex::new(InstallStatus::Success),
            uninstall_removes: true,
            next_session: AtomicU32::new(1),
            written: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            uninstalled: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_installed(self, package: &str, version_code: u64) -> Self {
        if let Ok(mut installed) = self.installed.lock() {
            installed.insert(package.to_string(), version_code);
        }
        self
    }

    #[must_use]
    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    #[must_use]
    pub fn failing_at(mut self, phase: InstallPhase) -> Self {
        self.fail_phase = Some(phase);
        self
    }

    #[must_use]
    pub fn with_commit_status(self, status: InstallStatus) -> Self {
        self.set_commit_status(status);
        self
    }

    #[must_use]
    pub fn uninstall_keeps_package(mut self) -> Self {
        self.uninstall_removes = false;
        self
    }

    pub fn set_commit_status(&self, status: InstallStatus) {
        if let Ok(mut current) = self.commit_status.lock() {
            *current = status;
        }
    }

    pub fn created_sessions(&self) -> u32 {
        self.next_session.load(Ordering::SeqCst) - 1
    }

    pub fn written_bytes(&self) -> Vec<u64> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn abandoned_sessions(&self) -> Vec<SessionId> {
        self.abandoned.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn uninstalled(&self) -> Vec<String> {
        self.uninstalled.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn fail(&self, phase: InstallPhase) -> Result<(), InstallError> {
        if self.fail_phase == Some(phase) {
            Err(InstallError::session(phase, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PackageQuery for FakeDevice {
    async fn installed_version_code(
        &self,
        package: &str,
    ) -> Result<Option<u64>, PackageQueryError> {
        if self.fail_queries {
            return Err(PackageQueryError::DeviceUnavailable {
                details: "no device attached".to_string(),
            });
        }
        Ok(self
            .installed
            .lock()
            .ok()
            .and_then(|installed| installed.get(package).copied()))
    }
}

#[async_trait]
impl InstallBackend for FakeDevice {
    async fn create_session(
        &self,
        _size: u64,
        _package_hint: Option<&str>,
    ) -> Result<SessionId, InstallError> {
        self.fail(InstallPhase::Create)?;
        Ok(SessionId(self.next_session.fetch_add(1, Ordering::SeqCst)))
    }

    async fn write_session(
        &self,
        _session: SessionId,
        file: &Path,
        size: u64,
    ) -> Result<(), InstallError> {
        self.fail(InstallPhase::Write)?;
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|error| InstallError::session(InstallPhase::Write, error.to_string()))?;
        if bytes.len() as u64 != size {
            return Err(InstallError::session(InstallPhase::Write, "size mismatch"));
        }
        if let Ok(mut written) = self.written.lock() {
            written.push(size);
        }
        Ok(())
    }

    async fn commit_session(
        &self,
        session: SessionId,
        target: InstallTarget,
        results: InstallResultSender,
    ) -> Result<(), InstallError> {
        self.fail(InstallPhase::Commit)?;
        let status = self
            .commit_status
            .lock()
            .map(|status| status.clone())
            .unwrap_or(InstallStatus::Success);
        let _ = results.send(InstallReport {
            session,
            package_name: target.package_hint,
            file_path: target.file_path,
            status,
        });
        Ok(())
    }

    async fn abandon_session(&self, session: SessionId) {
        if let Ok(mut abandoned) = self.abandoned.lock() {
            abandoned.push(session);
        }
    }

    async fn request_uninstall(&self, package: &str) -> Result<(), InstallError> {
        if let Ok(mut uninstalled) = self.uninstalled.lock() {
            uninstalled.push(package.to_string());
        }
        if self.uninstall_removes
            && let Ok(mut installed) = self.installed.lock()
        {
            installed.remove(package);
        }
        Ok(())
    }
}

/// Preferences kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    pub selected_source_id: Option<String>,
    pub last_seen_tags: HashMap<String, String>,
}

impl CheckPreferences for MemoryPreferences {
    fn selected_source_id(&self) -> Option<String> {
        self.selected_source_id.clone()
    }

    fn last_seen_tag(&self, source_id: &str) -> Option<String> {
        self.last_seen_tags.get(source_id).cloned()
    }

    fn set_last_seen_tag(&mut self, source_id: &str, tag: &str) {
        self.last_seen_tags
            .insert(source_id.to_string(), tag.to_string());
    }
}

const VERSION_CODE_ID: u32 = 0x0101_021b;
const VERSION_CODE_MAJOR_ID: u32 = 0x0101_0576;

/// Builds a compiled manifest document with just a root `manifest` element.
pub struct ManifestFixture {
    package: String,
    version_code: u32,
    version_code_major: Option<u32>,
    utf8: bool,
}

impl ManifestFixture {
    #[must_use]
    pub fn new(package: &str, version_code: u32) -> Self {
        Self {
            package: package.to_string(),
            version_code,
            version_code_major: None,
            utf8: false,
        }
    }

    #[must_use]
    pub fn with_major(mut self, major: u32) -> Self {
        self.version_code_major = Some(major);
        self
    }

    #[must_use]
    pub fn utf8(mut self) -> Self {
        self.utf8 = true;
        self
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Resource-mapped attribute names come first so their indices line up
        // with the resource map.
        let strings = [
            "versionCode",
            "versionCodeMajor",
            "package",
            "manifest",
            self.package.as_str(),
        ];

        let mut attributes = vec![(0, 0x10_u8, self.version_code, u32::MAX)];
        if let Some(major) = self.version_code_major {
            attributes.push((1, 0x10, major, u32::MAX));
        }
        attributes.push((2, 0x03, 4, 4));

        let mut body = string_pool(&strings, self.utf8);
        body.extend(chunk(0x0180, 8, &words(&[VERSION_CODE_ID, VERSION_CODE_MAJOR_ID])));
        body.extend(start_element(3, &attributes));

        chunk(0x0003, 8, &body)
    }
}

/// Serialises a compiled manifest into a minimal APK at `path`.
///
/// # Errors
/// Returns an error when the archive cannot be written.
pub fn write_test_apk(path: &Path, package: &str, version_code: u32) -> std::io::Result<()> {
    std::fs::write(path, test_apk_bytes(package, version_code)?)
}

/// The bytes of a minimal APK declaring `package` at `version_code`.
///
/// # Errors
/// Returns an error when the archive cannot be assembled.
pub fn test_apk_bytes(package: &str, version_code: u32) -> std::io::Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("AndroidManifest.xml", options)
        .map_err(std::io::Error::other)?;
    writer.write_all(&ManifestFixture::new(package, version_code).encode())?;
    writer
        .start_file("classes.dex", options)
        .map_err(std::io::Error::other)?;
    writer.write_all(b"dex\n035\0")?;
    Ok(writer
        .finish()
        .map_err(std::io::Error::other)?
        .into_inner())
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn chunk(chunk_type: u16, header_size: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend(chunk_type.to_le_bytes());
    out.extend(header_size.to_le_bytes());
    out.extend(((payload.len() + 8) as u32).to_le_bytes());
    out.extend(payload);
    out
}

fn string_pool(strings: &[&str], utf8: bool) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut data = Vec::new();
    for value in strings {
        offsets.push(data.len() as u32);
        if utf8 {
            data.push(value.encode_utf16().count() as u8);
            data.push(value.len() as u8);
            data.extend(value.as_bytes());
            data.push(0);
        } else {
            let units: Vec<u16> = value.encode_utf16().collect();
            data.extend((units.len() as u16).to_le_bytes());
            for unit in units {
                data.extend(unit.to_le_bytes());
            }
            data.extend([0, 0]);
        }
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }

    let header_size = 28_u32;
    let strings_start = header_size + 4 * strings.len() as u32;
    let flags = if utf8 { 0x100 } else { 0 };

    let mut payload = words(&[strings.len() as u32, 0, flags, strings_start, 0]);
    payload.extend(words(&offsets));
    payload.extend(data);
    chunk(0x0001, 28, &payload)
}

fn start_element(name: u32, attributes: &[(u32, u8, u32, u32)]) -> Vec<u8> {
    let mut payload = words(&[1, u32::MAX, u32::MAX, name]);
    payload.extend(20_u16.to_le_bytes());
    payload.extend(20_u16.to_le_bytes());
    payload.extend((attributes.len() as u16).to_le_bytes());
    payload.extend([0_u8; 6]);
    for &(attribute_name, data_type, data, raw) in attributes {
        payload.extend(words(&[u32::MAX, attribute_name, raw]));
        payload.extend(8_u16.to_le_bytes());
        payload.push(0);
        payload.push(data_type);
        payload.extend(data.to_le_bytes());
    }
    chunk(0x0102, 16, &payload)
}
