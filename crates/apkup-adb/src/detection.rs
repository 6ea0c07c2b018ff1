use std::path::{Path, PathBuf};

use apkup_platform::helper_command;
use log::debug;
use which::which;

use crate::parse::parse_adb_version;

#[cfg(windows)]
const ADB_BINARY: &str = "adb.exe";
#[cfg(not(windows))]
const ADB_BINARY: &str = "adb";

#[derive(Debug, Clone)]
pub struct AdbDetection {
    pub path: PathBuf,
    pub version: Option<String>,
    pub in_path: bool,
}

/// Find an `adb` binary: the configured path, then `PATH`, then the usual SDK
/// install locations.
pub async fn locate_adb(configured: Option<&Path>) -> Option<AdbDetection> {
    let in_path = which("adb").ok();
    let path = select_adb(configured, in_path.clone(), &sdk_candidates())?;
    let version = adb_version(&path).await;
    debug!("Using adb at {} (version {:?})", path.display(), version);

    Some(AdbDetection {
        in_path: in_path.as_deref() == Some(path.as_path()),
        path,
        version,
    })
}

fn select_adb(
    configured: Option<&Path>,
    in_path: Option<PathBuf>,
    candidates: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(path) = configured.filter(|path| path.is_file()) {
        return Some(path.to_path_buf());
    }
    if let Some(path) = in_path {
        return Some(path);
    }
    candidates.iter().find(|path| path.is_file()).cloned()
}

fn sdk_candidates() -> Vec<PathBuf> {
    let mut sdk_roots = Vec::new();

    for variable in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(root) = std::env::var(variable) {
            sdk_roots.push(PathBuf::from(root));
        }
    }

    if let Some(home) = dirs::home_dir() {
        #[cfg(target_os = "macos")]
        sdk_roots.push(home.join("Library").join("Android").join("sdk"));

        #[cfg(all(unix, not(target_os = "macos")))]
        sdk_roots.push(home.join("Android").join("Sdk"));
    }

    #[cfg(target_os = "windows")]
    if let Some(local_app_data) = dirs::data_local_dir() {
        sdk_roots.push(local_app_data.join("Android").join("Sdk"));
    }

    let mut paths: Vec<PathBuf> = sdk_roots
        .into_iter()
        .map(|root| root.join("platform-tools").join(ADB_BINARY))
        .collect();

    #[cfg(target_os = "macos")]
    paths.push(PathBuf::from("/opt/homebrew/bin/adb"));

    #[cfg(unix)]
    {
        paths.push(PathBuf::from("/usr/local/bin/adb"));
        paths.push(PathBuf::from("/usr/bin/adb"));
    }

    paths
}

async fn adb_version(path: &Path) -> Option<String> {
    let output = helper_command(path)
        .arg("version")
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    parse_adb_version(&String::from_utf8_lossy(&output.stdout))
}
