use apkup_backend::InstallStatus;

/// Version code from `dumpsys package <name>` output, `None` when the package
/// is not installed.
pub(crate) fn parse_version_code(dumpsys: &str) -> Option<u64> {
    dumpsys
        .split_whitespace()
        .find_map(|token| token.strip_prefix("versionCode="))
        .and_then(|value| value.parse().ok())
}

/// Session id from `Success: created install session [1234]`.
pub(crate) fn parse_session_id(output: &str) -> Option<u32> {
    let line = output.lines().find(|line| line.contains("install session"))?;
    let start = line.find('[')? + 1;
    let end = start + line[start..].find(']')?;
    line[start..end].trim().parse().ok()
}

/// Outcome of `pm install-commit` or `pm uninstall`.
pub(crate) fn parse_pm_outcome(stdout: &str, stderr: &str) -> InstallStatus {
    if stdout.lines().any(|line| line.trim() == "Success") {
        return InstallStatus::Success;
    }

    let text = if stdout.trim().is_empty() { stderr } else { stdout };
    let message = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Failure"))
        .map(|line| {
            match (line.find('['), line.rfind(']')) {
                (Some(open), Some(close)) if close > open => line[open + 1..close].to_string(),
                _ => line.trim_start_matches("Failure").trim().to_string(),
            }
        })
        .or_else(|| {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

    InstallStatus::Failure { message }
}

/// Version number from `adb version`.
pub(crate) fn parse_adb_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Android Debug Bridge version "))
        .map(|version| version.trim().to_string())
}

/// Android package names are dot-separated identifiers.
pub(crate) fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

#[cfg(test)]
mod tests {
    use apkup_backend::InstallStatus;

    use super::{
        is_valid_package_name, parse_adb_version, parse_pm_outcome, parse_session_id,
        parse_version_code,
    };

    const DUMPSYS: &str = "\
Packages:
  Package [com.example.app] (5c1a2f3):
    userId=10234
    pkg=Package{1e3c0a5 com.example.app}
    versionCode=40213 minSdk=24 targetSdk=34
    versionName=4.2.13
";

    #[test]
    fn version_code_is_read_from_dumpsys() {
        assert_eq!(parse_version_code(DUMPSYS), Some(40213));
    }

    #[test]
    fn missing_package_has_no_version_code() {
        assert_eq!(
            parse_version_code("Unable to find package: com.example.missing\n"),
            None
        );
        assert_eq!(parse_version_code(""), None);
    }

    #[test]
    fn session_id_is_read_from_create_output() {
        assert_eq!(
            parse_session_id("Success: created install session [1482203]\n"),
            Some(1_482_203)
        );
        assert_eq!(parse_session_id("Error: java.lang.SecurityException"), None);
    }

    #[test]
    fn pm_outcome_distinguishes_success_and_failure() {
        assert_eq!(parse_pm_outcome("Success\n", ""), InstallStatus::Success);
        assert_eq!(
            parse_pm_outcome(
                "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: signatures do not match]\n",
                ""
            ),
            InstallStatus::Failure {
                message: Some(
                    "INSTALL_FAILED_UPDATE_INCOMPATIBLE: signatures do not match".to_string()
                )
            }
        );
        assert_eq!(
            parse_pm_outcome("", "adb: failed to run\n"),
            InstallStatus::Failure {
                message: Some("adb: failed to run".to_string())
            }
        );
        assert_eq!(
            parse_pm_outcome("", ""),
            InstallStatus::Failure { message: None }
        );
    }

    #[test]
    fn adb_version_is_extracted() {
        let output = "Android Debug Bridge version 1.0.41\nVersion 35.0.1-11580240\n";
        assert_eq!(parse_adb_version(output).as_deref(), Some("1.0.41"));
        assert_eq!(parse_adb_version("garbage"), None);
    }

    #[test]
    fn package_names_are_validated() {
        assert!(is_valid_package_name("com.example.app_2"));
        assert!(!is_valid_package_name(""));
        assert!(!is_valid_package_name("com.example; rm -rf /"));
        assert!(!is_valid_package_name(".hidden"));
    }
}
