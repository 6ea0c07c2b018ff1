use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

/// `watch` runs for days; a tiny limit would rotate on every line.
const MIN_LOG_SIZE: u64 = 64 * 1024;

/// `debug.log` becomes `debug.log.1`.
fn backup_path(log_path: &Path) -> PathBuf {
    let mut name = OsString::from(log_path.as_os_str());
    name.push(".1");
    PathBuf::from(name)
}

/// Moves the current log over the single backup.
fn rotate(log_path: &Path, backup: &Path) -> io::Result<()> {
    match std::fs::remove_file(backup) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    std::fs::rename(log_path, backup)
}

fn rotate_if_oversized(log_path: &Path, max_size: u64) -> io::Result<bool> {
    match std::fs::metadata(log_path) {
        Ok(metadata) if metadata.len() > max_size => {
            rotate(log_path, &backup_path(log_path))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

struct OpenLog {
    file: File,
    len: u64,
}

/// Appends to the log file. Once a write would push it past `max_size` the
/// file is rotated to `<name>.1`; a file deleted while running is reopened.
struct RotatingLogWriter {
    path: PathBuf,
    backup: PathBuf,
    max_size: u64,
    current: Option<OpenLog>,
}

impl RotatingLogWriter {
    fn new(path: PathBuf, max_size: u64) -> io::Result<Self> {
        let mut writer = Self {
            backup: backup_path(&path),
            path,
            max_size,
            current: None,
        };
        writer.current = Some(writer.open()?);
        Ok(writer)
    }

    fn open(&self) -> io::Result<OpenLog> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let len = file.metadata()?.len();
        Ok(OpenLog { file, len })
    }

    fn log_for(&mut self, incoming: usize) -> io::Result<&mut OpenLog> {
        if self.current.is_none() || !self.path.exists() {
            self.current = Some(self.open()?);
        }

        let needs_rotation = self
            .current
            .as_ref()
            .is_some_and(|log| log.len > 0 && log.len + incoming as u64 > self.max_size);
        if needs_rotation {
            // Closed first so the rename also works on Windows.
            self.current = None;
            rotate(&self.path, &self.backup)?;
            self.current = Some(self.open()?);
        }

        self.current
            .as_mut()
            .ok_or_else(|| io::Error::other("log file not available"))
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let log = self.log_for(buf.len())?;
        let written = log.file.write(buf)?;
        log.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(log) => log.file.flush(),
            None => Ok(()),
        }
    }
}

pub fn init_logging(log_path: &Path, debug_enabled: bool, max_log_size: u64) {
    let max_log_size = max_log_size.max(MIN_LOG_SIZE);
    // The previous run stays readable in the backup.
    let rotated = rotate_if_oversized(log_path, max_log_size).unwrap_or(false);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("apkup")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    match RotatingLogWriter::new(log_path.to_path_buf(), max_log_size) {
        Ok(writer) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, writer)),
        Err(error) => eprintln!("Log file {} unavailable: {error}", log_path.display()),
    }

    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }

    set_logging_enabled(debug_enabled);

    if rotated {
        log::info!("Previous log moved to {}", backup_path(log_path).display());
    }
    if debug_enabled {
        log::info!("Debug logging to {}", log_path.display());
    }
}

/// Debug output when enabled; warnings and errors are always recorded.
pub fn set_logging_enabled(enabled: bool) {
    if enabled {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Warn);
    }
}
