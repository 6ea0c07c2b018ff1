mod app;
mod cli;
mod error;
mod flow;
mod logging;
mod settings;
mod single_instance;

use std::process::ExitCode;

use apkup_platform::AppPaths;
use clap::Parser;

use crate::app::App;
use crate::cli::{Cli, Command};
use crate::error::AppError;
use crate::settings::AppSettings;
use crate::single_instance::SingleInstance;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error}");
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let paths = match &cli.root {
        Some(root) => AppPaths::rooted_at(root),
        None => AppPaths::new()?,
    };
    paths
        .ensure_dirs()
        .map_err(|error| AppError::io("Failed to create application directories", error))?;

    let (settings, load_error) = match AppSettings::load(&paths) {
        Ok(settings) => (settings, None),
        Err(error) => (AppSettings::default(), Some(error)),
    };
    logging::init_logging(
        &paths.log_file(),
        settings.debug_logging || cli.debug,
        settings.max_log_size_bytes,
    );
    log::info!("apkup {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(error) = load_error {
        log::warn!("{error}; using default settings");
    }

    // Listing sources is read-only and may run next to a watcher.
    let _instance = match cli.command {
        Command::Sources => None,
        _ => Some(SingleInstance::acquire(&paths.lock_file())?),
    };

    let mut app = App::new(paths, settings)?;
    app.purge_stale_downloads();
    app.run(cli.command).await
}
