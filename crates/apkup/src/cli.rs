use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "apkup")]
#[command(about = "Fetch, cache and install APK releases onto an Android device", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Keep settings, cache and logs under this directory instead of the
    /// platform defaults
    #[arg(long, env = "APKUP_HOME", global = true)]
    pub root: Option<PathBuf>,

    /// Force debug logging for this run
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the configured update sources
    Sources,

    /// Make a source the active one
    Select {
        /// Source id as shown by `sources`
        id: String,
    },

    /// Fetch the latest release, download its packages and compare them with
    /// the device
    Check,

    /// Check, then install every package that is new or newer
    Sync {
        /// Answer yes to uninstall prompts
        #[arg(long, short)]
        yes: bool,
    },

    /// Install a local package file
    Install {
        file: PathBuf,

        /// Package name, enabling the uninstall and reinstall flow on failure
        #[arg(long)]
        package: Option<String>,

        /// Answer yes to uninstall prompts
        #[arg(long, short)]
        yes: bool,
    },

    /// Contact a source and print what it answered
    TestConnection {
        /// Source id, defaults to the active source
        id: Option<String>,
    },

    /// Run a check periodically until interrupted
    Watch {
        /// Seconds between checks, defaults to the configured interval
        #[arg(long)]
        interval: Option<u64>,
    },
}
