use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Erst - browse a git working copy as it was on any date
///
/// Paths under the mount that contain a date component such as
/// `2014-01-06` or `2014-01-06T12:00:00` show the repository as of that
/// moment, read-only. Everything else is the live working copy, and every
/// change made through it is committed.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory under git control to serve (initialized if needed)
    #[arg(value_name = "ROOT")]
    pub root: PathBuf,

    /// Where to mount the filesystem
    #[arg(value_name = "MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Optional log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Configuration file (default: ~/.config/erst/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Timeout for each git invocation in seconds, 0 for none
    #[arg(long, value_name = "SECS")]
    pub vcs_timeout: Option<u64>,

    /// Allow other users to access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Unmount the filesystem on Ctrl+C
    #[arg(long)]
    pub unmount_on_exit: bool,
}

impl Cli {
    /// Fold command-line overrides into a loaded configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(secs) = self.vcs_timeout {
            config.vcs.timeout_secs = secs;
        }
        if self.allow_other {
            config.mount.allow_other = true;
        }
    }
}
