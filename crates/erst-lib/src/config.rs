//! Configuration for erst
//!
//! Settings come from a TOML file (by default
//! `~/.config/erst/config.toml`); command-line flags override them.
//!
//! ```toml
//! [vcs]
//! binary = "git"
//! timeout_secs = 120
//! on_commit_failure = "fail"
//!
//! [mount]
//! fs_name = "erst"
//! allow_other = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up inside the per-user config directory
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vcs: VcsConfig,
    pub mount: MountConfig,
}

/// What happens when git refuses an add, remove or commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitFailurePolicy {
    /// The filesystem call fails with EIO
    #[default]
    Fail,
    /// Log the failure and report success
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsConfig {
    /// The git executable
    pub binary: PathBuf,
    /// Upper bound on any single git invocation; 0 disables it
    pub timeout_secs: u64,
    /// Live branch to return to if HEAD is found detached at startup.
    /// Without it, the branch saved under `erst.branch` in the repository
    /// config is used.
    pub branch: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub on_commit_failure: CommitFailurePolicy,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            timeout_secs: 120,
            branch: None,
            author_name: None,
            author_email: None,
            on_commit_failure: CommitFailurePolicy::default(),
        }
    }
}

impl VcsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub fs_name: String,
    /// Let other users see the mount (needs `user_allow_other` in /etc/fuse.conf)
    pub allow_other: bool,
    /// How long the kernel may cache attributes and entries
    pub attr_ttl_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "erst".to_string(),
            allow_other: false,
            attr_ttl_secs: 1,
        }
    }
}

impl MountConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }
}

impl Config {
    /// Default config file location, e.g. `~/.config/erst/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("erst").join(CONFIG_FILE))
    }

    /// Load from an explicit file, which must exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path` if given, else the default location if it exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(default) if default.is_file() => Self::from_file(&default),
                _ => Ok(Self::default()),
            },
        }
    }
}
