pub mod cli;
pub mod config;
pub mod filesystems;
pub mod selector;
pub mod vcs;

pub use config::{CommitFailurePolicy, Config, ConfigError};
pub use filesystems::{FilesystemGateway, FsError, TimeTravelFS};
pub use selector::{split_virtual_path, RevisionSelector, SelectorError};
pub use vcs::{GitStore, RevisionStore, VcsError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
