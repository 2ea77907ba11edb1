pub mod error;
pub mod gateway;
pub mod inodes;
pub mod resolver;
pub mod timetravel;

// Re-export key types for convenience
pub use error::{FsError, FsErrorCode, FsResult};
pub use gateway::FilesystemGateway;
pub use resolver::{CheckoutState, PathResolver, Resolution};
pub use timetravel::TimeTravelFS;
