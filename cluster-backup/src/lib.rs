//! cluster-backup library
//!
//! Point-in-time full and page-level incremental backups of a running
//! PostgreSQL cluster, synchronized with its WAL archive.

pub mod catalog;
pub mod config;
pub mod control;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod server;
pub mod session;
pub mod timeline;
pub mod transfer;
pub mod utils;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use session::{BackupContext, BackupDescriptor, BackupMode, BackupOptions, BackupSession, BackupStatus};
pub use utils::errors::{BackupError, Result};
