//! Error kinds surfaced by a backup session.

use thiserror::Error;

use crate::control::ControlFileError;
use crate::timeline::HistoryError;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another backup is running: {0}")]
    AlreadyRunning(String),

    #[error("Incompatible server: {0}")]
    Incompatible(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Switched WAL could not be archived in {seconds} seconds")]
    ArchiveTimeout { seconds: u64 },

    #[error("Interrupted {0}")]
    Interrupted(&'static str),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Corrupted control data: {0}")]
    ControlFile(#[from] ControlFileError),

    #[error("Invalid timeline history: {0}")]
    History(#[from] HistoryError),

    #[error("Current time may be rewound, retry with full backup mode ({path} has mtime {mtime}, now {now})")]
    ClockSkew { path: String, mtime: i64, now: i64 },

    #[error("Valid full backup not found for differential backup on timeline {0}, create a full backup first")]
    BaselineNotFound(u32),

    #[error("backup_label does not exist in PGDATA")]
    BackupLabelMissing,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Process exit code reported by the binary for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::Io(_)
            | BackupError::Serialization(_)
            | BackupError::BaselineNotFound(_)
            | BackupError::BackupLabelMissing => 3,
            BackupError::AlreadyRunning(_) => 4,
            BackupError::Corrupted(_) | BackupError::ControlFile(_) | BackupError::History(_) => 5,
            BackupError::Incompatible(_) => 6,
            BackupError::Protocol(_) | BackupError::Connection(_) => 7,
            BackupError::ArchiveTimeout { .. } => 8,
            BackupError::Interrupted(_) => 9,
            BackupError::ClockSkew { .. } => 10,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
