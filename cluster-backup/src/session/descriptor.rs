//! Backup descriptor persisted in the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::wal::{Lsn, TimeLineId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    /// Page-level incremental against the last data backup
    #[serde(rename = "page")]
    DiffPage,
}

impl BackupMode {
    pub fn is_diff(self) -> bool {
        matches!(self, BackupMode::DiffPage)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => write!(f, "full"),
            BackupMode::DiffPage => write!(f, "page"),
        }
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "f" => Ok(BackupMode::Full),
            "page" | "p" => Ok(BackupMode::DiffPage),
            other => Err(format!("invalid backup mode \"{}\"", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Invalid,
    Running,
    Done,
    Error,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One backup attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: TimeLineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Bytes read from the cluster (full size in full mode)
    pub data_bytes: u64,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub recovery_xid: u64,
    #[serde(default)]
    pub recovery_time: Option<DateTime<Utc>>,
    pub compress: bool,
}

impl BackupDescriptor {
    pub fn new(mode: BackupMode, compress: bool, start_time: DateTime<Utc>) -> Self {
        Self {
            mode,
            status: BackupStatus::Invalid,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time,
            end_time: None,
            data_bytes: 0,
            block_size: 0,
            wal_block_size: 0,
            recovery_xid: 0,
            recovery_time: None,
            compress,
        }
    }

    /// Directory name of this backup in the catalog.
    pub fn id(&self) -> String {
        self.start_time.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Label passed to the server when the backup window opens.
    pub fn label(&self) -> String {
        format!(
            "{} with cluster-backup",
            self.start_time.format("%Y-%m-%d %H:%M:%S")
        )
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = BackupStatus::Done;
        self.end_time = Some(at);
    }

    /// Move a still running descriptor to ERROR. Returns false when the
    /// descriptor was already finalized and nothing changed.
    pub fn fail(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != BackupStatus::Running || self.end_time.is_some() {
            return false;
        }
        self.status = BackupStatus::Error;
        self.end_time = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_mode_parsing_and_serde() {
        assert_eq!("full".parse::<BackupMode>().unwrap(), BackupMode::Full);
        assert_eq!("PAGE".parse::<BackupMode>().unwrap(), BackupMode::DiffPage);
        assert!("ptrack".parse::<BackupMode>().is_err());

        assert_eq!(serde_json::to_string(&BackupMode::DiffPage).unwrap(), "\"page\"");
        assert_eq!(serde_json::to_string(&BackupStatus::Running).unwrap(), "\"RUNNING\"");
    }

    #[test]
    fn test_id_and_label_follow_start_time() {
        let desc = BackupDescriptor::new(BackupMode::Full, false, at(1_791_979_200));
        assert_eq!(desc.id(), "20261014_120000");
        assert_eq!(desc.label(), "2026-10-14 12:00:00 with cluster-backup");
    }

    #[test]
    fn test_fail_only_touches_running_descriptor() {
        let mut desc = BackupDescriptor::new(BackupMode::Full, false, at(0));
        assert!(!desc.fail(at(5)));
        assert_eq!(desc.status, BackupStatus::Invalid);

        desc.status = BackupStatus::Running;
        assert!(desc.fail(at(5)));
        assert_eq!(desc.status, BackupStatus::Error);
        assert_eq!(desc.end_time, Some(at(5)));

        // Terminal descriptors stay as they are
        assert!(!desc.fail(at(9)));
        assert_eq!(desc.end_time, Some(at(5)));

        let mut done = BackupDescriptor::new(BackupMode::Full, false, at(0));
        done.status = BackupStatus::Running;
        done.complete(at(7));
        assert!(!done.fail(at(8)));
        assert_eq!(done.status, BackupStatus::Done);
    }

    #[test]
    fn test_descriptor_json_reads_back() {
        let mut desc = BackupDescriptor::new(BackupMode::DiffPage, true, at(0));
        desc.start_lsn = Lsn::from_parts(0, 0x0300_0028);
        let json = serde_json::to_string(&desc).unwrap();
        let back: BackupDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
