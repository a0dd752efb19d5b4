//! WAL archive synchronization.
//!
//! Opening and closing a backup window are both server notifications that
//! return an LSN. Closing the window (and forcing a segment switch) must
//! also wait until the segment holding that LSN has been archived, which is
//! observed through the disappearance of its `.ready` marker.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::control;
use crate::server::{quote_literal, Connector, ControlChannel};
use crate::wal::{archive_ready_path, Lsn, TimeLineId};
use crate::{BackupError, Result};

/// Seconds to wait for a switched segment to be archived.
pub const TIMEOUT_ARCHIVE: u32 = 10;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const STOP_BACKUP_SQL: &str = "SELECT * FROM pg_stop_backup()";
pub const SWITCH_XLOG_SQL: &str = "SELECT * FROM pg_switch_xlog()";
pub const TXID_CURRENT_SQL: &str = "SELECT txid_current()";

/// State of the server right after a close or switch notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePoint {
    pub lsn: Lsn,
    pub tli: TimeLineId,
    pub recovery_xid: u64,
    pub recovery_time: DateTime<Utc>,
    /// Polls needed before the segment was archived.
    pub tries: u32,
}

pub struct ArchiveSync<'a, C> {
    connector: &'a C,
    pgdata: &'a Path,
    cancel: &'a CancellationToken,
    timeout: u32,
}

impl<'a, C: Connector> ArchiveSync<'a, C> {
    pub fn new(connector: &'a C, pgdata: &'a Path, cancel: &'a CancellationToken) -> Self {
        Self {
            connector,
            pgdata,
            cancel,
            timeout: TIMEOUT_ARCHIVE,
        }
    }

    /// Announce the start of a backup. A smooth start waits for a regular
    /// checkpoint instead of forcing an immediate one.
    pub async fn start_backup(&self, label: &str, smooth: bool) -> Result<Lsn> {
        let sql = format!(
            "SELECT pg_start_backup({}, {})",
            quote_literal(label),
            if smooth { "false" } else { "true" }
        );

        let mut channel = self.connector.connect().await?;
        let result = channel.query(&sql).await?;
        let lsn = parse_lsn(result.single_value("pg_start_backup()")?)?;
        channel.close().await?;

        info!("pg_start_backup(): lsn={}", lsn);
        Ok(lsn)
    }

    /// Announce the end of the backup and wait for its last segment.
    pub async fn stop_backup(&self) -> Result<ArchivePoint> {
        self.wait_for_archive(STOP_BACKUP_SQL).await
    }

    /// Force a segment switch and wait for the finished segment.
    pub async fn switch_xlog(&self) -> Result<ArchivePoint> {
        self.wait_for_archive(SWITCH_XLOG_SQL).await
    }

    /// Run `sql`, which must return an LSN, then block until the segment
    /// containing it has been archived.
    pub async fn wait_for_archive(&self, sql: &str) -> Result<ArchivePoint> {
        let mut channel = self.connector.connect().await?;
        let result = channel.query(sql).await?;
        let lsn = parse_lsn(result.single_value(sql)?)?;

        // Read the timeline here: this also runs from cleanup, without a
        // descriptor.
        let tli = control::current_timeline(self.pgdata)?;
        let ready = archive_ready_path(self.pgdata, tli, lsn);
        info!("{}: tli={} lsn={}", sql, tli, lsn);

        let xid_result = channel.query(TXID_CURRENT_SQL).await?;
        let recovery_xid = parse_xid(xid_result.single_value("txid_current()")?)?;
        let recovery_time = Utc::now();
        channel.close().await?;

        debug!("Waiting for {}", ready.display());
        let tries = wait_for_marker(&ready, self.timeout, self.cancel).await?;
        info!("{} removed after {} tries", ready.display(), tries);

        Ok(ArchivePoint {
            lsn,
            tli,
            recovery_xid,
            recovery_time,
            tries,
        })
    }
}

fn parse_lsn(value: &str) -> Result<Lsn> {
    value
        .parse()
        .map_err(|e| BackupError::Protocol(format!("result of backup command is invalid: {}", e)))
}

fn parse_xid(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::Protocol(format!("result of txid_current() is invalid: {}", value)))
}

fn marker_exists(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Poll once per second until `ready` disappears.
///
/// Returns the number of polls that still saw the marker. Fails after
/// `timeout` such polls, or as soon as `cancel` is observed after a sleep.
pub async fn wait_for_marker(ready: &Path, timeout: u32, cancel: &CancellationToken) -> Result<u32> {
    let mut tries = 0;
    while marker_exists(ready) {
        if tries >= timeout {
            return Err(BackupError::ArchiveTimeout {
                seconds: timeout as u64,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        if cancel.is_cancelled() {
            return Err(BackupError::Interrupted("during waiting for WAL archiving"));
        }
        tries += 1;
    }
    Ok(tries)
}
