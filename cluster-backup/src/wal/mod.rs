//! Write-ahead log positions and segment naming.
//!
//! An [`Lsn`] is a 64-bit byte offset into the WAL stream, printed by the
//! server as two 32-bit hexadecimal words separated by `/`. Segment numbers
//! and archive-status marker names are derived from it the same way the
//! server does, so the engine can observe archiver progress.

pub mod archive;
pub mod pagemap;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Timeline identifier.
pub type TimeLineId = u32;

/// Size of one WAL segment file (16 MiB).
pub const XLOG_SEG_SIZE: u64 = 16 * 1024 * 1024;

/// WAL page size expected by this engine.
pub const XLOG_BLCKSZ: u32 = 8192;

/// Directory holding WAL segments, relative to the data directory.
pub const XLOGDIR: &str = "pg_xlog";

const SEGMENTS_PER_XLOGID: u64 = 0x1_0000_0000 / XLOG_SEG_SIZE;

/// A position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid (zero) position, also used as "unbounded".
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn from_parts(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    /// Number of the WAL segment containing this position.
    pub fn segment(self) -> u64 {
        self.0 / XLOG_SEG_SIZE
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.hi(), self.lo())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(pub String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN \"{}\"", self.0)
    }
}

impl std::error::Error for ParseLsnError {}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseLsnError(s.to_string());
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn::from_parts(hi, lo))
    }
}

/// File name of a WAL segment on the given timeline.
pub fn xlog_file_name(tli: TimeLineId, segno: u64) -> String {
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        segno / SEGMENTS_PER_XLOGID,
        segno % SEGMENTS_PER_XLOGID
    )
}

/// Path of the `.ready` marker that exists while the segment holding `lsn`
/// is waiting to be archived.
pub fn archive_ready_path(pgdata: &Path, tli: TimeLineId, lsn: Lsn) -> PathBuf {
    pgdata
        .join(XLOGDIR)
        .join("archive_status")
        .join(format!("{}.ready", xlog_file_name(tli, lsn.segment())))
}

/// Path of the history file describing the ancestors of `tli`.
pub fn history_file_path(pgdata: &Path, tli: TimeLineId) -> PathBuf {
    pgdata.join(XLOGDIR).join(format!("{:08X}.history", tli))
}
