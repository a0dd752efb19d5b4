//! Control file validation.
//!
//! `global/pg_control` is a fixed-size file whose leading bytes hold the
//! `ControlFileData` structure followed by a CRC-32C of everything before
//! the checksum field. Only the fields this engine needs are decoded.

use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use thiserror::Error;

use crate::wal::{Lsn, TimeLineId};
use crate::Result;

/// On-disk size of the control file.
pub const PG_CONTROL_SIZE: usize = 8192;

/// Location of the control file relative to the data directory.
pub const PG_CONTROL_PATH: &str = "global/pg_control";

// Byte offsets within ControlFileData (9.5 layout, 64-bit).
const OFF_SYSTEM_IDENTIFIER: usize = 0;
const OFF_CONTROL_VERSION: usize = 8;
const OFF_CATALOG_VERSION: usize = 12;
const OFF_CHECKPOINT: usize = 32;
const OFF_CHECKPOINT_COPY: usize = 48;
const OFF_THIS_TIMELINE: usize = OFF_CHECKPOINT_COPY + 8;
const OFF_BLCKSZ: usize = 216;
const OFF_RELSEG_SIZE: usize = 220;
const OFF_XLOG_BLCKSZ: usize = 224;
const OFF_XLOG_SEG_SIZE: usize = 228;

/// Offset of the `crc` field; the checksum covers `[0, OFF_CRC)`.
pub const OFF_CRC: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlFileError {
    #[error("unexpected control file size {actual}, expected {expected}")]
    SizeMismatch { actual: usize, expected: usize },

    #[error("unexpected control file CRC {actual:08X}, expected {expected:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Decoded subset of the control structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    pub system_identifier: u64,
    pub control_version: u32,
    pub catalog_version: u32,
    pub checkpoint: Lsn,
    /// Timeline of the last checkpoint (`checkPointCopy.ThisTimeLineID`).
    pub timeline: TimeLineId,
    pub block_size: u32,
    pub relseg_size: u32,
    pub wal_block_size: u32,
    pub wal_segment_size: u32,
    pub crc: u32,
}

impl ControlFile {
    /// Verify size and checksum of a raw control file and decode it.
    pub fn parse(buf: &[u8]) -> std::result::Result<Self, ControlFileError> {
        if buf.len() != PG_CONTROL_SIZE {
            return Err(ControlFileError::SizeMismatch {
                actual: buf.len(),
                expected: PG_CONTROL_SIZE,
            });
        }

        let stored = LittleEndian::read_u32(&buf[OFF_CRC..OFF_CRC + 4]);
        let computed = crc32c::crc32c(&buf[..OFF_CRC]);
        if stored != computed {
            return Err(ControlFileError::ChecksumMismatch {
                expected: computed,
                actual: stored,
            });
        }

        let u32_at = |off: usize| LittleEndian::read_u32(&buf[off..off + 4]);

        Ok(Self {
            system_identifier: LittleEndian::read_u64(&buf[OFF_SYSTEM_IDENTIFIER..]),
            control_version: u32_at(OFF_CONTROL_VERSION),
            catalog_version: u32_at(OFF_CATALOG_VERSION),
            checkpoint: Lsn(LittleEndian::read_u64(&buf[OFF_CHECKPOINT..])),
            timeline: u32_at(OFF_THIS_TIMELINE),
            block_size: u32_at(OFF_BLCKSZ),
            relseg_size: u32_at(OFF_RELSEG_SIZE),
            wal_block_size: u32_at(OFF_XLOG_BLCKSZ),
            wal_segment_size: u32_at(OFF_XLOG_SEG_SIZE),
            crc: stored,
        })
    }

    /// Read and validate the control file of the cluster at `pgdata`.
    pub fn read(pgdata: &Path) -> Result<Self> {
        let buf = std::fs::read(pgdata.join(PG_CONTROL_PATH))?;
        Ok(Self::parse(&buf)?)
    }
}

/// Timeline of the last checkpoint recorded in the cluster's control file.
pub fn current_timeline(pgdata: &Path) -> Result<TimeLineId> {
    Ok(ControlFile::read(pgdata)?.timeline)
}

/// Build a valid control file image. Used by tests across the crate.
#[cfg(test)]
pub(crate) fn control_file_image(timeline: TimeLineId) -> Vec<u8> {
    let mut buf = vec![0u8; PG_CONTROL_SIZE];
    LittleEndian::write_u64(&mut buf[OFF_SYSTEM_IDENTIFIER..], 0x5F3A_11C2_0000_0001);
    LittleEndian::write_u32(&mut buf[OFF_CONTROL_VERSION..], 942);
    LittleEndian::write_u32(&mut buf[OFF_CATALOG_VERSION..], 201510051);
    LittleEndian::write_u32(&mut buf[OFF_THIS_TIMELINE..], timeline);
    LittleEndian::write_u32(&mut buf[OFF_BLCKSZ..], 8192);
    LittleEndian::write_u32(&mut buf[OFF_RELSEG_SIZE..], 131072);
    LittleEndian::write_u32(&mut buf[OFF_XLOG_BLCKSZ..], 8192);
    LittleEndian::write_u32(&mut buf[OFF_XLOG_SEG_SIZE..], 16 * 1024 * 1024);
    let crc = crc32c::crc32c(&buf[..OFF_CRC]);
    LittleEndian::write_u32(&mut buf[OFF_CRC..], crc);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_valid_control_file() {
        let control = ControlFile::parse(&control_file_image(3)).unwrap();
        assert_eq!(control.timeline, 3);
        assert_eq!(control.block_size, 8192);
        assert_eq!(control.wal_segment_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_size_mismatch() {
        let mut buf = control_file_image(1);
        buf.truncate(4096);
        assert_eq!(
            ControlFile::parse(&buf),
            Err(ControlFileError::SizeMismatch {
                actual: 4096,
                expected: PG_CONTROL_SIZE
            })
        );
    }

    #[test]
    fn test_any_flipped_byte_before_crc_fails() {
        let image = control_file_image(2);
        for offset in 0..OFF_CRC {
            let mut buf = image.clone();
            buf[offset] ^= 0x01;
            assert!(
                matches!(
                    ControlFile::parse(&buf),
                    Err(ControlFileError::ChecksumMismatch { .. })
                ),
                "flip at offset {} was not detected",
                offset
            );
        }
    }

    #[test]
    fn test_bytes_after_crc_are_not_covered() {
        let mut buf = control_file_image(2);
        buf[PG_CONTROL_SIZE - 1] = 0xFF;
        assert!(ControlFile::parse(&buf).is_ok());
    }

    #[test]
    fn test_current_timeline_from_disk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir(temp_dir.path().join("global"))?;
        std::fs::write(temp_dir.path().join(PG_CONTROL_PATH), control_file_image(7))?;

        assert_eq!(current_timeline(temp_dir.path())?, 7);
        Ok(())
    }
}
