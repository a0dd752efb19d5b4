//! Timeline history resolution.
//!
//! A history file lists, one per line, each ancestor timeline and the LSN at
//! which the server switched away from it:
//!
//! ```text
//! # comment
//! 1	0/16000000	no recovery target specified
//! 3	0/20000000	before 2000-01-01 00:00:00+00
//! ```
//!
//! Resolving a timeline yields those ancestors as contiguous LSN ranges,
//! followed by an open-ended range for the timeline itself.

use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::wal::{history_file_path, Lsn, TimeLineId};
use crate::Result;

/// One contiguous stretch of WAL belonging to a single timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineId,
    /// Switch point into this timeline ([`Lsn::INVALID`] for the first entry).
    pub begin: Lsn,
    /// Switch point out of this timeline, [`Lsn::INVALID`] when still open.
    pub end: Lsn,
}

impl TimelineHistoryEntry {
    pub fn is_open(&self) -> bool {
        !self.end.is_valid()
    }

    /// Whether `lsn` falls into this entry's range.
    pub fn contains(&self, lsn: Lsn) -> bool {
        lsn >= self.begin && (self.is_open() || lsn < self.end)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("syntax error in history file: {line}: expected a numeric timeline ID")]
    ExpectedTimeline { line: String },

    #[error("syntax error in history file: {line}: expected a transaction log switchpoint location")]
    ExpectedSwitchpoint { line: String },

    #[error("invalid data in history file: {line}: timeline IDs must be in increasing sequence")]
    NonIncreasing { line: String },

    #[error("invalid data in history file: timeline IDs must be less than child timeline's ID {target}")]
    TargetNotNewer { target: TimeLineId },
}

/// Parse the contents of the history file of `target`.
pub fn parse_history(
    content: &str,
    target: TimeLineId,
) -> std::result::Result<Vec<TimelineHistoryEntry>, HistoryError> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut prev_end = Lsn::INVALID;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let tli: TimeLineId = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| HistoryError::ExpectedTimeline {
                line: line.to_string(),
            })?;
        let switchpoint: Lsn = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| HistoryError::ExpectedSwitchpoint {
                line: line.to_string(),
            })?;

        if entries.last().is_some_and(|last| tli <= last.tli) {
            return Err(HistoryError::NonIncreasing {
                line: line.to_string(),
            });
        }

        // the remainder of the line (reason) is ignored
        entries.push(TimelineHistoryEntry {
            tli,
            begin: prev_end,
            end: switchpoint,
        });
        prev_end = switchpoint;
    }

    if entries.last().is_some_and(|last| target <= last.tli) {
        return Err(HistoryError::TargetNotNewer { target });
    }

    entries.push(TimelineHistoryEntry {
        tli: target,
        begin: prev_end,
        end: Lsn::INVALID,
    });

    Ok(entries)
}

/// Resolve the full history of `tli` for the cluster at `pgdata`.
///
/// Timeline 1 has no history file and resolves to a single open entry.
pub fn resolve_history(pgdata: &Path, tli: TimeLineId) -> Result<Vec<TimelineHistoryEntry>> {
    let history = if tli == 1 {
        vec![TimelineHistoryEntry {
            tli,
            begin: Lsn::INVALID,
            end: Lsn::INVALID,
        }]
    } else {
        let content = std::fs::read_to_string(history_file_path(pgdata, tli))?;
        parse_history(&content, tli)?
    };

    for entry in &history {
        debug!("Timeline history: {}: {} - {}", entry.tli, entry.begin, entry.end);
    }

    Ok(history)
}

/// Index of `tli` within a resolved history.
pub fn timeline_index(history: &[TimelineHistoryEntry], tli: TimeLineId) -> Option<usize> {
    history.iter().position(|entry| entry.tli == tli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assert_contiguous(entries: &[TimelineHistoryEntry]) {
        for pair in entries.windows(2) {
            assert!(pair[0].tli < pair[1].tli);
            assert_eq!(pair[0].end, pair[1].begin);
        }
        assert!(entries.last().unwrap().is_open());
    }

    #[test]
    fn test_parse_two_ancestors() {
        let content = "1\t0/16000000\tno recovery target specified\n3\t0/20000000\treason\n";
        let entries = parse_history(content, 5).unwrap();

        assert_eq!(
            entries,
            vec![
                TimelineHistoryEntry { tli: 1, begin: Lsn(0), end: Lsn(0x1600_0000) },
                TimelineHistoryEntry { tli: 3, begin: Lsn(0x1600_0000), end: Lsn(0x2000_0000) },
                TimelineHistoryEntry { tli: 5, begin: Lsn(0x2000_0000), end: Lsn::INVALID },
            ]
        );
        assert_contiguous(&entries);
    }

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let content = "# created by failover\n\n   \n  # indented comment\n2\t0/3000000\n";
        let entries = parse_history(content, 4).unwrap();
        assert_eq!(entries.len(), 2);
        assert_contiguous(&entries);
    }

    #[test]
    fn test_parse_empty_file_gives_single_open_entry() {
        let entries = parse_history("", 2).unwrap();
        assert_eq!(
            entries,
            vec![TimelineHistoryEntry { tli: 2, begin: Lsn::INVALID, end: Lsn::INVALID }]
        );
    }

    #[test]
    fn test_parse_contiguity_over_many_entries() {
        let content: String = (1..20u32)
            .map(|tli| format!("{}\t{:X}/{:08X}\n", tli * 2, tli, tli * 0x100))
            .collect();
        let entries = parse_history(&content, 100).unwrap();
        assert_eq!(entries.len(), 20);
        assert_contiguous(&entries);
    }

    #[test]
    fn test_missing_timeline_id() {
        assert!(matches!(
            parse_history("abc\t0/1\n", 2),
            Err(HistoryError::ExpectedTimeline { .. })
        ));
    }

    #[test]
    fn test_missing_switchpoint() {
        assert!(matches!(
            parse_history("1\n", 2),
            Err(HistoryError::ExpectedSwitchpoint { .. })
        ));
        assert!(matches!(
            parse_history("1\tnot-an-lsn\n", 2),
            Err(HistoryError::ExpectedSwitchpoint { .. })
        ));
    }

    #[test]
    fn test_non_increasing_timelines() {
        let content = "2\t0/1000000\n2\t0/2000000\n";
        assert!(matches!(
            parse_history(content, 5),
            Err(HistoryError::NonIncreasing { .. })
        ));

        let content = "3\t0/1000000\n1\t0/2000000\n";
        assert!(matches!(
            parse_history(content, 5),
            Err(HistoryError::NonIncreasing { .. })
        ));
    }

    #[test]
    fn test_target_must_be_newer() {
        let content = "1\t0/1000000\n4\t0/2000000\n";
        assert_eq!(
            parse_history(content, 4),
            Err(HistoryError::TargetNotNewer { target: 4 })
        );
    }

    #[test]
    fn test_resolve_root_timeline_without_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let history = resolve_history(temp_dir.path(), 1)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tli, 1);
        assert!(history[0].is_open());
        assert!(history[0].contains(Lsn(u64::MAX)));
        Ok(())
    }

    #[test]
    fn test_resolve_reads_history_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir(temp_dir.path().join("pg_xlog"))?;
        std::fs::write(
            temp_dir.path().join("pg_xlog/00000005.history"),
            "1\t0/16000000\n3\t0/20000000\n",
        )?;

        let history = resolve_history(temp_dir.path(), 5)?;
        assert_eq!(timeline_index(&history, 5), Some(2));
        assert_eq!(timeline_index(&history, 2), None);
        assert!(history[1].contains(Lsn(0x1600_0000)));
        assert!(!history[1].contains(Lsn(0x2000_0000)));
        Ok(())
    }
}
