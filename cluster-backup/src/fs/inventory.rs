//! In-memory inventory of the data directory for one backup session.
//!
//! Entries are sorted by logical path once, at construction, and never
//! reordered afterwards; lookups by path are binary searches over that order.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

use crate::fs::metadata::{FileEntry, WriteSize};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::{BackupError, Result};

/// Directories that hold database objects.
pub const DATAFILE_DIRS: [&str; 3] = ["base", "global", "pg_tblspc"];

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Whole seconds since the epoch, negative before it.
pub fn epoch_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs_f64().ceil() as i64),
    }
}

/// Whether a regular file at `rel_path` may hold relation pages.
///
/// The path must start with one of [`DATAFILE_DIRS`] and the file name must
/// start with a decimal digit.
pub fn is_datafile_candidate(rel_path: &str) -> bool {
    let Some((top, _)) = rel_path.split_once('/') else {
        return false;
    };
    if !DATAFILE_DIRS.contains(&top) {
        return false;
    }

    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    name.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[derive(Debug, Default)]
pub struct FileInventory {
    entries: Vec<FileEntry>,
}

impl FileInventory {
    /// List and classify everything under `root`.
    pub fn scan(root: &Path, options: &WalkOptions) -> Result<Self> {
        let mut entries = walk_directory(root, options)?;
        for entry in entries.iter_mut() {
            entry.is_datafile = entry.is_regular() && is_datafile_candidate(&entry.rel_path);
        }
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, rel_path: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.rel_path.as_str().cmp(rel_path))
            .ok()
    }

    pub fn get(&self, rel_path: &str) -> Option<&FileEntry> {
        self.position(rel_path).map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, rel_path: &str) -> Option<&mut FileEntry> {
        self.position(rel_path).map(move |i| &mut self.entries[i])
    }

    /// Entries in ascending path order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [FileEntry] {
        &mut self.entries
    }

    /// Fail if any entry was modified after `now`.
    pub fn check_clock(&self, now: SystemTime) -> Result<()> {
        let now = epoch_secs(now);
        match self.entries.iter().find(|e| e.mtime > now) {
            Some(entry) => Err(BackupError::ClockSkew {
                path: entry.rel_path.clone(),
                mtime: entry.mtime,
                now,
            }),
            None => Ok(()),
        }
    }

    /// Bytes of source data covered by the backup: bytes read for page-level
    /// backups, file sizes otherwise.
    pub fn data_bytes(&self, page_level: bool) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.is_regular())
            .map(|e| if page_level { e.read_size } else { e.size })
            .sum()
    }

    /// `(copied, skipped)` counts of regular files.
    pub fn copy_counts(&self) -> (usize, usize) {
        self.entries
            .iter()
            .filter(|e| e.is_regular())
            .fold((0, 0), |(copied, skipped), e| match e.write_size {
                WriteSize::Written(_) => (copied + 1, skipped),
                WriteSize::Skipped => (copied, skipped + 1),
                WriteSize::Pending => (copied, skipped),
            })
    }
}

/// Block until the wall clock has moved past the second `mtime`.
///
/// Returns the first sampled time past the boundary.
pub async fn wait_past_mtime(
    clock: &dyn Clock,
    mtime: i64,
    cancel: &CancellationToken,
) -> Result<SystemTime> {
    loop {
        let now = clock.now();
        if epoch_secs(now) > mtime {
            return Ok(now);
        }

        let subsec = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let nap = Duration::from_nanos(1_000_000_000 - subsec as u64);

        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = cancel.cancelled() => {
                return Err(BackupError::Interrupted("during backup"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::FileKind;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn entry(rel: &str, mtime: i64) -> FileEntry {
        let mut e = FileEntry::new(PathBuf::from("/pgdata").join(rel), rel.to_string(), FileKind::File);
        e.mtime = mtime;
        e
    }

    /// Clock that advances by a fixed step on every read.
    struct SteppingClock {
        now: Mutex<SystemTime>,
        step: Duration,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> SystemTime {
            let mut now = self.now.lock().unwrap();
            let current = *now;
            *now += self.step;
            current
        }
    }

    #[test]
    fn test_datafile_classification() {
        assert!(is_datafile_candidate("base/1/100"));
        assert!(is_datafile_candidate("base/1/100.1"));
        assert!(is_datafile_candidate("global/1262"));
        assert!(is_datafile_candidate("pg_tblspc/16400/PG_9.5_201510051/16384/16401"));

        assert!(!is_datafile_candidate("postgresql.conf"));
        assert!(!is_datafile_candidate("base/1/pg_filenode.map"));
        assert!(!is_datafile_candidate("global/pg_control"));
        assert!(!is_datafile_candidate("pg_clog/0000"));
        assert!(!is_datafile_candidate("basement/1/100"));
        assert!(!is_datafile_candidate("1234"));
    }

    #[test]
    fn test_scan_flags_only_datafiles() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("base/1"))?;
        fs::write(temp_dir.path().join("base/1/100"), vec![0u8; 8192])?;
        fs::write(temp_dir.path().join("postgresql.conf"), b"port = 5432\n")?;

        let inventory = FileInventory::scan(temp_dir.path(), &WalkOptions::default())?;
        let flagged: Vec<&str> = inventory
            .entries()
            .iter()
            .filter(|e| e.is_datafile)
            .map(|e| e.rel_path.as_str())
            .collect();
        assert_eq!(flagged, vec!["base/1/100"]);
        assert!(!inventory.get("base/1").unwrap().is_datafile);
        Ok(())
    }

    #[test]
    fn test_entries_sorted_and_searchable() {
        let inventory = FileInventory::from_entries(vec![
            entry("global/1262", 1),
            entry("base/1/100", 1),
            entry("base/1/100.1", 1),
            entry("PG_VERSION", 1),
        ]);

        let paths: Vec<&str> = inventory.entries().iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["PG_VERSION", "base/1/100", "base/1/100.1", "global/1262"]);
        assert!(inventory.get("base/1/100.1").is_some());
        assert!(inventory.get("base/1/101").is_none());
    }

    #[test]
    fn test_clock_skew_detected() {
        let inventory = FileInventory::from_entries(vec![entry("a", 100), entry("b", 205)]);
        let now = UNIX_EPOCH + Duration::from_secs(200);

        match inventory.check_clock(now) {
            Err(BackupError::ClockSkew { path, mtime, now }) => {
                assert_eq!(path, "b");
                assert_eq!(mtime, 205);
                assert_eq!(now, 200);
            }
            other => panic!("expected clock skew, got {:?}", other),
        }

        assert!(inventory.check_clock(UNIX_EPOCH + Duration::from_secs(205)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_past_mtime_blocks_until_next_second() -> Result<()> {
        let clock = SteppingClock {
            now: Mutex::new(UNIX_EPOCH + Duration::from_millis(1_000_250)),
            step: Duration::from_millis(400),
        };
        let cancel = CancellationToken::new();

        let now = wait_past_mtime(&clock, 1000, &cancel).await?;
        assert!(epoch_secs(now) > 1000);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_past_mtime_returns_immediately_when_past() -> Result<()> {
        let clock = SteppingClock {
            now: Mutex::new(UNIX_EPOCH + Duration::from_secs(2000)),
            step: Duration::ZERO,
        };
        let now = wait_past_mtime(&clock, 1999, &CancellationToken::new()).await?;
        assert_eq!(epoch_secs(now), 2000);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_past_mtime_is_cancellable() {
        let clock = SteppingClock {
            now: Mutex::new(UNIX_EPOCH + Duration::from_secs(1000)),
            step: Duration::ZERO,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = wait_past_mtime(&clock, 1000, &cancel).await;
        assert!(matches!(result, Err(BackupError::Interrupted(_))));
    }

    #[test]
    fn test_data_bytes_accounting() {
        let mut a = entry("base/1/100", 1);
        a.size = 16384;
        a.read_size = 8192;
        let mut dir = entry("base/1", 1);
        dir.kind = FileKind::Dir;
        dir.size = 4096;

        let inventory = FileInventory::from_entries(vec![a, dir]);
        assert_eq!(inventory.data_bytes(false), 16384);
        assert_eq!(inventory.data_bytes(true), 8192);
    }
}
