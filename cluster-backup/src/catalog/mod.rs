//! On-disk backup catalog.
//!
//! ```text
//! <backup_path>/backup.pid
//! <backup_path>/backups/<YYYYMMDD_HHMMSS>/backup.json
//!                                         database/
//!                                         file_database.txt
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::executor::manifest::{self, Baseline};
use crate::fs::inventory::FileInventory;
use crate::session::{BackupDescriptor, BackupStatus};
use crate::wal::TimeLineId;
use crate::{BackupError, Result};

pub const LOCK_FILE: &str = "backup.pid";
pub const BACKUPS_DIR: &str = "backups";
pub const DESCRIPTOR_FILE: &str = "backup.json";
pub const DATABASE_DIR: &str = "database";
pub const DATABASE_FILE_LIST: &str = "file_database.txt";

#[derive(Debug, Clone)]
pub struct FsCatalog {
    backup_path: PathBuf,
}

/// Exclusive ownership of a catalog, released on drop.
#[derive(Debug)]
pub struct CatalogLock {
    path: PathBuf,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released catalog lock {}", self.path.display()),
            Err(e) => warn!("could not remove lock file {}: {}", self.path.display(), e),
        }
    }
}

impl FsCatalog {
    pub fn new(backup_path: impl Into<PathBuf>) -> Self {
        Self {
            backup_path: backup_path.into(),
        }
    }

    /// Take the catalog lock.
    ///
    /// A lock file left by a process that no longer exists is removed and
    /// taken over.
    pub fn lock(&self) -> Result<CatalogLock> {
        fs::create_dir_all(&self.backup_path)?;
        let path = self.backup_path.join(LOCK_FILE);

        // One retry after removing a stale lock
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!("Acquired catalog lock {}", path.display());
                    return Ok(CatalogLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                // Released between our attempts
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let pid: u32 = content.trim().parse().map_err(|_| {
                BackupError::Corrupted(format!("bogus data in lock file {}", path.display()))
            })?;

            if pid != std::process::id() && is_process_alive(pid) {
                return Err(BackupError::AlreadyRunning(format!(
                    "lock file {} is held by pid {}",
                    path.display(),
                    pid
                )));
            }

            warn!("Removing stale lock file {} (pid {})", path.display(), pid);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackupError::AlreadyRunning(format!(
            "could not acquire lock file {}",
            path.display()
        )))
    }

    pub fn backup_dir(&self, desc: &BackupDescriptor) -> PathBuf {
        self.backup_path.join(BACKUPS_DIR).join(desc.id())
    }

    pub fn database_dir(&self, desc: &BackupDescriptor) -> PathBuf {
        self.backup_dir(desc).join(DATABASE_DIR)
    }

    pub fn file_list_path(&self, desc: &BackupDescriptor) -> PathBuf {
        self.backup_dir(desc).join(DATABASE_FILE_LIST)
    }

    /// Create the directory of a new backup, failing if it already exists.
    pub fn create_backup_dir(&self, desc: &BackupDescriptor) -> Result<PathBuf> {
        fs::create_dir_all(self.backup_path.join(BACKUPS_DIR))?;
        let dir = self.backup_dir(desc);
        fs::create_dir(&dir)?;
        fs::create_dir(dir.join(DATABASE_DIR))?;
        Ok(dir)
    }

    /// Persist `desc`, replacing the previous version atomically.
    pub fn write_descriptor(&self, desc: &BackupDescriptor) -> Result<()> {
        let dir = self.backup_dir(desc);
        let tmp = dir.join(format!("{}.tmp", DESCRIPTOR_FILE));

        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut out, desc)?;
        out.write_all(b"\n")?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp, dir.join(DESCRIPTOR_FILE))?;

        debug!("Persisted backup {} as {}", desc.id(), desc.status);
        Ok(())
    }

    pub fn read_descriptor(&self, dir: &Path) -> Result<BackupDescriptor> {
        let file = File::open(dir.join(DESCRIPTOR_FILE))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Every readable backup, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupDescriptor>> {
        let root = self.backup_path.join(BACKUPS_DIR);
        let dirs = match fs::read_dir(&root) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for dir in dirs {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            match self.read_descriptor(&dir.path()) {
                Ok(desc) => backups.push(desc),
                Err(e) => warn!("Skipping backup {}: {}", dir.path().display(), e),
            }
        }

        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(backups)
    }

    /// File list of a finished backup, keyed for diffing.
    pub fn read_baseline(&self, desc: &BackupDescriptor) -> Result<Baseline> {
        let file = File::open(self.file_list_path(desc))?;
        let records = manifest::read_file_list(BufReader::new(file))?;
        info!("Loaded {} entries from backup {}", records.len(), desc.id());
        Ok(Baseline::new(records))
    }

    pub fn write_file_list(&self, desc: &BackupDescriptor, inventory: &FileInventory) -> Result<()> {
        let mut out = BufWriter::new(File::create(self.file_list_path(desc))?);
        manifest::write_file_list(&mut out, inventory.entries())?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    }
}

/// Newest successful backup taken on timeline `tli`.
///
/// `backups` must be ordered newest first, as returned by
/// [`FsCatalog::list_backups`].
pub fn last_data_backup(backups: &[BackupDescriptor], tli: TimeLineId) -> Option<&BackupDescriptor> {
    backups
        .iter()
        .find(|b| b.status == BackupStatus::Done && b.tli == tli)
}

fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BackupMode;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn descriptor(secs: i64, status: BackupStatus, tli: TimeLineId) -> BackupDescriptor {
        let mut desc = BackupDescriptor::new(BackupMode::Full, false, Utc.timestamp_opt(secs, 0).unwrap());
        desc.status = status;
        desc.tli = tli;
        desc
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let catalog = FsCatalog::new(dir.path());

        let lock = catalog.lock().unwrap();
        let content = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        let _again = catalog.lock().unwrap();
    }

    #[test]
    fn test_lock_held_by_live_process_is_refused() {
        let dir = TempDir::new().unwrap();
        // pid 1 always exists
        fs::write(dir.path().join(LOCK_FILE), "1\n").unwrap();

        let result = FsCatalog::new(dir.path()).lock();
        assert!(matches!(result, Err(BackupError::AlreadyRunning(_))));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        // Above the kernel's pid_max, so never alive
        fs::write(dir.path().join(LOCK_FILE), "2147483646\n").unwrap();

        let _lock = FsCatalog::new(dir.path()).lock().unwrap();
        let content = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_bogus_lock_content_is_corruption() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "not a pid").unwrap();
        let result = FsCatalog::new(dir.path()).lock();
        assert!(matches!(result, Err(BackupError::Corrupted(_))));
    }

    #[test]
    fn test_descriptors_are_listed_newest_first() {
        let dir = TempDir::new().unwrap();
        let catalog = FsCatalog::new(dir.path());

        for desc in [
            descriptor(100, BackupStatus::Done, 1),
            descriptor(300, BackupStatus::Error, 1),
            descriptor(200, BackupStatus::Done, 2),
        ] {
            catalog.create_backup_dir(&desc).unwrap();
            catalog.write_descriptor(&desc).unwrap();
        }
        // A directory without a descriptor is ignored
        fs::create_dir(dir.path().join(BACKUPS_DIR).join("junk")).unwrap();

        let list = catalog.list_backups().unwrap();
        let times: Vec<i64> = list.iter().map(|b| b.start_time.timestamp()).collect();
        assert_eq!(times, vec![300, 200, 100]);

        assert_eq!(last_data_backup(&list, 1).map(|b| b.start_time.timestamp()), Some(100));
        assert_eq!(last_data_backup(&list, 2).map(|b| b.start_time.timestamp()), Some(200));
        assert!(last_data_backup(&list, 3).is_none());
    }

    #[test]
    fn test_descriptor_rewrite_replaces_status() {
        let dir = TempDir::new().unwrap();
        let catalog = FsCatalog::new(dir.path());
        let mut desc = descriptor(100, BackupStatus::Running, 1);

        let backup_dir = catalog.create_backup_dir(&desc).unwrap();
        assert!(backup_dir.join(DATABASE_DIR).is_dir());
        catalog.write_descriptor(&desc).unwrap();

        desc.complete(Utc.timestamp_opt(160, 0).unwrap());
        catalog.write_descriptor(&desc).unwrap();

        let stored = catalog.read_descriptor(&backup_dir).unwrap();
        assert_eq!(stored.status, BackupStatus::Done);
        assert!(!backup_dir.join("backup.json.tmp").exists());
    }

    #[test]
    fn test_backup_dir_collision_fails() {
        let dir = TempDir::new().unwrap();
        let catalog = FsCatalog::new(dir.path());
        let desc = descriptor(100, BackupStatus::Running, 1);
        catalog.create_backup_dir(&desc).unwrap();
        assert!(matches!(catalog.create_backup_dir(&desc), Err(BackupError::Io(_))));
    }

    #[test]
    fn test_missing_catalog_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let catalog = FsCatalog::new(dir.path().join("absent"));
        assert!(catalog.list_backups().unwrap().is_empty());
    }
}
