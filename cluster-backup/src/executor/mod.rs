//! Copy pass of a backup session.
//!
//! Walks the inventory in ascending path order and, for each entry:
//! - recreates directories in the backup,
//! - skips regular files unchanged since the baseline backup,
//! - copies the rest page by page (data files in page mode) or whole.

pub mod manifest;

use std::fs;
use std::io;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fs::inventory::{epoch_secs, wait_past_mtime, Clock, FileInventory};
use crate::fs::metadata::{apply_permissions, FileEntry, FileKind, WriteSize};
use crate::transfer::copy::FileCopier;
use crate::wal::Lsn;
use crate::{BackupError, Result};
use manifest::Baseline;

/// Permissions of directories created in the backup.
pub const DIR_PERMISSION: u32 = 0o700;

/// How a regular file compares with the baseline backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Same path, identical mtime: nothing to copy.
    Unchanged,
    /// Not in the baseline: copied whole.
    New,
    /// In the baseline but modified: eligible for a page-level copy.
    Modified,
}

pub fn classify(entry: &FileEntry, baseline: &Baseline, prefix: Option<&str>) -> Change {
    match baseline.find(&entry.rel_path, prefix) {
        Some(prev) if prev.mtime == entry.mtime => Change::Unchanged,
        Some(_) => Change::Modified,
        None => Change::New,
    }
}

/// Inputs of one copy pass.
pub struct CopyPass<'a> {
    pub to_root: &'a Path,
    /// File list of the baseline backup (page mode only).
    pub baseline: Option<&'a Baseline>,
    /// Start LSN of the baseline backup; pages older than it are not copied.
    pub since: Option<Lsn>,
    /// Path prefix of the current tree inside the baseline's file list.
    pub prefix: Option<&'a str>,
    pub compress: bool,
    pub copier: &'a dyn FileCopier,
    pub clock: &'a dyn Clock,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    pub directories: usize,
    pub copied: usize,
    pub skipped: usize,
    pub written_bytes: u64,
}

impl CopyPass<'_> {
    /// Copy every entry of `inventory` into `to_root`.
    pub async fn run(&self, inventory: &mut FileInventory) -> Result<CopySummary> {
        let mut now = self.clock.now();

        // An mtime ahead of the clock makes mtime comparison meaningless.
        inventory.check_clock(now)?;

        let total = inventory.len();
        let mut summary = CopySummary::default();

        for (i, entry) in inventory.entries_mut().iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Interrupted("during backup"));
            }

            // Re-stat: the listing may be stale by now.
            let metadata = match fs::metadata(&entry.path) {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("({}/{}) {} skip (vanished)", i + 1, total, entry.rel_path);
                    entry.write_size = WriteSize::Skipped;
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match FileKind::from_file_type(metadata.file_type()) {
                FileKind::Dir => {
                    let dir = self.to_root.join(&entry.rel_path);
                    fs::create_dir_all(&dir)?;
                    apply_permissions(&dir, DIR_PERMISSION)?;
                    summary.directories += 1;
                    debug!("({}/{}) {} directory", i + 1, total, entry.rel_path);
                }
                FileKind::File => {
                    let mut page_level = entry.is_datafile;

                    if let Some(baseline) = self.baseline {
                        match classify(entry, baseline, self.prefix) {
                            Change::Unchanged => {
                                entry.write_size = WriteSize::Skipped;
                                summary.skipped += 1;
                                debug!("({}/{}) {} skip", i + 1, total, entry.rel_path);
                                continue;
                            }
                            Change::New => {
                                // Stored whole, so not in page-record form.
                                page_level = false;
                                entry.is_datafile = false;
                            }
                            Change::Modified => {}
                        }
                    }

                    // Writes later in the mtime's second could be missed.
                    if epoch_secs(now) == entry.mtime {
                        now = wait_past_mtime(self.clock, entry.mtime, self.cancel).await?;
                    }

                    let written = if page_level {
                        let since = self.baseline.and(self.since);
                        self.copier
                            .copy_data_file(self.to_root, entry, since, self.compress)?
                    } else {
                        self.copier.copy_file(self.to_root, entry, self.compress)?
                    };

                    if !written {
                        entry.write_size = WriteSize::Skipped;
                        summary.skipped += 1;
                        debug!("({}/{}) {} skip", i + 1, total, entry.rel_path);
                        continue;
                    }

                    summary.copied += 1;
                    if let WriteSize::Written(n) = entry.write_size {
                        summary.written_bytes += n;
                        if self.compress && entry.size > 0 {
                            debug!(
                                "({}/{}) {} compressed {} ({:.2}% of {})",
                                i + 1,
                                total,
                                entry.rel_path,
                                n,
                                100.0 * n as f64 / entry.size as f64,
                                entry.size
                            );
                        } else {
                            debug!("({}/{}) {} copied {}", i + 1, total, entry.rel_path, n);
                        }
                    }
                }
                other => {
                    debug!(
                        "({}/{}) {} unexpected file type {:?}",
                        i + 1,
                        total,
                        entry.rel_path,
                        other
                    );
                }
            }
        }

        info!(
            "Copy pass finished: {} directories, {} files copied, {} skipped, {} bytes written",
            summary.directories, summary.copied, summary.skipped, summary.written_bytes
        );
        Ok(summary)
    }
}
