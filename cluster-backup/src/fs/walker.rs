//! Directory traversal of the data directory.
//!
//! Lists every file, directory and symlink target under the root (the root
//! itself is omitted), honouring two kinds of exclusion: directories whose
//! contents are transient (the directory is kept, its children are not) and
//! files that must never be copied.

use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::fs::metadata::{relative_path, FileEntry};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links (tablespaces under `pg_tblspc` are links)
    pub follow_links: bool,

    /// Directory names whose contents are not listed
    pub exclude_dirs: Vec<String>,

    /// File names that are not listed
    pub exclude_files: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: true,
            exclude_dirs: default_exclude_dirs(),
            exclude_files: default_exclude_files(),
        }
    }
}

pub fn default_exclude_dirs() -> Vec<String> {
    vec![
        "pg_xlog".to_string(),
        "pg_stat_tmp".to_string(),
        "pgsql_tmp".to_string(),
    ]
}

pub fn default_exclude_files() -> Vec<String> {
    vec!["postmaster.pid".to_string(), "postmaster.opts".to_string()]
}

/// Walk a directory tree and collect every entry below `root`.
///
/// Entries that vanish while the walk is in progress are left out.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) if is_vanished(&e) => {
                debug!("Skipping vanished entry: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let name = entry.file_name().to_string_lossy();
        let is_dir = entry.file_type().is_dir();

        if !is_dir && options.exclude_files.iter().any(|f| *f == name) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if is_vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        entries.push(FileEntry::from_metadata(
            entry.path().to_path_buf(),
            relative_path(entry.path(), root),
            &metadata,
        ));

        if is_dir && options.exclude_dirs.iter().any(|d| *d == name) {
            walker.skip_current_dir();
        }
    }

    Ok(entries)
}

fn is_vanished(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::FileKind;
    use std::fs;
    use tempfile::TempDir;

    fn rel_paths(entries: &[FileEntry]) -> Vec<String> {
        let mut paths: Vec<String> = entries.iter().map(|e| e.rel_path.clone()).collect();
        paths.sort();
        paths
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("base/1"))?;
        fs::write(temp_dir.path().join("PG_VERSION"), b"9.5\n")?;
        fs::write(temp_dir.path().join("base/1/100"), b"content")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(rel_paths(&files), vec!["PG_VERSION", "base", "base/1", "base/1/100"]);

        let dir = files.iter().find(|e| e.rel_path == "base/1").unwrap();
        assert_eq!(dir.kind, FileKind::Dir);
        let file = files.iter().find(|e| e.rel_path == "base/1/100").unwrap();
        assert_eq!(file.kind, FileKind::File);
        assert_eq!(file.size, 7);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("pg_xlog/archive_status"))?;
        fs::write(temp_dir.path().join("pg_xlog/000000010000000000000001"), b"wal")?;
        fs::write(temp_dir.path().join("postmaster.pid"), b"1234")?;
        fs::write(temp_dir.path().join("backup_label"), b"START WAL LOCATION")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(rel_paths(&files), vec!["backup_label", "pg_xlog"]);

        Ok(())
    }

    #[test]
    fn test_follows_tablespace_links() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let pgdata = temp_dir.path().join("pgdata");
        let tablespace = temp_dir.path().join("ts");

        fs::create_dir_all(pgdata.join("pg_tblspc"))?;
        fs::create_dir_all(tablespace.join("PG_9.5_201510051/16384"))?;
        fs::write(tablespace.join("PG_9.5_201510051/16384/16401"), b"page")?;
        std::os::unix::fs::symlink(&tablespace, pgdata.join("pg_tblspc/16400"))?;

        let files = walk_directory(&pgdata, &WalkOptions::default())?;
        assert!(rel_paths(&files)
            .contains(&"pg_tblspc/16400/PG_9.5_201510051/16384/16401".to_string()));

        Ok(())
    }
}
