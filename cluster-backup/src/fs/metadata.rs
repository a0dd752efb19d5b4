//! Per-file records of the cluster inventory.
//!
//! A [`FileEntry`] carries what the listing observed (type, mode, size,
//! mtime) plus what the copy pass decided for it (bytes written or skipped,
//! bytes read, changed-block pagemap).

use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::wal::pagemap::Pagemap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_file() {
            FileKind::File
        } else if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        }
    }

    /// Single-letter code used in the persisted file list.
    pub fn code(self) -> char {
        match self {
            FileKind::File => 'f',
            FileKind::Dir => 'd',
            FileKind::Symlink => 'l',
            FileKind::Other => 'o',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'f' => Some(FileKind::File),
            'd' => Some(FileKind::Dir),
            'l' => Some(FileKind::Symlink),
            'o' => Some(FileKind::Other),
            _ => None,
        }
    }
}

/// Outcome of copying one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteSize {
    /// Not processed by the copy pass (yet), or not a regular file.
    #[default]
    Pending,
    /// Bytes written to the backup.
    Written(u64),
    /// Nothing was written: unchanged, vanished, or no pages selected.
    Skipped,
}

impl WriteSize {
    /// Value stored in the file list; skipped files are recorded as `-1`.
    pub fn as_persisted(self) -> i64 {
        match self {
            WriteSize::Pending => 0,
            WriteSize::Written(n) => n as i64,
            WriteSize::Skipped => -1,
        }
    }

    pub fn from_persisted(value: i64) -> Self {
        if value < 0 {
            WriteSize::Skipped
        } else {
            WriteSize::Written(value as u64)
        }
    }
}

/// One filesystem object under the data directory.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Absolute path on the source cluster.
    pub path: PathBuf,

    /// Path relative to the data directory, `/`-separated.
    pub rel_path: String,

    pub kind: FileKind,

    /// Unix mode bits, including the file type.
    pub mode: u32,

    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub mtime: i64,

    /// Candidate for page-level copying.
    pub is_datafile: bool,

    pub write_size: WriteSize,

    /// Bytes read from the source (page copies may read only part of a file).
    pub read_size: u64,

    pub pagemap: Pagemap,
}

impl FileEntry {
    pub fn new(path: PathBuf, rel_path: String, kind: FileKind) -> Self {
        Self {
            path,
            rel_path,
            kind,
            mode: 0,
            size: 0,
            mtime: 0,
            is_datafile: false,
            write_size: WriteSize::Pending,
            read_size: 0,
            pagemap: Pagemap::new(),
        }
    }

    pub fn from_metadata(path: PathBuf, rel_path: String, metadata: &fs::Metadata) -> Self {
        Self {
            kind: FileKind::from_file_type(metadata.file_type()),
            mode: metadata.mode(),
            size: metadata.len(),
            mtime: metadata.mtime(),
            ..Self::new(path, rel_path, FileKind::Other)
        }
    }

    /// Extract an entry from a path under `root`, following symlinks.
    pub fn from_path(path: &Path, root: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self::from_metadata(
            path.to_path_buf(),
            relative_path(path, root),
            &metadata,
        ))
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_path(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Apply permission bits to a file or directory in the backup.
pub fn apply_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}
