//! Persisted file list of a backup.
//!
//! Every backup records each inventoried entry on one line so a later
//! incremental backup can diff against it:
//!
//! ```text
//! <kind> <mode octal> <size> <write_size> <read_size> <is_datafile> <mtime> <path>
//! f 100600 16384 8200 16384 1 1700000000 base/1/100
//! ```
//!
//! `write_size` is `-1` for skipped files. The path is the last field and
//! may contain spaces.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use crate::fs::metadata::{FileEntry, FileKind, WriteSize};
use crate::{BackupError, Result};

/// One line of a persisted file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub rel_path: String,
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub write_size: WriteSize,
    pub read_size: u64,
    pub is_datafile: bool,
    pub mtime: i64,
}

impl FileRecord {
    pub fn from_entry(entry: &FileEntry) -> Self {
        Self {
            rel_path: entry.rel_path.clone(),
            kind: entry.kind,
            mode: entry.mode,
            size: entry.size,
            write_size: entry.write_size,
            read_size: entry.read_size,
            is_datafile: entry.is_datafile,
            mtime: entry.mtime,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {:o} {} {} {} {} {} {}",
            self.kind.code(),
            self.mode,
            self.size,
            self.write_size.as_persisted(),
            self.read_size,
            u8::from(self.is_datafile),
            self.mtime,
            self.rel_path
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let invalid = || BackupError::Corrupted(format!("invalid file list line: {}", line));

        let mut fields = line.splitn(8, ' ');
        let mut next = || fields.next().ok_or_else(invalid);

        let kind = next()?
            .chars()
            .next()
            .and_then(FileKind::from_code)
            .ok_or_else(invalid)?;
        let mode = u32::from_str_radix(next()?, 8).map_err(|_| invalid())?;
        let size = next()?.parse().map_err(|_| invalid())?;
        let write_size = next()?.parse::<i64>().map_err(|_| invalid())?;
        let read_size = next()?.parse().map_err(|_| invalid())?;
        let is_datafile = match next()? {
            "0" => false,
            "1" => true,
            _ => return Err(invalid()),
        };
        let mtime = next()?.parse().map_err(|_| invalid())?;
        let rel_path = next()?.to_string();
        if rel_path.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            rel_path,
            kind,
            mode,
            size,
            write_size: WriteSize::from_persisted(write_size),
            read_size,
            is_datafile,
            mtime,
        })
    }
}

/// Write one line per entry, in the order given.
pub fn write_file_list<'a, W, I>(mut out: W, entries: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a FileEntry>,
{
    for entry in entries {
        writeln!(out, "{}", FileRecord::from_entry(entry).to_line())?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_file_list<R: BufRead>(input: R) -> Result<Vec<FileRecord>> {
    let mut records = Vec::new();
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(FileRecord::parse_line(&line)?);
    }
    Ok(records)
}

/// File list of the previous backup, indexed for lookups by path.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    files: HashMap<String, FileRecord>,
}

impl Baseline {
    pub fn new(records: Vec<FileRecord>) -> Self {
        Self {
            files: records
                .into_iter()
                .map(|r| (r.rel_path.clone(), r))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Record for `rel_path`. With a `prefix`, the current tree is stored
    /// under that prefix in the previous list and is matched against
    /// `<prefix>/<rel_path>`.
    pub fn find(&self, rel_path: &str, prefix: Option<&str>) -> Option<&FileRecord> {
        match prefix {
            Some(prefix) => self
                .files
                .get(&format!("{}/{}", prefix.trim_end_matches('/'), rel_path)),
            None => self.files.get(rel_path),
        }
    }
}
