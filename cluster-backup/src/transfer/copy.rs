//! File copy routines used by the copy pass.
//!
//! Plain files are copied byte for byte. Data files are stored as a
//! sequence of page records, each an 4-byte little-endian block number
//! followed by the 8 KiB page, which lets an incremental backup store only
//! the pages that changed. Both forms are optionally zstd-compressed.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::fs::metadata::{apply_permissions, FileEntry, WriteSize};
use crate::wal::Lsn;

/// Database page size expected by this engine.
pub const BLCKSZ: usize = 8192;

/// Size of the block-number header preceding each stored page.
pub const PAGE_HEADER_SIZE: u64 = 4;

/// Copy capability consumed by the copy pass.
///
/// Both methods return `Ok(false)` when nothing was written, for instance
/// because the source vanished, and record the transferred sizes on `entry`.
pub trait FileCopier: Send + Sync {
    /// Copy a whole file.
    fn copy_file(&self, to_root: &Path, entry: &mut FileEntry, compress: bool) -> io::Result<bool>;

    /// Copy a data file page by page. With `since`, only pages changed since
    /// that LSN are stored.
    fn copy_data_file(
        &self,
        to_root: &Path,
        entry: &mut FileEntry,
        since: Option<Lsn>,
        compress: bool,
    ) -> io::Result<bool>;
}

/// Copies to a local backup directory.
#[derive(Debug, Clone)]
pub struct LocalCopier {
    compression_level: i32,
}

impl LocalCopier {
    pub fn new(compression_level: i32) -> Self {
        Self { compression_level }
    }

    fn open_source(entry: &FileEntry) -> io::Result<Option<File>> {
        match File::open(&entry.path) {
            Ok(f) => Ok(Some(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_target(&self, to_root: &Path, entry: &FileEntry, compress: bool) -> io::Result<Sink> {
        let target = to_root.join(&entry.rel_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = Counted::new(BufWriter::new(File::create(&target)?));
        let writer = if compress {
            Writer::Zstd(zstd::stream::write::Encoder::new(file, self.compression_level)?)
        } else {
            Writer::Plain(file)
        };
        Ok(Sink {
            path: target,
            writer,
        })
    }
}

impl Default for LocalCopier {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Writer that counts the bytes passed through to the target file.
struct Counted<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Counted<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for Counted<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Writer {
    Plain(Counted<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, Counted<BufWriter<File>>>),
}

/// Output file. Its size is counted after compression.
struct Sink {
    path: PathBuf,
    writer: Writer,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.writer {
            Writer::Plain(w) => w.write(buf),
            Writer::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Writer::Plain(w) => w.flush(),
            Writer::Zstd(w) => w.flush(),
        }
    }
}

impl Sink {
    /// Finish the stream and return the number of bytes stored.
    fn finish(self, mode: u32) -> io::Result<u64> {
        let mut file = match self.writer {
            Writer::Plain(w) => w,
            Writer::Zstd(w) => w.finish()?,
        };
        file.flush()?;
        apply_permissions(&self.path, mode)?;
        Ok(file.count)
    }
}

/// LSN stored in the first eight bytes of a page header.
pub fn page_lsn(page: &[u8]) -> Lsn {
    Lsn::from_parts(
        LittleEndian::read_u32(&page[0..4]),
        LittleEndian::read_u32(&page[4..8]),
    )
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl FileCopier for LocalCopier {
    fn copy_file(&self, to_root: &Path, entry: &mut FileEntry, compress: bool) -> io::Result<bool> {
        let Some(source) = Self::open_source(entry)? else {
            return Ok(false);
        };

        let mut sink = self.create_target(to_root, entry, compress)?;
        let read = io::copy(&mut BufReader::new(source), &mut sink)?;
        let written = sink.finish(entry.mode)?;

        entry.read_size = read;
        entry.write_size = WriteSize::Written(written);
        Ok(true)
    }

    fn copy_data_file(
        &self,
        to_root: &Path,
        entry: &mut FileEntry,
        since: Option<Lsn>,
        compress: bool,
    ) -> io::Result<bool> {
        // A relation segment is always a whole number of pages.
        if entry.size % BLCKSZ as u64 != 0 {
            entry.is_datafile = false;
            return self.copy_file(to_root, entry, compress);
        }

        let Some(source) = Self::open_source(entry)? else {
            return Ok(false);
        };
        let mut reader = BufReader::new(source);
        let use_pagemap = since.is_some() && !entry.pagemap.is_empty();

        let mut page = vec![0u8; BLCKSZ];
        let mut sink: Option<Sink> = None;
        let mut read = 0u64;
        let mut blkno = 0u32;

        loop {
            if use_pagemap && !entry.pagemap.contains(blkno) {
                // Only pages named by the pagemap are read.
                if blkno as u64 * BLCKSZ as u64 >= entry.size {
                    break;
                }
                if reader.seek_relative(BLCKSZ as i64).is_err() {
                    break;
                }
                blkno += 1;
                continue;
            }

            let n = read_full(&mut reader, &mut page)?;
            if n == 0 {
                break;
            }
            read += n as u64;
            if n < BLCKSZ {
                // Truncated concurrently; the WAL replay restores the tail.
                break;
            }

            let wanted = match since {
                None => true,
                Some(_) if use_pagemap => true,
                Some(lsn) => page_lsn(&page) >= lsn,
            };

            if wanted {
                if sink.is_none() {
                    sink = Some(self.create_target(to_root, entry, compress)?);
                }
                if let Some(out) = sink.as_mut() {
                    out.write_u32::<LittleEndian>(blkno)?;
                    out.write_all(&page)?;
                }
            }
            blkno += 1;
        }

        entry.read_size = read;
        match sink {
            Some(out) => {
                let written = out.finish(entry.mode)?;
                entry.write_size = WriteSize::Written(written);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
