//! Byte-level copy of files into the backup.

pub mod copy;
