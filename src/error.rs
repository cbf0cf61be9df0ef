//! Crate-level error type.
//!
//! Every fallible public operation returns [`ArchiveError`]. Callers that only
//! care about the broad class of failure can match on [`ArchiveError::kind`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;
use crate::entry::EntryError;
use crate::header::HeaderError;

/// Broad failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A source file, archive path or entry name does not exist.
    NotFound,
    /// The archive structure is invalid; the reader handle is bad.
    FormatInvalid,
    /// Stored bytes do not match their checksum or declared size.
    Integrity,
    /// An underlying read, write or seek failed.
    Io,
    /// Something with the same key already exists.
    Collision,
    /// The call does not fit the handle's state or arguments.
    Usage,
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive not found: {0}")]
    NotFound(PathBuf),
    #[error("Source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("No entry named {0:?}")]
    EntryNotFound(String),

    #[error("Invalid header: {0}")]
    Header(#[from] HeaderError),
    #[error("Invalid table: {0}")]
    Table(#[from] EntryError),
    #[error("Entry {name:?} overlaps the table at offset {table_offset}")]
    EntryBeyondTable { name: String, table_offset: u64 },
    #[error("Archive is in a bad state")]
    Bad,

    #[error("CRC mismatch for {name:?}: expected {expected:08x}, computed {actual:08x}")]
    CrcMismatch { name: String, expected: u32, actual: u32 },
    #[error("Size mismatch for {name:?}: expected {expected} bytes, produced {actual}")]
    SizeMismatch { name: String, expected: u64, actual: u64 },
    #[error("Entry {name:?} declares {declared} bytes, impossible from {stored} stored bytes")]
    ImplausibleSize { name: String, declared: u64, stored: u64 },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("{0} is already queued")]
    AlreadyQueued(PathBuf),
    #[error("Destination already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Archive is not open")]
    NotOpen,
    #[error("Buffer holds {available} bytes, entry needs {needed}")]
    BufferTooSmall { needed: u64, available: u64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::NotFound(_)
            | ArchiveError::SourceNotFound(_)
            | ArchiveError::EntryNotFound(_) => ErrorKind::NotFound,

            ArchiveError::Header(HeaderError::Io(_)) => ErrorKind::Io,
            ArchiveError::Table(EntryError::Io(_)) => ErrorKind::Io,
            ArchiveError::Table(EntryError::NameTooLong(_)) => ErrorKind::Usage,
            ArchiveError::Header(_)
            | ArchiveError::Table(_)
            | ArchiveError::EntryBeyondTable { .. }
            | ArchiveError::Bad => ErrorKind::FormatInvalid,

            ArchiveError::CrcMismatch { .. }
            | ArchiveError::SizeMismatch { .. }
            | ArchiveError::ImplausibleSize { .. }
            | ArchiveError::Codec(_) => ErrorKind::Integrity,

            ArchiveError::AlreadyQueued(_) | ArchiveError::AlreadyExists(_) => ErrorKind::Collision,

            ArchiveError::NotOpen | ArchiveError::BufferTooSmall { .. } => ErrorKind::Usage,

            ArchiveError::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
