//! Fixed 13-byte archive header.
//!
//! ```text
//! offset  size  field
//!      0     4  signature    B1 44 41 54  ("±DAT" in Latin-1)
//!      4     1  version      must equal VERSION
//!      5     8  table_offset u64 LE, start of the entry table
//! ```
//!
//! The writer emits the header with a zero table offset and patches the
//! field in place once all stored bytes are on disk.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const SIGNATURE: [u8; 4] = [0xB1, 0x44, 0x41, 0x54];
pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: u64 = 13;
/// Byte position of the `table_offset` field.
pub const TABLE_OFFSET_POS: u64 = 5;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid signature {0:02x?}")]
    InvalidSignature([u8; 4]),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("Table offset is unset")]
    MissingTableOffset,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub table_offset: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl Header {
    /// Header for a fresh archive; the table offset is a placeholder.
    pub fn new() -> Self {
        Self {
            version: VERSION,
            table_offset: 0,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&SIGNATURE)?;
        writer.write_u8(self.version)?;
        writer.write_u64::<LittleEndian>(self.table_offset)?;
        Ok(())
    }

    /// Read and validate a header. Signature and version are checked before
    /// the table offset is read.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != SIGNATURE {
            return Err(HeaderError::InvalidSignature(signature));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let table_offset = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            version,
            table_offset,
        })
    }
}

/// Overwrite the table offset field of an already written header, then
/// return the cursor to `table_offset` so the table can follow.
pub fn patch_table_offset<W: Write + Seek>(mut writer: W, table_offset: u64) -> io::Result<()> {
    writer.seek(SeekFrom::Start(TABLE_OFFSET_POS))?;
    writer.write_u64::<LittleEndian>(table_offset)?;
    writer.seek(SeekFrom::Start(table_offset))?;
    Ok(())
}
