//! Table entry model: the metadata record describing one stored file.
//!
//! On-disk record, all integers little-endian:
//!
//! ```text
//! name_len:u16  name:[u8; name_len]  method:u8  flags:u8
//! crc32:u32  original_size:u64  data_start:u64  data_end:u64
//! ```
//!
//! Records are variable length, so a table can only be decoded front to
//! back. See [`crate::table::TableReader`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Bytes of a record that follow the name.
pub const FIXED_FIELDS_SIZE: usize = 1 + 1 + 4 + 8 + 8 + 8;

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("Truncated table record")]
    Truncated,
    #[error("Unknown compression method: {0}")]
    UnknownCompressionMethod(u8),
    #[error("Entry name is not valid UTF-8")]
    InvalidName,
    #[error("Entry name is {0} bytes, longer than the 65535 byte limit")]
    NameTooLong(usize),
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for EntryError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            EntryError::Truncated
        } else {
            EntryError::Io(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Stored verbatim.
    #[default]
    None = 0,
    /// zlib-wrapped deflate stream.
    Zlib = 1,
}

impl CompressionMethod {
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Zlib => "zlib",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "store" => Some(CompressionMethod::None),
            "zlib" | "deflate" => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = EntryError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(CompressionMethod::None),
            1 => Ok(CompressionMethod::Zlib),
            other => Err(EntryError::UnknownCompressionMethod(other)),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-entry flag byte. Bit 0 marks the entry as encrypted; nothing in the
/// pipeline acts on it yet. Bits 1-7 are reserved and preserved as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u8);

impl Flags {
    pub const ENCRYPTED: u8 = 0b0000_0001;

    pub fn encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn with_encrypted(self, on: bool) -> Self {
        if on {
            Flags(self.0 | Self::ENCRYPTED)
        } else {
            Flags(self.0 & !Self::ENCRYPTED)
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl From<u8> for Flags {
    fn from(v: u8) -> Self {
        Flags(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableEntry {
    /// Name inside the archive; may contain `/` to denote a path.
    pub name: String,
    pub compression_method: CompressionMethod,
    pub flags: Flags,
    /// CRC32 of the stored (possibly compressed) bytes.
    pub crc32: u32,
    pub original_size: u64,
    pub data_start: u64,
    /// Offset immediately after the final stored byte.
    pub data_end: u64,
}

impl TableEntry {
    /// A queued entry; checksum, sizes and offsets are filled in when the
    /// file is written.
    pub fn new(name: impl Into<String>, compression_method: CompressionMethod, flags: Flags) -> Self {
        Self {
            name: name.into(),
            compression_method,
            flags,
            ..Self::default()
        }
    }

    pub fn size_in_archive(&self) -> u64 {
        self.data_end.saturating_sub(self.data_start)
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.name.len() + FIXED_FIELDS_SIZE
    }

    /// Fails with `NameTooLong` if the name cannot be length-prefixed.
    pub fn check_name(&self) -> Result<u16, EntryError> {
        u16::try_from(self.name.len()).map_err(|_| EntryError::NameTooLong(self.name.len()))
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), EntryError> {
        let name_len = self.check_name()?;
        writer.write_u16::<LittleEndian>(name_len)?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_u8(self.compression_method as u8)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        writer.write_u64::<LittleEndian>(self.original_size)?;
        writer.write_u64::<LittleEndian>(self.data_start)?;
        writer.write_u64::<LittleEndian>(self.data_end)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EntryError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write(&mut out)?;
        Ok(out)
    }

    /// Decode one complete record.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, EntryError> {
        let name_len = reader.read_u16::<LittleEndian>()?;
        Self::read_after_len(name_len, reader)
    }

    /// Decode the remainder of a record whose length prefix was already
    /// consumed.
    pub fn read_after_len<R: Read>(name_len: u16, mut reader: R) -> Result<Self, EntryError> {
        let mut name = vec![0u8; name_len as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| EntryError::InvalidName)?;

        let compression_method = CompressionMethod::try_from(reader.read_u8()?)?;
        let flags = Flags(reader.read_u8()?);
        let crc32 = reader.read_u32::<LittleEndian>()?;
        let original_size = reader.read_u64::<LittleEndian>()?;
        let data_start = reader.read_u64::<LittleEndian>()?;
        let data_end = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            name,
            compression_method,
            flags,
            crc32,
            original_size,
            data_start,
            data_end,
        })
    }
}
