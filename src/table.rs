//! Sequential access to the entry table.
//!
//! The table has no entry count and no index: it runs from the header's
//! table offset to end of file, one variable-length record after another.
//! [`TableReader`] walks it lazily and stops at the first failed length
//! read.

use byteorder::{LittleEndian, ByteOrder};
use std::io::{self, Read, Write};
use tracing::warn;

use crate::entry::{EntryError, TableEntry};
use crate::io_stream::read_chunk;

/// Lazy iterator over the records of a table region.
///
/// Yields `Err` once for a malformed record and is exhausted afterwards.
pub struct TableReader<R: Read> {
    reader: R,
    done:   bool,
}

impl<R: Read> TableReader<R> {
    /// `reader` must be positioned at the table offset.
    pub fn new(reader: R) -> Self {
        Self { reader, done: false }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the 2-byte length prefix. `Ok(None)` when fewer than two bytes
    /// remain.
    fn read_name_len(&mut self) -> io::Result<Option<u16>> {
        let mut buf = [0u8; 2];
        match read_chunk(&mut self.reader, &mut buf)? {
            2 => Ok(Some(LittleEndian::read_u16(&buf))),
            0 => Ok(None),
            filled => {
                warn!("Ignoring {filled} stray byte(s) at end of table");
                Ok(None)
            }
        }
    }
}

impl<R: Read> Iterator for TableReader<R> {
    type Item = Result<TableEntry, EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.read_name_len() {
            Ok(Some(name_len)) => TableEntry::read_after_len(name_len, &mut self.reader),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(EntryError::Io(e)),
        };
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

impl<R: Read> std::iter::FusedIterator for TableReader<R> {}

/// Serialise `entries` back to back at the writer's current position.
/// Returns the number of bytes written.
pub fn write_table<'a, W, I>(mut writer: W, entries: I) -> Result<u64, EntryError>
where
    W: Write,
    I: IntoIterator<Item = &'a TableEntry>,
{
    let mut written = 0u64;
    for entry in entries {
        entry.write(&mut writer)?;
        written += entry.encoded_len() as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CompressionMethod, Flags};
    use std::io::Cursor;

    fn entries() -> Vec<TableEntry> {
        ["a", "ünïcödé/名前", ""]
            .iter()
            .enumerate()
            .map(|(i, name)| TableEntry {
                name: name.to_string(),
                compression_method: if i % 2 == 0 { CompressionMethod::None } else { CompressionMethod::Zlib },
                flags: Flags::default(),
                crc32: i as u32,
                original_size: 10 * i as u64,
                data_start: 13 + 10 * i as u64,
                data_end: 23 + 10 * i as u64,
            })
            .collect()
    }

    #[test]
    fn reads_until_clean_eof() {
        let expected = entries();
        let mut buf = Vec::new();
        let n = write_table(&mut buf, &expected).unwrap();
        assert_eq!(n as usize, buf.len());

        let decoded: Vec<_> = TableReader::new(Cursor::new(buf))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn empty_region_yields_nothing() {
        assert_eq!(TableReader::new(Cursor::new(Vec::<u8>::new())).count(), 0);
    }

    #[test]
    fn single_trailing_byte_ends_the_table() {
        let mut buf = Vec::new();
        write_table(&mut buf, &entries()[..1]).unwrap();
        buf.push(0x42);
        let decoded: Vec<_> = TableReader::new(Cursor::new(buf))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn truncated_record_stops_iteration_with_error() {
        let mut buf = Vec::new();
        write_table(&mut buf, &entries()).unwrap();
        buf.truncate(buf.len() - 3);

        let mut it = TableReader::new(Cursor::new(buf));
        assert!(it.next().unwrap().is_ok());
        assert!(it.next().unwrap().is_ok());
        assert!(matches!(it.next(), Some(Err(EntryError::Truncated))));
        assert!(it.next().is_none());
    }
}
