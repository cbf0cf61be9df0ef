//! Archive reader.
//!
//! A reader owns one open archive file and its fully loaded entry table.
//!
//! ```text
//!           open ok
//! Closed ───────────▶ Open ──── read fault ────▶ Bad
//!    │                                            ▲
//!    └────── bad header / bad table ──────────────┘
//! ```
//!
//! `Bad` is terminal for every lookup and extraction; only [`ArchiveReader::close`]
//! or a fresh [`ArchiveReader::open`] leave it. Integrity failures (CRC or
//! size mismatch, a corrupt deflate stream) are reported per call and do not
//! poison the handle.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::DEFAULT_CHUNK_SIZE;
use crate::entry::{CompressionMethod, TableEntry};
use crate::error::{ArchiveError, Result};
use crate::header::{Header, HeaderError, HEADER_SIZE};
use crate::io_stream::{self, StreamError};
use crate::table::TableReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Closed,
    Open,
    Bad,
}

/// Configuration for [`ArchiveReader`].
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub chunk_size:   usize,
    /// Reject extracted data whose stored bytes fail the CRC check.
    pub validate_crc: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            chunk_size:   DEFAULT_CHUNK_SIZE,
            validate_crc: true,
        }
    }
}

pub struct ArchiveReader {
    path:    Option<PathBuf>,
    file:    Option<File>,
    header:  Header,
    entries: BTreeMap<String, TableEntry>,
    state:   ReaderState,
    options: ReaderOptions,
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveReader {
    pub fn new() -> Self {
        Self::with_options(ReaderOptions::default())
    }

    pub fn with_options(options: ReaderOptions) -> Self {
        Self {
            path: None,
            file: None,
            header: Header::new(),
            entries: BTreeMap::new(),
            state: ReaderState::Closed,
            options,
        }
    }

    /// Construct a reader and open `path`, failing unless it ends up `Open`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = Self::new();
        reader.open(path)?;
        Ok(reader)
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn set_validate_crc(&mut self, on: bool) {
        self.options.validate_crc = on;
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open an archive and load its table.
    ///
    /// A missing path leaves the handle `Closed`. A file that is not a valid
    /// archive leaves it `Bad`.
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.release();
        let path = path.as_ref();

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        self.path = Some(path.to_path_buf());
        self.file = Some(file);

        match self.load() {
            Ok(()) => {
                self.state = ReaderState::Open;
                debug!(
                    "Opened {} ({} entries, table at {})",
                    path.display(),
                    self.entries.len(),
                    self.header.table_offset
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open {}: {e}", path.display());
                self.entries.clear();
                self.state = ReaderState::Bad;
                Err(e)
            }
        }
    }

    /// Release the file and table. Fails with `NotOpen` when no archive file
    /// is held.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Err(ArchiveError::NotOpen);
        }
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.file = None;
        self.path = None;
        self.header = Header::new();
        self.entries.clear();
        self.state = ReaderState::Closed;
    }

    fn load(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(ArchiveError::NotOpen)?;
        file.seek(SeekFrom::Start(0))?;
        self.header = Header::read(&mut *file)?;
        self.entries = load_table(file, self.header.table_offset)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ReaderState::Open => Ok(()),
            ReaderState::Bad => Err(ArchiveError::Bad),
            ReaderState::Closed => Err(ArchiveError::NotOpen),
        }
    }

    fn live(&self) -> Option<&BTreeMap<String, TableEntry>> {
        (self.state == ReaderState::Open).then_some(&self.entries)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ReaderState::Open
    }

    pub fn is_bad(&self) -> bool {
        self.state == ReaderState::Bad
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn size(&self) -> usize {
        self.live().map_or(0, BTreeMap::len)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.live().is_some_and(|e| e.contains_key(name))
    }

    /// Entry names in sorted order.
    pub fn list_files(&self) -> Vec<&str> {
        self.live()
            .map(|e| e.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every entry, sorted by name.
    pub fn get_table(&self) -> Vec<TableEntry> {
        self.entries().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TableEntry> {
        self.live().into_iter().flat_map(|e| e.values())
    }

    /// Offset of the entry table; zero unless the archive is open.
    pub fn get_table_offset(&self) -> u64 {
        if self.is_open() { self.header.table_offset } else { 0 }
    }

    pub fn header(&self) -> Option<&Header> {
        self.is_open().then_some(&self.header)
    }

    pub fn get_file_entry(&self, name: &str) -> Result<&TableEntry> {
        self.ensure_open()?;
        self.entries
            .get(name)
            .ok_or_else(|| ArchiveError::EntryNotFound(name.to_string()))
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    /// Return the original bytes of `name`. Never returns partial data.
    pub fn get_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self.get_file_entry(name)?.clone();
        check_declared_size(&entry)?;
        let mut buf = alloc_zeroed(entry.original_size)?;
        self.extract_entry(&entry, &mut buf)?;
        Ok(buf)
    }

    /// Extract `name` into a caller supplied buffer of at least
    /// `original_size` bytes. Returns the number of bytes produced.
    pub fn get_file_raw(&mut self, name: &str, buf: &mut [u8]) -> Result<u64> {
        let entry = self.get_file_entry(name)?.clone();
        check_declared_size(&entry)?;
        if (buf.len() as u64) < entry.original_size {
            return Err(ArchiveError::BufferTooSmall {
                needed:    entry.original_size,
                available: buf.len() as u64,
            });
        }
        self.extract_entry(&entry, &mut buf[..entry.original_size as usize])
    }

    fn extract_entry(&mut self, entry: &TableEntry, dest: &mut [u8]) -> Result<u64> {
        let chunk_size = self.options.chunk_size;
        let file = self.file.as_mut().ok_or(ArchiveError::NotOpen)?;

        let outcome = match io_stream::extract(file, entry, dest, chunk_size) {
            Ok(o) => o,
            Err(StreamError::Source(e)) | Err(StreamError::Sink(e)) => {
                return Err(self.fault(e));
            }
            Err(StreamError::Codec(e)) => {
                warn!("Entry {:?} failed to decode: {e}", entry.name);
                return Err(e.into());
            }
        };

        if self.options.validate_crc && outcome.crc32 != entry.crc32 {
            warn!("CRC mismatch for {:?}", entry.name);
            return Err(ArchiveError::CrcMismatch {
                name:     entry.name.clone(),
                expected: entry.crc32,
                actual:   outcome.crc32,
            });
        }
        if outcome.produced != entry.original_size {
            return Err(ArchiveError::SizeMismatch {
                name:     entry.name.clone(),
                expected: entry.original_size,
                actual:   outcome.produced,
            });
        }
        Ok(outcome.produced)
    }

    /// Check the stored bytes of `name` against its CRC without decoding.
    pub fn verify(&mut self, name: &str) -> Result<()> {
        let entry = self.get_file_entry(name)?.clone();
        let chunk_size = self.options.chunk_size;
        let file = self.file.as_mut().ok_or(ArchiveError::NotOpen)?;

        let actual = match io_stream::checksum_range(file, entry.data_start..entry.data_end, chunk_size) {
            Ok(crc) => crc,
            Err(e) => return Err(self.fault(e)),
        };
        if actual != entry.crc32 {
            return Err(ArchiveError::CrcMismatch {
                name: entry.name,
                expected: entry.crc32,
                actual,
            });
        }
        Ok(())
    }

    /// [`verify`](Self::verify) every entry, in name order.
    pub fn verify_all(&mut self) -> Vec<(String, Result<()>)> {
        let names: Vec<String> = self.list_files().into_iter().map(str::to_owned).collect();
        names
            .into_iter()
            .map(|name| {
                let result = self.verify(&name);
                (name, result)
            })
            .collect()
    }

    /// An archive read failed: the handle is no longer trustworthy.
    fn fault(&mut self, e: io::Error) -> ArchiveError {
        warn!("Read fault, marking archive bad: {e}");
        self.state = ReaderState::Bad;
        ArchiveError::Io(e)
    }
}

/// Upper bound on deflate's expansion of stored bytes.
const MAX_DEFLATE_RATIO: u64 = 1032;

/// Reject an `original_size` the stored bytes cannot possibly decode to.
fn check_declared_size(entry: &TableEntry) -> Result<()> {
    let stored = entry.size_in_archive();
    let plausible = match entry.compression_method {
        CompressionMethod::None => entry.original_size == stored,
        CompressionMethod::Zlib => entry.original_size <= stored.saturating_mul(MAX_DEFLATE_RATIO),
    };
    if plausible {
        return Ok(());
    }
    warn!(
        "Entry {:?} declares {} bytes from {} stored bytes",
        entry.name, entry.original_size, stored
    );
    Err(ArchiveError::ImplausibleSize {
        name:     entry.name.clone(),
        declared: entry.original_size,
        stored,
    })
}

fn alloc_zeroed(len: u64) -> Result<Vec<u8>> {
    let oom = || io::Error::new(io::ErrorKind::OutOfMemory, format!("cannot allocate {len} bytes"));
    let len = usize::try_from(len).map_err(|_| oom())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| oom())?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Scan the table region starting at `table_offset` into a name-keyed map.
/// Leaves the file positioned at its start.
fn load_table(file: &mut File, table_offset: u64) -> Result<BTreeMap<String, TableEntry>> {
    if table_offset == 0 {
        return Err(HeaderError::MissingTableOffset.into());
    }
    let len = file.metadata()?.len();
    if table_offset < HEADER_SIZE || table_offset > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("table offset {table_offset} outside file of {len} bytes"),
        )
        .into());
    }
    file.seek(SeekFrom::Start(table_offset))?;

    let mut entries = BTreeMap::new();
    for record in TableReader::new(BufReader::new(&mut *file)) {
        let entry = record?;
        if entry.data_end > table_offset || entry.data_start > entry.data_end {
            return Err(ArchiveError::EntryBeyondTable {
                name: entry.name,
                table_offset,
            });
        }
        if let Some(prev) = entries.insert(entry.name.clone(), entry) {
            warn!("Duplicate table entry {:?}; keeping the later record", prev.name);
        }
    }

    file.seek(SeekFrom::Start(0))?;
    Ok(entries)
}
