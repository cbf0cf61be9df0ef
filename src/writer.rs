//! Archive writer.
//!
//! [`ArchiveWriter`] holds a queue of source paths, each paired with the
//! entry it will become. [`ArchiveWriter::write_archive`] builds a fresh
//! archive from the queue; [`ArchiveWriter::append_archive`] adds the queue
//! to an existing archive without moving any byte that is already stored.
//!
//! # Append
//! Appending is a two-phase transaction:
//!
//! 1. [`AppendPlan::new`] (no I/O) sorts the existing entries by
//!    `data_start`, drops queued entries whose names are taken, and fixes the
//!    insertion point at the old table offset.
//! 2. [`AppendPlan::execute`] overwrites the old table with the new data,
//!    patches the header, and writes the old records followed by the new
//!    ones as a single table.
//!
//! Everything before the old table offset is left untouched, so every
//! existing entry keeps its offsets and checksum.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use crate::entry::TableEntry;
use crate::error::{ArchiveError, Result};
use crate::header::{patch_table_offset, Header};
use crate::io_stream::{compress_stream, StreamError};
use crate::reader::ArchiveReader;
use crate::table::write_table;

/// Configuration for [`ArchiveWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub chunk_size: usize,
    /// zlib level, 0-9.
    pub level:      u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            level:      DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The source could not be opened or read.
    Unreadable(String),
    /// Another entry already uses the name.
    NameCollision,
    /// The source is the archive being written.
    IsDestination,
}

/// A queued file that was left out of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub path:   PathBuf,
    pub name:   String,
    pub reason: SkipReason,
}

/// What a write or append did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteSummary {
    pub table_offset: u64,
    /// Total archive length after the write.
    pub archive_len:  u64,
    /// Entries stored by this operation, in write order.
    pub written:      Vec<TableEntry>,
    pub skipped:      Vec<Skipped>,
}

// ── Data pass ────────────────────────────────────────────────────────────────

/// Stream every source into `dst` at its current position, completing each
/// entry's checksum, sizes and offsets.
///
/// Sources that cannot be read, or whose names are already in `names`, are
/// skipped and recorded in `summary`. Failures writing `dst` abort.
fn write_entries<W, I>(
    dst:     &mut W,
    sources: I,
    options: &WriterOptions,
    names:   &mut HashSet<String>,
    summary: &mut WriteSummary,
) -> Result<()>
where
    W: Write + Seek,
    I: IntoIterator<Item = (PathBuf, TableEntry)>,
{
    for (path, mut entry) in sources {
        if names.contains(&entry.name) {
            warn!("Name {:?} is already taken; skipping {}", entry.name, path.display());
            summary.skipped.push(Skipped { path, name: entry.name, reason: SkipReason::NameCollision });
            continue;
        }

        let source = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open {}; it has not been written to the archive: {e}", path.display());
                summary.skipped.push(Skipped { path, name: entry.name, reason: SkipReason::Unreadable(e.to_string()) });
                continue;
            }
        };

        let data_start = dst.stream_position()?;
        let outcome = match compress_stream(
            BufReader::new(source),
            &mut *dst,
            entry.compression_method,
            options.level,
            options.chunk_size,
        ) {
            Ok(o) => o,
            Err(StreamError::Source(e)) => {
                warn!("Failed to read {}; it has not been written to the archive: {e}", path.display());
                dst.seek(SeekFrom::Start(data_start))?;
                summary.skipped.push(Skipped { path, name: entry.name, reason: SkipReason::Unreadable(e.to_string()) });
                continue;
            }
            Err(StreamError::Sink(e)) => return Err(e.into()),
            Err(StreamError::Codec(e)) => return Err(e.into()),
        };

        entry.data_start = data_start;
        entry.data_end = data_start + outcome.stored_size;
        entry.crc32 = outcome.crc32;
        entry.original_size = outcome.original_size;
        debug!(
            "Stored {} as {:?}: {} -> {} bytes ({})",
            path.display(),
            entry.name,
            entry.original_size,
            outcome.stored_size,
            entry.compression_method
        );

        names.insert(entry.name.clone());
        summary.written.push(entry);
    }
    Ok(())
}

/// Flush, cut the file at `len` and sync it.
fn finish_file(out: BufWriter<File>, len: u64) -> Result<()> {
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

// ── Append plan ──────────────────────────────────────────────────────────────

/// Phase one of an append, computed without touching the disk.
#[derive(Debug, Clone)]
pub struct AppendPlan {
    /// Where new data begins: the old table offset.
    pub insert_at:  u64,
    /// Entries already in the archive, sorted by `data_start`.
    pub existing:   Vec<TableEntry>,
    /// Queued entries that will be written, in queue order.
    pub incoming:   Vec<(PathBuf, TableEntry)>,
    /// Queued entries dropped because their name is taken.
    pub collisions: Vec<(PathBuf, TableEntry)>,
}

impl AppendPlan {
    pub fn new<I>(table_offset: u64, mut existing: Vec<TableEntry>, queued: I) -> Self
    where
        I: IntoIterator<Item = (PathBuf, TableEntry)>,
    {
        existing.sort_by_key(|e| e.data_start);

        let mut names: HashSet<String> = existing.iter().map(|e| e.name.clone()).collect();
        let mut incoming = Vec::new();
        let mut collisions = Vec::new();
        for (path, entry) in queued {
            if names.insert(entry.name.clone()) {
                incoming.push((path, entry));
            } else {
                collisions.push((path, entry));
            }
        }

        Self { insert_at: table_offset, existing, incoming, collisions }
    }

    /// Phase two: write the incoming data over the old table and rewrite the
    /// table in full. `dst` must hold the archive the plan was built from.
    pub fn execute<W: Write + Seek>(self, dst: &mut W, options: &WriterOptions) -> Result<WriteSummary> {
        if let Some(e) = self.existing.iter().find(|e| e.data_end > self.insert_at) {
            return Err(ArchiveError::EntryBeyondTable { name: e.name.clone(), table_offset: self.insert_at });
        }

        let mut summary = WriteSummary::default();
        summary.skipped.extend(self.collisions.into_iter().map(|(path, entry)| Skipped {
            path,
            name: entry.name,
            reason: SkipReason::NameCollision,
        }));

        let mut names: HashSet<String> = self.existing.iter().map(|e| e.name.clone()).collect();
        dst.seek(SeekFrom::Start(self.insert_at))?;
        write_entries(dst, self.incoming, options, &mut names, &mut summary)?;

        let table_offset = dst.stream_position()?;
        patch_table_offset(&mut *dst, table_offset)?;
        let mut table_len = write_table(&mut *dst, &self.existing)?;
        table_len += write_table(&mut *dst, &summary.written)?;
        dst.flush()?;

        summary.table_offset = table_offset;
        summary.archive_len = table_offset + table_len;
        Ok(summary)
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ArchiveWriter {
    queue:   BTreeMap<PathBuf, TableEntry>,
    options: WriterOptions,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: WriterOptions) -> Self {
        Self { queue: BTreeMap::new(), options }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Queue `path` to be stored as `entry`.
    pub fn queue_file<P: Into<PathBuf>>(&mut self, path: P, entry: TableEntry) -> Result<()> {
        let path = path.into();
        if self.queue.contains_key(&path) {
            warn!("{} has already been queued", path.display());
            return Err(ArchiveError::AlreadyQueued(path));
        }
        if !path.exists() {
            warn!("{} does not exist", path.display());
            return Err(ArchiveError::SourceNotFound(path));
        }
        entry.check_name()?;
        self.queue.insert(path, entry);
        Ok(())
    }

    /// Returns false if `path` was not queued.
    pub fn remove_file<P: AsRef<Path>>(&mut self, path: P) -> bool {
        self.queue.remove(path.as_ref()).is_some()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued sources in write order.
    pub fn queued(&self) -> impl Iterator<Item = (&Path, &TableEntry)> {
        self.queue.iter().map(|(p, e)| (p.as_path(), e))
    }

    /// Clone the queue, leaving out any source that resolves to
    /// `destination`; those are recorded in `summary`.
    fn snapshot(&self, destination: &Path, summary: &mut WriteSummary) -> Vec<(PathBuf, TableEntry)> {
        let target = fs::canonicalize(destination).ok();
        let mut sources = Vec::with_capacity(self.queue.len());
        for (path, entry) in &self.queue {
            if target.is_some() && fs::canonicalize(path).ok() == target {
                warn!("{} is the destination archive; skipping it", path.display());
                summary.skipped.push(Skipped {
                    path:   path.clone(),
                    name:   entry.name.clone(),
                    reason: SkipReason::IsDestination,
                });
                continue;
            }
            sources.push((path.clone(), entry.clone()));
        }
        sources
    }

    /// Build a new archive at `destination` from the queue. The queue is
    /// left intact.
    pub fn write_archive<P: AsRef<Path>>(&self, destination: P, overwrite: bool) -> Result<WriteSummary> {
        let destination = destination.as_ref();
        if destination.exists() && !overwrite {
            warn!("{} already exists", destination.display());
            return Err(ArchiveError::AlreadyExists(destination.to_path_buf()));
        }
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut summary = WriteSummary::default();
        let sources = self.snapshot(destination, &mut summary);

        let mut out = BufWriter::new(File::create(destination)?);
        Header::new().write(&mut out)?;

        let mut names = HashSet::new();
        write_entries(&mut out, sources, &self.options, &mut names, &mut summary)?;

        let table_offset = out.stream_position()?;
        patch_table_offset(&mut out, table_offset)?;
        let table_len = write_table(&mut out, &summary.written)?;

        summary.table_offset = table_offset;
        summary.archive_len = table_offset + table_len;
        finish_file(out, summary.archive_len)?;

        info!(
            "Wrote {} with {} entries ({} skipped)",
            destination.display(),
            summary.written.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Add the queue to the existing archive at `destination`. Queued names
    /// already present in the archive are skipped.
    pub fn append_archive<P: AsRef<Path>>(&self, destination: P) -> Result<WriteSummary> {
        let destination = destination.as_ref();

        let mut reader = ArchiveReader::new();
        reader.open(destination)?;
        let table_offset = reader.get_table_offset();
        let existing = reader.get_table();
        reader.close()?;

        let mut excluded = WriteSummary::default();
        let plan = AppendPlan::new(table_offset, existing, self.snapshot(destination, &mut excluded));
        for (path, entry) in &plan.collisions {
            warn!(
                "An entry named {:?} already exists in the archive; skipping {}",
                entry.name,
                path.display()
            );
        }
        debug!(
            "Appending {} entries at offset {} after {} existing",
            plan.incoming.len(),
            plan.insert_at,
            plan.existing.len()
        );

        let file = OpenOptions::new().read(true).write(true).open(destination)?;
        let mut out = BufWriter::new(file);
        let mut summary = plan.execute(&mut out, &self.options)?;
        finish_file(out, summary.archive_len)?;
        summary.skipped.append(&mut excluded.skipped);

        info!(
            "Appended {} entries to {} ({} skipped)",
            summary.written.len(),
            destination.display(),
            summary.skipped.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CompressionMethod, Flags};
    use crate::table::TableReader;
    use std::io::Cursor;

    fn entry(name: &str, start: u64, end: u64) -> TableEntry {
        TableEntry {
            name: name.into(),
            data_start: start,
            data_end: end,
            ..TableEntry::default()
        }
    }

    fn queued(name: &str) -> (PathBuf, TableEntry) {
        (
            PathBuf::from(format!("/src/{name}")),
            TableEntry::new(name, CompressionMethod::Zlib, Flags::default()),
        )
    }

    #[test]
    fn plan_sorts_existing_by_data_start() {
        let existing = vec![entry("z", 13, 20), entry("b", 30, 40), entry("a", 20, 30)];
        let plan = AppendPlan::new(40, existing, Vec::new());
        let order: Vec<_> = plan.existing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(order, ["z", "a", "b"]);
        assert_eq!(plan.insert_at, 40);
    }

    #[test]
    fn plan_drops_colliding_names() {
        let existing = vec![entry("a", 13, 20), entry("b", 20, 30)];
        let plan = AppendPlan::new(30, existing, vec![queued("b"), queued("c"), queued("c")]);
        let incoming: Vec<_> = plan.incoming.iter().map(|(_, e)| e.name.as_str()).collect();
        let dropped: Vec<_> = plan.collisions.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(incoming, ["c"]);
        assert_eq!(dropped, ["b", "c"]);
    }

    #[test]
    fn execute_with_nothing_new_rewrites_same_table() {
        let mut archive = Vec::new();
        Header { version: 1, table_offset: 18 }.write(&mut archive).unwrap();
        archive.extend_from_slice(b"hello");
        let old = vec![entry("h", 13, 18)];
        write_table(&mut archive, &old).unwrap();
        let before = archive.clone();

        let plan = AppendPlan::new(18, old, vec![queued("h")]);
        let mut cur = Cursor::new(archive);
        let summary = plan.execute(&mut cur, &WriterOptions::default()).unwrap();

        assert_eq!(summary.table_offset, 18);
        assert_eq!(summary.archive_len as usize, before.len());
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(cur.into_inner(), before);
    }

    #[test]
    fn execute_rejects_entries_past_the_table() {
        let plan = AppendPlan::new(20, vec![entry("a", 13, 25)], Vec::new());
        let err = plan.execute(&mut Cursor::new(vec![0u8; 64]), &WriterOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryBeyondTable { .. }));
    }

    #[test]
    fn unreadable_source_is_skipped_and_cursor_rewound() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        fs::write(&good, b"good data").unwrap();

        let mut out = Cursor::new(Vec::new());
        Header::new().write(&mut out).unwrap();
        let mut summary = WriteSummary::default();
        let sources = vec![
            (dir.path().join("vanished.txt"), TableEntry::new("gone", CompressionMethod::None, Flags::default())),
            (good, TableEntry::new("good", CompressionMethod::None, Flags::default())),
        ];
        write_entries(&mut out, sources, &WriterOptions::default(), &mut HashSet::new(), &mut summary).unwrap();

        assert_eq!(summary.skipped.len(), 1);
        assert!(matches!(summary.skipped[0].reason, SkipReason::Unreadable(_)));
        assert_eq!(summary.written.len(), 1);
        assert_eq!(summary.written[0].data_start, 13);
        assert_eq!(summary.written[0].data_end, 22);
        assert_eq!(summary.written[0].crc32, crc32fast::hash(b"good data"));
    }

    #[test]
    fn queue_rejects_duplicates_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"a").unwrap();

        let mut writer = ArchiveWriter::new();
        let e = TableEntry::new("a", CompressionMethod::None, Flags::default());
        writer.queue_file(&path, e.clone()).unwrap();
        assert!(matches!(writer.queue_file(&path, e.clone()), Err(ArchiveError::AlreadyQueued(_))));
        assert!(matches!(
            writer.queue_file(dir.path().join("nope"), e),
            Err(ArchiveError::SourceNotFound(_))
        ));
        assert_eq!(writer.len(), 1);
        assert!(writer.remove_file(&path));
        assert!(!writer.remove_file(&path));
        assert!(writer.is_empty());
    }

    #[test]
    fn write_archive_table_follows_data() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("s.txt");
        fs::write(&src, b"some text").unwrap();
        let dest = dir.path().join("nested/out.dat");

        let mut writer = ArchiveWriter::new();
        writer.queue_file(&src, TableEntry::new("s", CompressionMethod::Zlib, Flags::default())).unwrap();
        let summary = writer.write_archive(&dest, false).unwrap();

        let bytes = fs::read(&dest).unwrap();
        assert_eq!(bytes.len() as u64, summary.archive_len);
        let header = Header::read(Cursor::new(&bytes)).unwrap();
        assert_eq!(header.table_offset, summary.table_offset);
        assert_eq!(header.table_offset, summary.written[0].data_end);

        let table: Vec<_> = TableReader::new(Cursor::new(&bytes[header.table_offset as usize..]))
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(table, summary.written);

        assert!(matches!(writer.write_archive(&dest, false), Err(ArchiveError::AlreadyExists(_))));
        writer.write_archive(&dest, true).unwrap();
    }

    #[test]
    fn clear_empties_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new();
        for name in ["a", "b", "c"] {
            let path = dir.path().join(name);
            fs::write(&path, name).unwrap();
            writer.queue_file(&path, TableEntry::new(name, CompressionMethod::None, Flags::default())).unwrap();
        }
        assert_eq!(writer.len(), 3);

        writer.clear();
        assert!(writer.is_empty());
        assert_eq!(writer.queued().count(), 0);

        let dest = dir.path().join("out.dat");
        let summary = writer.write_archive(&dest, false).unwrap();
        assert!(summary.written.is_empty());
        assert_eq!(summary.table_offset, 13);
    }

    #[test]
    fn destination_in_queue_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("self.dat");
        fs::write(&dest, b"previous contents").unwrap();
        let other = dir.path().join("other.txt");
        fs::write(&other, b"other").unwrap();

        let mut writer = ArchiveWriter::new();
        writer.queue_file(&dest, TableEntry::new("self", CompressionMethod::None, Flags::default())).unwrap();
        writer.queue_file(&other, TableEntry::new("other", CompressionMethod::None, Flags::default())).unwrap();

        let summary = writer.write_archive(&dest, true).unwrap();
        assert_eq!(summary.written.len(), 1);
        assert_eq!(summary.written[0].name, "other");
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::IsDestination);

        let summary = writer.append_archive(&dest).unwrap();
        assert!(summary.skipped.iter().any(|s| s.reason == SkipReason::IsDestination));
        assert!(summary.skipped.iter().any(|s| s.reason == SkipReason::NameCollision));
        assert!(summary.written.is_empty());
    }
}
