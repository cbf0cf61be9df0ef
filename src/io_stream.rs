//! Streaming pumps between files and codecs.
//!
//! Each pump moves data in chunks of at most `chunk_size` bytes and keeps a
//! running CRC32 of the *stored* representation: the codec output when
//! writing, the raw range bytes when reading. A reader can therefore check an
//! entry's integrity from its stored bytes alone ([`checksum_range`]).
//!
//! Errors are tagged by side so callers can tell an entry-local problem (the
//! source went away) from an archive-level one (the archive could not be
//! written or read).

use crc32fast::Hasher;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use thiserror::Error;

use crate::codec::{decoder_for, encoder_for, ChunkCodec, CodecError};
use crate::entry::{CompressionMethod, TableEntry};

#[derive(Error, Debug)]
pub enum StreamError {
    /// Reading the input failed: the source file when compressing, the
    /// archive when extracting.
    #[error("Read failed: {0}")]
    Source(#[source] io::Error),
    /// Writing to the destination failed or came up short.
    #[error("Write failed: {0}")]
    Sink(#[source] io::Error),
    #[error(transparent)]
    Codec(CodecError),
}

impl From<CodecError> for StreamError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Emit(io) => StreamError::Sink(io),
            other => StreamError::Codec(other),
        }
    }
}

/// Result of streaming one source into the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    /// CRC32 of the bytes written to the archive.
    pub crc32:         u32,
    pub original_size: u64,
    pub stored_size:   u64,
}

/// Result of pulling one entry out of the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOutcome {
    /// CRC32 of the stored bytes actually read.
    pub crc32:    u32,
    /// Original bytes written to the destination buffer.
    pub produced: u64,
}

/// Fill `buf` from `src`, stopping early only at end of input.
pub(crate) fn read_chunk<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Write side ───────────────────────────────────────────────────────────────

/// Stream `src` to end of input through the encoder for `method`, writing
/// every produced run to `dst` as soon as it is emitted.
pub fn compress_stream<R: Read, W: Write>(
    mut src:    R,
    mut dst:    W,
    method:     CompressionMethod,
    level:      u32,
    chunk_size: usize,
) -> Result<StreamOutcome, StreamError> {
    let mut codec = encoder_for(method, level, chunk_size);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Hasher::new();
    let mut original_size = 0u64;
    let mut stored_size = 0u64;

    let mut emit = |bytes: &[u8]| -> io::Result<()> {
        dst.write_all(bytes)?;
        hasher.update(bytes);
        stored_size += bytes.len() as u64;
        Ok(())
    };

    loop {
        let n = read_chunk(&mut src, &mut buf).map_err(StreamError::Source)?;
        if n == 0 {
            break;
        }
        original_size += n as u64;
        codec.feed(&buf[..n], &mut emit)?;
    }
    codec.finish(&mut emit)?;

    Ok(StreamOutcome {
        crc32: hasher.finalize(),
        original_size,
        stored_size,
    })
}

// ── Read side ────────────────────────────────────────────────────────────────

fn overflow(capacity: usize) -> impl FnOnce(CodecError) -> StreamError {
    move |e| match e {
        CodecError::Emit(_) => StreamError::Codec(CodecError::OutputOverflow { capacity: capacity as u64 }),
        other => StreamError::Codec(other),
    }
}

/// Inflate the zlib stream stored in `range` into `dest`.
///
/// Reads at most one chunk at a time, never past `range.end`, and stops as
/// soon as the decoder reports the end of its stream. The returned CRC
/// covers the compressed bytes read.
pub fn decompress<R: Read + Seek>(
    src:        &mut R,
    range:      Range<u64>,
    dest:       &mut [u8],
    chunk_size: usize,
) -> Result<ExtractOutcome, StreamError> {
    src.seek(SeekFrom::Start(range.start)).map_err(StreamError::Source)?;

    let capacity = dest.len();
    let mut inflater = decoder_for(CompressionMethod::Zlib, chunk_size);
    let mut remaining = range.end.saturating_sub(range.start);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Hasher::new();
    let mut produced = 0usize;

    let mut emit = |bytes: &[u8]| -> io::Result<()> {
        let end = produced + bytes.len();
        if end > dest.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "destination buffer full"));
        }
        dest[produced..end].copy_from_slice(bytes);
        produced = end;
        Ok(())
    };

    while remaining > 0 && !inflater.is_finished() {
        let want = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..want]).map_err(StreamError::Source)?;
        remaining -= want as u64;
        hasher.update(&buf[..want]);
        inflater.feed(&buf[..want], &mut emit).map_err(overflow(capacity))?;
    }
    inflater.finish(&mut emit).map_err(overflow(capacity))?;

    Ok(ExtractOutcome {
        crc32:    hasher.finalize(),
        produced: produced as u64,
    })
}

/// Copy the stored bytes in `range` verbatim into `dest`.
pub fn passthrough<R: Read + Seek>(
    src:        &mut R,
    range:      Range<u64>,
    dest:       &mut [u8],
    chunk_size: usize,
) -> Result<ExtractOutcome, StreamError> {
    let len = range.end.saturating_sub(range.start);
    if len > dest.len() as u64 {
        return Err(StreamError::Codec(CodecError::OutputOverflow { capacity: dest.len() as u64 }));
    }
    src.seek(SeekFrom::Start(range.start)).map_err(StreamError::Source)?;

    let mut hasher = Hasher::new();
    for piece in dest[..len as usize].chunks_mut(chunk_size.max(1)) {
        src.read_exact(piece).map_err(StreamError::Source)?;
        hasher.update(piece);
    }
    Ok(ExtractOutcome {
        crc32:    hasher.finalize(),
        produced: len,
    })
}

/// Extract `entry` into `dest` using the pump its compression method needs.
pub fn extract<R: Read + Seek>(
    src:        &mut R,
    entry:      &TableEntry,
    dest:       &mut [u8],
    chunk_size: usize,
) -> Result<ExtractOutcome, StreamError> {
    let range = entry.data_start..entry.data_end;
    match entry.compression_method {
        CompressionMethod::None => passthrough(src, range, dest, chunk_size),
        CompressionMethod::Zlib => decompress(src, range, dest, chunk_size),
    }
}

/// CRC32 of the stored bytes in `range`, without decoding them.
pub fn checksum_range<R: Read + Seek>(src: &mut R, range: Range<u64>, chunk_size: usize) -> io::Result<u32> {
    src.seek(SeekFrom::Start(range.start))?;
    let mut remaining = range.end.saturating_sub(range.start);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Hasher::new();
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(hasher.finalize())
}
