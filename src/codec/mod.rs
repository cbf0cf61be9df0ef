//! Chunk-fed codec state machines.
//!
//! Every codec is an explicit state object advanced by [`ChunkCodec::feed`]
//! and closed by [`ChunkCodec::finish`]. Produced bytes are handed to an
//! `emit` callback as soon as they exist, so memory use is bounded by the
//! chunk size no matter how large the stream is. The same contract drives
//! both the compress path (writer) and the extract path (reader).
//!
//! The deflate primitive is `flate2`'s low-level `Compress` / `Decompress`
//! with the zlib wrapper enabled, which is byte compatible with zlib's
//! `deflateInit` / `inflateInit` streams.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;
use thiserror::Error;

use crate::entry::CompressionMethod;

/// Default streaming chunk: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;
/// zlib's `Z_DEFAULT_COMPRESSION` level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    /// The decoder rejected the stream. Recoverable: the archive handle
    /// stays usable.
    #[error("Corrupt stream: {0}")]
    Corrupt(String),
    #[error("Stream ended before the codec reached its end marker")]
    UnexpectedEnd,
    #[error("Decoded data exceeds the {capacity} byte destination")]
    OutputOverflow { capacity: u64 },
    /// The `emit` callback failed.
    #[error("Output sink failed: {0}")]
    Emit(#[source] io::Error),
}

/// Callback receiving every run of produced bytes.
pub type Emit<'a> = dyn FnMut(&[u8]) -> io::Result<()> + 'a;

pub trait ChunkCodec {
    fn method(&self) -> CompressionMethod;

    /// Push one chunk of input through the codec.
    fn feed(&mut self, input: &[u8], emit: &mut Emit<'_>) -> Result<(), CodecError>;

    /// Flush whatever the codec still holds and close the stream.
    fn finish(&mut self, emit: &mut Emit<'_>) -> Result<(), CodecError>;

    /// True once the codec has seen the end of its stream.
    fn is_finished(&self) -> bool;
}

// ── Stored ───────────────────────────────────────────────────────────────────

/// Identity codec for [`CompressionMethod::None`].
#[derive(Debug, Default)]
pub struct Stored {
    finished: bool,
}

impl ChunkCodec for Stored {
    fn method(&self) -> CompressionMethod { CompressionMethod::None }

    fn feed(&mut self, input: &[u8], emit: &mut Emit<'_>) -> Result<(), CodecError> {
        if !input.is_empty() {
            emit(input).map_err(CodecError::Emit)?;
        }
        Ok(())
    }

    fn finish(&mut self, _: &mut Emit<'_>) -> Result<(), CodecError> {
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool { self.finished }
}

// ── Deflater ─────────────────────────────────────────────────────────────────

pub struct Deflater {
    inner:    Compress,
    out:      Vec<u8>,
    finished: bool,
}

impl Deflater {
    pub fn new(level: u32, chunk_size: usize) -> Self {
        Self {
            inner:    Compress::new(Compression::new(level.min(9)), true),
            out:      vec![0u8; chunk_size.max(1)],
            finished: false,
        }
    }

    pub fn total_in(&self) -> u64 { self.inner.total_in() }
    pub fn total_out(&self) -> u64 { self.inner.total_out() }

    /// Run deflate over `input` until it is consumed and the output buffer
    /// comes back with room to spare (or, when finishing, until stream end).
    fn run(&mut self, mut input: &[u8], finishing: bool, emit: &mut Emit<'_>) -> Result<(), CodecError> {
        let flush = if finishing { FlushCompress::Finish } else { FlushCompress::None };
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .compress(input, &mut self.out, flush)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced > 0 {
                emit(&self.out[..produced]).map_err(CodecError::Emit)?;
            }

            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return Ok(());
                }
                _ if consumed == 0 && produced == 0 => {
                    if finishing {
                        return Err(CodecError::Compression("deflate made no progress".into()));
                    }
                    return Ok(());
                }
                _ => {}
            }

            if !finishing && input.is_empty() && produced < self.out.len() {
                return Ok(());
            }
        }
    }
}

impl ChunkCodec for Deflater {
    fn method(&self) -> CompressionMethod { CompressionMethod::Zlib }

    fn feed(&mut self, input: &[u8], emit: &mut Emit<'_>) -> Result<(), CodecError> {
        if self.finished {
            return Err(CodecError::Compression("deflate stream already finished".into()));
        }
        self.run(input, false, emit)
    }

    fn finish(&mut self, emit: &mut Emit<'_>) -> Result<(), CodecError> {
        if self.finished {
            return Ok(());
        }
        self.run(&[], true, emit)
    }

    fn is_finished(&self) -> bool { self.finished }
}

// ── Inflater ─────────────────────────────────────────────────────────────────

pub struct Inflater {
    inner:    Decompress,
    out:      Vec<u8>,
    finished: bool,
}

impl Inflater {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner:    Decompress::new(true),
            out:      vec![0u8; chunk_size.max(1)],
            finished: false,
        }
    }

    pub fn total_in(&self) -> u64 { self.inner.total_in() }
    pub fn total_out(&self) -> u64 { self.inner.total_out() }
}

impl ChunkCodec for Inflater {
    fn method(&self) -> CompressionMethod { CompressionMethod::Zlib }

    /// Bytes fed after the end marker are ignored.
    fn feed(&mut self, mut input: &[u8], emit: &mut Emit<'_>) -> Result<(), CodecError> {
        while !self.finished {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress(input, &mut self.out, FlushDecompress::None)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced > 0 {
                emit(&self.out[..produced]).map_err(CodecError::Emit)?;
            }

            match status {
                Status::StreamEnd => self.finished = true,
                // Needs more input than this chunk holds.
                _ if consumed == 0 && produced == 0 => break,
                _ if input.is_empty() && produced < self.out.len() => break,
                _ => {}
            }
        }
        Ok(())
    }

    fn finish(&mut self, _: &mut Emit<'_>) -> Result<(), CodecError> {
        if self.finished {
            Ok(())
        } else {
            Err(CodecError::UnexpectedEnd)
        }
    }

    fn is_finished(&self) -> bool { self.finished }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Codec that turns original bytes into stored bytes.
pub fn encoder_for(method: CompressionMethod, level: u32, chunk_size: usize) -> Box<dyn ChunkCodec> {
    match method {
        CompressionMethod::None => Box::new(Stored::default()),
        CompressionMethod::Zlib => Box::new(Deflater::new(level, chunk_size)),
    }
}

/// Codec that turns stored bytes back into original bytes.
pub fn decoder_for(method: CompressionMethod, chunk_size: usize) -> Box<dyn ChunkCodec> {
    match method {
        CompressionMethod::None => Box::new(Stored::default()),
        CompressionMethod::Zlib => Box::new(Inflater::new(chunk_size)),
    }
}
