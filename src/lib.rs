pub mod error;
pub mod header;
pub mod entry;
pub mod table;
pub mod codec;
pub mod io_stream;
pub mod reader;
pub mod writer;

pub use error::{ArchiveError, ErrorKind, Result};
pub use header::Header;
pub use entry::{CompressionMethod, Flags, TableEntry};
pub use codec::{ChunkCodec, DEFAULT_CHUNK_SIZE};
pub use reader::{ArchiveReader, ReaderOptions, ReaderState};
pub use writer::{AppendPlan, ArchiveWriter, WriteSummary, WriterOptions};
