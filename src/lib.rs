//! Parallel gzip (RFC 1952) compression and streaming decompression.
//!
//! [`Writer`] splits its input into fixed-size blocks, compresses them on a
//! pool of worker threads, and reassembles the fragments in order into a
//! single well-formed gzip stream. Non-final fragments end with a deflate
//! partial flush so the concatenation stays a legal deflate stream; the
//! trailer carries the CRC-32 and length of the whole uncompressed input.
//!
//! [`Reader`] is a sequential decoder wrapped in a bounded read-ahead
//! thread, so decompression overlaps with whatever the caller does with
//! the output. Concatenated gzip streams read as one logical stream.
//!
//! ```
//! use std::io::{Read, Write};
//!
//! let mut writer = pargz::Writer::new(Vec::new());
//! writer.write_all(b"hello world").unwrap();
//! writer.close().unwrap();
//! let compressed = writer.into_inner().unwrap();
//!
//! let mut reader = pargz::Reader::new(std::io::Cursor::new(compressed)).unwrap();
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).unwrap();
//! assert_eq!(out, b"hello world");
//! ```

mod deflate;
mod error;
mod header;
mod pool;
mod reader;
mod writer;

pub use error::{PargzError, PargzResult};
pub use header::Header;
pub use reader::Reader;
pub use writer::Writer;

/// No compression: stored blocks only.
pub const NO_COMPRESSION: i32 = 0;
/// Fastest compression level.
pub const BEST_SPEED: i32 = 1;
/// Best (slowest) compression level.
pub const BEST_COMPRESSION: i32 = 9;
/// Let the backend pick its default level.
pub const DEFAULT_COMPRESSION: i32 = -1;
/// Huffman coding only, no match searching.
pub const HUFFMAN_ONLY: i32 = -2;

/// Default size of an independently compressed block.
///
/// Documented as "approximately 250 kB"; the implementation rounds to a
/// power of two.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Default number of compression workers (and in-flight blocks).
pub const DEFAULT_BLOCKS: usize = 16;
