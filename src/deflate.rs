//! Deflate codec wrappers.
//!
//! Blocks are compressed independently but must concatenate into one
//! legal deflate stream, so every non-final fragment is terminated with
//! a sync flush (an empty stored block, the 5-byte `00 00 00 FF FF`
//! marker) leaving the next fragment byte-aligned. Only the final
//! fragment sets BFINAL.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::BufRead;

use crate::error::{PargzError, PargzResult};
use crate::{BEST_COMPRESSION, DEFAULT_COMPRESSION, HUFFMAN_ONLY};

pub(crate) fn validate_level(level: i32) -> PargzResult<()> {
    if (HUFFMAN_ONLY..=BEST_COMPRESSION).contains(&level) {
        Ok(())
    } else {
        Err(PargzError::InvalidLevel(level))
    }
}

/// Map the public level range onto the backend's 0-9 scale.
fn backend_level(level: i32) -> Compression {
    match level {
        DEFAULT_COMPRESSION => Compression::default(),
        // flate2 exposes no Huffman-only strategy; use the fastest level.
        HUFFMAN_ONLY => Compression::fast(),
        n => Compression::new(n as u32),
    }
}

/// Worst-case output allowance for a block, mirroring the stored-block
/// expansion bound plus flush overhead.
pub(crate) fn compress_bound(input_len: usize) -> usize {
    input_len + input_len / 10 + 64
}

/// Compresses one block at a time into concatenable deflate fragments.
///
/// One instance lives per worker thread and is reset between blocks.
pub(crate) struct BlockCompressor {
    raw: Compress,
}

impl BlockCompressor {
    pub(crate) fn new(level: i32) -> Self {
        BlockCompressor {
            raw: Compress::new(backend_level(level), false),
        }
    }

    /// Compress `input` and append the fragment to `out`.
    ///
    /// With `last` set the fragment ends the deflate stream (BFINAL);
    /// otherwise it ends with a sync flush.
    pub(crate) fn compress_block(
        &mut self,
        input: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> PargzResult<()> {
        self.raw.reset();
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(32 * 1024);
            }
            let flush = if consumed < input.len() {
                FlushCompress::None
            } else if last {
                FlushCompress::Finish
            } else {
                FlushCompress::Sync
            };
            let before_in = self.raw.total_in();
            let status = self
                .raw
                .compress_vec(&input[consumed..], out, flush)
                .map_err(|e| PargzError::Deflate(e.to_string()))?;
            consumed += (self.raw.total_in() - before_in) as usize;
            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    // A sync flush is done once all input is consumed and
                    // the backend left spare output space.
                    if !last && consumed == input.len() && out.len() < out.capacity() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Streaming inflater over a buffered source.
///
/// Stops exactly at the end of the deflate stream, leaving trailer and
/// any following member untouched in the source buffer.
pub(crate) struct StreamInflater {
    raw: Decompress,
}

impl StreamInflater {
    pub(crate) fn new() -> Self {
        StreamInflater {
            raw: Decompress::new(false),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.raw.reset(false);
    }

    /// Inflate into `out` until it is full or the stream ends.
    ///
    /// Returns `(bytes_written, stream_ended)`.
    pub(crate) fn read_block<R: BufRead>(
        &mut self,
        src: &mut R,
        out: &mut [u8],
    ) -> PargzResult<(usize, bool)> {
        let mut written = 0usize;
        while written < out.len() {
            let input = src.fill_buf().map_err(PargzError::SourceRead)?;
            let at_eof = input.is_empty();
            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let status = self
                .raw
                .decompress(input, &mut out[written..], FlushDecompress::None)
                .map_err(|e| PargzError::Inflate(e.to_string()))?;
            let consumed = (self.raw.total_in() - before_in) as usize;
            let produced = (self.raw.total_out() - before_out) as usize;
            src.consume(consumed);
            written += produced;
            match status {
                Status::StreamEnd => return Ok((written, true)),
                Status::Ok | Status::BufError => {
                    if at_eof && produced == 0 {
                        return Err(PargzError::Inflate(
                            "unexpected end of deflate stream".to_string(),
                        ));
                    }
                }
            }
        }
        Ok((written, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(input: &[u8], last: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(compress_bound(input.len()));
        BlockCompressor::new(6)
            .compress_block(input, last, &mut out)
            .unwrap();
        out
    }

    fn inflate_all(deflate: &[u8]) -> Vec<u8> {
        let mut src = std::io::Cursor::new(deflate);
        let mut inflater = StreamInflater::new();
        let mut out = Vec::new();
        loop {
            let mut block = vec![0u8; 4096];
            let (n, end) = inflater.read_block(&mut src, &mut block).unwrap();
            out.extend_from_slice(&block[..n]);
            if end {
                return out;
            }
        }
    }

    #[test]
    fn non_final_fragment_ends_with_sync_marker() {
        let frag = fragment(b"hello", false);
        assert!(frag.len() >= 4);
        assert_eq!(&frag[frag.len() - 4..], &[0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn concatenated_fragments_inflate_in_order() {
        let mut stream = fragment(b"hello ", false);
        stream.extend_from_slice(&fragment(b"", false));
        stream.extend_from_slice(&fragment(b"world", true));
        assert_eq!(inflate_all(&stream), b"hello world");
    }

    #[test]
    fn empty_final_fragment_is_a_valid_stream() {
        let stream = fragment(b"", true);
        assert!(!stream.is_empty());
        assert_eq!(inflate_all(&stream), b"");
    }

    #[test]
    fn inflater_stops_at_stream_end() {
        let mut stream = fragment(b"payload", true);
        stream.extend_from_slice(b"TRAILER!");
        let mut src = std::io::Cursor::new(&stream[..]);
        let mut inflater = StreamInflater::new();
        let mut block = vec![0u8; 4096];
        let (n, end) = inflater.read_block(&mut src, &mut block).unwrap();
        assert!(end);
        assert_eq!(&block[..n], b"payload");
        // Everything after the deflate stream is still unread.
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut src, &mut rest).unwrap();
        assert_eq!(rest, b"TRAILER!");
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let stream = fragment(b"some data that compresses", true);
        let cut = &stream[..stream.len() - 3];
        let mut src = std::io::Cursor::new(cut);
        let mut inflater = StreamInflater::new();
        let mut block = vec![0u8; 4096];
        let err = inflater.read_block(&mut src, &mut block).unwrap_err();
        assert!(matches!(err, PargzError::Inflate(_)));
    }

    #[test]
    fn level_range_is_enforced() {
        for level in crate::HUFFMAN_ONLY..=crate::BEST_COMPRESSION {
            validate_level(level).unwrap();
        }
        assert!(matches!(
            validate_level(10),
            Err(PargzError::InvalidLevel(10))
        ));
        assert!(matches!(
            validate_level(-3),
            Err(PargzError::InvalidLevel(-3))
        ));
    }
}
