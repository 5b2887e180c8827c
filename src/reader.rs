//! Read-ahead gzip reader.
//!
//! Decompression itself is sequential; the win is overlap. A producer
//! thread inflates `block_size` chunks ahead of the caller and hands
//! them through a bounded channel of depth `2 * blocks`, so the caller
//! copies from finished buffers while the next ones are being inflated.
//!
//! A gzip file can be a concatenation of gzip members; reads return the
//! concatenation of their uncompressed contents. Only the first
//! member's header is recorded in [`Reader::header`]. Each member's
//! trailer (CRC-32 and ISIZE) is validated before the next one starts.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crc32fast::Hasher;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::deflate::StreamInflater;
use crate::error::{PargzError, PargzResult};
use crate::header::{self, Header};
use crate::{DEFAULT_BLOCKS, DEFAULT_BLOCK_SIZE};

const SOURCE_BUF_SIZE: usize = 32 * 1024;

type Source = BufReader<Box<dyn Read + Send>>;

#[derive(Debug)]
enum Message {
    Block(Vec<u8>),
    Eof,
    Failed(PargzError),
}

#[derive(Debug)]
struct ReadAhead {
    rx: Receiver<Message>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A decompressing reader with background read-ahead.
///
/// ```
/// use std::io::{Read, Write};
///
/// let mut writer = pargz::Writer::new(Vec::new());
/// writer.write_all(b"stream contents").unwrap();
/// writer.close().unwrap();
/// let gz = writer.into_inner().unwrap();
///
/// let mut reader = pargz::Reader::new(std::io::Cursor::new(gz)).unwrap();
/// let mut out = String::new();
/// reader.read_to_string(&mut out).unwrap();
/// assert_eq!(out, "stream contents");
/// ```
#[derive(Debug)]
pub struct Reader {
    /// Header of the first gzip member, available from construction.
    pub header: Header,
    block_size: usize,
    blocks: usize,
    state: Option<ReadAhead>,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
    err: Option<PargzError>,
}

impl Reader {
    /// Create a reader with default read-ahead settings.
    ///
    /// Parses the first member's header before returning; fails with
    /// `InvalidHeader` if the source does not start with one.
    pub fn new<R: Read + Send + 'static>(source: R) -> PargzResult<Reader> {
        Reader::with_capacity(source, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS)
    }

    /// Create a reader prefetching up to `blocks` buffers of roughly
    /// `block_size` bytes each.
    ///
    /// A zero `blocks` or a `block_size` of 512 bytes or less falls
    /// back to the defaults.
    pub fn with_capacity<R: Read + Send + 'static>(
        source: R,
        block_size: usize,
        blocks: usize,
    ) -> PargzResult<Reader> {
        let block_size = if block_size <= 512 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        let blocks = if blocks == 0 { DEFAULT_BLOCKS } else { blocks };
        let mut src: Source = BufReader::with_capacity(SOURCE_BUF_SIZE, Box::new(source));
        let header = header::read_header(&mut src)?;
        Ok(Reader {
            header,
            block_size,
            blocks,
            state: Some(start_read_ahead(src, block_size, blocks)),
            current: Vec::new(),
            pos: 0,
            finished: false,
            err: None,
        })
    }

    /// Discard all state and continue reading from `source`, as if the
    /// reader had been freshly constructed. The first header of the new
    /// source is parsed and saved.
    pub fn reset<R: Read + Send + 'static>(&mut self, source: R) -> PargzResult<()> {
        self.shutdown();
        self.current = Vec::new();
        self.pos = 0;
        self.finished = false;
        self.err = None;
        let mut src: Source = BufReader::with_capacity(SOURCE_BUF_SIZE, Box::new(source));
        match header::read_header(&mut src) {
            Ok(h) => self.header = h,
            Err(e) => {
                self.err = Some(e.clone());
                return Err(e);
            }
        }
        self.state = Some(start_read_ahead(src, self.block_size, self.blocks));
        Ok(())
    }

    /// Stop the read-ahead thread. Does not close the underlying
    /// source. Reads after close fail with `InvalidState`.
    pub fn close(&mut self) -> PargzResult<()> {
        self.shutdown();
        if self.err.is_none() {
            self.err = Some(PargzError::InvalidState("reader is closed"));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            state.stop.store(true, Ordering::Release);
            // Dropping the receiver unblocks a producer stuck on send.
            drop(state.rx);
            let _ = state.handle.join();
        }
    }

    fn read_bytes(&mut self, out: &mut [u8]) -> PargzResult<usize> {
        if let Some(e) = &self.err {
            return Err(e.clone());
        }
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.current.len() {
                // Return what is buffered, even if the caller has room
                // for more; the next call picks up the next block.
                let n = (self.current.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            let state = match &self.state {
                Some(state) => state,
                None => {
                    self.finished = true;
                    return Ok(0);
                }
            };
            match state.rx.recv() {
                Ok(Message::Block(block)) => {
                    self.current = block;
                    self.pos = 0;
                }
                Ok(Message::Eof) => {
                    self.finished = true;
                    return Ok(0);
                }
                Ok(Message::Failed(e)) => {
                    self.err = Some(e.clone());
                    return Err(e);
                }
                Err(_) => {
                    self.finished = true;
                    return Ok(0);
                }
            }
        }
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_read_ahead(src: Source, block_size: usize, blocks: usize) -> ReadAhead {
    let (tx, rx) = bounded(2 * blocks);
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || produce(src, tx, stop, block_size))
    };
    ReadAhead { rx, stop, handle }
}

/// Producer loop: inflate block-sized chunks and push them downstream.
///
/// At each member's end the trailer is validated and a following member
/// header, if any, is parsed. Exits on error, end of input, `stop`, or
/// a dropped receiver.
fn produce(mut src: Source, tx: Sender<Message>, stop: Arc<AtomicBool>, block_size: usize) {
    let mut inflater = StreamInflater::new();
    let mut digest = Hasher::new();
    let mut size: u32 = 0;
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut block = vec![0u8; block_size];
        match inflater.read_block(&mut src, &mut block) {
            Err(e) => {
                let _ = tx.send(Message::Failed(e));
                return;
            }
            Ok((n, member_ended)) => {
                block.truncate(n);
                digest.update(&block);
                size = size.wrapping_add(n as u32);
                if n > 0 && tx.send(Message::Block(block)).is_err() {
                    return;
                }
                if member_ended {
                    if let Err(e) = check_trailer(&mut src, digest.clone().finalize(), size) {
                        let _ = tx.send(Message::Failed(e));
                        return;
                    }
                    match another_member(&mut src) {
                        Ok(true) => {
                            inflater.reset();
                            digest = Hasher::new();
                            size = 0;
                        }
                        Ok(false) => {
                            let _ = tx.send(Message::Eof);
                            return;
                        }
                        Err(e) => {
                            let _ = tx.send(Message::Failed(e));
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Read the 8-byte trailer and compare against the computed CRC-32 and
/// length (mod 2^32).
fn check_trailer(src: &mut Source, crc: u32, size: u32) -> PargzResult<()> {
    let mut raw = [0u8; 8];
    src.read_exact(&mut raw).map_err(PargzError::SourceRead)?;
    let want_crc = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let want_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if want_crc != crc || want_size != size {
        return Err(PargzError::InvalidChecksum);
    }
    Ok(())
}

/// Clean end of input means the stream is done; anything else must be
/// another member header.
fn another_member(src: &mut Source) -> PargzResult<bool> {
    if src.fill_buf().map_err(PargzError::SourceRead)?.is_empty() {
        return Ok(false);
    }
    header::read_header(src)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, GzBuilder};
    use std::io::Cursor;
    use std::io::Write;

    fn gzip_with_metadata(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzBuilder::new()
            .filename(&b"name"[..])
            .comment(&b"comment"[..])
            .extra(&b"extra"[..])
            .mtime(100_000_000)
            .write(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn gzip_plain(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzBuilder::new().write(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn read_all(reader: &mut Reader) -> PargzResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 997];
        loop {
            match reader.read_bytes(&mut buf) {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => return Err(e),
            }
        }
    }

    #[test]
    fn reads_foreign_gzip_with_metadata() {
        let gz = gzip_with_metadata(b"payload");
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        assert_eq!(reader.header.name.as_deref(), Some("name"));
        assert_eq!(reader.header.comment.as_deref(), Some("comment"));
        assert_eq!(reader.header.extra.as_deref(), Some(&b"extra"[..]));
        assert_eq!(reader.header.mod_time, 100_000_000);
        assert_eq!(read_all(&mut reader).unwrap(), b"payload");
    }

    #[test]
    fn latin1_name_maps_to_unicode() {
        let gz = {
            let mut encoder = GzBuilder::new()
                .filename(&b"\xc4u\xdferung"[..])
                .write(Vec::new(), Compression::default());
            encoder.write_all(b"x").unwrap();
            encoder.finish().unwrap()
        };
        let reader = Reader::new(Cursor::new(gz)).unwrap();
        assert_eq!(reader.header.name.as_deref(), Some("Äußerung"));
    }

    #[test]
    fn concatenated_members_read_as_one() {
        let mut gz = gzip_with_metadata(b"hello ");
        gz.extend_from_slice(&gzip_plain(b"world\n"));
        gz.extend_from_slice(&gzip_plain(b""));
        gz.extend_from_slice(&gzip_plain(b"!"));
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        assert_eq!(read_all(&mut reader).unwrap(), b"hello world\n!");
        // Only the first member's header is kept.
        assert_eq!(reader.header.name.as_deref(), Some("name"));
    }

    #[test]
    fn small_blocks_stream_through_the_channel() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let gz = gzip_plain(&payload);
        let mut reader = Reader::with_capacity(Cursor::new(gz), 600, 2).unwrap();
        assert_eq!(read_all(&mut reader).unwrap(), payload);
    }

    #[test]
    fn capacity_zero_falls_back_to_defaults() {
        let gz = gzip_plain(b"defaults");
        let mut reader = Reader::with_capacity(Cursor::new(gz), 0, 0).unwrap();
        assert_eq!(read_all(&mut reader).unwrap(), b"defaults");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = Reader::new(Cursor::new(vec![0u8; 32])).unwrap_err();
        assert!(matches!(err, PargzError::InvalidHeader(_)));
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = Reader::new(Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, PargzError::InvalidHeader(_)));
    }

    #[test]
    fn corrupt_crc_is_detected() {
        let mut gz = gzip_plain(b"checksummed");
        let at = gz.len() - 6;
        gz[at] ^= 0xff;
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        let err = read_all(&mut reader).unwrap_err();
        assert!(matches!(err, PargzError::InvalidChecksum));
    }

    #[test]
    fn corrupt_isize_is_detected() {
        let mut gz = gzip_plain(b"checksummed");
        let at = gz.len() - 1;
        gz[at] ^= 0xff;
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        let err = read_all(&mut reader).unwrap_err();
        assert!(matches!(err, PargzError::InvalidChecksum));
    }

    #[test]
    fn truncated_deflate_is_detected() {
        let gz = gzip_plain(b"this stream will be cut short");
        let cut = &gz[..gz.len() - 12];
        let mut reader = Reader::new(Cursor::new(cut.to_vec())).unwrap();
        let err = read_all(&mut reader).unwrap_err();
        assert!(matches!(err, PargzError::Inflate(_)));
    }

    #[test]
    fn garbage_after_trailer_is_a_header_error() {
        let mut gz = gzip_plain(b"valid part");
        gz.extend_from_slice(b"garbage");
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        let err = read_all(&mut reader).unwrap_err();
        assert!(matches!(err, PargzError::InvalidHeader(_)));
    }

    #[test]
    fn errors_latch_across_reads() {
        let mut gz = gzip_plain(b"payload");
        let at = gz.len() - 6;
        gz[at] ^= 0xff;
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        assert!(read_all(&mut reader).is_err());
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_bytes(&mut buf),
            Err(PargzError::InvalidChecksum)
        ));
    }

    #[test]
    fn reset_reads_the_new_source() {
        let mut reader = Reader::new(Cursor::new(gzip_plain(b"first"))).unwrap();
        assert_eq!(read_all(&mut reader).unwrap(), b"first");

        reader.reset(Cursor::new(gzip_with_metadata(b"second"))).unwrap();
        assert_eq!(reader.header.name.as_deref(), Some("name"));
        assert_eq!(read_all(&mut reader).unwrap(), b"second");
    }

    #[test]
    fn reset_clears_a_latched_error() {
        let mut gz = gzip_plain(b"payload");
        let at = gz.len() - 6;
        gz[at] ^= 0xff;
        let mut reader = Reader::new(Cursor::new(gz)).unwrap();
        assert!(read_all(&mut reader).is_err());

        reader.reset(Cursor::new(gzip_plain(b"clean"))).unwrap();
        assert_eq!(read_all(&mut reader).unwrap(), b"clean");
    }

    #[test]
    fn read_after_close_fails() {
        let mut reader = Reader::new(Cursor::new(gzip_plain(b"data"))).unwrap();
        reader.close().unwrap();
        reader.close().unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_bytes(&mut buf),
            Err(PargzError::InvalidState(_))
        ));
    }

    #[test]
    fn read_returns_at_most_the_current_block() {
        let payload = vec![b'z'; 4000];
        let gz = gzip_plain(&payload);
        let mut reader = Reader::with_capacity(Cursor::new(gz), 1000, 2).unwrap();
        let mut buf = vec![0u8; 10_000];
        let n = reader.read_bytes(&mut buf).unwrap();
        assert!(n <= 1000, "read crossed a block boundary: {n}");
    }
}
