//! Parallel gzip writer.
//!
//! This implements the pigz threading model adapted to a streaming
//! `io::Write` facade:
//!
//! 1. The caller's writes are sliced into `block_size` blocks.
//! 2. N worker threads compress blocks out of order, each producing a
//!    deflate fragment plus a per-block CRC-32.
//! 3. One emitter thread reorders results by sequence number, writes
//!    fragments to the sink, and folds CRCs and lengths into the
//!    running totals used for the trailer.
//!
//! Backpressure comes from a bounded pool of input buffers: `write`
//! blocks only when every buffer is in flight. The sink is touched by
//! the emitter thread alone, so bytes land in strict block order:
//! `header || frag(0) || frag(1) || ... || trailer`.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crc32fast::Hasher;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::deflate::{self, BlockCompressor};
use crate::error::{PargzError, PargzResult};
use crate::header::{self, Header};
use crate::pool::BufferPool;
use crate::{DEFAULT_BLOCKS, DEFAULT_BLOCK_SIZE, DEFAULT_COMPRESSION};

/// A unit of work: one slice of input, tagged with its position.
struct Block {
    seq: u64,
    input: Vec<u8>,
    last: bool,
}

struct CompressedBlock {
    bytes: Vec<u8>,
    /// Per-block digest; the emitter folds these with `combine`.
    crc: Hasher,
}

struct BlockResult {
    seq: u64,
    last: bool,
    /// Input buffer, recycled into the pool once the block is emitted.
    input: Vec<u8>,
    payload: PargzResult<CompressedBlock>,
}

/// Emitter progress published for the flush/close barriers.
#[derive(Default)]
struct Progress {
    /// All blocks below this sequence number have reached the sink.
    next_emit_seq: u64,
    /// Trailer written; set by the emitter after the last block.
    finished: bool,
    /// First error observed anywhere in the pipeline.
    err: Option<PargzError>,
}

struct Shared {
    progress: Mutex<Progress>,
    emitted: Condvar,
}

impl Shared {
    fn new() -> Self {
        Shared {
            progress: Mutex::new(Progress::default()),
            emitted: Condvar::new(),
        }
    }
}

struct Pipeline<W> {
    /// Closed (set to `None`) to let workers drain out on close.
    block_tx: Option<Sender<Block>>,
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    abort: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    emitter: Option<JoinHandle<W>>,
}

/// Stop the pipeline and recover the sink from the emitter thread.
///
/// With `abort` set, workers skip any blocks still queued and the
/// emitter discards pending results, so the join is prompt.
fn teardown<W>(mut pipe: Pipeline<W>, abort: bool) -> Option<W> {
    if abort {
        pipe.abort.store(true, Ordering::Release);
    }
    pipe.block_tx = None;
    for handle in pipe.workers.drain(..) {
        let _ = handle.join();
    }
    pipe.emitter.take().and_then(|handle| handle.join().ok())
}

/// A gzip writer that compresses blocks on parallel worker threads.
///
/// `Writer` implements [`std::io::Write`]; `write` slices input into
/// blocks and `flush` blocks until everything written so far has been
/// compressed and handed to the sink (the emitted prefix is a valid,
/// decodable gzip prefix). [`close`](Writer::close) writes the trailer;
/// dropping an unclosed writer aborts the stream instead of finishing
/// it.
///
/// Header fields may be set freely until the first byte is written:
///
/// ```
/// use std::io::Write;
///
/// let mut writer = pargz::Writer::new(Vec::new());
/// writer.header.name = Some("data.txt".to_string());
/// writer.write_all(b"payload").unwrap();
/// writer.close().unwrap();
/// ```
pub struct Writer<W: Write + Send + 'static> {
    /// Gzip header metadata, frozen once the first byte is written.
    pub header: Header,
    level: i32,
    block_size: usize,
    blocks: usize,
    /// Present until the pipeline starts and again after close.
    sink: Option<W>,
    pipeline: Option<Pipeline<W>>,
    current: Vec<u8>,
    next_seq: u64,
    total_in: u64,
    closed: bool,
    latched: Option<PargzError>,
}

impl<W: Write + Send + 'static> Writer<W> {
    /// Create a writer compressing at the default level.
    pub fn new(sink: W) -> Writer<W> {
        Writer::build(sink, DEFAULT_COMPRESSION)
    }

    /// Create a writer with an explicit compression level
    /// ([`HUFFMAN_ONLY`](crate::HUFFMAN_ONLY) through
    /// [`BEST_COMPRESSION`](crate::BEST_COMPRESSION)).
    pub fn with_level(sink: W, level: i32) -> PargzResult<Writer<W>> {
        deflate::validate_level(level)?;
        Ok(Writer::build(sink, level))
    }

    fn build(sink: W, level: i32) -> Writer<W> {
        Writer {
            header: Header::default(),
            level,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks: DEFAULT_BLOCKS,
            sink: Some(sink),
            pipeline: None,
            current: Vec::new(),
            next_seq: 0,
            total_in: 0,
            closed: false,
            latched: None,
        }
    }

    /// Configure the block size and worker count for this session.
    ///
    /// Must be called before any data is written. `blocks` is both the
    /// number of worker threads and half the buffer-pool depth.
    pub fn set_concurrency(&mut self, block_size: usize, blocks: usize) -> PargzResult<()> {
        if blocks == 0 {
            return Err(PargzError::InvalidConfig(
                "blocks must be at least 1".to_string(),
            ));
        }
        if block_size < 1024 {
            return Err(PargzError::InvalidConfig(format!(
                "block size must be at least 1024 bytes, got {block_size}"
            )));
        }
        if self.closed {
            return Err(PargzError::InvalidState("writer is closed"));
        }
        if self.pipeline.is_some() || self.next_seq > 0 || self.total_in > 0 {
            return Err(PargzError::InvalidState(
                "concurrency is fixed once data has been written",
            ));
        }
        self.block_size = block_size;
        self.blocks = blocks;
        Ok(())
    }

    /// Bytes accepted by `write` so far. Unchanged by `close`.
    pub fn uncompressed_size(&self) -> usize {
        self.total_in as usize
    }

    /// A reference to the sink. `None` while a compression session is
    /// running (the emitter thread owns the sink until close or reset).
    pub fn get_ref(&self) -> Option<&W> {
        self.sink.as_ref()
    }

    /// Consume the writer and recover the sink, aborting any unfinished
    /// session without writing a trailer.
    pub fn into_inner(mut self) -> Option<W> {
        if let Some(pipe) = self.pipeline.take() {
            self.sink = teardown(pipe, true);
        }
        self.sink.take()
    }

    /// Finish the stream: submit the tail block, drain all outstanding
    /// work, and write the gzip trailer (CRC-32 and ISIZE).
    ///
    /// Idempotent; repeated calls return the first outcome.
    pub fn close(&mut self) -> PargzResult<()> {
        if self.closed {
            return match &self.latched {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            };
        }
        self.closed = true;
        let result = self.finish();
        if let Err(e) = &result {
            self.latched = Some(e.clone());
        }
        result
    }

    fn finish(&mut self) -> PargzResult<()> {
        if let Some(e) = self.latched_error() {
            if let Some(pipe) = self.pipeline.take() {
                self.sink = teardown(pipe, true);
            }
            return Err(e);
        }
        self.submit_current(true)?;
        {
            let pipe = self
                .pipeline
                .as_mut()
                .expect("pipeline runs once a block is submitted");
            pipe.block_tx = None;
            let mut progress = pipe.shared.progress.lock().unwrap();
            while !progress.finished && progress.err.is_none() {
                progress = pipe.shared.emitted.wait(progress).unwrap();
            }
        }
        let pipe = self.pipeline.take().unwrap();
        let err = pipe.shared.progress.lock().unwrap().err.clone();
        self.sink = teardown(pipe, err.is_some());
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abort any pending work and rewind to a fresh writer targeting
    /// `sink`. The old sink keeps whatever had already been emitted.
    ///
    /// Header fields, counters, and any latched error are cleared; the
    /// compression level and concurrency settings are kept.
    pub fn reset(&mut self, sink: W) {
        if let Some(pipe) = self.pipeline.take() {
            teardown(pipe, true);
        }
        self.header = Header::default();
        self.sink = Some(sink);
        self.current = Vec::new();
        self.next_seq = 0;
        self.total_in = 0;
        self.closed = false;
        self.latched = None;
    }

    fn latched_error(&self) -> Option<PargzError> {
        if let Some(e) = &self.latched {
            return Some(e.clone());
        }
        if let Some(pipe) = &self.pipeline {
            if let Some(e) = &pipe.shared.progress.lock().unwrap().err {
                return Some(e.clone());
            }
        }
        None
    }

    /// Emit the header and start workers and emitter. The sink moves
    /// into the emitter thread; header and configuration are frozen
    /// from here on.
    fn ensure_pipeline(&mut self) -> PargzResult<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        let mut sink = self.sink.take().expect("sink present until pipeline start");
        if let Err(e) = header::write_header(&mut sink, &self.header, self.level) {
            self.sink = Some(sink);
            self.latched = Some(e.clone());
            return Err(e);
        }

        let pool = Arc::new(BufferPool::new(self.block_size, 2 * self.blocks));
        let (block_tx, block_rx) = bounded::<Block>(2 * self.blocks);
        let (result_tx, result_rx) = bounded::<BlockResult>(2 * self.blocks);
        let shared = Arc::new(Shared::new());
        let abort = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(self.blocks);
        for _ in 0..self.blocks {
            let rx = block_rx.clone();
            let tx = result_tx.clone();
            let stop = Arc::clone(&abort);
            let level = self.level;
            workers.push(thread::spawn(move || worker_loop(rx, tx, stop, level)));
        }
        drop(block_rx);
        drop(result_tx);

        let emitter = {
            let pool = Arc::clone(&pool);
            let shared = Arc::clone(&shared);
            let abort = Arc::clone(&abort);
            thread::spawn(move || emitter_loop(sink, result_rx, pool, shared, abort))
        };

        self.current = pool.acquire();
        self.pipeline = Some(Pipeline {
            block_tx: Some(block_tx),
            pool,
            shared,
            abort,
            workers,
            emitter: Some(emitter),
        });
        Ok(())
    }

    /// Hand the current buffer to the workers as block `next_seq`.
    ///
    /// Acquiring the replacement buffer is the backpressure point: it
    /// blocks while all pool buffers are in flight.
    fn submit_current(&mut self, last: bool) -> PargzResult<()> {
        self.ensure_pipeline()?;
        let pipe = self.pipeline.as_ref().expect("pipeline just started");
        let replacement = if last { Vec::new() } else { pipe.pool.acquire() };
        let input = std::mem::replace(&mut self.current, replacement);
        let block = Block {
            seq: self.next_seq,
            input,
            last,
        };
        self.next_seq += 1;
        let tx = pipe
            .block_tx
            .as_ref()
            .expect("block channel open until close");
        if tx.send(block).is_err() {
            return Err(self
                .latched_error()
                .unwrap_or(PargzError::InvalidState("compression pipeline stopped")));
        }
        Ok(())
    }

    fn push_bytes(&mut self, buf: &[u8]) -> PargzResult<usize> {
        if let Some(e) = self.latched_error() {
            return Err(e);
        }
        if self.closed {
            return Err(PargzError::InvalidState("write after close"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_pipeline()?;

        let mut rest = buf;
        while !rest.is_empty() {
            let room = self.block_size - self.current.len();
            let take = room.min(rest.len());
            self.current.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.current.len() == self.block_size {
                self.submit_current(false)?;
            }
        }
        self.total_in += buf.len() as u64;
        Ok(buf.len())
    }

    /// Submit the partial block and wait until every block so far has
    /// been written to the sink.
    ///
    /// Because non-final fragments end with a partial flush, the sink
    /// then holds a prefix from which a decoder can recover every byte
    /// written so far. Legal before any write; the result is a valid
    /// empty gzip prefix.
    fn sync_flush(&mut self) -> PargzResult<()> {
        if let Some(e) = self.latched_error() {
            return Err(e);
        }
        if self.closed {
            return Err(PargzError::InvalidState("flush after close"));
        }
        self.submit_current(false)?;
        let target = self.next_seq;
        let pipe = self
            .pipeline
            .as_ref()
            .expect("pipeline runs once a block is submitted");
        let mut progress = pipe.shared.progress.lock().unwrap();
        while progress.next_emit_seq < target && progress.err.is_none() {
            progress = pipe.shared.emitted.wait(progress).unwrap();
        }
        match &progress.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl<W: Write + Send + 'static> Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.push_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.sync_flush()?)
    }
}

impl<W: Write + Send + 'static> Drop for Writer<W> {
    fn drop(&mut self) {
        if let Some(pipe) = self.pipeline.take() {
            teardown(pipe, true);
        }
    }
}

fn worker_loop(rx: Receiver<Block>, tx: Sender<BlockResult>, stop: Arc<AtomicBool>, level: i32) {
    let mut compressor = BlockCompressor::new(level);
    for block in rx.iter() {
        if stop.load(Ordering::Acquire) {
            // Keep draining so teardown joins promptly.
            continue;
        }
        let Block { seq, input, last } = block;
        let mut out = Vec::with_capacity(deflate::compress_bound(input.len()));
        let payload = match compressor.compress_block(&input, last, &mut out) {
            Ok(()) => {
                let mut crc = Hasher::new();
                crc.update(&input);
                Ok(CompressedBlock { bytes: out, crc })
            }
            Err(e) => Err(e),
        };
        let result = BlockResult {
            seq,
            last,
            input,
            payload,
        };
        if tx.send(result).is_err() {
            return;
        }
    }
}

/// Reorder results by sequence number and write them to the sink.
///
/// Owns the sink, the pending map, the running CRC, and the running
/// total; nothing else touches them. Returns the sink on exit so close
/// and reset can recover it.
fn emitter_loop<W: Write>(
    mut sink: W,
    rx: Receiver<BlockResult>,
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    abort: Arc<AtomicBool>,
) -> W {
    let mut pending: BTreeMap<u64, BlockResult> = BTreeMap::new();
    let mut next_emit: u64 = 0;
    let mut crc = Hasher::new();
    let mut total: u64 = 0;
    let mut failed = false;

    for result in rx.iter() {
        if failed || abort.load(Ordering::Acquire) {
            pool.release(result.input);
            continue;
        }
        pending.insert(result.seq, result);

        while let Some(result) = pending.remove(&next_emit) {
            let BlockResult {
                last,
                input,
                payload,
                ..
            } = result;
            let input_len = input.len() as u64;
            pool.release(input);

            let step = payload.and_then(|block| {
                sink.write_all(&block.bytes).map_err(PargzError::SinkWrite)?;
                crc.combine(&block.crc);
                total += input_len;
                if last {
                    let mut trailer = [0u8; 8];
                    trailer[..4].copy_from_slice(&crc.clone().finalize().to_le_bytes());
                    trailer[4..].copy_from_slice(&(total as u32).to_le_bytes());
                    sink.write_all(&trailer).map_err(PargzError::SinkWrite)?;
                }
                Ok(last)
            });
            next_emit += 1;

            let mut progress = shared.progress.lock().unwrap();
            progress.next_emit_seq = next_emit;
            match step {
                Ok(true) => progress.finished = true,
                Ok(false) => {}
                Err(e) => {
                    failed = true;
                    if progress.err.is_none() {
                        progress.err = Some(e);
                    }
                }
            }
            shared.emitted.notify_all();
            if failed {
                break;
            }
        }
        if failed {
            for (_, result) in std::mem::take(&mut pending) {
                pool.release(result.input);
            }
        }
    }
    for (_, result) in pending {
        pool.release(result.input);
    }
    sink
}
