//! Bounded pool of input block buffers.
//!
//! The pool is the writer's backpressure mechanism: the slicer blocks in
//! `acquire` when all buffers are in flight, which caps live memory at
//! `slots * capacity` regardless of how far compression falls behind.

use crossbeam_channel::{bounded, Receiver, Sender};

pub(crate) struct BufferPool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    buf_capacity: usize,
}

impl BufferPool {
    pub(crate) fn new(buf_capacity: usize, slots: usize) -> Self {
        let (free_tx, free_rx) = bounded(slots);
        for _ in 0..slots {
            free_tx
                .send(Vec::with_capacity(buf_capacity))
                .expect("pool channel sized to hold every buffer");
        }
        BufferPool {
            free_tx,
            free_rx,
            buf_capacity,
        }
    }

    /// Take a free buffer, blocking until one is released.
    pub(crate) fn acquire(&self) -> Vec<u8> {
        self.free_rx
            .recv()
            .expect("pool owns both channel ends")
    }

    /// Return a buffer to the free list. Never blocks.
    pub(crate) fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() < self.buf_capacity {
            buf = Vec::with_capacity(self.buf_capacity);
        }
        let _ = self.free_tx.try_send(buf);
    }
}
