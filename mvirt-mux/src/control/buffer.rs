//! Pooled outbound message buffers and the transmit queue.
//!
//! Buffers move between two lists guarded by one lock: the free pool and
//! the transmit queue. Freed buffers never go back to the allocator while
//! the mux lives; allocation reuses the smallest pooled buffer that fits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::counters::{MuxCounter, MuxCounters};
use crate::error::{MuxError, Result};

/// Fresh allocations are rounded up to a multiple of this.
pub const SBTX_BLOCK: usize = 1024;

#[derive(Debug)]
pub struct SbTxBuffer {
    id: u64,
    len: usize,
    data: Vec<u8>,
}

impl SbTxBuffer {
    /// Pool-unique identity, stable across reuse.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

#[derive(Default)]
struct Lists {
    free: Vec<SbTxBuffer>,
    tx: VecDeque<SbTxBuffer>,
}

pub struct SbTxPool {
    lists: Mutex<Lists>,
    counters: Arc<MuxCounters>,
    next_id: AtomicU64,
}

impl SbTxPool {
    pub fn new(counters: Arc<MuxCounters>) -> Self {
        SbTxPool {
            lists: Mutex::new(Lists::default()),
            counters,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a zeroed buffer holding `len` bytes.
    ///
    /// Reuses the smallest free buffer whose capacity is at least `len`;
    /// otherwise allocates a new one rounded up to `SBTX_BLOCK`.
    pub fn alloc(&self, len: usize) -> Result<SbTxBuffer> {
        let reused = {
            let mut lists = self.lock();
            let best = lists
                .free
                .iter()
                .enumerate()
                .filter(|(_, b)| b.capacity() >= len)
                .min_by_key(|(_, b)| b.capacity())
                .map(|(i, _)| i);
            best.map(|i| lists.free.swap_remove(i))
        };

        if let Some(mut buf) = reused {
            self.counters.dec(MuxCounter::SbtxFree);
            buf.data.fill(0);
            buf.len = len;
            trace!(id = buf.id, len, capacity = buf.capacity(), "sbtx buffer reused");
            return Ok(buf);
        }

        let capacity = len
            .max(1)
            .checked_next_multiple_of(SBTX_BLOCK)
            .ok_or(MuxError::NoBuffer(len))?;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| MuxError::NoBuffer(len))?;
        data.resize(capacity, 0);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, len, capacity, "sbtx buffer allocated");
        Ok(SbTxBuffer { id, len, data })
    }

    /// Allocate a buffer and copy `bytes` into it.
    pub fn alloc_from(&self, bytes: &[u8]) -> Result<SbTxBuffer> {
        let mut buf = self.alloc(bytes.len())?;
        buf.data_mut().copy_from_slice(bytes);
        Ok(buf)
    }

    /// Return a buffer to the free pool.
    pub fn free(&self, buf: SbTxBuffer) {
        self.lock().free.push(buf);
        self.counters.inc(MuxCounter::SbtxFree);
    }

    /// Queue at the tail.
    pub fn append(&self, buf: SbTxBuffer) {
        self.lock().tx.push_back(buf);
        self.counters.inc(MuxCounter::SbtxQueued);
    }

    /// Queue at the head; used to retry a send that would have blocked.
    pub fn prepend(&self, buf: SbTxBuffer) {
        self.lock().tx.push_front(buf);
        self.counters.inc(MuxCounter::SbtxQueued);
    }

    pub fn pop(&self) -> Option<SbTxBuffer> {
        let buf = self.lock().tx.pop_front();
        if buf.is_some() {
            self.counters.dec(MuxCounter::SbtxQueued);
        }
        buf
    }

    /// Move every queued buffer to the free pool, discarding its contents.
    pub fn drain_tx(&self) -> usize {
        let mut lists = self.lock();
        let Lists { free, tx } = &mut *lists;
        let n = tx.len();
        free.extend(tx.drain(..));
        drop(lists);
        for _ in 0..n {
            self.counters.dec(MuxCounter::SbtxQueued);
            self.counters.inc(MuxCounter::SbtxFree);
        }
        n
    }

    pub fn queued(&self) -> usize {
        self.lock().tx.len()
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }
}
