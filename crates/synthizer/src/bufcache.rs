//! Pooled per-block scratch buffers
//!
//! Every source and generator needs one or more `MAX_CHANNELS × BLOCK_SIZE`
//! scratch buffers per tick. They are pooled so the audio thread reuses
//! the same allocations tick after tick: a fixed reserve is populated at
//! context construction and acquisition past the reserve is a bug
//! (asserted in debug builds).
//!
//! Buffers are zeroed on acquisition and handed back dirty when the guard
//! drops.

use std::cell::RefCell;

use crate::types::{Sample, BLOCK_SIZE, MAX_CHANNELS};

/// Samples per pooled buffer.
pub const BUFFER_SAMPLES: usize = MAX_CHANNELS * BLOCK_SIZE;

/// Pool of scratch buffers owned by the audio thread.
pub struct BlockBufferCache {
    free: RefCell<Vec<Box<[Sample; BUFFER_SAMPLES]>>>,
    reserve: usize,
    outstanding: std::cell::Cell<usize>,
    overflowed: std::cell::Cell<bool>,
}

impl BlockBufferCache {
    /// Create a cache with `reserve` buffers pre-populated.
    pub fn with_reserve(reserve: usize) -> Self {
        let free = (0..reserve)
            .map(|_| Box::new([0.0; BUFFER_SAMPLES]))
            .collect();
        Self {
            free: RefCell::new(free),
            reserve,
            outstanding: std::cell::Cell::new(0),
            overflowed: std::cell::Cell::new(false),
        }
    }

    /// Acquire a zeroed buffer for the rest of the tick scope.
    ///
    /// The hot path pops from the free list. An empty list means the
    /// reserve was sized wrong: the fallback allocation keeps audio
    /// flowing for this tick and latches the overflow flag, which the
    /// scheduler turns into an invariant failure at end-of-block.
    pub fn acquire(&self) -> BlockBufferGuard<'_> {
        let mut buf = match self.free.borrow_mut().pop() {
            Some(buf) => buf,
            None => {
                self.overflowed.set(true);
                Box::new([0.0; BUFFER_SAMPLES])
            }
        };
        buf.fill(0.0);
        self.outstanding.set(self.outstanding.get() + 1);
        BlockBufferGuard { cache: self, buf: Some(buf) }
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Configured reserve size.
    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// True once an acquisition had to allocate past the reserve.
    pub fn overflowed(&self) -> bool {
        self.overflowed.get()
    }
}

/// Scope guard for a pooled buffer; derefs to the full sample storage.
pub struct BlockBufferGuard<'a> {
    cache: &'a BlockBufferCache,
    buf: Option<Box<[Sample; BUFFER_SAMPLES]>>,
}

impl BlockBufferGuard<'_> {
    /// View the first `channels × BLOCK_SIZE` samples as an interleaved bus.
    pub fn bus(&self, channels: usize) -> &[Sample] {
        &self.buf.as_ref().unwrap()[..channels * BLOCK_SIZE]
    }

    /// Mutable interleaved bus view.
    pub fn bus_mut(&mut self, channels: usize) -> &mut [Sample] {
        &mut self.buf.as_mut().unwrap()[..channels * BLOCK_SIZE]
    }
}

impl std::ops::Deref for BlockBufferGuard<'_> {
    type Target = [Sample; BUFFER_SAMPLES];
    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for BlockBufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for BlockBufferGuard<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.cache.free.borrow_mut().push(buf);
            self.cache.outstanding.set(self.cache.outstanding.get() - 1);
        }
    }
}
