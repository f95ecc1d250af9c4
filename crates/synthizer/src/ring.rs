//! Lock-free SPSC sample ring
//!
//! Bridges decode threads to the audio thread. The API is two-phase on
//! both sides: `begin_*` hands back one or two contiguous regions (two
//! when the request wraps the end of storage), `end_*` publishes how much
//! was actually produced or consumed.
//!
//! The shared counter holds the number of samples currently buffered. The
//! producer publishes with `Release` and reads free space `Relaxed`; the
//! consumer acquires the counter before touching data and releases it on
//! consumption. Wrap indices are only ever mutated by their owning side,
//! so this is sufficient.
//!
//! The consumer never blocks: on underflow `begin_read` returns empty
//! regions and the caller emits silence for the tick. The producer blocks
//! on a read-end event when the ring is full; decode threads are expected
//! to run ahead of the audio thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::types::Sample;

/// Auto-reset wakeup used by the producer to wait for read progress.
///
/// `signal` has an atomic fast path so the audio thread only touches the
/// mutex when a producer is actually parked.
struct ReadEndEvent {
    waiting: AtomicBool,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl ReadEndEvent {
    fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Park until signaled, or until a short timeout elapses. The timeout
    /// bounds the window where a signal races the `waiting` flag; callers
    /// re-check their predicate in a loop.
    fn wait(&self) {
        self.waiting.store(true, Ordering::SeqCst);
        let signaled = self.signaled.lock().unwrap();
        let (mut signaled, _) = self
            .condvar
            .wait_timeout(signaled, std::time::Duration::from_millis(10))
            .unwrap();
        *signaled = false;
        self.waiting.store(false, Ordering::SeqCst);
    }

    fn signal(&self) {
        if !self.waiting.load(Ordering::SeqCst) {
            return;
        }
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.condvar.notify_one();
    }
}

struct RingShared {
    storage: UnsafeCell<Box<[Sample]>>,
    capacity: usize,
    /// Samples currently in the buffer.
    samples_in_buffer: AtomicUsize,
    read_end_event: ReadEndEvent,
    reader_closed: AtomicBool,
    writer_closed: AtomicBool,
}

// Safety: the writer only touches the free region, the reader only the
// filled region, and the boundary is published through samples_in_buffer
// with release/acquire ordering.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Producer half of an [`audio_ring`].
pub struct RingWriter {
    shared: Arc<RingShared>,
    write_pointer: usize,
    pending_write: usize,
}

/// Consumer half of an [`audio_ring`].
pub struct RingReader {
    shared: Arc<RingShared>,
    read_pointer: usize,
    pending_read: usize,
}

/// One or two contiguous regions of ring storage.
///
/// The second slice is non-empty only when the request wraps the end of
/// the buffer. Callers fill (or drain) in order: `first`, then `second`.
pub struct Regions<'a> {
    pub first: &'a mut [Sample],
    pub second: &'a mut [Sample],
}

impl Regions<'_> {
    /// Total samples across both regions.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// Copy from `src` into the regions, returning samples copied.
    pub fn copy_from(&mut self, src: &[Sample]) -> usize {
        let n1 = self.first.len().min(src.len());
        self.first[..n1].copy_from_slice(&src[..n1]);
        let n2 = self.second.len().min(src.len() - n1);
        self.second[..n2].copy_from_slice(&src[n1..n1 + n2]);
        n1 + n2
    }

    /// Copy out of the regions into `dst`, returning samples copied.
    pub fn copy_to(&self, dst: &mut [Sample]) -> usize {
        let n1 = self.first.len().min(dst.len());
        dst[..n1].copy_from_slice(&self.first[..n1]);
        let n2 = self.second.len().min(dst.len() - n1);
        dst[n1..n1 + n2].copy_from_slice(&self.second[..n2]);
        n1 + n2
    }
}

/// Create a heap-backed SPSC ring holding `capacity` samples.
pub fn audio_ring(capacity: usize) -> (RingWriter, RingReader) {
    assert!(capacity > 0, "ring capacity must be nonzero");
    let shared = Arc::new(RingShared {
        storage: UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()),
        capacity,
        samples_in_buffer: AtomicUsize::new(0),
        read_end_event: ReadEndEvent::new(),
        reader_closed: AtomicBool::new(false),
        writer_closed: AtomicBool::new(false),
    });
    (
        RingWriter {
            shared: shared.clone(),
            write_pointer: 0,
            pending_write: 0,
        },
        RingReader {
            shared,
            read_pointer: 0,
            pending_read: 0,
        },
    )
}

/// Split `[start, start + len)` of the storage into at most two slices.
///
/// Safety: caller must own that span per the SPSC protocol.
unsafe fn regions_at(shared: &RingShared, start: usize, len: usize) -> Regions<'_> {
    let storage = &mut *shared.storage.get();
    let base = storage.as_mut_ptr();
    let size1 = len.min(shared.capacity - start);
    let size2 = len - size1;
    Regions {
        first: std::slice::from_raw_parts_mut(base.add(start), size1),
        second: std::slice::from_raw_parts_mut(base, size2),
    }
}

impl RingWriter {
    /// Ring capacity in samples.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Begin a write of at least `requested` samples.
    ///
    /// Blocks on the read-end event until enough space frees up. With
    /// `max_available` the returned regions cover all free space (but
    /// never less than `requested`). Returns `None` if the reader is gone,
    /// so decode loops unwind instead of blocking forever.
    pub fn begin_write(&mut self, requested: usize, max_available: bool) -> Option<Regions<'_>> {
        assert!(requested > 0 && requested <= self.shared.capacity);

        let available = loop {
            if self.shared.reader_closed.load(Ordering::Acquire) {
                return None;
            }
            let used = self.shared.samples_in_buffer.load(Ordering::Relaxed);
            let free = self.shared.capacity - used;
            if free >= requested {
                break free;
            }
            self.shared.read_end_event.wait();
        };

        let allocating = if max_available { available } else { requested };
        self.pending_write = allocating;
        // Safety: [write_pointer, +allocating) is free space owned by us.
        Some(unsafe { regions_at(&self.shared, self.write_pointer, allocating) })
    }

    /// Non-blocking variant: returns however much space is free right now
    /// (possibly empty regions).
    pub fn begin_write_available(&mut self) -> Regions<'_> {
        let used = self.shared.samples_in_buffer.load(Ordering::Relaxed);
        let free = self.shared.capacity - used;
        self.pending_write = free;
        unsafe { regions_at(&self.shared, self.write_pointer, free) }
    }

    /// Publish `amount` written samples. May be called in chunks.
    pub fn end_write(&mut self, amount: usize) {
        assert!(amount <= self.pending_write);
        self.pending_write -= amount;
        self.write_pointer = (self.write_pointer + amount) % self.shared.capacity;
        self.shared
            .samples_in_buffer
            .fetch_add(amount, Ordering::Release);
    }

    /// True once the reader half has been dropped.
    pub fn is_reader_closed(&self) -> bool {
        self.shared.reader_closed.load(Ordering::Acquire)
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.shared.writer_closed.store(true, Ordering::Release);
    }
}

impl RingReader {
    /// Samples currently readable.
    pub fn available(&self) -> usize {
        self.shared.samples_in_buffer.load(Ordering::Acquire)
    }

    /// Begin a read of `requested` samples. Never blocks.
    ///
    /// With `max_available = false`, returns empty regions unless at least
    /// `requested` samples are buffered. With `max_available = true`,
    /// returns whatever is buffered, which may be less than requested.
    pub fn begin_read(&mut self, requested: usize, max_available: bool) -> Regions<'_> {
        assert!(requested > 0 && requested <= self.shared.capacity);

        let available = self.shared.samples_in_buffer.load(Ordering::Acquire);
        if available == 0 || (available < requested && !max_available) {
            self.pending_read = 0;
            return Regions {
                first: &mut [],
                second: &mut [],
            };
        }

        let allocating = if max_available {
            available
        } else {
            requested
        };
        self.pending_read = allocating;
        // Safety: [read_pointer, +allocating) holds published data owned
        // by the consumer side until end_read.
        unsafe { regions_at(&self.shared, self.read_pointer, allocating) }
    }

    /// Consume `amount` samples and wake a waiting producer.
    pub fn end_read(&mut self, amount: usize) {
        assert!(amount <= self.pending_read);
        self.pending_read -= amount;
        self.read_pointer = (self.read_pointer + amount) % self.shared.capacity;
        self.shared
            .samples_in_buffer
            .fetch_sub(amount, Ordering::Release);
        self.shared.read_end_event.signal();
    }

    /// True once the writer half has been dropped.
    pub fn is_writer_closed(&self) -> bool {
        self.shared.writer_closed.load(Ordering::Acquire)
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.shared.reader_closed.store(true, Ordering::Release);
        // A producer blocked in begin_write must notice and give up.
        self.shared.read_end_event.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let (mut w, mut r) = audio_ring(16);

        let mut regions = w.begin_write(4, false).unwrap();
        assert_eq!(regions.len(), 4);
        regions.copy_from(&[1.0, 2.0, 3.0, 4.0]);
        drop(regions);
        w.end_write(4);

        let mut out = [0.0; 4];
        let regions = r.begin_read(4, false);
        assert_eq!(regions.len(), 4);
        regions.copy_to(&mut out);
        drop(regions);
        r.end_read(4);

        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_underflow_returns_empty() {
        let (mut w, mut r) = audio_ring(8);
        let mut regions = w.begin_write(3, false).unwrap();
        regions.copy_from(&[1.0, 2.0, 3.0]);
        drop(regions);
        w.end_write(3);

        // Strict request for more than available: empty.
        assert!(r.begin_read(4, false).is_empty());
        // max_available returns the 3 that exist.
        assert_eq!(r.begin_read(4, true).len(), 3);
        r.end_read(3);
    }

    #[test]
    fn test_wrap_produces_two_regions() {
        let (mut w, mut r) = audio_ring(8);

        // Advance both pointers to 6.
        let mut regions = w.begin_write(6, false).unwrap();
        regions.copy_from(&[0.0; 6]);
        drop(regions);
        w.end_write(6);
        r.begin_read(6, false);
        r.end_read(6);

        // A 4-sample write now wraps: 2 at the end, 2 at the front.
        let mut regions = w.begin_write(4, false).unwrap();
        assert_eq!(regions.first.len(), 2);
        assert_eq!(regions.second.len(), 2);
        regions.copy_from(&[5.0, 6.0, 7.0, 8.0]);
        drop(regions);
        w.end_write(4);

        let mut out = [0.0; 4];
        let regions = r.begin_read(4, false);
        regions.copy_to(&mut out);
        drop(regions);
        r.end_read(4);
        assert_eq!(out, [5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_fifo_across_threads() {
        let (mut w, mut r) = audio_ring(64);
        const TOTAL: usize = 10_000;

        let producer = thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let chunk = (TOTAL - next).min(16);
                let mut regions = match w.begin_write(chunk, false) {
                    Some(r) => r,
                    None => return,
                };
                for i in 0..chunk {
                    let v = (next + i) as Sample;
                    if i < regions.first.len() {
                        regions.first[i] = v;
                    } else {
                        regions.second[i - regions.first.len()] = v;
                    }
                }
                drop(regions);
                w.end_write(chunk);
                next += chunk;
            }
        });

        let mut expected = 0usize;
        while expected < TOTAL {
            let n;
            {
                let regions = r.begin_read(1, true);
                n = regions.len();
                let mut buf = vec![0.0; n];
                regions.copy_to(&mut buf);
                for &v in &buf {
                    assert_eq!(v, expected as Sample);
                    expected += 1;
                }
            }
            if n > 0 {
                r.end_read(n);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_blocked_writer_wakes_on_reader_drop() {
        let (mut w, r) = audio_ring(4);
        let mut regions = w.begin_write(4, false).unwrap();
        regions.copy_from(&[0.0; 4]);
        drop(regions);
        w.end_write(4);

        let blocked = thread::spawn(move || {
            // Ring is full; this blocks until the reader disappears.
            w.begin_write(1, false).is_none()
        });
        thread::sleep(std::time::Duration::from_millis(50));
        drop(r);
        assert!(blocked.join().unwrap());
    }
}
