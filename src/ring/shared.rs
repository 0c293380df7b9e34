//! Single-producer/single-consumer ring shared between two threads
//!
//! The same cursor arithmetic as [`RingBuffer`](super::RingBuffer), split
//! into a [`Producer`] that only advances the write cursor and a
//! [`Consumer`] that only advances the read cursor. No lock is taken: each
//! side publishes its cursor with `Release` and observes the other's with
//! `Acquire`, which orders the byte copies against the cursor updates.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::{Backoff, CachePadded};

use crate::error::{Error, Result};

/// Upper bound on one sleep once spinning has backed off completely.
const PARK_INTERVAL: Duration = Duration::from_millis(1);

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    producer_closed: AtomicBool,
    /// Set when the producer stopped on an error rather than at end of input
    producer_aborted: AtomicBool,
    consumer_closed: AtomicBool,
}

// SAFETY: the producer only writes bytes in the free region [head, tail + cap)
// and the consumer only reads bytes in [tail, head). The regions are disjoint
// and ownership of a byte moves between them only through the Release/Acquire
// cursor stores, so no byte is accessed by both sides concurrently.
unsafe impl Sync for Shared {}

impl Shared {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Raw pointer to the byte at `index`.
    fn slot(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.capacity());
        // SAFETY: index is in bounds; the pointer is derived from the whole
        // slice so copies may run to the end of the storage.
        unsafe { UnsafeCell::raw_get(self.storage.as_ptr().add(index)) }
    }

    /// Split `len` bytes starting at `cursor` into at most two runs.
    fn runs(&self, cursor: u64, len: usize) -> (usize, usize, usize) {
        let start = (cursor % self.capacity() as u64) as usize;
        let first = len.min(self.capacity() - start);
        (start, first, len - first)
    }
}

/// Create a shared ring of `capacity` bytes.
///
/// # Errors
///
/// Returns `Error::Config` if `capacity` is 0.
pub fn shared_ring(capacity: usize) -> Result<(Producer, Consumer)> {
    if capacity == 0 {
        return Err(Error::Config("shared ring capacity must be greater than 0".into()));
    }

    let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
    let shared = Arc::new(Shared {
        storage,
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
        producer_closed: AtomicBool::new(false),
        producer_aborted: AtomicBool::new(false),
        consumer_closed: AtomicBool::new(false),
    });

    Ok((
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    ))
}

fn pause(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::park_timeout(PARK_INTERVAL);
    } else {
        backoff.snooze();
    }
}

/// Writing half. Dropping it marks the stream as finished.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Copy as much of `src` as fits without waiting.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        let free = shared.capacity() - (head - tail) as usize;
        let n = free.min(src.len());
        if n == 0 {
            return 0;
        }

        let (start, first, second) = shared.runs(head, n);
        // SAFETY: [head, head + n) lies in the free region, which the
        // consumer does not touch until the head store below.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), shared.slot(start), first);
            if second > 0 {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), shared.slot(0), second);
            }
        }

        shared.head.store(head + n as u64, Ordering::Release);
        n
    }

    /// Push all of `src`, waiting for space as needed.
    ///
    /// Returns `false` if the consumer went away first.
    pub fn push_all(&mut self, mut src: &[u8]) -> bool {
        let backoff = Backoff::new();
        while !src.is_empty() {
            if self.shared.consumer_closed.load(Ordering::Acquire) {
                return false;
            }
            let n = self.push(src);
            if n == 0 {
                pause(&backoff);
            } else {
                src = &src[n..];
                backoff.reset();
            }
        }
        true
    }

    /// Close the stream as failed. The consumer still drains what was
    /// pushed, then sees [`Consumer::is_aborted`].
    pub fn abort(self) {
        self.shared.producer_aborted.store(true, Ordering::Release);
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.shared.producer_closed.store(true, Ordering::Release);
    }
}

/// Reading half. Dropping it tells the producer to stop.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Copy out whatever is buffered, up to `dst.len()`, without waiting.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let shared = &*self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        let head = shared.head.load(Ordering::Acquire);
        let n = ((head - tail) as usize).min(dst.len());
        if n == 0 {
            return 0;
        }

        let (start, first, second) = shared.runs(tail, n);
        // SAFETY: [tail, tail + n) was published by the producer's Release
        // store of head and is not rewritten until our tail store below.
        unsafe {
            ptr::copy_nonoverlapping(shared.slot(start), dst.as_mut_ptr(), first);
            if second > 0 {
                ptr::copy_nonoverlapping(shared.slot(0), dst.as_mut_ptr().add(first), second);
            }
        }

        shared.tail.store(tail + n as u64, Ordering::Release);
        n
    }

    /// Wait until some bytes arrive and copy them out.
    ///
    /// Returns 0 only once the producer is gone and everything it pushed has
    /// been consumed.
    pub fn pop_blocking(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let backoff = Backoff::new();
        loop {
            let closed = self.shared.producer_closed.load(Ordering::Acquire);
            let n = self.pop(dst);
            if n > 0 || closed {
                return n;
            }
            pause(&backoff);
        }
    }

    /// True once the producer is gone and the ring is drained.
    pub fn is_finished(&self) -> bool {
        self.shared.producer_closed.load(Ordering::Acquire)
            && self.shared.head.load(Ordering::Acquire)
                == self.shared.tail.load(Ordering::Relaxed)
    }

    /// True if the producer closed through [`Producer::abort`].
    pub fn is_aborted(&self) -> bool {
        self.shared.producer_aborted.load(Ordering::Acquire)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.consumer_closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_error() {
        assert!(shared_ring(0).is_err());
    }

    #[test]
    fn test_push_pop_wraps() {
        let (mut producer, mut consumer) = shared_ring(8).unwrap();
        assert_eq!(producer.push(&[1, 2, 3, 4, 5, 6]), 6);
        let mut out = [0u8; 4];
        assert_eq!(consumer.pop(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(producer.push(&[7, 8, 9, 10, 11, 12, 13]), 6);
        let mut out = [0u8; 8];
        assert_eq!(consumer.pop(&mut out), 8);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_finished_after_producer_drop() {
        let (mut producer, mut consumer) = shared_ring(4).unwrap();
        producer.push(&[1, 2]);
        drop(producer);
        assert!(!consumer.is_finished());

        let mut out = [0u8; 4];
        assert_eq!(consumer.pop_blocking(&mut out), 2);
        assert_eq!(consumer.pop_blocking(&mut out), 0);
        assert!(consumer.is_finished());
    }

    #[test]
    fn test_abort_distinguished_from_end() {
        let (mut producer, mut consumer) = shared_ring(4).unwrap();
        producer.push(&[9]);
        producer.abort();

        let mut out = [0u8; 4];
        assert_eq!(consumer.pop_blocking(&mut out), 1);
        assert_eq!(consumer.pop_blocking(&mut out), 0);
        assert!(consumer.is_finished());
        assert!(consumer.is_aborted());

        let (producer, consumer) = shared_ring(4).unwrap();
        drop(producer);
        assert!(!consumer.is_aborted());
    }

    #[test]
    fn test_push_all_stops_when_consumer_gone() {
        let (mut producer, consumer) = shared_ring(4).unwrap();
        drop(consumer);
        assert!(!producer.push_all(&[0u8; 16]));
    }

    #[test]
    fn test_cross_thread_transfer_preserves_order() {
        let (mut producer, mut consumer) = shared_ring(61).unwrap();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let expected = data.clone();

        let writer = thread::spawn(move || {
            for chunk in data.chunks(97) {
                assert!(producer.push_all(chunk));
            }
        });

        let mut received = Vec::with_capacity(expected.len());
        let mut buf = [0u8; 33];
        loop {
            let n = consumer.pop_blocking(&mut buf);
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        writer.join().unwrap();
        assert_eq!(received, expected);
    }
}
