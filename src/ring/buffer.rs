//! Fixed-capacity circular byte buffer
//!
//! Two cursors count every byte ever written and read; positions in the
//! storage are those counts modulo capacity. The buffer never blocks and
//! never resizes. Backpressure is the owner's decision, made from
//! [`RingBuffer::bytes_available`] and [`RingBuffer::space_available`].

use crate::error::{Error, Result};

/// Circular byte buffer with separate fill and drain cursors.
///
/// # Unit alignment
///
/// When the capacity is a whole multiple of some unit and a cursor only
/// ever advances in whole units, a unit never straddles the wrap point:
/// [`readable`](Self::readable) or [`writable`](Self::writable) at that
/// cursor is always at least one unit long once a unit is available. Stream
/// nodes rely on this to transform sectors in place.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Total bytes written
    head: u64,
    /// Total bytes read; never passes `head`
    tail: u64,
}

impl RingBuffer {
    /// Create a ring of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `capacity` is 0.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("ring buffer capacity must be greater than 0".into()));
        }

        Ok(Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        })
    }

    /// Create a ring holding exactly `units` units of `unit` bytes.
    pub fn with_units(unit: usize, units: usize) -> Result<Self> {
        let capacity = unit.checked_mul(units).ok_or_else(|| {
            Error::Config(format!("ring of {} x {} bytes overflows", units, unit))
        })?;
        if unit == 0 || units == 0 {
            return Err(Error::Config(format!(
                "ring must hold at least one unit (unit={}, units={})",
                unit, units
            )));
        }
        Self::new(capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes written but not yet read.
    #[inline]
    pub fn bytes_available(&self) -> usize {
        (self.head - self.tail) as usize
    }

    /// Bytes that can be written before the ring is full.
    #[inline]
    pub fn space_available(&self) -> usize {
        self.capacity() - self.bytes_available()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bytes_available() == self.capacity()
    }

    /// Total bytes ever written.
    pub fn total_written(&self) -> u64 {
        self.head
    }

    /// Total bytes ever read.
    pub fn total_read(&self) -> u64 {
        self.tail
    }

    #[inline]
    fn index(&self, cursor: u64) -> usize {
        (cursor % self.capacity() as u64) as usize
    }

    /// Copy as much of `src` as fits. Returns the number of bytes taken.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut done = 0;
        while done < src.len() {
            let slot = self.writable();
            if slot.is_empty() {
                break;
            }
            let n = slot.len().min(src.len() - done);
            slot[..n].copy_from_slice(&src[done..done + n]);
            self.commit(n);
            done += n;
        }
        done
    }

    /// Copy up to `dst.len()` buffered bytes out. Returns the number copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// Like [`read`](Self::read) but leaves the bytes in the ring.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.bytes_available());
        let start = self.index(self.tail);
        let first = n.min(self.capacity() - start);
        dst[..first].copy_from_slice(&self.storage[start..start + first]);
        dst[first..n].copy_from_slice(&self.storage[..n - first]);
        n
    }

    /// Pad with `filler` until at least `n` bytes are available to read.
    ///
    /// Never pads past capacity. Returns the number of filler bytes added;
    /// zero when `n` bytes were already available.
    pub fn fill_to(&mut self, n: usize, filler: u8) -> usize {
        let target = n.min(self.capacity());
        let mut padded = 0;
        while self.bytes_available() < target {
            let missing = target - self.bytes_available();
            let slot = self.writable();
            let chunk = slot.len().min(missing);
            slot[..chunk].fill(filler);
            self.commit(chunk);
            padded += chunk;
        }
        padded
    }

    /// Contiguous run of readable bytes starting at the read cursor.
    pub fn readable(&self) -> &[u8] {
        let start = self.index(self.tail);
        let len = self.bytes_available().min(self.capacity() - start);
        &self.storage[start..start + len]
    }

    /// Mutable view of [`readable`](Self::readable), for in-place transforms.
    pub fn readable_mut(&mut self) -> &mut [u8] {
        let start = self.index(self.tail);
        let len = self.bytes_available().min(self.capacity() - start);
        &mut self.storage[start..start + len]
    }

    /// Advance the read cursor past `n` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are available.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.bytes_available(),
            "consume past write cursor: {} > {}",
            n,
            self.bytes_available()
        );
        self.tail += n as u64;
    }

    /// Contiguous run of free space starting at the write cursor.
    pub fn writable(&mut self) -> &mut [u8] {
        let start = self.index(self.head);
        let len = self.space_available().min(self.capacity() - start);
        &mut self.storage[start..start + len]
    }

    /// Publish `n` bytes written through [`writable`](Self::writable).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the free space.
    pub fn commit(&mut self, n: usize) {
        assert!(
            n <= self.space_available(),
            "commit past capacity: {} > {}",
            n,
            self.space_available()
        );
        self.head += n as u64;
    }

    /// Drop all buffered bytes and rewind both cursors.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}
