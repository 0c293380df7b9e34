//! In-memory device
//!
//! A scriptable [`DeviceIo`] backed by byte buffers. Cloning yields another
//! handle on the same device, so a test can keep one handle for inspection
//! after moving the other into a chain.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::domain::ports::{DeviceIo, Direction, Flush, Transfer};
use crate::error::{Error, Result};

/// Outcome forced on the next device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Report not-ready without touching the data
    WouldBlock,
    /// Fail with an OS error of this kind
    Fail(io::ErrorKind),
    /// Behave normally
    Pass,
}

#[derive(Debug, Default)]
struct Inner {
    input: BytesMut,
    output: BytesMut,
    script: VecDeque<Step>,
    max_chunk: Option<usize>,
    keep_open: bool,
    start_failure: Option<io::ErrorKind>,

    starts: u64,
    reads: u64,
    writes: u64,
    flushes: u64,
    releases: u64,
}

impl Inner {
    fn limit(&self, len: usize) -> usize {
        self.max_chunk.map_or(len, |max| len.min(max))
    }

    fn next_step(&mut self, operation: &'static str) -> Result<Option<Transfer>> {
        match self.script.pop_front().unwrap_or(Step::Pass) {
            Step::Pass => Ok(None),
            Step::WouldBlock => Ok(Some(Transfer::WouldBlock)),
            Step::Fail(kind) => Err(Error::device(
                operation,
                io::Error::new(kind, "scripted failure"),
            )),
        }
    }
}

/// Device that reads from and writes to memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDevice {
    /// Empty device. Reads report end of stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose reads return `data`.
    pub fn with_input(data: impl AsRef<[u8]>) -> Self {
        let device = Self::new();
        device.push_input(data);
        device
    }

    /// Limit every transfer to at most `max` bytes.
    pub fn with_max_chunk(self, max: usize) -> Self {
        self.inner.lock().max_chunk = Some(max.max(1));
        self
    }

    /// Append bytes for later reads.
    pub fn push_input(&self, data: impl AsRef<[u8]>) {
        self.inner.lock().input.extend_from_slice(data.as_ref());
    }

    /// When open, an exhausted input reports would-block instead of end of
    /// stream.
    pub fn keep_open(&self, open: bool) {
        self.inner.lock().keep_open = open;
    }

    /// Queue outcomes for the next reads and writes, one per call.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.inner.lock().script.extend(steps);
    }

    /// Make the next `start` fail.
    pub fn fail_next_start(&self, kind: io::ErrorKind) {
        self.inner.lock().start_failure = Some(kind);
    }

    /// Everything written so far.
    pub fn output(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().output)
    }

    /// Take everything written so far, leaving the output empty.
    pub fn take_output(&self) -> Bytes {
        self.inner.lock().output.split().freeze()
    }

    /// Bytes not yet read.
    pub fn remaining_input(&self) -> usize {
        self.inner.lock().input.len()
    }

    pub fn starts(&self) -> u64 {
        self.inner.lock().starts
    }

    pub fn reads(&self) -> u64 {
        self.inner.lock().reads
    }

    pub fn writes(&self) -> u64 {
        self.inner.lock().writes
    }

    pub fn flushes(&self) -> u64 {
        self.inner.lock().flushes
    }

    pub fn releases(&self) -> u64 {
        self.inner.lock().releases
    }
}

impl DeviceIo for MemoryDevice {
    fn start(&mut self, _direction: Direction) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.starts += 1;
        match inner.start_failure.take() {
            Some(kind) => Err(Error::device("start", io::Error::new(kind, "scripted failure"))),
            None => Ok(()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        let mut inner = self.inner.lock();
        inner.reads += 1;
        if let Some(transfer) = inner.next_step("read")? {
            return Ok(transfer);
        }

        if inner.input.is_empty() {
            return Ok(if inner.keep_open {
                Transfer::WouldBlock
            } else {
                Transfer::EndOfStream
            });
        }

        let n = inner.limit(buf.len()).min(inner.input.len());
        buf[..n].copy_from_slice(&inner.input[..n]);
        inner.input.advance(n);
        Ok(Transfer::Bytes(n))
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        let mut inner = self.inner.lock();
        inner.writes += 1;
        if let Some(transfer) = inner.next_step("write")? {
            return Ok(transfer);
        }

        let n = inner.limit(buf.len());
        inner.output.extend_from_slice(&buf[..n]);
        Ok(Transfer::Bytes(n))
    }

    fn flush(&mut self) -> Result<Flush> {
        self.inner.lock().flushes += 1;
        Ok(Flush::Complete)
    }

    fn release(&mut self) {
        self.inner.lock().releases += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_reads_input_then_end_of_stream() {
        let mut device = MemoryDevice::with_input(b"hello").with_max_chunk(3);
        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), Transfer::Bytes(3));
        assert_eq!(&buf[..3], b"hel");
        assert_eq!(device.read(&mut buf).unwrap(), Transfer::Bytes(2));
        assert_eq!(device.read(&mut buf).unwrap(), Transfer::EndOfStream);
        assert_eq!(device.reads(), 3);
    }

    #[test]
    fn test_keep_open_reports_would_block() {
        let mut device = MemoryDevice::new();
        device.keep_open(true);
        assert_eq!(device.read(&mut [0u8; 4]).unwrap(), Transfer::WouldBlock);
        device.push_input([1u8, 2]);
        assert_eq!(device.read(&mut [0u8; 4]).unwrap(), Transfer::Bytes(2));
    }

    #[test]
    fn test_script_applies_in_order() {
        let mut device = MemoryDevice::new();
        device.script([
            Step::WouldBlock,
            Step::Fail(io::ErrorKind::BrokenPipe),
            Step::Pass,
        ]);

        assert_eq!(device.write(b"ab").unwrap(), Transfer::WouldBlock);
        assert_matches!(
            device.write(b"ab"),
            Err(Error::DeviceFailure { operation: "write", .. })
        );
        assert_eq!(device.write(b"ab").unwrap(), Transfer::Bytes(2));
        assert_eq!(device.write(b"cd").unwrap(), Transfer::Bytes(2));
        assert_eq!(&device.take_output()[..], b"abcd");
        assert!(device.output().is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let handle = MemoryDevice::new();
        let mut device = handle.clone();
        device.write(b"xyz").unwrap();
        device.release();
        assert_eq!(&handle.output()[..], b"xyz");
        assert_eq!(handle.releases(), 1);
    }
}
