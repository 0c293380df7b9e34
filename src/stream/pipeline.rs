//! Overlapped record and playback
//!
//! Application I/O and chain I/O run on two threads joined by a
//! [`shared_ring`]: one side only advances the write cursor, the other only
//! the read cursor. The chain always stays on the caller's thread.
//!
//! ```text
//! record:  input ──(worker)──▶ shared ring ──(caller)──▶ chain ──▶ device
//! play:    device ──▶ chain ──(caller)──▶ shared ring ──(worker)──▶ output
//! ```

use std::io::{self, Read, Write};
use std::thread::{self, ScopedJoinHandle};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ring::{shared_ring, Consumer, Producer};

use super::driver::Driver;
use super::node::StreamNode;

/// Largest single copy between a worker and its handle.
const CHUNK: usize = 16 * 1024;

/// Record everything from `input` through `node`, which must already be
/// started for writing. Flushes and releases the chain at the end.
///
/// If reading `input` fails, the chain is released without flushing so no
/// padded partial sector reaches the device, and the input error is
/// returned. A chain error takes precedence over an input error.
///
/// Returns the number of bytes recorded.
pub fn record<R: Read + Send>(
    input: R,
    node: &mut StreamNode,
    driver: &Driver,
    capacity: usize,
) -> Result<u64> {
    let (producer, mut consumer) = shared_ring(capacity)?;
    let mut chunk = vec![0u8; capacity.min(CHUNK)];

    thread::scope(|scope| {
        let reader = scope.spawn(move || pump_reader(input, producer));
        let fed = feed_chain(&mut consumer, node, driver, &mut chunk);
        // Unblocks the reader if the chain gave up early
        drop(consumer);
        let read = join(reader);

        if fed.is_err() || read.is_err() {
            node.release();
        }
        let recorded = fed?;
        let read = read?;
        info!(recorded, read, "Recording complete");
        Ok(recorded)
    })
}

/// Play `node`, which must already be started for reading, into `output`
/// until end of stream. Releases the chain at the end.
///
/// Returns the number of bytes written to `output`. If both sides fail the
/// output error is returned.
pub fn play<W: Write + Send>(
    node: &mut StreamNode,
    output: W,
    driver: &Driver,
    capacity: usize,
) -> Result<u64> {
    let (mut producer, consumer) = shared_ring(capacity)?;
    let mut chunk = vec![0u8; capacity.min(CHUNK)];

    thread::scope(|scope| {
        let writer = scope.spawn(move || pump_writer(consumer, output));
        let drained = drain_chain(node, driver, &mut producer, &mut chunk);
        drop(producer);
        let written = join(writer);

        if drained.is_err() {
            node.release();
        }
        let written = written?;
        let played = drained?;
        info!(played, written, "Playback complete");
        Ok(written)
    })
}

fn feed_chain(
    consumer: &mut Consumer,
    node: &mut StreamNode,
    driver: &Driver,
    chunk: &mut [u8],
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let n = consumer.pop_blocking(chunk);
        if n == 0 {
            break;
        }
        driver.write_all(node, &chunk[..n])?;
        total += n as u64;
    }

    if consumer.is_aborted() {
        warn!(total, "Input failed, releasing chain without flushing");
        node.release();
        return Ok(total);
    }

    debug!(total, "Input exhausted, flushing chain");
    driver.finish(node)?;
    Ok(total)
}

fn drain_chain(
    node: &mut StreamNode,
    driver: &Driver,
    producer: &mut Producer,
    chunk: &mut [u8],
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let n = driver.read(node, chunk)?;
        if n == 0 {
            break;
        }
        if !producer.push_all(&chunk[..n]) {
            debug!(total, "Output closed, stopping playback");
            break;
        }
        total += n as u64;
    }

    node.release();
    Ok(total)
}

fn pump_reader<R: Read>(mut input: R, mut producer: Producer) -> Result<u64> {
    let mut buf = vec![0u8; producer.capacity().min(CHUNK)];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                producer.abort();
                return Err(Error::Io(err));
            }
        };
        if !producer.push_all(&buf[..n]) {
            break;
        }
        total += n as u64;
    }
    Ok(total)
}

fn pump_writer<W: Write>(mut consumer: Consumer, mut output: W) -> Result<u64> {
    let mut buf = vec![0u8; consumer.capacity().min(CHUNK)];
    let mut total = 0u64;
    loop {
        let n = consumer.pop_blocking(&mut buf);
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.flush()?;
    Ok(total)
}

fn join<T>(handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::Internal("pipeline worker panicked".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryDevice;
    use crate::domain::Direction;
    use crate::format::{Density, FormatVariant, ModeWord, VideoStandard};
    use crate::stream::node::{StreamOptions, DEFAULT_FILLER};
    use std::io::Cursor;

    fn mode() -> ModeWord {
        ModeWord::pack(
            Some(VideoStandard::Ntsc),
            Some(Density::High),
            Some(FormatVariant::Ep),
            None,
        )
    }

    #[test]
    fn test_record_then_play() {
        let options = StreamOptions::default();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let device = MemoryDevice::new();

        let mut chain = StreamNode::tape_chain(mode(), device.clone(), &options).unwrap();
        chain.start(Direction::Write).unwrap();
        let recorded = record(Cursor::new(payload.clone()), &mut chain, &Driver::default(), 1000)
            .unwrap();
        assert_eq!(recorded, payload.len() as u64);

        let sector = mode().geometry().unwrap().data_size;
        let sectors = payload.len().div_ceil(sector);
        let field = mode().geometry().unwrap().field_size();
        assert_eq!(device.output().len(), sectors * field);

        let mut chain =
            StreamNode::tape_chain(mode(), MemoryDevice::with_input(device.output()), &options)
                .unwrap();
        chain.start(Direction::Read).unwrap();
        let mut out = Vec::new();
        let played = play(&mut chain, &mut out, &Driver::default(), 777).unwrap();

        assert_eq!(played, (sectors * sector) as u64);
        assert_eq!(&out[..payload.len()], payload.as_slice());
        assert!(out[payload.len()..].iter().all(|&b| b == DEFAULT_FILLER));
    }

    #[test]
    fn test_failed_input_is_not_flushed() {
        struct FailsAfter(usize);
        impl Read for FailsAfter {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::Other, "input broke"));
                }
                let n = buf.len().min(self.0);
                buf[..n].fill(0xAB);
                self.0 -= n;
                Ok(n)
            }
        }

        let device = MemoryDevice::new();
        let mut chain =
            StreamNode::tape_chain(mode(), device.clone(), &StreamOptions::default()).unwrap();
        chain.start(Direction::Write).unwrap();

        let err = record(FailsAfter(100), &mut chain, &Driver::default(), 1000).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::Other));
        assert_eq!(chain.state(), crate::stream::NodeState::Stopped);
        assert_eq!(device.output().len(), 0);
        assert_eq!(device.flushes(), 0);
    }

    #[test]
    fn test_output_error_wins() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let options = StreamOptions::default();
        let mut chain =
            StreamNode::device(mode(), 4, MemoryDevice::with_input(vec![1u8; 4096]), &options)
                .unwrap();
        chain.start(Direction::Read).unwrap();

        let err = play(&mut chain, Broken, &Driver::default(), 64).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(chain.state(), crate::stream::NodeState::Stopped);
    }
}
