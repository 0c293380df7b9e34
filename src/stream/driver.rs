//! Retry driver
//!
//! Stream nodes never block; they report would-block and leave the retry
//! policy to their caller. [`Driver`] is that caller for code that wants
//! blocking semantics: it retries after the device signals readiness
//! ([`RetryStrategy::Poll`]) or after an exponential spin
//! ([`RetryStrategy::Spin`]), and gives up with `Error::Timeout` once the
//! advisory timeout has passed without progress, reporting the stall on the
//! node first.

use std::thread;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

use crate::domain::{Flush, Readiness, Transfer};
use crate::error::{Error, Result};
use crate::format::ModeWord;

use super::node::StreamNode;

/// Sleep once spinning has backed off completely.
const SPIN_PARK: Duration = Duration::from_millis(1);

/// How to wait after a would-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Wait on the device's readiness signal
    #[default]
    Poll,
    /// Spin with exponential backoff
    Spin,
}

/// Blocking front end for a stream chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Driver {
    timeout: Option<Duration>,
    strategy: RetryStrategy,
}

impl Driver {
    /// `timeout` of `None` waits indefinitely.
    pub fn new(timeout: Option<Duration>, strategy: RetryStrategy) -> Self {
        Self { timeout, strategy }
    }

    /// Driver using the timeout carried in `mode`.
    pub fn for_mode(mode: ModeWord, strategy: RetryStrategy) -> Self {
        Self::new(mode.timeout(), strategy)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Write all of `buf`, waiting whenever the chain is full.
    pub fn write_all(&self, node: &mut StreamNode, mut buf: &[u8]) -> Result<()> {
        let mut waiter = Waiter::new(self);
        while !buf.is_empty() {
            match node.write(buf)? {
                Transfer::Bytes(n) => {
                    buf = &buf[n..];
                    waiter.reset();
                }
                Transfer::WouldBlock => waiter.wait(node)?,
                Transfer::EndOfStream => {
                    return Err(Error::Internal(format!(
                        "{} stream reported end of stream on write",
                        node.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Read into `buf`, waiting until some bytes arrive.
    ///
    /// Returns 0 only at end of stream (or for an empty `buf`).
    pub fn read(&self, node: &mut StreamNode, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut waiter = Waiter::new(self);
        loop {
            match node.read(buf)? {
                Transfer::Bytes(n) => return Ok(n),
                Transfer::WouldBlock => waiter.wait(node)?,
                Transfer::EndOfStream => return Ok(0),
            }
        }
    }

    /// Flush until everything has reached the device.
    pub fn flush(&self, node: &mut StreamNode) -> Result<()> {
        let mut waiter = Waiter::new(self);
        loop {
            match node.flush()? {
                Flush::Complete => return Ok(()),
                Flush::Pending => waiter.wait(node)?,
            }
        }
    }

    /// Flush, then release the chain whatever the outcome.
    pub fn finish(&self, node: &mut StreamNode) -> Result<()> {
        let result = self.flush(node);
        node.release();
        result
    }
}

/// Wait state across the retries of one operation.
struct Waiter {
    timeout: Option<Duration>,
    strategy: RetryStrategy,
    backoff: Backoff,
    since: Option<Instant>,
}

impl Waiter {
    fn new(driver: &Driver) -> Self {
        Self {
            timeout: driver.timeout,
            strategy: driver.strategy,
            backoff: Backoff::new(),
            since: None,
        }
    }

    fn reset(&mut self) {
        self.since = None;
        self.backoff.reset();
    }

    fn wait(&mut self, node: &mut StreamNode) -> Result<()> {
        let since = *self.since.get_or_insert_with(Instant::now);
        let waited = since.elapsed();
        let remaining = match self.timeout {
            Some(limit) if waited >= limit => return stall(node, waited),
            Some(limit) => Some(limit - waited),
            None => None,
        };

        match self.strategy {
            RetryStrategy::Poll => {
                if node.wait_ready(remaining)? == Readiness::TimedOut {
                    return stall(node, since.elapsed());
                }
            }
            RetryStrategy::Spin => {
                if self.backoff.is_completed() {
                    thread::sleep(SPIN_PARK);
                } else {
                    self.backoff.snooze();
                }
            }
        }
        Ok(())
    }
}

fn stall(node: &mut StreamNode, waited: Duration) -> Result<()> {
    node.report_stall(waited);
    Err(Error::Timeout {
        node: node.name(),
        waited,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{MemoryDevice, Step};
    use crate::domain::{Direction, EventPublisher};
    use crate::format::{Density, FormatVariant, VideoStandard};
    use crate::stream::node::StreamOptions;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn mode() -> ModeWord {
        ModeWord::pack(
            Some(VideoStandard::Pal),
            Some(Density::Low),
            Some(FormatVariant::Ep),
            None,
        )
    }

    fn device_node(device: MemoryDevice, collector: &Arc<InMemoryEventCollector>) -> StreamNode {
        let options = StreamOptions {
            ring_units: 1,
            ..StreamOptions::default()
        }
        .with_publisher(Arc::clone(collector) as Arc<dyn EventPublisher>);
        StreamNode::device(mode(), 8, device, &options).unwrap()
    }

    #[test]
    fn test_write_all_retries_would_block() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        device.script([Step::WouldBlock, Step::WouldBlock, Step::WouldBlock]);
        let mut node = device_node(device.clone(), &collector);
        node.start(Direction::Write).unwrap();

        let data: Vec<u8> = (0..40).collect();
        for strategy in [RetryStrategy::Poll, RetryStrategy::Spin] {
            let driver = Driver::new(None, strategy);
            driver.write_all(&mut node, &data).unwrap();
        }
        Driver::default().finish(&mut node).unwrap();

        let mut expected = data.clone();
        expected.extend_from_slice(&data);
        assert_eq!(&device.output()[..], expected.as_slice());
        assert!(node.stats().would_blocks() > 0);
    }

    #[test]
    fn test_read_returns_zero_at_end_of_stream() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::with_input(b"tape").with_max_chunk(3);
        device.script([Step::WouldBlock]);
        let mut node = device_node(device, &collector);
        node.start(Direction::Read).unwrap();

        let driver = Driver::default();
        let mut buf = [0u8; 16];
        assert_eq!(driver.read(&mut node, &mut buf).unwrap(), 3);
        assert_eq!(driver.read(&mut node, &mut buf).unwrap(), 1);
        assert_eq!(driver.read(&mut node, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_timeout_reports_stall() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        device.keep_open(true);
        let mut node = device_node(device, &collector);
        node.start(Direction::Read).unwrap();

        let timeout = Duration::from_millis(20);
        let driver = Driver::new(Some(timeout), RetryStrategy::Spin);
        let err = driver.read(&mut node, &mut [0u8; 4]).unwrap_err();
        assert_matches!(err, Error::Timeout { node: "device", waited } if waited >= timeout);
        assert_eq!(node.stats().stalls(), 1);
        assert_eq!(collector.events_of_type("Stalled").len(), 1);
    }

    #[test]
    fn test_for_mode_takes_timeout() {
        let driver = Driver::for_mode(mode().with_timeout(Some(3)), RetryStrategy::Poll);
        assert_eq!(driver.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(Driver::for_mode(mode(), RetryStrategy::Spin).timeout(), None);
    }
}
