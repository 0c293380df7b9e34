//! Domain Ports (Port/Adapter Pattern)
//!
//! The abstractions the stream chain depends on. Adapters in
//! [`crate::adapters`] implement them for real file descriptors, in-memory
//! test devices and event sinks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Stream Chain                           │
//! │   sector codec ──▶ framer ──▶ device node                    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                 │                  │
//!          ▼                 ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ports (Traits)                           │
//! │  ActivityListener │ EventPublisher │ DeviceIo                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Adapters (Impls)                            │
//! │  StdioDevice │ MemoryDevice │ FieldPacer │ LoggingPublisher  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::events::StreamEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Direction of data flow through a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Medium to application (playback)
    Read,
    /// Application to medium (record)
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Outcome of one non-failing transfer attempt.
///
/// A zero-length success is never used to mean "nothing ready" or "no more
/// data"; those have their own variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved, possibly fewer than requested
    Bytes(usize),
    /// No progress; the peer is not ready. Retry after readiness or timeout.
    WouldBlock,
    /// The source has no more data
    EndOfStream,
}

impl Transfer {
    /// Bytes moved, zero for the other outcomes.
    pub fn bytes(self) -> usize {
        match self {
            Transfer::Bytes(n) => n,
            Transfer::WouldBlock | Transfer::EndOfStream => 0,
        }
    }

    pub fn is_would_block(self) -> bool {
        self == Transfer::WouldBlock
    }

    pub fn is_end_of_stream(self) -> bool {
        self == Transfer::EndOfStream
    }
}

/// Result of waiting for a device to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything buffered has reached the device
    Complete,
    /// Some bytes are still buffered; retry after readiness
    Pending,
}

/// Progress report delivered to an [`ActivityListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// A call moved `bytes` bytes
    Progress { direction: Direction, bytes: usize },
    /// A call made no progress
    WouldBlock { direction: Direction },
    /// A read reached the end of the stream
    EndOfStream,
    /// The advisory timeout elapsed while waiting for readiness
    Stalled { direction: Direction, waited: Duration },
}

impl Activity {
    pub(crate) fn from_transfer(direction: Direction, transfer: Transfer) -> Self {
        match transfer {
            Transfer::Bytes(bytes) => Activity::Progress { direction, bytes },
            Transfer::WouldBlock => Activity::WouldBlock { direction },
            Transfer::EndOfStream => Activity::EndOfStream,
        }
    }
}

// =============================================================================
// Port Traits
// =============================================================================

/// Bridge between the bottom of a chain and real hardware or a file.
///
/// Implementations must keep the three outcomes apart: `Ok(Transfer::Bytes)`
/// for (possibly short) progress, `Ok(Transfer::WouldBlock)` for a transient
/// not-ready condition, and `Err(Error::DeviceFailure)` for fatal failures,
/// which are never retried.
pub trait DeviceIo: Send {
    /// Prepare for transfers in `direction`.
    fn start(&mut self, _direction: Direction) -> Result<()> {
        Ok(())
    }

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer>;

    /// Write up to `buf.len()` bytes.
    fn write(&mut self, buf: &[u8]) -> Result<Transfer>;

    /// Push out anything the adapter itself still holds.
    fn flush(&mut self) -> Result<Flush> {
        Ok(Flush::Complete)
    }

    /// Block until the device is ready for `direction` or `timeout` elapses.
    /// `None` waits indefinitely.
    fn wait_ready(&mut self, _direction: Direction, _timeout: Option<Duration>) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    /// Stop transfers. Must be safe to call at any time.
    fn release(&mut self) {}
}

impl<D: DeviceIo + ?Sized> DeviceIo for Box<D> {
    fn start(&mut self, direction: Direction) -> Result<()> {
        (**self).start(direction)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<Flush> {
        (**self).flush()
    }

    fn wait_ready(&mut self, direction: Direction, timeout: Option<Duration>) -> Result<Readiness> {
        (**self).wait_ready(direction, timeout)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Capability notified after every read or write on a stream node.
///
/// Fires at most once per call, after the call completes. No guarantee is
/// made about the calling thread, and the listener must not call back into
/// the node that notified it.
pub trait ActivityListener: Send {
    fn on_activity(&mut self, activity: &Activity);
}

impl<F> ActivityListener for F
where
    F: FnMut(&Activity) + Send,
{
    fn on_activity(&mut self, activity: &Activity) {
        self(activity)
    }
}

/// Sink for notable stream events (skipped sectors, integrity warnings,
/// stalls).
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    fn publish(&self, event: StreamEvent) -> Result<()>;

    /// Publish multiple events.
    fn publish_all(&self, events: Vec<StreamEvent>) -> Result<()> {
        for event in events {
            self.publish(event)?;
        }
        Ok(())
    }
}
