//! Stdio device adapter
//!
//! [`DeviceIo`] over any `Read + Write` handle: a capture device node, a
//! pipe, a socket or a regular file.
//!
//! # Outcome mapping
//!
//! | `std::io` result               | Reported as                     |
//! |--------------------------------|---------------------------------|
//! | `Ok(n)`, `n > 0`               | `Transfer::Bytes(n)`            |
//! | `Ok(0)` on read                | `Transfer::EndOfStream`         |
//! | `Ok(0)` on write               | `Error::DeviceFailure`          |
//! | `ErrorKind::WouldBlock`        | `Transfer::WouldBlock`          |
//! | `ErrorKind::Interrupted`       | retried                         |
//! | anything else                  | `Error::DeviceFailure`          |
//!
//! # Transfer styles
//!
//! - **Raw**: every call maps to exactly one OS read or write.
//! - **Record**: the handle is driven in fixed-size records, as required by
//!   devices that only accept whole buffers. Writes collect one record before
//!   sending it; reads fetch one record and serve it out in pieces. A short
//!   final record is sent on flush.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::ports::{DeviceIo, Direction, Flush, Readiness, Transfer};
use crate::error::{Error, Result};

/// How transfers are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStyle {
    /// Pass each call straight through
    #[default]
    Raw,
    /// Fixed-size records of this many bytes
    Record(usize),
}

/// Device I/O over a standard I/O handle.
#[derive(Debug)]
pub struct StdioDevice<T> {
    inner: T,
    style: TransferStyle,
    #[cfg(unix)]
    fd: Option<RawFd>,
    /// Record style: pending bytes (write) or the rest of a record (read)
    carry: BytesMut,
    /// Bytes of the front record already sent
    sent: usize,
}

impl<T: Read + Write + Send> StdioDevice<T> {
    /// Wrap a handle. Without a descriptor, `wait_ready` cannot poll and
    /// reports ready at once.
    pub fn new(inner: T, style: TransferStyle) -> Result<Self> {
        if style == TransferStyle::Record(0) {
            return Err(Error::Config("record size must be greater than 0".into()));
        }

        Ok(Self {
            inner,
            style,
            #[cfg(unix)]
            fd: None,
            carry: BytesMut::new(),
            sent: 0,
        })
    }

    pub fn style(&self) -> TransferStyle {
        self.style
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn read_record(&mut self, buf: &mut [u8], record: usize) -> Result<Transfer> {
        if self.carry.is_empty() {
            if buf.len() >= record {
                return read_once(&mut self.inner, &mut buf[..record]);
            }

            self.carry.resize(record, 0);
            match read_once(&mut self.inner, &mut self.carry[..]) {
                Ok(Transfer::Bytes(n)) => self.carry.truncate(n),
                other => {
                    self.carry.clear();
                    return other;
                }
            }
        }

        let n = buf.len().min(self.carry.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.advance(n);
        Ok(Transfer::Bytes(n))
    }

    fn write_record(&mut self, buf: &[u8], record: usize) -> Result<Transfer> {
        if self.send_records(record)? {
            return Ok(Transfer::WouldBlock);
        }

        let take = (record - self.carry.len()).min(buf.len());
        self.carry.extend_from_slice(&buf[..take]);
        self.send_records(record)?;
        Ok(Transfer::Bytes(take))
    }

    /// Send every complete record in `carry`. Returns true if the handle
    /// would block.
    fn send_records(&mut self, record: usize) -> Result<bool> {
        while self.carry.len() >= record {
            if !self.send_front(record)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Send the front `len` bytes of `carry`. Returns false if the handle
    /// would block.
    fn send_front(&mut self, len: usize) -> Result<bool> {
        while self.sent < len {
            match write_once(&mut self.inner, &self.carry[self.sent..len])? {
                Transfer::Bytes(n) => self.sent += n,
                _ => return Ok(false),
            }
        }
        self.carry.advance(len);
        self.sent = 0;
        Ok(true)
    }
}

#[cfg(unix)]
impl<T: Read + Write + Send + AsRawFd> StdioDevice<T> {
    /// Wrap a handle backed by a file descriptor; `wait_ready` polls it.
    pub fn with_fd(inner: T, style: TransferStyle) -> Result<Self> {
        let fd = inner.as_raw_fd();
        let mut device = Self::new(inner, style)?;
        device.fd = Some(fd);
        Ok(device)
    }
}

impl<T: Read + Write + Send> DeviceIo for StdioDevice<T> {
    fn start(&mut self, direction: Direction) -> Result<()> {
        self.carry.clear();
        self.sent = 0;
        debug!(%direction, style = ?self.style, "Stdio device started");
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        match self.style {
            TransferStyle::Raw => read_once(&mut self.inner, buf),
            TransferStyle::Record(record) => self.read_record(buf, record),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        match self.style {
            TransferStyle::Raw => write_once(&mut self.inner, buf),
            TransferStyle::Record(record) => self.write_record(buf, record),
        }
    }

    fn flush(&mut self) -> Result<Flush> {
        if let TransferStyle::Record(record) = self.style {
            if self.send_records(record)? {
                return Ok(Flush::Pending);
            }
            // Short final record
            let len = self.carry.len();
            if len > 0 && !self.send_front(len)? {
                return Ok(Flush::Pending);
            }
        }

        match retry(|| self.inner.flush().map(|()| 0)) {
            Ok(_) => Ok(Flush::Complete),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Flush::Pending),
            Err(err) => Err(Error::device("flush", err)),
        }
    }

    #[cfg(unix)]
    fn wait_ready(&mut self, direction: Direction, timeout: Option<Duration>) -> Result<Readiness> {
        match self.fd {
            Some(fd) => poll_fd(fd, direction, timeout),
            None => Ok(Readiness::Ready),
        }
    }

    #[cfg(not(unix))]
    fn wait_ready(&mut self, _direction: Direction, _timeout: Option<Duration>) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    fn release(&mut self) {
        if !self.carry.is_empty() {
            debug!(discarded = self.carry.len(), "Stdio device released with pending bytes");
        }
        self.carry.clear();
        self.sent = 0;
    }
}

/// Run `op`, retrying while it is interrupted by a signal.
fn retry(mut op: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn read_once(inner: &mut impl Read, buf: &mut [u8]) -> Result<Transfer> {
    match retry(|| inner.read(buf)) {
        Ok(0) => Ok(Transfer::EndOfStream),
        Ok(n) => Ok(Transfer::Bytes(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
        Err(err) => Err(Error::device("read", err)),
    }
}

fn write_once(inner: &mut impl Write, buf: &[u8]) -> Result<Transfer> {
    match retry(|| inner.write(buf)) {
        Ok(0) => Err(Error::device(
            "write",
            io::Error::new(io::ErrorKind::WriteZero, "device accepted no bytes"),
        )),
        Ok(n) => Ok(Transfer::Bytes(n)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
        Err(err) => Err(Error::device("write", err)),
    }
}

/// Wait for `fd` to become readable or writable.
#[cfg(unix)]
pub fn poll_fd(fd: RawFd, direction: Direction, timeout: Option<Duration>) -> Result<Readiness> {
    let events = match direction {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    };
    let mut pollfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    loop {
        // SAFETY: pollfd is a valid, initialised struct and nfds is 1.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::device("poll", err));
        }
        // Hang-up and error conditions count as ready; the next transfer
        // reports them.
        return Ok(if rc == 0 {
            Readiness::TimedOut
        } else {
            Readiness::Ready
        });
    }
}

/// Set or clear `O_NONBLOCK` on a descriptor.
#[cfg(unix)]
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: F_GETFL takes no argument and touches no memory.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: F_SETFL takes an int flag word and touches no memory.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
