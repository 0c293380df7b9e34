//! Field-rate pacing
//!
//! Tape moves at the video field rate whatever the application does.
//! [`FieldPacer`] wraps a device and lets at most one field's worth of bytes
//! through per field period, reporting would-block in between. Useful for
//! feeding a generator that has no flow control of its own, and for
//! exercising the would-block path against a plain file.

use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::domain::ports::{DeviceIo, Direction, Flush, Readiness, Transfer};
use crate::error::{Error, Result};
use crate::format::ModeWord;

/// Device wrapper admitting one field per field period.
#[derive(Debug)]
pub struct FieldPacer<D> {
    inner: D,
    period: Duration,
    field: usize,
    /// Bytes still allowed in the current period
    budget: usize,
    /// When the next period opens
    deadline: Instant,
}

impl<D: DeviceIo> FieldPacer<D> {
    pub fn new(inner: D, period: Duration, field: usize) -> Result<Self> {
        if field == 0 || period.is_zero() {
            return Err(Error::Config(
                "pacing needs a non-zero field size and period".into(),
            ));
        }

        Ok(Self {
            inner,
            period,
            field,
            budget: field,
            deadline: Instant::now() + period,
        })
    }

    /// Pace at the field rate and field size of `mode`.
    pub fn for_mode(inner: D, mode: ModeWord) -> Result<Self> {
        let format = mode.geometry()?;
        let standard = mode
            .standard()
            .ok_or_else(|| Error::Config("video standard is not set".into()))?;
        Self::new(inner, standard.field_period(), format.field_size())
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Bytes allowed now, opening the next period if it is due.
    fn admit(&mut self, want: usize) -> Option<usize> {
        if self.budget == 0 {
            let now = Instant::now();
            if now < self.deadline {
                return None;
            }
            // Keep the cadence when slightly late, resync when far behind
            let base = if now.duration_since(self.deadline) > self.period {
                now
            } else {
                self.deadline
            };
            self.deadline = base + self.period;
            self.budget = self.field;
            trace!(field = self.field, "Field period opened");
        }
        Some(want.min(self.budget))
    }

    fn spend(&mut self, transfer: Transfer) -> Transfer {
        if let Transfer::Bytes(n) = transfer {
            self.budget -= n.min(self.budget);
        }
        transfer
    }
}

impl<D: DeviceIo> DeviceIo for FieldPacer<D> {
    fn start(&mut self, direction: Direction) -> Result<()> {
        self.budget = self.field;
        self.deadline = Instant::now() + self.period;
        self.inner.start(direction)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        match self.admit(buf.len()) {
            None => Ok(Transfer::WouldBlock),
            Some(n) => {
                let transfer = self.inner.read(&mut buf[..n])?;
                Ok(self.spend(transfer))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        match self.admit(buf.len()) {
            None => Ok(Transfer::WouldBlock),
            Some(n) => {
                let transfer = self.inner.write(&buf[..n])?;
                Ok(self.spend(transfer))
            }
        }
    }

    fn flush(&mut self) -> Result<Flush> {
        self.inner.flush()
    }

    fn wait_ready(&mut self, direction: Direction, timeout: Option<Duration>) -> Result<Readiness> {
        let mut remaining = timeout;
        if self.budget == 0 {
            let wait = self.deadline.saturating_duration_since(Instant::now());
            if let Some(limit) = timeout {
                if limit < wait {
                    thread::sleep(limit);
                    return Ok(Readiness::TimedOut);
                }
                remaining = Some(limit - wait);
            }
            thread::sleep(wait);
        }
        self.inner.wait_ready(direction, remaining)
    }

    fn release(&mut self) {
        self.inner.release()
    }
}
