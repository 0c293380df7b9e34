//! Stream Nodes
//!
//! A chain is a stack of nodes, each owning the node beneath it:
//!
//! ```text
//! application ──▶ sector codec ──▶ framer ──▶ device node ──▶ DeviceIo
//!                 (scramble)       (fields)    (byte ring)
//! ```
//!
//! Every node keeps a [`RingBuffer`] plus one staging unit. Writes stage the
//! caller's bytes until a whole unit is complete, encode it into the ring and
//! push the ring down to the source. Reads pull whole raw units from the
//! source into staging, decode them into the ring and hand the caller any
//! slice of the result. The ring's write cursor only ever moves in whole
//! units, so every unit is contiguous and encoded in place.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::adapters::event_publisher::LoggingEventPublisher;
use crate::codec::{descramble, scramble, sector_seed, FrameCheck, SectorFramer, MAX_RESYNC_GAP};
use crate::domain::{
    Activity, ActivityListener, DeviceIo, Direction, EventPublisher, Flush, Readiness,
    StreamEvent, Transfer,
};
use crate::error::{Error, Result};
use crate::format::ModeWord;
use crate::ring::RingBuffer;

use super::stats::StreamStats;

/// Byte used to pad incomplete sectors and conceal lost ones.
pub const DEFAULT_FILLER: u8 = 0x33;

/// Ring depth, in units, when none is configured.
pub const DEFAULT_RING_UNITS: usize = 8;

// =============================================================================
// Value Objects
// =============================================================================

/// Direction state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Stopped,
    Reading,
    Writing,
}

impl NodeState {
    fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Read => NodeState::Reading,
            Direction::Write => NodeState::Writing,
        }
    }

    /// Direction of an active node, `None` while stopped.
    pub fn direction(self) -> Option<Direction> {
        match self {
            NodeState::Stopped => None,
            NodeState::Reading => Some(Direction::Read),
            NodeState::Writing => Some(Direction::Write),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Reading => write!(f, "reading"),
            NodeState::Writing => write!(f, "writing"),
        }
    }
}

/// What a framer does with a sector that fails its structural check.
///
/// Every problem is published as a [`StreamEvent`] whatever the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    /// Pass the damaged payload through unchanged
    Deliver,
    /// Replace damaged or missing sectors with filler
    #[default]
    Conceal,
    /// Fail the read with `Error::Integrity`. The offending sectors are
    /// concealed before the error is returned, so reading again continues
    /// with filler in their place.
    Halt,
}

/// Settings shared by every node of a chain.
#[derive(Clone)]
pub struct StreamOptions {
    /// Ring depth in units of the node's ring-side unit
    pub ring_units: usize,
    /// Padding byte for incomplete and concealed sectors
    pub filler: u8,
    pub integrity: IntegrityPolicy,
    pub publisher: Arc<dyn EventPublisher>,
}

impl StreamOptions {
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_integrity(mut self, integrity: IntegrityPolicy) -> Self {
        self.integrity = integrity;
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            ring_units: DEFAULT_RING_UNITS,
            filler: DEFAULT_FILLER,
            integrity: IntegrityPolicy::default(),
            publisher: Arc::new(LoggingEventPublisher::new()),
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("ring_units", &self.ring_units)
            .field("filler", &format_args!("{:#04x}", self.filler))
            .field("integrity", &self.integrity)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Stream Node
// =============================================================================

enum Kind {
    /// Bottom of the chain; bytes pass through unchanged
    Device(Box<dyn DeviceIo>),
    /// Scrambles each sector with its sequence-derived seed
    Sector,
    /// Lays sectors out in video fields
    Frame(SectorFramer),
}

enum Fill {
    Ready,
    Blocked,
    Finished,
}

/// One stage of a tape chain.
pub struct StreamNode {
    name: &'static str,
    kind: Kind,
    source: Option<Box<StreamNode>>,
    mode: ModeWord,
    state: NodeState,

    /// Unit on the application side
    unit_in: usize,
    /// Unit on the source side
    unit_out: usize,
    ring_units: usize,
    ring: RingBuffer,
    /// One partial unit: cooked bytes while writing, raw bytes while reading
    staging: Vec<u8>,
    staged: usize,

    /// Sequence number of the next sector
    sequence: u64,
    source_done: bool,
    /// Missing sectors still to be concealed before the staged one
    gap: u64,

    filler: u8,
    integrity: IntegrityPolicy,
    listener: Option<Box<dyn ActivityListener>>,
    publisher: Arc<dyn EventPublisher>,
    stats: Arc<StreamStats>,
}

impl StreamNode {
    /// Bottom node over a device. `unit` is the granularity a flush pads to.
    pub fn device<D: DeviceIo + 'static>(
        mode: ModeWord,
        unit: usize,
        device: D,
        options: &StreamOptions,
    ) -> Result<Self> {
        Self::build("device", Kind::Device(Box::new(device)), None, mode, unit, unit, options)
    }

    /// Framer over a source whose unit is one video field.
    pub fn framer(source: StreamNode, options: &StreamOptions) -> Result<Self> {
        let mode = source.mode;
        let format = mode.geometry()?;
        if source.unit() != format.field_size() {
            return Err(Error::Config(format!(
                "framer needs a {} byte field unit below it, the {} stream has {}",
                format.field_size(),
                source.name,
                source.unit()
            )));
        }

        let framer = SectorFramer::new(format, options.filler);
        Self::build(
            "frame",
            Kind::Frame(framer),
            Some(Box::new(source)),
            mode,
            format.data_size,
            format.field_size(),
            options,
        )
    }

    /// Scrambling sector codec over a source whose unit is one sector.
    pub fn sector_codec(source: StreamNode, options: &StreamOptions) -> Result<Self> {
        let mode = source.mode;
        let format = mode.geometry()?;
        if source.unit() != format.data_size {
            return Err(Error::Config(format!(
                "sector codec needs a {} byte sector unit below it, the {} stream has {}",
                format.data_size,
                source.name,
                source.unit()
            )));
        }

        Self::build(
            "sector",
            Kind::Sector,
            Some(Box::new(source)),
            mode,
            format.data_size,
            format.data_size,
            options,
        )
    }

    /// Full tape chain: sector codec over framer over a field-unit device node.
    pub fn tape_chain<D: DeviceIo + 'static>(
        mode: ModeWord,
        device: D,
        options: &StreamOptions,
    ) -> Result<Self> {
        let format = mode.geometry()?;
        let device = Self::device(mode, format.field_size(), device, options)?;
        let framer = Self::framer(device, options)?;
        Self::sector_codec(framer, options)
    }

    fn build(
        name: &'static str,
        kind: Kind,
        source: Option<Box<StreamNode>>,
        mode: ModeWord,
        unit_in: usize,
        unit_out: usize,
        options: &StreamOptions,
    ) -> Result<Self> {
        if unit_in == 0 || unit_out == 0 {
            return Err(Error::Config(format!("{} stream unit must be greater than 0", name)));
        }
        if options.ring_units == 0 {
            return Err(Error::Config(format!(
                "{} stream needs at least one ring unit",
                name
            )));
        }
        // Sized for the larger unit so either direction can start
        let ring = RingBuffer::with_units(unit_in.max(unit_out), options.ring_units)?;

        Ok(Self {
            name,
            kind,
            source,
            mode,
            state: NodeState::Stopped,
            unit_in,
            unit_out,
            ring_units: options.ring_units,
            ring,
            staging: vec![0u8; unit_in.max(unit_out)],
            staged: 0,
            sequence: 0,
            source_done: false,
            gap: 0,
            filler: options.filler,
            integrity: options.integrity,
            listener: None,
            publisher: Arc::clone(&options.publisher),
            stats: Arc::new(StreamStats::new()),
        })
    }

    /// Attach an activity listener.
    pub fn with_listener(mut self, listener: impl ActivityListener + 'static) -> Self {
        self.set_listener(listener);
        self
    }

    pub fn set_listener(&mut self, listener: impl ActivityListener + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> ModeWord {
        self.mode
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Bytes per unit on the application side.
    pub fn unit(&self) -> usize {
        self.unit_in
    }

    /// Sequence number of the next sector to encode or decode.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes held in this node, not counting its sources.
    pub fn buffered(&self) -> usize {
        self.ring.bytes_available() + self.staged
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn source(&self) -> Option<&StreamNode> {
        self.source.as_deref()
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    /// Move from `Stopped` to `direction`, starting the sources first.
    pub fn start(&mut self, direction: Direction) -> Result<()> {
        if self.state != NodeState::Stopped {
            return Err(self.protocol("start"));
        }

        if let Some(source) = self.source.as_deref_mut() {
            source.start(direction)?;
        }
        if let Err(err) = self.prepare(direction) {
            if let Some(source) = self.source.as_deref_mut() {
                source.release();
            }
            return Err(err);
        }

        self.state = NodeState::for_direction(direction);
        debug!(node = self.name, %direction, mode = %self.mode, "Stream started");
        self.publish(StreamEvent::started(self.name, direction, self.mode));
        Ok(())
    }

    /// Per-kind start hook.
    fn prepare(&mut self, direction: Direction) -> Result<()> {
        let unit = match direction {
            Direction::Read => self.unit_in,
            Direction::Write => self.unit_out,
        };
        if self.ring.capacity() == unit * self.ring_units {
            self.ring.clear();
        } else {
            self.ring = RingBuffer::with_units(unit, self.ring_units)?;
        }

        self.staged = 0;
        self.sequence = 0;
        self.source_done = false;
        self.gap = 0;

        if let Kind::Device(device) = &mut self.kind {
            device.start(direction)?;
        }
        Ok(())
    }

    /// Return to `Stopped`, then release the source.
    ///
    /// Safe to call in any state. A partially staged unit is discarded.
    pub fn release(&mut self) {
        if self.state != NodeState::Stopped {
            let discarded = self.staged;
            self.staged = 0;
            self.gap = 0;
            if let Kind::Device(device) = &mut self.kind {
                device.release();
            }

            let previous = self.state;
            self.state = NodeState::Stopped;
            debug!(
                node = self.name,
                state = %previous,
                sectors = self.sequence,
                discarded,
                "Stream released"
            );
            self.publish(StreamEvent::released(self.name, self.sequence, discarded));
        }

        if let Some(source) = self.source.as_deref_mut() {
            source.release();
        }
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Read decoded bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        self.expect(NodeState::Reading, "read")?;

        let result = if buf.is_empty() {
            Ok(Transfer::Bytes(0))
        } else if matches!(self.kind, Kind::Device(_)) {
            self.read_device(buf)
        } else {
            self.read_upper(buf)
        };

        let result = self.guard(result);
        if let Ok(transfer) = &result {
            self.account(Direction::Read, *transfer);
        }
        result
    }

    /// Write bytes from `buf`. A short count means the ring is full.
    pub fn write(&mut self, buf: &[u8]) -> Result<Transfer> {
        self.expect(NodeState::Writing, "write")?;

        let result = if buf.is_empty() {
            Ok(Transfer::Bytes(0))
        } else if matches!(self.kind, Kind::Device(_)) {
            self.write_device(buf)
        } else {
            self.write_upper(buf)
        };

        let result = self.guard(result);
        if let Ok(transfer) = &result {
            self.account(Direction::Write, *transfer);
        }
        result
    }

    /// Pad a trailing partial sector, push everything down and flush the
    /// sources.
    ///
    /// `Flush::Pending` means some bytes are still buffered; retry after the
    /// device becomes ready.
    pub fn flush(&mut self) -> Result<Flush> {
        self.expect(NodeState::Writing, "flush")?;
        let result = if matches!(self.kind, Kind::Device(_)) {
            self.flush_device()
        } else {
            self.flush_upper()
        };
        self.guard(result)
    }

    /// Wait until the device at the bottom of the chain is ready.
    ///
    /// The timeout is advisory; `Readiness::TimedOut` leaves the decision to
    /// the caller.
    pub fn wait_ready(&mut self, timeout: Option<Duration>) -> Result<Readiness> {
        let Some(direction) = self.state.direction() else {
            return Err(self.protocol("wait_ready"));
        };

        let result = match (&mut self.kind, self.source.as_deref_mut()) {
            (Kind::Device(device), _) => device.wait_ready(direction, timeout),
            (_, Some(source)) => source.wait_ready(timeout),
            (_, None) => Ok(Readiness::Ready),
        };
        self.guard(result)
    }

    /// Report that the device stayed not-ready for `waited`.
    pub fn report_stall(&mut self, waited: Duration) {
        let Some(direction) = self.state.direction() else {
            return;
        };

        warn!(node = self.name, %direction, ?waited, "Stream stalled");
        self.stats.record_stall();
        if let Some(listener) = self.listener.as_mut() {
            listener.on_activity(&Activity::Stalled { direction, waited });
        }
        self.publish(StreamEvent::stalled(self.name, direction, waited));
    }

    // =========================================================================
    // Device Kind
    // =========================================================================

    /// One device read per call, and only when the ring is empty.
    fn read_device(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        if self.ring.is_empty() {
            if self.source_done {
                return Ok(Transfer::EndOfStream);
            }

            self.ring.clear();
            let Kind::Device(device) = &mut self.kind else {
                return Err(Error::Internal(format!("{} stream has no device", self.name)));
            };
            match device.read(self.ring.writable())? {
                Transfer::Bytes(0) | Transfer::WouldBlock => return Ok(Transfer::WouldBlock),
                Transfer::Bytes(n) => self.ring.commit(n),
                Transfer::EndOfStream => {
                    self.source_done = true;
                    return Ok(Transfer::EndOfStream);
                }
            }
        }

        Ok(Transfer::Bytes(self.ring.read(buf)))
    }

    fn write_device(&mut self, buf: &[u8]) -> Result<Transfer> {
        let mut accepted = self.ring.write(buf);
        self.drain_device()?;
        if accepted < buf.len() {
            accepted += self.ring.write(&buf[accepted..]);
        }

        Ok(if accepted == 0 {
            Transfer::WouldBlock
        } else {
            Transfer::Bytes(accepted)
        })
    }

    /// Push buffered bytes to the device until it stops taking them.
    fn drain_device(&mut self) -> Result<()> {
        let Kind::Device(device) = &mut self.kind else {
            return Err(Error::Internal(format!("{} stream has no device", self.name)));
        };

        while !self.ring.is_empty() {
            match device.write(self.ring.readable())? {
                Transfer::Bytes(0) | Transfer::WouldBlock => break,
                Transfer::Bytes(n) => self.ring.consume(n),
                Transfer::EndOfStream => {
                    return Err(Error::device(
                        "write",
                        io::Error::new(io::ErrorKind::WriteZero, "device reported end of stream"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn flush_device(&mut self) -> Result<Flush> {
        self.drain_device()?;

        let partial = (self.ring.total_written() % self.unit_out as u64) as usize;
        if partial > 0 {
            let padding = self.unit_out - partial;
            if self.ring.space_available() < padding {
                return Ok(Flush::Pending);
            }
            self.ring
                .fill_to(self.ring.bytes_available() + padding, self.filler);
            debug!(node = self.name, padding, "Padded trailing unit");
            self.drain_device()?;
        }

        if !self.ring.is_empty() {
            return Ok(Flush::Pending);
        }
        match &mut self.kind {
            Kind::Device(device) => device.flush(),
            _ => Ok(Flush::Complete),
        }
    }

    // =========================================================================
    // Codec Kinds
    // =========================================================================

    fn write_upper(&mut self, buf: &[u8]) -> Result<Transfer> {
        let mut accepted = self.accept(buf);
        self.push_down()?;
        if accepted < buf.len() {
            accepted += self.accept(&buf[accepted..]);
        }

        Ok(if accepted == 0 {
            Transfer::WouldBlock
        } else {
            Transfer::Bytes(accepted)
        })
    }

    /// Stage caller bytes, encoding each completed unit into the ring.
    fn accept(&mut self, buf: &[u8]) -> usize {
        let mut taken = 0;
        loop {
            if self.staged == self.unit_in {
                if self.ring.space_available() < self.unit_out {
                    break;
                }
                self.encode_staged();
            }
            if taken == buf.len() {
                break;
            }

            let n = (self.unit_in - self.staged).min(buf.len() - taken);
            self.staging[self.staged..self.staged + n].copy_from_slice(&buf[taken..taken + n]);
            self.staged += n;
            taken += n;
        }
        taken
    }

    fn encode_staged(&mut self) {
        let (unit_in, unit_out) = (self.unit_in, self.unit_out);
        let slot = &mut self.ring.writable()[..unit_out];
        match &self.kind {
            Kind::Sector => {
                slot.copy_from_slice(&self.staging[..unit_in]);
                scramble(slot, sector_seed(self.sequence));
            }
            Kind::Frame(framer) => framer.frame(&self.staging[..unit_in], self.sequence, slot),
            Kind::Device(_) => slot.copy_from_slice(&self.staging[..unit_in]),
        }

        self.ring.commit(unit_out);
        trace!(node = self.name, sequence = self.sequence, "Sector encoded");
        self.sequence += 1;
        self.staged = 0;
        self.stats.record_sector();
    }

    /// Hand the ring to the source until it stops taking bytes.
    fn push_down(&mut self) -> Result<()> {
        let name = self.name;
        let source = self
            .source
            .as_deref_mut()
            .ok_or_else(|| Error::Internal(format!("{} stream has no source", name)))?;

        while !self.ring.is_empty() {
            match source.write(self.ring.readable())? {
                Transfer::Bytes(0) | Transfer::WouldBlock => break,
                Transfer::Bytes(n) => self.ring.consume(n),
                Transfer::EndOfStream => {
                    return Err(Error::Internal(format!(
                        "{} stream reported end of stream on write",
                        source.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn flush_upper(&mut self) -> Result<Flush> {
        if self.staged > 0 {
            if self.ring.space_available() < self.unit_out {
                self.push_down()?;
            }
            if self.ring.space_available() < self.unit_out {
                return Ok(Flush::Pending);
            }

            let padding = self.unit_in - self.staged;
            self.staging[self.staged..self.unit_in].fill(self.filler);
            self.staged = self.unit_in;
            debug!(node = self.name, sequence = self.sequence, padding, "Padded trailing sector");
            self.encode_staged();
        }

        self.push_down()?;
        if !self.ring.is_empty() {
            return Ok(Flush::Pending);
        }
        match self.source.as_deref_mut() {
            Some(source) => source.flush(),
            None => Ok(Flush::Complete),
        }
    }

    fn read_upper(&mut self, buf: &mut [u8]) -> Result<Transfer> {
        if self.ring.is_empty() {
            match self.fill()? {
                Fill::Ready => {}
                Fill::Blocked => return Ok(Transfer::WouldBlock),
                Fill::Finished => return Ok(Transfer::EndOfStream),
            }
        }
        Ok(Transfer::Bytes(self.ring.read(buf)))
    }

    /// Pull from the source until at least one decoded unit is buffered.
    fn fill(&mut self) -> Result<Fill> {
        let name = self.name;
        loop {
            if !self.ring.is_empty() {
                return Ok(Fill::Ready);
            }
            if self.gap > 0 {
                self.conceal_missing();
                continue;
            }
            if self.staged == self.unit_out {
                self.decode_staged()?;
                continue;
            }
            if self.source_done {
                return Ok(Fill::Finished);
            }

            let source = self
                .source
                .as_deref_mut()
                .ok_or_else(|| Error::Internal(format!("{} stream has no source", name)))?;
            match source.read(&mut self.staging[self.staged..self.unit_out])? {
                Transfer::Bytes(0) | Transfer::WouldBlock => return Ok(Fill::Blocked),
                Transfer::Bytes(n) => self.staged += n,
                Transfer::EndOfStream => {
                    self.source_done = true;
                    self.discard_truncated();
                }
            }
        }
    }

    fn decode_staged(&mut self) -> Result<()> {
        let (unit_in, unit_out) = (self.unit_in, self.unit_out);
        let check = {
            let slot = &mut self.ring.writable()[..unit_in];
            match &self.kind {
                Kind::Frame(framer) => Some(framer.deframe(&self.staging[..unit_out], slot)),
                Kind::Sector => {
                    slot.copy_from_slice(&self.staging[..unit_in]);
                    descramble(slot, sector_seed(self.sequence));
                    None
                }
                Kind::Device(_) => {
                    slot.copy_from_slice(&self.staging[..unit_in]);
                    None
                }
            }
        };
        self.resolve(check)
    }

    /// Match a decoded unit against the expected sequence number.
    fn resolve(&mut self, check: Option<FrameCheck>) -> Result<()> {
        let (found, damage) = match check {
            None => {
                self.deliver();
                return Ok(());
            }
            Some(FrameCheck::Valid { sequence }) => (sequence, None),
            Some(FrameCheck::Damaged { sequence, reason }) => (sequence, Some(reason)),
            Some(FrameCheck::Unreadable { reason }) => return self.damaged(reason),
        };

        // Keys carry the low 32 bits of the sequence number
        let expected = self.sequence;
        let ahead = u64::from(found.wrapping_sub(expected as u32));
        let behind = u64::from((expected as u32).wrapping_sub(found));

        if ahead == 0 {
            match damage {
                None => {
                    self.deliver();
                    Ok(())
                }
                Some(reason) => self.damaged(reason),
            }
        } else if ahead <= MAX_RESYNC_GAP {
            self.skip_to(expected + ahead)
        } else if behind <= MAX_RESYNC_GAP && behind <= expected {
            self.drop_stale(expected - behind)
        } else {
            self.damaged(format!("sector number {} out of range", found))
        }
    }

    fn deliver(&mut self) {
        self.ring.commit(self.unit_in);
        trace!(node = self.name, sequence = self.sequence, "Sector decoded");
        self.sequence += 1;
        self.staged = 0;
        self.stats.record_sector();
    }

    fn damaged(&mut self, reason: String) -> Result<()> {
        let sequence = self.sequence;
        warn!(node = self.name, sequence, %reason, "Damaged sector");
        self.stats.record_integrity_warning();
        self.publish(StreamEvent::sector_invalid(self.name, sequence, reason.clone()));

        if self.integrity != IntegrityPolicy::Deliver {
            self.stage_filler();
            self.stats.record_concealed();
        }
        self.deliver();

        match self.integrity {
            IntegrityPolicy::Halt => Err(Error::Integrity { sequence, reason }),
            _ => Ok(()),
        }
    }

    /// Sectors `expected..found` never arrived. The staged field is decoded
    /// again once the gap is concealed.
    fn skip_to(&mut self, found: u64) -> Result<()> {
        let expected = self.sequence;
        warn!(node = self.name, expected, found, "Sectors missing");
        self.stats.record_integrity_warning();
        self.publish(StreamEvent::sector_skipped(self.name, expected, found));

        self.gap = found - expected;
        if self.integrity == IntegrityPolicy::Halt {
            return Err(Error::Integrity {
                sequence: expected,
                reason: format!("sectors {}..{} missing", expected, found),
            });
        }
        Ok(())
    }

    fn drop_stale(&mut self, found: u64) -> Result<()> {
        let reason = format!("stale sector {} while expecting {}", found, self.sequence);
        warn!(node = self.name, found, expected = self.sequence, "Dropping stale sector");
        self.stats.record_integrity_warning();
        self.publish(StreamEvent::sector_invalid(self.name, found, reason.clone()));

        self.staged = 0;
        if self.integrity == IntegrityPolicy::Halt {
            return Err(Error::Integrity {
                sequence: found,
                reason,
            });
        }
        Ok(())
    }

    /// Fill the next slot with filler as it would have been recorded, so
    /// the sector codec above descrambles it back to plain filler.
    fn stage_filler(&mut self) {
        let slot = &mut self.ring.writable()[..self.unit_in];
        slot.fill(self.filler);
        scramble(slot, sector_seed(self.sequence));
    }

    fn conceal_missing(&mut self) {
        self.stage_filler();
        self.ring.commit(self.unit_in);
        trace!(node = self.name, sequence = self.sequence, "Missing sector concealed");
        self.sequence += 1;
        self.gap -= 1;
        self.stats.record_sector();
        self.stats.record_concealed();
    }

    fn discard_truncated(&mut self) {
        if self.staged == 0 {
            return;
        }

        let reason = format!("truncated ({} of {} bytes)", self.staged, self.unit_out);
        warn!(node = self.name, sequence = self.sequence, %reason, "Discarding partial sector");
        self.stats.record_integrity_warning();
        self.publish(StreamEvent::sector_invalid(self.name, self.sequence, reason));
        self.staged = 0;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn protocol(&self, operation: &'static str) -> Error {
        Error::Protocol {
            node: self.name,
            operation,
            state: self.state.to_string(),
        }
    }

    fn expect(&self, state: NodeState, operation: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.protocol(operation))
        }
    }

    /// Tear the chain down on a device failure.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_device_failure() {
                if matches!(self.kind, Kind::Device(_)) {
                    error!(node = self.name, error = %err, "Device failed, releasing chain");
                    self.publish(StreamEvent::device_failed(self.name, err));
                }
                self.release();
            }
        }
        result
    }

    fn account(&mut self, direction: Direction, transfer: Transfer) {
        match (direction, transfer) {
            (Direction::Read, Transfer::Bytes(n)) => self.stats.record_bytes_out(n),
            (Direction::Write, Transfer::Bytes(n)) => self.stats.record_bytes_in(n),
            (_, Transfer::WouldBlock) => self.stats.record_would_block(),
            (_, Transfer::EndOfStream) => {}
        }
        if let Some(listener) = self.listener.as_mut() {
            listener.on_activity(&Activity::from_transfer(direction, transfer));
        }
    }

    fn publish(&self, event: StreamEvent) {
        if let Err(err) = self.publisher.publish(event) {
            warn!(node = self.name, error = %err, "Failed to publish stream event");
        }
    }
}

impl Drop for StreamNode {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for StreamNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamNode")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("unit", &self.unit_in)
            .field("sequence", &self.sequence)
            .field("buffered", &self.buffered())
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_publisher::InMemoryEventCollector;
    use crate::adapters::memory::{MemoryDevice, Step};
    use crate::format::{Density, FormatVariant, VideoStandard};
    use assert_matches::assert_matches;

    fn mode() -> ModeWord {
        ModeWord::pack(
            Some(VideoStandard::Ntsc),
            Some(Density::Low),
            Some(FormatVariant::Sp),
            None,
        )
    }

    fn options(collector: &Arc<InMemoryEventCollector>) -> StreamOptions {
        StreamOptions {
            ring_units: 2,
            ..StreamOptions::default()
        }
        .with_publisher(Arc::clone(collector) as Arc<dyn EventPublisher>)
    }

    /// Frame `sectors` payloads with the given sequence numbers.
    fn tape(sequences: &[u64], payload: impl Fn(u64) -> Vec<u8>) -> Vec<u8> {
        let format = mode().geometry().unwrap();
        let framer = SectorFramer::new(format, DEFAULT_FILLER);
        let mut out = Vec::new();
        for &seq in sequences {
            let mut field = vec![0u8; format.field_size()];
            framer.frame(&payload(seq), seq, &mut field);
            out.extend_from_slice(&field);
        }
        out
    }

    fn framer_over(device: MemoryDevice, options: &StreamOptions) -> StreamNode {
        let field = mode().geometry().unwrap().field_size();
        let device = StreamNode::device(mode(), field, device, options).unwrap();
        StreamNode::framer(device, options).unwrap()
    }

    /// Filler as a framer hands it up for the sector at `sequence`.
    fn recorded_filler(sequence: u64) -> Vec<u8> {
        let mut sector = vec![DEFAULT_FILLER; mode().geometry().unwrap().data_size];
        scramble(&mut sector, sector_seed(sequence));
        sector
    }

    /// Read to the end, collecting errors instead of stopping at them.
    fn read_through_errors(node: &mut StreamNode) -> (Vec<u8>, Vec<Error>) {
        let mut out = Vec::new();
        let mut errors = Vec::new();
        let mut buf = [0u8; 500];
        loop {
            match node.read(&mut buf) {
                Ok(Transfer::Bytes(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Transfer::WouldBlock) => continue,
                Ok(Transfer::EndOfStream) => return (out, errors),
                Err(err) => {
                    errors.push(err);
                    assert!(errors.len() < 8, "read keeps failing: {:?}", errors);
                }
            }
        }
    }

    fn read_all(node: &mut StreamNode) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 500];
        loop {
            match node.read(&mut buf)? {
                Transfer::Bytes(n) => out.extend_from_slice(&buf[..n]),
                Transfer::WouldBlock => continue,
                Transfer::EndOfStream => return Ok(out),
            }
        }
    }

    #[test]
    fn test_state_machine() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let mut node = StreamNode::device(mode(), 16, MemoryDevice::new(), &options(&collector))
            .unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        assert_matches!(node.write(b"x"), Err(Error::Protocol { operation: "write", .. }));
        assert_matches!(node.flush(), Err(Error::Protocol { .. }));

        node.start(Direction::Write).unwrap();
        assert_eq!(node.state(), NodeState::Writing);
        assert_matches!(node.start(Direction::Read), Err(Error::Protocol { operation: "start", .. }));
        assert_matches!(node.read(&mut [0u8; 4]), Err(Error::Protocol { operation: "read", .. }));

        node.release();
        node.release();
        assert_eq!(node.state(), NodeState::Stopped);

        node.start(Direction::Read).unwrap();
        assert_eq!(node.state(), NodeState::Reading);
        assert_matches!(node.write(b"x"), Err(Error::Protocol { .. }));
        assert_eq!(collector.events_of_type("Started").len(), 2);
        assert_eq!(collector.events_of_type("Released").len(), 1);
    }

    #[test]
    fn test_start_propagates_to_source_and_release_cascades() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        let mut chain = StreamNode::tape_chain(mode(), device.clone(), &options(&collector)).unwrap();

        chain.start(Direction::Write).unwrap();
        assert_eq!(device.starts(), 1);
        let framer = chain.source().unwrap();
        assert_eq!(framer.state(), NodeState::Writing);
        assert_eq!(framer.source().unwrap().state(), NodeState::Writing);

        chain.release();
        assert_eq!(device.releases(), 1);
        let framer = chain.source().unwrap();
        assert_eq!(framer.state(), NodeState::Stopped);
        assert_eq!(framer.source().unwrap().state(), NodeState::Stopped);

        let released: Vec<_> = collector
            .events_of_type("Released")
            .iter()
            .map(|e| e.node().to_string())
            .collect();
        assert_eq!(released, vec!["sector", "frame", "device"]);
    }

    #[test]
    fn test_failed_device_start_leaves_chain_stopped() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        device.fail_next_start(io::ErrorKind::PermissionDenied);
        let mut chain = StreamNode::tape_chain(mode(), device.clone(), &options(&collector)).unwrap();

        let err = chain.start(Direction::Write).unwrap_err();
        assert!(err.is_device_failure());
        assert_eq!(chain.state(), NodeState::Stopped);
        assert_eq!(chain.source().unwrap().state(), NodeState::Stopped);
        assert!(collector.events_of_type("Started").is_empty());

        chain.start(Direction::Write).unwrap();
        assert_eq!(device.starts(), 2);
    }

    #[test]
    fn test_mismatched_units_rejected() {
        let options = StreamOptions::default();
        let device = StreamNode::device(mode(), 100, MemoryDevice::new(), &options).unwrap();
        assert_matches!(StreamNode::framer(device, &options), Err(Error::Config(_)));

        let device = StreamNode::device(mode(), 100, MemoryDevice::new(), &options).unwrap();
        assert_matches!(StreamNode::sector_codec(device, &options), Err(Error::Config(_)));

        let zero = StreamOptions {
            ring_units: 0,
            ..StreamOptions::default()
        };
        assert_matches!(
            StreamNode::device(mode(), 16, MemoryDevice::new(), &zero),
            Err(Error::Config(_))
        );
        assert_matches!(
            StreamNode::tape_chain(ModeWord::UNSET, MemoryDevice::new(), &options),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_device_write_short_count_when_full() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        device.script([Step::WouldBlock, Step::WouldBlock]);
        let mut node = StreamNode::device(mode(), 4, device.clone(), &options(&collector)).unwrap();
        node.start(Direction::Write).unwrap();

        // Ring holds 2 units of 4 bytes; the device refuses two writes
        assert_eq!(node.write(&[1u8; 12]).unwrap(), Transfer::Bytes(8));
        assert_eq!(node.write(&[2u8; 4]).unwrap(), Transfer::WouldBlock);
        assert_eq!(node.write(&[3u8; 4]).unwrap(), Transfer::Bytes(4));
        assert_eq!(node.flush().unwrap(), Flush::Complete);
        assert_eq!(&device.output()[..], &[1, 1, 1, 1, 1, 1, 1, 1, 3, 3, 3, 3]);
    }

    #[test]
    fn test_device_flush_pads_to_unit() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        let mut node = StreamNode::device(mode(), 4, device.clone(), &options(&collector)).unwrap();
        node.start(Direction::Write).unwrap();
        node.write(&[7u8; 5]).unwrap();
        assert_eq!(node.flush().unwrap(), Flush::Complete);
        assert_eq!(
            &device.output()[..],
            &[7, 7, 7, 7, 7, DEFAULT_FILLER, DEFAULT_FILLER, DEFAULT_FILLER]
        );
    }

    #[test]
    fn test_device_failure_releases_chain() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        device.script([Step::Fail(io::ErrorKind::BrokenPipe)]);
        let mut chain = StreamNode::tape_chain(mode(), device.clone(), &options(&collector)).unwrap();
        chain.start(Direction::Write).unwrap();

        let sector = vec![0u8; chain.unit()];
        let err = chain.write(&sector).unwrap_err();
        assert!(err.is_device_failure());
        assert_eq!(chain.state(), NodeState::Stopped);
        assert_eq!(device.releases(), 1);
        assert_eq!(collector.events_of_type("DeviceFailed").len(), 1);
    }

    #[test]
    fn test_release_discards_partial_sector() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let device = MemoryDevice::new();
        let mut chain = StreamNode::tape_chain(mode(), device.clone(), &options(&collector)).unwrap();
        chain.start(Direction::Write).unwrap();
        assert_eq!(chain.write(&[1u8; 10]).unwrap(), Transfer::Bytes(10));
        chain.release();

        assert!(device.output().is_empty());
        match &collector.events_of_type("Released")[0] {
            StreamEvent::Released {
                node,
                discarded_bytes,
                ..
            } => {
                assert_eq!(node, "sector");
                assert_eq!(*discarded_bytes, 10);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_missing_sectors_are_concealed() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let options = options(&collector);
        let sector = mode().geometry().unwrap().data_size;
        let payload = |seq: u64| vec![seq as u8 + 1; sector];
        let device = MemoryDevice::with_input(tape(&[0, 3, 4], payload));

        let mut node = framer_over(device, &options);
        node.start(Direction::Read).unwrap();
        let out = read_all(&mut node).unwrap();

        assert_eq!(out.len(), 5 * sector);
        assert!(out[..sector].iter().all(|&b| b == 1));
        assert_eq!(out[sector..2 * sector], recorded_filler(1)[..]);
        assert_eq!(out[2 * sector..3 * sector], recorded_filler(2)[..]);
        assert!(out[3 * sector..4 * sector].iter().all(|&b| b == 4));
        assert!(out[4 * sector..].iter().all(|&b| b == 5));

        let skipped = collector.events_of_type("SectorSkipped");
        assert_matches!(
            skipped.as_slice(),
            [StreamEvent::SectorSkipped { expected: 1, found: 3, .. }]
        );
        assert_eq!(node.stats().concealed_sectors(), 2);
    }

    #[test]
    fn test_stale_sector_dropped() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let options = options(&collector);
        let sector = mode().geometry().unwrap().data_size;
        let payload = |seq: u64| vec![seq as u8; sector];
        let device = MemoryDevice::with_input(tape(&[0, 1, 1, 2], payload));

        let mut node = framer_over(device, &options);
        node.start(Direction::Read).unwrap();
        let out = read_all(&mut node).unwrap();

        assert_eq!(out.len(), 3 * sector);
        assert_eq!(node.sequence(), 3);
        assert_matches!(
            collector.events_of_type("SectorInvalid").as_slice(),
            [StreamEvent::SectorInvalid { sequence: 1, .. }]
        );
    }

    #[test]
    fn test_damaged_sector_policies() {
        let sector = mode().geometry().unwrap().data_size;
        let mut image = tape(&[0, 1], |seq| vec![seq as u8 + 0x40; sector]);
        // Destroy every key of the second field
        let field = mode().geometry().unwrap().field_size();
        image[field..2 * field].fill(0);

        for (policy, expected) in [
            (IntegrityPolicy::Conceal, Some(recorded_filler(1))),
            (IntegrityPolicy::Deliver, Some(vec![0; sector])),
            (IntegrityPolicy::Halt, None),
        ] {
            let collector = Arc::new(InMemoryEventCollector::new());
            let options = options(&collector).with_integrity(policy);
            let mut node = framer_over(MemoryDevice::with_input(image.clone()), &options);
            node.start(Direction::Read).unwrap();

            match expected {
                Some(second) => {
                    let out = read_all(&mut node).unwrap();
                    assert_eq!(out.len(), 2 * sector);
                    assert!(out[..sector].iter().all(|&b| b == 0x40));
                    assert_eq!(out[sector..], second[..], "{:?}", policy);
                }
                None => {
                    assert_matches!(read_all(&mut node), Err(Error::Integrity { sequence: 1, .. }));
                }
            }
            assert_eq!(collector.events_of_type("SectorInvalid").len(), 1);
        }
    }

    #[test]
    fn test_halt_resumes_after_damaged_sector() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let options = options(&collector).with_integrity(IntegrityPolicy::Halt);
        let sector = mode().geometry().unwrap().data_size;
        let field = mode().geometry().unwrap().field_size();
        let mut image = tape(&[0, 1, 2], |seq| vec![seq as u8 + 0x40; sector]);
        image[field..2 * field].fill(0);

        let mut node = framer_over(MemoryDevice::with_input(image), &options);
        node.start(Direction::Read).unwrap();
        let (out, errors) = read_through_errors(&mut node);

        assert_matches!(errors.as_slice(), [Error::Integrity { sequence: 1, .. }]);
        assert_eq!(out.len(), 3 * sector);
        assert_eq!(out[sector..2 * sector], recorded_filler(1)[..]);
        assert!(out[2 * sector..].iter().all(|&b| b == 0x42));
        assert_eq!(node.sequence(), 3);
    }

    #[test]
    fn test_halt_resumes_after_missing_sectors() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let options = options(&collector).with_integrity(IntegrityPolicy::Halt);
        let sector = mode().geometry().unwrap().data_size;
        let image = tape(&[0, 3], |seq| vec![seq as u8 + 1; sector]);

        let mut node = framer_over(MemoryDevice::with_input(image), &options);
        node.start(Direction::Read).unwrap();
        let (out, errors) = read_through_errors(&mut node);

        assert_matches!(errors.as_slice(), [Error::Integrity { sequence: 1, .. }]);
        assert_eq!(out.len(), 4 * sector);
        assert_eq!(out[2 * sector..3 * sector], recorded_filler(2)[..]);
        assert!(out[3 * sector..].iter().all(|&b| b == 4));
        assert_eq!(node.stats().concealed_sectors(), 2);
    }

    #[test]
    fn test_truncated_field_discarded() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let options = options(&collector);
        let sector = mode().geometry().unwrap().data_size;
        let mut image = tape(&[0, 1], |_| vec![9u8; sector]);
        image.truncate(image.len() - 10);

        let mut node = framer_over(MemoryDevice::with_input(image), &options);
        node.start(Direction::Read).unwrap();
        let out = read_all(&mut node).unwrap();

        assert_eq!(out.len(), sector);
        match &collector.events_of_type("SectorInvalid")[0] {
            StreamEvent::SectorInvalid { reason, .. } => assert!(reason.starts_with("truncated")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_report_stall_notifies_listener() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut node = StreamNode::device(mode(), 4, MemoryDevice::new(), &options(&collector))
            .unwrap()
            .with_listener(move |activity: &Activity| sink.lock().push(*activity));

        node.report_stall(Duration::from_secs(1));
        assert!(seen.lock().is_empty());

        node.start(Direction::Write).unwrap();
        node.report_stall(Duration::from_secs(1));
        assert_eq!(
            seen.lock().as_slice(),
            &[Activity::Stalled {
                direction: Direction::Write,
                waited: Duration::from_secs(1)
            }]
        );
        assert_eq!(node.stats().stalls(), 1);
        assert_eq!(collector.events_of_type("Stalled").len(), 1);
    }
}
