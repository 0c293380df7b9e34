//! Stream Events
//!
//! Immutable records of notable things that happened on a chain. Integrity
//! problems are reported here rather than as errors, because playback has
//! to ride over damaged stretches of tape.
//!
//! # Example
//!
//! ```ignore
//! let event = StreamEvent::sector_skipped("frame", 41, 43);
//! publisher.publish(event)?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::Direction;

/// Notable occurrence on a stream node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    // =========================================================================
    // Lifecycle Events
    // =========================================================================
    /// A node started transferring.
    Started {
        node: String,
        direction: Direction,
        mode: String,
        timestamp: DateTime<Utc>,
    },

    /// A node was released.
    Released {
        node: String,
        sectors: u64,
        discarded_bytes: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Integrity Events
    // =========================================================================
    /// One or more sectors never arrived; `found` was read where `expected`
    /// was due.
    SectorSkipped {
        node: String,
        expected: u64,
        found: u64,
        timestamp: DateTime<Utc>,
    },

    /// A sector failed its structural check.
    SectorInvalid {
        node: String,
        sequence: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Transport Events
    // =========================================================================
    /// The device stayed not-ready past the advisory timeout.
    Stalled {
        node: String,
        direction: Direction,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The device failed; the chain was torn down.
    DeviceFailed {
        node: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamEvent::Started { timestamp, .. } => *timestamp,
            StreamEvent::Released { timestamp, .. } => *timestamp,
            StreamEvent::SectorSkipped { timestamp, .. } => *timestamp,
            StreamEvent::SectorInvalid { timestamp, .. } => *timestamp,
            StreamEvent::Stalled { timestamp, .. } => *timestamp,
            StreamEvent::DeviceFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Started { .. } => "Started",
            StreamEvent::Released { .. } => "Released",
            StreamEvent::SectorSkipped { .. } => "SectorSkipped",
            StreamEvent::SectorInvalid { .. } => "SectorInvalid",
            StreamEvent::Stalled { .. } => "Stalled",
            StreamEvent::DeviceFailed { .. } => "DeviceFailed",
        }
    }

    /// Name of the node that raised the event.
    pub fn node(&self) -> &str {
        match self {
            StreamEvent::Started { node, .. }
            | StreamEvent::Released { node, .. }
            | StreamEvent::SectorSkipped { node, .. }
            | StreamEvent::SectorInvalid { node, .. }
            | StreamEvent::Stalled { node, .. }
            | StreamEvent::DeviceFailed { node, .. } => node,
        }
    }

    /// True for events describing damaged or missing sectors.
    pub fn is_integrity_warning(&self) -> bool {
        matches!(
            self,
            StreamEvent::SectorSkipped { .. } | StreamEvent::SectorInvalid { .. }
        )
    }

    // =========================================================================
    // Factory Methods
    // =========================================================================

    pub fn started(node: &str, direction: Direction, mode: impl ToString) -> Self {
        StreamEvent::Started {
            node: node.to_string(),
            direction,
            mode: mode.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn released(node: &str, sectors: u64, discarded_bytes: usize) -> Self {
        StreamEvent::Released {
            node: node.to_string(),
            sectors,
            discarded_bytes,
            timestamp: Utc::now(),
        }
    }

    pub fn sector_skipped(node: &str, expected: u64, found: u64) -> Self {
        StreamEvent::SectorSkipped {
            node: node.to_string(),
            expected,
            found,
            timestamp: Utc::now(),
        }
    }

    pub fn sector_invalid(node: &str, sequence: u64, reason: impl Into<String>) -> Self {
        StreamEvent::SectorInvalid {
            node: node.to_string(),
            sequence,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stalled(node: &str, direction: Direction, waited: Duration) -> Self {
        StreamEvent::Stalled {
            node: node.to_string(),
            direction,
            waited_ms: waited.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn device_failed(node: &str, reason: impl ToString) -> Self {
        StreamEvent::DeviceFailed {
            node: node.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        }
    }
}
