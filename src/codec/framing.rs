//! Sector framing
//!
//! Lays a scrambled sector out in a video field and checks the structure on
//! the way back:
//!
//! ```text
//! ┌────────┬─────┬──────────────┬─────┬──────────────┬─────┬─────────┐
//! │ leader │ key │ key_interval │ key │ key_interval │ ... │ trailer │
//! │  0xE2  │  0  │   payload    │  1  │   payload    │     │ filler  │
//! └────────┴─────┴──────────────┴─────┴──────────────┴─────┴─────────┘
//! ```
//!
//! Key `i` of sector `s` starts with `(s as u32) + i` little-endian and is
//! padded with the marker pattern. Every key therefore names the sector
//! independently, and deframing takes a vote.

use tracing::instrument;

use crate::format::SectorFormat;

/// Byte value filling the leader.
pub const LEADER_BYTE: u8 = 0xE2;

/// Base of the marker pattern after the sequence bytes of each key.
pub const KEY_MARKER: u8 = 0x5A;

/// Largest forward jump in sequence numbers that is concealed rather than
/// treated as a damaged sector.
pub const MAX_RESYNC_GAP: u64 = 64;

const SEQUENCE_BYTES: usize = 4;

/// Result of checking a received field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCheck {
    /// Leader and every key intact and in agreement
    Valid { sequence: u32 },
    /// A majority of keys agree but the frame is not clean
    Damaged { sequence: u32, reason: String },
    /// No sequence number can be recovered
    Unreadable { reason: String },
}

impl FrameCheck {
    /// Sequence number recovered from the keys, if any.
    pub fn sequence(&self) -> Option<u32> {
        match self {
            FrameCheck::Valid { sequence } | FrameCheck::Damaged { sequence, .. } => {
                Some(*sequence)
            }
            FrameCheck::Unreadable { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, FrameCheck::Valid { .. })
    }
}

/// Frames sectors into fields for one sector geometry.
#[derive(Debug, Clone)]
pub struct SectorFramer {
    format: SectorFormat,
    filler: u8,
}

impl SectorFramer {
    pub fn new(format: SectorFormat, filler: u8) -> Self {
        Self { format, filler }
    }

    pub fn format(&self) -> &SectorFormat {
        &self.format
    }

    /// Payload bytes per sector.
    pub fn sector_size(&self) -> usize {
        self.format.data_size
    }

    /// Bytes per framed field.
    pub fn field_size(&self) -> usize {
        self.format.field_size()
    }

    /// Frame `payload` (one sector) into `field`.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is not exactly one sector or `field` is not
    /// exactly one field.
    #[instrument(level = "trace", skip(self, payload, field))]
    pub fn frame(&self, payload: &[u8], sequence: u64, field: &mut [u8]) {
        assert_eq!(payload.len(), self.format.data_size, "payload is not one sector");
        assert_eq!(field.len(), self.field_size(), "output is not one field");

        let sf = &self.format;
        field[..sf.leader].fill(LEADER_BYTE);

        let mut at = sf.leader;
        for (i, chunk) in payload.chunks_exact(sf.key_interval).enumerate() {
            write_key(&mut field[at..at + sf.key_length], sequence as u32, i);
            at += sf.key_length;
            field[at..at + chunk.len()].copy_from_slice(chunk);
            at += chunk.len();
        }

        field[at..].fill(self.filler);
    }

    /// Extract the payload of `field` into `payload` and check its framing.
    ///
    /// The payload is always copied out, even from a damaged frame.
    #[instrument(level = "trace", skip(self, field, payload))]
    pub fn deframe(&self, field: &[u8], payload: &mut [u8]) -> FrameCheck {
        assert_eq!(payload.len(), self.format.data_size, "payload is not one sector");
        assert_eq!(field.len(), self.field_size(), "input is not one field");

        let sf = &self.format;
        let leader_intact = field[..sf.leader]
            .iter()
            .filter(|&&b| b == LEADER_BYTE)
            .count();
        let leader_ok = leader_intact * 4 >= sf.leader * 3;

        let keys = sf.key_count();
        let mut votes: Vec<u32> = Vec::with_capacity(keys);
        let mut at = sf.leader;
        for (i, chunk) in payload.chunks_exact_mut(sf.key_interval).enumerate() {
            if let Some(sequence) = read_key(&field[at..at + sf.key_length], i) {
                votes.push(sequence);
            }
            at += sf.key_length;
            chunk.copy_from_slice(&field[at..at + sf.key_interval]);
            at += sf.key_interval;
        }

        let Some((sequence, agreeing)) = majority(&votes) else {
            return FrameCheck::Unreadable {
                reason: format!("no readable key in {} keys", keys),
            };
        };

        if agreeing * 2 <= keys {
            return FrameCheck::Unreadable {
                reason: format!("only {} of {} keys agree", agreeing, keys),
            };
        }

        if agreeing == keys && leader_ok {
            FrameCheck::Valid { sequence }
        } else if !leader_ok {
            FrameCheck::Damaged {
                sequence,
                reason: format!("leader damaged ({} of {} bytes intact)", leader_intact, sf.leader),
            }
        } else {
            FrameCheck::Damaged {
                sequence,
                reason: format!("{} of {} keys damaged", keys - agreeing, keys),
            }
        }
    }
}

fn write_key(key: &mut [u8], sequence: u32, index: usize) {
    let value = sequence.wrapping_add(index as u32);
    key[..SEQUENCE_BYTES].copy_from_slice(&value.to_le_bytes());
    for (j, byte) in key[SEQUENCE_BYTES..].iter_mut().enumerate() {
        *byte = KEY_MARKER ^ j as u8;
    }
}

fn read_key(key: &[u8], index: usize) -> Option<u32> {
    let markers_ok = key[SEQUENCE_BYTES..]
        .iter()
        .enumerate()
        .all(|(j, &byte)| byte == KEY_MARKER ^ j as u8);
    if !markers_ok {
        return None;
    }

    let mut raw = [0u8; SEQUENCE_BYTES];
    raw.copy_from_slice(&key[..SEQUENCE_BYTES]);
    Some(u32::from_le_bytes(raw).wrapping_sub(index as u32))
}

/// Most frequent value and its count.
fn majority(votes: &[u32]) -> Option<(u32, usize)> {
    votes
        .iter()
        .map(|&candidate| {
            let count = votes.iter().filter(|&&v| v == candidate).count();
            (candidate, count)
        })
        .max_by_key(|&(_, count)| count)
}
