//! Sector geometry table
//!
//! The single source of truth for how a sector is laid out in a video field
//! for each (standard, density, format) combination.

use super::mode::{Density, FormatVariant, VideoStandard};

/// Bytes in one scrambler word.
pub const WORD_SIZE: usize = 4;

/// Smallest key that can carry a sector sequence number.
pub const MIN_KEY_LENGTH: usize = 4;

/// Derived sector geometry. Recomputed from the mode on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorFormat {
    /// Payload bytes carried per video line
    pub bytes_per_line: usize,
    /// Data-carrying lines per field
    pub lines_per_field: usize,
    /// Leader bytes at the start of every field
    pub leader: usize,
    /// Application payload bytes per sector
    pub data_size: usize,
    /// Payload bytes between consecutive keys
    pub key_interval: usize,
    /// Bytes per key
    pub key_length: usize,
}

impl SectorFormat {
    /// Bytes in one raw video field.
    pub fn field_size(&self) -> usize {
        self.bytes_per_line * self.lines_per_field
    }

    /// Keys embedded in one sector.
    pub fn key_count(&self) -> usize {
        self.data_size / self.key_interval
    }

    /// Bytes used by leader, keys and payload.
    pub fn framed_size(&self) -> usize {
        self.leader + self.data_size + self.key_count() * self.key_length
    }

    /// Filler bytes after the framed sector up to the end of the field.
    pub fn trailer(&self) -> usize {
        self.field_size() - self.framed_size()
    }
}

struct Layout {
    leader: usize,
    data_size: usize,
    key_interval: usize,
    key_length: usize,
}

const fn layout(leader: usize, data_size: usize, key_interval: usize, key_length: usize) -> Layout {
    Layout {
        leader,
        data_size,
        key_interval,
        key_length,
    }
}

fn table(standard: VideoStandard, density: Density, format: FormatVariant) -> Layout {
    use Density::*;
    use FormatVariant::*;
    use VideoStandard::*;

    match (standard, density, format) {
        (Ntsc, Low, Sp) => layout(28, 896, 64, 4),
        (Ntsc, Low, Ep) => layout(56, 768, 32, 4),
        (Ntsc, High, Sp) => layout(28, 2176, 128, 8),
        (Ntsc, High, Ep) => layout(56, 1984, 64, 8),
        (Pal, Low, Sp) => layout(28, 1088, 64, 4),
        (Pal, Low, Ep) => layout(56, 960, 32, 4),
        (Pal, High, Sp) => layout(28, 2688, 128, 8),
        (Pal, High, Ep) => layout(56, 2432, 64, 8),
    }
}

/// Look up the sector geometry for a mode combination.
///
/// Total over the closed enums; see [`ModeWord::geometry`] for the fallible
/// variant that handles unset fields.
///
/// [`ModeWord::geometry`]: super::ModeWord::geometry
pub fn geometry(standard: VideoStandard, density: Density, format: FormatVariant) -> SectorFormat {
    let entry = table(standard, density, format);
    SectorFormat {
        bytes_per_line: density.bytes_per_line(),
        lines_per_field: standard.lines_per_field(),
        leader: entry.leader,
        data_size: entry.data_size,
        key_interval: entry.key_interval,
        key_length: entry.key_length,
    }
}

/// Every combination in the table, for exhaustive checks.
pub fn all_combinations() -> impl Iterator<Item = (VideoStandard, Density, FormatVariant)> {
    VideoStandard::ALL.into_iter().flat_map(|standard| {
        Density::ALL.into_iter().flat_map(move |density| {
            FormatVariant::ALL
                .into_iter()
                .map(move |format| (standard, density, format))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_eight_entries() {
        assert_eq!(all_combinations().count(), 8);
    }

    #[test]
    fn test_geometry_fits_field() {
        for (standard, density, format) in all_combinations() {
            let sf = geometry(standard, density, format);
            assert!(sf.data_size > 0);
            assert!(sf.leader + sf.key_length <= sf.data_size);
            assert!(sf.framed_size() <= sf.field_size(), "{:?}", sf);
            assert_eq!(sf.data_size % WORD_SIZE, 0);
            assert_eq!(sf.data_size % sf.key_interval, 0);
            assert!(sf.key_length >= MIN_KEY_LENGTH);
        }
    }

    #[test]
    fn test_known_entry() {
        let sf = geometry(VideoStandard::Ntsc, Density::Low, FormatVariant::Sp);
        assert_eq!(sf.field_size(), 1012);
        assert_eq!(sf.key_count(), 14);
        assert_eq!(sf.framed_size(), 28 + 896 + 56);
        assert_eq!(sf.trailer(), 1012 - 980);
    }

    #[test]
    fn test_ep_trades_payload_for_keys() {
        for standard in VideoStandard::ALL {
            for density in Density::ALL {
                let sp = geometry(standard, density, FormatVariant::Sp);
                let ep = geometry(standard, density, FormatVariant::Ep);
                assert!(ep.data_size < sp.data_size);
                assert!(ep.key_count() > sp.key_count());
                assert_eq!(sp.field_size(), ep.field_size());
            }
        }
    }
}
