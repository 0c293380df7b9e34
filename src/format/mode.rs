//! Packed mode word
//!
//! A [`ModeWord`] carries the four recording parameters in one `u32`:
//!
//! ```text
//!  31            16 15         8 7   6 5    4 3     2 1      0
//! ┌────────────────┬────────────┬─────┬──────┬───────┬────────┐
//! │    reserved    │  timeout   │ rsv │format│density│standard│
//! └────────────────┴────────────┴─────┴──────┴───────┴────────┘
//! ```
//!
//! Each two-bit field uses `0` as its "unset" value; the timeout byte uses
//! `0xFF`. Raw timeout values above [`MAX_TIMEOUT_SECS`] also read back as
//! unset.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::geometry::{geometry, SectorFormat};
use crate::error::{Error, Result};

const STANDARD_SHIFT: u32 = 0;
const DENSITY_SHIFT: u32 = 2;
const FORMAT_SHIFT: u32 = 4;
const TIMEOUT_SHIFT: u32 = 8;

const FIELD_MASK: u32 = 0b11;
const TIMEOUT_MASK: u32 = 0xFF;

/// Raw timeout byte meaning "no timeout configured".
pub const TIMEOUT_UNSET: u32 = 0xFF;

/// Longest timeout the mode word can carry.
pub const MAX_TIMEOUT_SECS: u32 = 60;

/// Video timing standard of the capture/generator device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum VideoStandard {
    Ntsc,
    Pal,
}

impl VideoStandard {
    pub const ALL: [VideoStandard; 2] = [VideoStandard::Ntsc, VideoStandard::Pal];

    fn code(self) -> u32 {
        match self {
            VideoStandard::Ntsc => 1,
            VideoStandard::Pal => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(VideoStandard::Ntsc),
            2 => Some(VideoStandard::Pal),
            _ => None,
        }
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        match self {
            VideoStandard::Ntsc => "NTSC",
            VideoStandard::Pal => "PAL",
        }
    }

    /// Data-carrying lines in one video field.
    pub fn lines_per_field(self) -> usize {
        match self {
            VideoStandard::Ntsc => 253,
            VideoStandard::Pal => 305,
        }
    }

    /// Fields per second, as a rational `(numerator, denominator)`.
    pub fn field_rate(self) -> (u64, u64) {
        match self {
            VideoStandard::Ntsc => (60_000, 1_001),
            VideoStandard::Pal => (50, 1),
        }
    }

    /// Duration of one field at this standard's rate.
    pub fn field_period(self) -> Duration {
        let (num, den) = self.field_rate();
        Duration::from_nanos(1_000_000_000 * den / num)
    }
}

impl fmt::Display for VideoStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bit density used when modulating bytes onto a video line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Density {
    Low,
    High,
}

impl Density {
    pub const ALL: [Density; 2] = [Density::Low, Density::High];

    fn code(self) -> u32 {
        match self {
            Density::Low => 1,
            Density::High => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Density::Low),
            2 => Some(Density::High),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Density::Low => "LOW",
            Density::High => "HIGH",
        }
    }

    /// Payload bytes carried by one video line.
    pub fn bytes_per_line(self) -> usize {
        match self {
            Density::Low => 4,
            Density::High => 10,
        }
    }
}

impl fmt::Display for Density {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sector format variant.
///
/// `Sp` favours payload; `Ep` spends more of each field on leader and keys
/// for tapes recorded at extended-play speed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FormatVariant {
    Sp,
    Ep,
}

impl FormatVariant {
    pub const ALL: [FormatVariant; 2] = [FormatVariant::Sp, FormatVariant::Ep];

    fn code(self) -> u32 {
        match self {
            FormatVariant::Sp => 1,
            FormatVariant::Ep => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(FormatVariant::Sp),
            2 => Some(FormatVariant::Ep),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FormatVariant::Sp => "SP",
            FormatVariant::Ep => "EP",
        }
    }
}

impl fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Packed recording mode. Immutable; copy it wherever it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeWord(u32);

impl ModeWord {
    /// A mode word with every field unset.
    pub const UNSET: ModeWord = ModeWord(TIMEOUT_UNSET << TIMEOUT_SHIFT);

    /// Pack the four fields. Never fails: a timeout above
    /// [`MAX_TIMEOUT_SECS`] is stored as unset.
    pub fn pack(
        standard: Option<VideoStandard>,
        density: Option<Density>,
        format: Option<FormatVariant>,
        timeout_secs: Option<u32>,
    ) -> Self {
        let timeout = match timeout_secs {
            Some(secs) if secs <= MAX_TIMEOUT_SECS => secs,
            _ => TIMEOUT_UNSET,
        };

        let raw = (standard.map_or(0, VideoStandard::code) << STANDARD_SHIFT)
            | (density.map_or(0, Density::code) << DENSITY_SHIFT)
            | (format.map_or(0, FormatVariant::code) << FORMAT_SHIFT)
            | (timeout << TIMEOUT_SHIFT);

        ModeWord(raw)
    }

    /// Reinterpret a raw value, e.g. one read back from a device.
    pub fn from_raw(raw: u32) -> Self {
        ModeWord(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn standard(self) -> Option<VideoStandard> {
        VideoStandard::from_code((self.0 >> STANDARD_SHIFT) & FIELD_MASK)
    }

    pub fn density(self) -> Option<Density> {
        Density::from_code((self.0 >> DENSITY_SHIFT) & FIELD_MASK)
    }

    pub fn format(self) -> Option<FormatVariant> {
        FormatVariant::from_code((self.0 >> FORMAT_SHIFT) & FIELD_MASK)
    }

    /// Timeout in whole seconds, or `None` when unset or out of range.
    pub fn timeout_secs(self) -> Option<u32> {
        let secs = (self.0 >> TIMEOUT_SHIFT) & TIMEOUT_MASK;
        (secs <= MAX_TIMEOUT_SECS).then_some(secs)
    }

    pub fn timeout(self) -> Option<Duration> {
        self.timeout_secs().map(|secs| Duration::from_secs(u64::from(secs)))
    }

    /// Replace the timeout, keeping the other fields.
    pub fn with_timeout(self, timeout_secs: Option<u32>) -> Self {
        ModeWord::pack(self.standard(), self.density(), self.format(), timeout_secs)
    }

    /// True when standard, density and format are all set.
    pub fn is_complete(self) -> bool {
        self.standard().is_some() && self.density().is_some() && self.format().is_some()
    }

    /// Sector geometry for this mode.
    ///
    /// Fails with a configuration error if any geometry field is unset.
    pub fn geometry(self) -> Result<SectorFormat> {
        match (self.standard(), self.density(), self.format()) {
            (Some(standard), Some(density), Some(format)) => {
                Ok(geometry(standard, density, format))
            }
            _ => Err(Error::Config(format!(
                "mode {} does not select a video standard, density and sector format",
                self
            ))),
        }
    }
}

impl Default for ModeWord {
    fn default() -> Self {
        ModeWord::UNSET
    }
}

impl fmt::Display for ModeWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |label: Option<&'static str>| label.unwrap_or("-");
        write!(
            f,
            "{}/{}/{}",
            field(self.standard().map(VideoStandard::label)),
            field(self.density().map(Density::label)),
            field(self.format().map(FormatVariant::label)),
        )?;
        match self.timeout_secs() {
            Some(secs) => write!(f, "/{}s", secs),
            None => Ok(()),
        }
    }
}
