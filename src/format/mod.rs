//! Recording Mode and Sector Geometry
//!
//! - **Mode word** (`mode.rs`): packs video standard, bit density, sector
//!   format and I/O timeout into one value
//! - **Geometry** (`geometry.rs`): maps a mode to leader/payload/key layout
//! - **Summary** (`summary.rs`): human-readable rendering of a mode

pub mod geometry;
pub mod mode;
pub mod summary;

pub use geometry::{geometry, SectorFormat};
pub use mode::{Density, FormatVariant, ModeWord, VideoStandard, MAX_TIMEOUT_SECS};
pub use summary::{summary, write_summary};
