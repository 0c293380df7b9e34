//! Sector Codec
//!
//! Transforms applied to every sector between the application and the
//! medium.
//!
//! # Components
//!
//! - **Randomizer** (`randomizer.rs`): self-inverse LCG scrambling, seeded
//!   from the sector sequence number
//! - **Framing** (`framing.rs`): places a sector in a video field behind a
//!   leader with interleaved sequence keys, and checks that structure on
//!   playback
//!
//! # Usage
//!
//! ```rust
//! use vtape::codec::{descramble, scramble, sector_seed};
//!
//! let mut sector = vec![0x42u8; 896];
//! scramble(&mut sector, sector_seed(3));
//! descramble(&mut sector, sector_seed(3));
//! assert!(sector.iter().all(|&b| b == 0x42));
//! ```

pub mod framing;
pub mod randomizer;

#[cfg(test)]
mod proptest;

pub use crate::format::geometry::WORD_SIZE;
pub use framing::{FrameCheck, SectorFramer, MAX_RESYNC_GAP};
pub use randomizer::{descramble, scramble, sector_seed};
