//! Ring Buffers
//!
//! - [`RingBuffer`]: owned, single-threaded circular buffer used inside
//!   every stream node
//! - [`shared_ring`]: the same cursor discipline split into a producer and a
//!   consumer half for overlapping application I/O with device I/O on two
//!   threads

pub mod buffer;
pub mod shared;

pub use buffer::RingBuffer;
pub use shared::{shared_ring, Consumer, Producer};
