//! Stream Chain
//!
//! - **Node** (`node.rs`) - [`StreamNode`] and its direction state machine
//! - **Stats** (`stats.rs`) - per-node atomic counters
//! - **Driver** (`driver.rs`) - blocking retry loop over a non-blocking chain
//! - **Pipeline** (`pipeline.rs`) - record and playback with application I/O
//!   on a second thread
//!
//! # Usage
//!
//! ```ignore
//! use vtape::domain::Direction;
//! use vtape::stream::{Driver, RetryStrategy, StreamNode, StreamOptions};
//!
//! let mut chain = StreamNode::tape_chain(mode, device, &StreamOptions::default())?;
//! chain.start(Direction::Write)?;
//!
//! let driver = Driver::for_mode(mode, RetryStrategy::Poll);
//! driver.write_all(&mut chain, b"hello tape")?;
//! driver.finish(&mut chain)?;
//! ```

pub mod driver;
pub mod node;
pub mod pipeline;
pub mod stats;

pub use driver::{Driver, RetryStrategy};
pub use node::{
    IntegrityPolicy, NodeState, StreamNode, StreamOptions, DEFAULT_FILLER, DEFAULT_RING_UNITS,
};
pub use pipeline::{play, record};
pub use stats::{StatsSnapshot, StreamStats};
