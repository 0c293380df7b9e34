//! vtape - byte streams on video tape
//!
//! Stores an arbitrary byte stream on an analog video recorder by packing
//! data into video fields. A recording mode selects the video standard, bit
//! density and sector format; from it follow the sector geometry and the
//! field layout.
//!
//! # Architecture
//!
//! A transport is a chain of stream nodes, each owning a ring buffer and
//! pulling from or pushing to the node below it:
//!
//! ```text
//! application ⇄ sector codec (scramble) ⇄ framer (fields) ⇄ device node ⇄ DeviceIo
//! ```
//!
//! Nodes never block. Would-block and end-of-stream are reported as
//! [`domain::Transfer`] values; [`stream::Driver`] adds blocking semantics on
//! top for callers that want them.
//!
//! # Modules
//!
//! - [`adapters`] - Device and event publisher implementations of the domain ports
//! - [`codec`] - Sector randomizer and field framing
//! - [`config`] - YAML transport configuration
//! - [`domain`] - Ports and stream events
//! - [`error`] - Error types
//! - [`format`] - Mode word and sector geometry
//! - [`ring`] - Ring buffers
//! - [`stream`] - Stream nodes, retry driver and overlapped pipeline

pub mod adapters;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod format;
pub mod ring;
pub mod stream;

// Re-export commonly used types
pub use config::TransportConfig;
pub use domain::{DeviceIo, Direction, StreamEvent, Transfer};
pub use error::{Error, Result};
pub use format::{ModeWord, SectorFormat};
pub use stream::{Driver, StreamNode, StreamOptions};
