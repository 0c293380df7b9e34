//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │          DeviceIo │ ActivityListener │ EventPublisher       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ StdioDevice │ MemoryDevice │ FieldPacer                    │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector │ Composite │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::fs::OpenOptions;
//! use vtape::adapters::{StdioDevice, TransferStyle};
//! use vtape::stream::{StreamNode, StreamOptions};
//!
//! let file = OpenOptions::new().read(true).write(true).open("/dev/video0")?;
//! let device = StdioDevice::with_fd(file, TransferStyle::Raw)?;
//! let chain = StreamNode::tape_chain(mode, device, &StreamOptions::default())?;
//! ```

pub mod event_publisher;
pub mod memory;
pub mod pacer;
pub mod stdio;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use memory::{MemoryDevice, Step};
pub use pacer::FieldPacer;
#[cfg(unix)]
pub use stdio::set_nonblocking;
pub use stdio::{StdioDevice, TransferStyle};
