//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - traits the stream chain depends on, plus the
//!   transfer outcome types shared by every layer
//! - **Events** (`events.rs`) - notable occurrences published by stream nodes
//!
//! # Usage
//!
//! ```ignore
//! use vtape::domain::{DeviceIo, Transfer};
//!
//! fn pump<D: DeviceIo>(device: &mut D, buf: &[u8]) -> vtape::Result<usize> {
//!     match device.write(buf)? {
//!         Transfer::Bytes(n) => Ok(n),
//!         Transfer::WouldBlock | Transfer::EndOfStream => Ok(0),
//!     }
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::StreamEvent;
pub use ports::{
    Activity, ActivityListener, DeviceIo, Direction, EventPublisher, Flush, Readiness, Transfer,
};
