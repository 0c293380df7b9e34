//! Event Publisher Adapter
//!
//! Backends for the `EventPublisher` port: tracing output, an in-memory
//! collector that tallies tape damage, and a fan-out composite.

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::StreamEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logs stream events through tracing, tagged with the raising node.
///
/// Damaged and missing sectors always go out at warn level; lifecycle
/// events use the configured level.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log routine events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    /// Create a new logging event publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: StreamEvent) -> Result<()> {
        let node = event.node();
        let kind = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if event.is_integrity_warning() {
            warn!(node, kind, event = %json, "Tape damage");
        } else if self.info_level {
            info!(node, kind, event = %json, "Stream event");
        } else {
            debug!(node, kind, event = %json, "Stream event");
        }

        Ok(())
    }
}

/// Keeps events for later inspection; `vtape check` builds its damage
/// report from one.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<StreamEvent>>,
}

impl InMemoryEventCollector {
    /// Create a new in-memory event collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.read().clone()
    }

    /// Get the count of collected events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events raised by the node called `node`.
    pub fn events_for_node(&self, node: &str) -> Vec<StreamEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.node() == node)
            .cloned()
            .collect()
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<StreamEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Count of skipped-sector and invalid-sector events.
    pub fn integrity_warnings(&self) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.is_integrity_warning())
            .count()
    }

    /// Total number of sectors reported as never having arrived.
    pub fn missing_sectors(&self) -> u64 {
        self.events
            .read()
            .iter()
            .map(|e| match e {
                StreamEvent::SectorSkipped {
                    expected, found, ..
                } => found.saturating_sub(*expected),
                _ => 0,
            })
            .sum()
    }

    /// Sequence numbers of sectors that failed their structural check, in
    /// the order they were read.
    pub fn damaged_sequences(&self) -> Vec<u64> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                StreamEvent::SectorInvalid { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect()
    }
}

impl EventPublisher for InMemoryEventCollector {
    fn publish(&self, event: StreamEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

/// Fans each event out to every backend in turn, stopping at the first
/// that fails.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    /// Create a new composite publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a publisher to the composite.
    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

impl EventPublisher for CompositeEventPublisher {
    fn publish(&self, event: StreamEvent) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish(event.clone())?;
        }
        Ok(())
    }
}

/// Forwarding impl so a shared collector can sit inside a composite.
impl<P: EventPublisher + ?Sized> EventPublisher for std::sync::Arc<P> {
    fn publish(&self, event: StreamEvent) -> Result<()> {
        (**self).publish(event)
    }
}
