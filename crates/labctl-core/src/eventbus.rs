//! Event bus for labctl.
//!
//! Components announce state changes by publishing [`LabEvent`]s; the
//! orchestrator, metrics and tests observe them by subscribing.

use crate::event::{EventMetadata, LabEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast event bus.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is discarded, and slow subscribers lose the oldest buffered events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(LabEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: LabEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: LabEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.publish_with_metadata(event, metadata)
    }

    /// Publish an event with custom metadata.
    pub fn publish_with_metadata(&self, event: LabEvent, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&LabEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Create a filtered subscription helper for common patterns.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(LabEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(LabEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(LabEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<LabEvent> {
        let mut events = Vec::new();
        while let Some((event, _)) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&LabEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(LabEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&LabEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(LabEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(LabEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(LabEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Builder for creating filtered subscriptions.
pub struct FilterBuilder {
    tx: broadcast::Sender<(LabEvent, EventMetadata)>,
}

impl FilterBuilder {
    pub fn device_events(&self) -> FilteredReceiver<fn(&LabEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), LabEvent::is_device_event)
    }

    pub fn lock_events(&self) -> FilteredReceiver<fn(&LabEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), LabEvent::is_lock_event)
    }

    pub fn job_events(&self) -> FilteredReceiver<fn(&LabEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), LabEvent::is_job_event)
    }

    pub fn fault_events(&self) -> FilteredReceiver<fn(&LabEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), LabEvent::is_fault_event)
    }

    /// Subscribe to every event concerning one device.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&LabEvent) -> bool + Send + 'static> {
        let target = device_id.into();
        FilteredReceiver::new(self.tx.subscribe(), move |event: &LabEvent| {
            event.device_id() == Some(target.as_str())
        })
    }

    /// Subscribe with a custom filter function.
    pub fn custom<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&LabEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;
