//! Event bus and Reading stream.
//!
//! A single bounded broadcast channel carries every [`GridEvent`]. Slow
//! subscribers lose the oldest events instead of applying backpressure to
//! the poller; the receivers here log the lag and keep going.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;

use crate::event::{EventMetadata, GridEvent};
use crate::reading::Reading;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast bus shared by all components.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(GridEvent, EventMetadata)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus that buffers `capacity` events per slow subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `false` when nobody is listening.
    pub fn publish(&self, event: GridEvent, source: &str) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Shorthand for publishing a telemetry sample.
    pub fn publish_reading(&self, reading: Reading, source: &str) -> bool {
        self.publish(GridEvent::Reading(reading), source)
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching `filter`.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&GridEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Subscribe to device lifecycle events only.
    pub fn subscribe_device_events(&self) -> FilteredReceiver<fn(&GridEvent) -> bool> {
        self.subscribe_filtered(GridEvent::is_device_event)
    }

    /// Subscribe to the normalized Reading stream.
    pub fn subscribe_readings(&self) -> ReadingStream {
        ReadingStream {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

/// Receiver for all events.
pub struct EventReceiver {
    rx: broadcast::Receiver<(GridEvent, EventMetadata)>,
}

impl EventReceiver {
    /// Next event, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<(GridEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(GridEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => return Some(item),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Receiver that only yields events accepted by a filter.
pub struct FilteredReceiver<F>
where
    F: Fn(&GridEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(GridEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&GridEvent) -> bool + Send,
{
    pub async fn recv(&mut self) -> Option<(GridEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) if (self.filter)(&event) => return Some((event, meta)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(GridEvent, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok((event, meta)) if (self.filter)(&event) => return Some((event, meta)),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Stream of readings produced by the poller and the push listener.
pub struct ReadingStream {
    rx: broadcast::Receiver<(GridEvent, EventMetadata)>,
    lagged: u64,
}

impl ReadingStream {
    /// Next reading, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Reading> {
        loop {
            match self.rx.recv().await {
                Ok((GridEvent::Reading(reading), _)) => return Some(reading),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                    tracing::warn!(skipped = n, "Reading subscriber lagged, oldest readings dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total readings this subscriber has missed.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Reading> + Send {
        async_stream::stream! {
            while let Some(reading) = self.recv().await {
                yield reading;
            }
        }
    }
}
