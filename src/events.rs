use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::Stream;
use tracing::{instrument, trace};

use crate::hw::{CharacteristicPayload, DiscoveryStatus, GattStatus};

/// Normalised events published by the connection manager.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum GattEvent {
    /// The link to the peripheral is up.
    Connected,
    /// The link to the peripheral is down.
    Disconnected,
    /// Service discovery finished; the catalog was replaced only when the outcome is complete.
    ServicesDiscovered(DiscoveryStatus),
    /// A characteristic value arrived from a read or a notification.
    DataAvailable(CharacteristicPayload),
    /// A characteristic write completed with the given status.
    WriteComplete(CharacteristicPayload, GattStatus),
}

impl GattEvent {
    /// Stable event name for logs and output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ServicesDiscovered(_) => "services_discovered",
            Self::DataAvailable(_) => "data_available",
            Self::WriteComplete(..) => "write_complete",
        }
    }
}

/// In-process fan-out of [`GattEvent`]s to every live subscriber, in publish order.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: Mutex<Vec<UnboundedSender<GattEvent>>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for the whole event set.
    pub fn subscribe(&self) -> EventSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        EventSubscription { receiver }
    }

    /// Delivers `event` to every subscriber, pruning the ones that were dropped.
    #[instrument(skip(self), level = "trace", fields(event = event.name()))]
    pub fn publish(&self, event: GattEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        trace!(subscribers = subscribers.len(), "event published");
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| !subscriber.is_closed());
        subscribers.len()
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: UnboundedReceiver<GattEvent>,
}

impl EventSubscription {
    /// Waits for the next event; `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<GattEvent> {
        self.receiver.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<GattEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventSubscription {
    type Item = GattEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
