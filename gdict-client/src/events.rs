//! # Event Channel
//!
//! Connection lifecycle and server key-change notifications, fanned out to
//! every live [`Subscription`]. Each subscriber gets its own unbounded queue,
//! so events from one connection arrive in the order they were produced.
//! With nobody subscribed, events are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionHandle;

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected {
        handle: ConnectionHandle,
    },
    Disconnected {
        handle: ConnectionHandle,
    },
    /// The connection broke and every pending operation on it failed.
    Failed {
        handle: ConnectionHandle,
        reason: String,
    },
    /// Another session changed `key`. `None` means it was deleted.
    KeyChanged {
        handle: ConnectionHandle,
        key: Bytes,
        value: Option<Bytes>,
    },
}

impl Event {
    pub fn handle(&self) -> ConnectionHandle {
        match self {
            Event::Connected { handle }
            | Event::Disconnected { handle }
            | Event::Failed { handle, .. }
            | Event::KeyChanged { handle, .. } => *handle,
        }
    }
}

#[derive(Debug, Default)]
struct BusInner {
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<Event>)>>,
    next_id: AtomicU64,
}

/// Fan-out point shared by the driver and its connections.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push((id, tx));
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Queues `event` for every subscriber.
    pub(crate) fn publish(&self, event: Event) {
        // Held across the sends so concurrent publishers cannot reorder
        // one connection's events between subscribers.
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Receiving end of the event channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Waits for the next event. `None` once the driver and all of its
    /// connections are gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
