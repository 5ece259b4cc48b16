//! Asynchronous notification registry.
//!
//! Interested parties register and receive events on their own queue. Delivery is fire and forget:
//! the notifier never blocks on a subscriber, and subscribers that dropped their queue are pruned on
//! the next delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    /// New data is available to read.
    Readable,
    /// The device can accept writes again.
    Writable,
    /// The device went away.
    Hangup,
}

pub struct Subscription {
    id: u64,
    events: Receiver<NotifyEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> &Receiver<NotifyEvent> {
        &self.events
    }

    /// Returns every event queued so far without blocking.
    pub fn drain(&self) -> Vec<NotifyEvent> {
        self.events.try_iter().collect()
    }
}

#[derive(Default)]
pub struct NotifyRegistry {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(u64, Sender<NotifyEvent>)>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { id, events: rx }
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        sinks.len() != before
    }

    /// Delivers `event` to every live subscriber and returns how many received it.
    pub fn notify(&self, event: NotifyEvent) -> usize {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|(_, tx)| tx.send(event).is_ok());
        sinks.len()
    }

    pub fn len(&self) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_reaches_every_subscriber() {
        let registry = NotifyRegistry::new();
        let a = registry.subscribe();
        let b = registry.subscribe();
        assert_ne!(a.id(), b.id());

        assert_eq!(registry.notify(NotifyEvent::Readable), 2);
        assert_eq!(a.drain(), vec![NotifyEvent::Readable]);
        assert_eq!(b.drain(), vec![NotifyEvent::Readable]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let registry = NotifyRegistry::new();
        let keep = registry.subscribe();
        drop(registry.subscribe());

        assert_eq!(registry.notify(NotifyEvent::Writable), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(keep.drain(), vec![NotifyEvent::Writable]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = NotifyRegistry::new();
        let sub = registry.subscribe();
        assert!(registry.unsubscribe(sub.id()));
        assert!(!registry.unsubscribe(sub.id()));

        assert_eq!(registry.notify(NotifyEvent::Hangup), 0);
        assert!(sub.drain().is_empty());
    }
}
