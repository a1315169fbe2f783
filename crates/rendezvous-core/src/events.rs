//! Event infrastructure for observing a negotiation.
//!
//! Provides `NegotiationEvent` for the owning application and `EventBus`
//! for subscriptions. Wrap the bus in `Arc` to subscribe.

use crate::ParticipantId;
use crate::negotiator::NegotiationState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted while a participant finds its peer and connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NegotiationEvent {
    /// The negotiation state machine moved.
    StateChanged {
        from: NegotiationState,
        to: NegotiationState,
    },
    /// Another participant's announcement was observed.
    PeerDiscovered {
        remote: ParticipantId,
        /// False when the announcement came from the initial replay.
        live: bool,
    },
    /// The local data channel can carry data.
    ChannelOpen { label: String },
    /// Data arrived from the remote participant.
    MessageReceived { data: Vec<u8> },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct EventSubscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(NegotiationEvent) + Send + Sync>;

/// Event bus for publishing negotiation events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `EventSubscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(NegotiationEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        EventSubscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: NegotiationEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn opened(label: &str) -> NegotiationEvent {
        NegotiationEvent::ChannelOpen {
            label: label.into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e));

        bus.emit(opened("chat"));

        assert_eq!(*seen.lock().unwrap(), vec![opened("chat")]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(opened("a"));
        drop(sub);
        bus.emit(opened("b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = NegotiationEvent::StateChanged {
            from: NegotiationState::Announced,
            to: NegotiationState::Discovered,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["to"], "discovered");
    }
}
