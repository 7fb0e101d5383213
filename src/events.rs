//! Observer registry for broadcast events (spec.md SS9 Design Notes: replaces
//! "global notifications" with an explicit `subscribe`/`unsubscribe`
//! interface holding weak references and garbage-collecting dead entries
//! lazily on each notification).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::address::Address;
use crate::error::Error;

/// One observable occurrence (spec.md SS6 "Observable events").
#[derive(Clone, Debug)]
pub enum Event {
    CredentialSet,
    CredentialExpired,
    IdentityKeyChanged { address: Address },
    DeliveryReceipt { source: Address, timestamp: i64 },
    InboundMessage(InboundMessage),
    ReadSyncReceipts(Vec<(Uuid, i64)>),
    QueueEmpty,
    SocketConnected,
    SocketDisconnected { error: Option<String> },
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub source: Address,
    pub timestamp: i64,
    pub expire_timer: Option<u32>,
    pub server_age: Option<i64>,
    pub server_received_timestamp: Option<i64>,
    pub end_session: bool,
    pub expiration_timer_update: bool,
    pub body: Option<String>,
    pub expiration_start_timestamp: Option<i64>,
    pub destination: Option<Uuid>,
}

pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscription {
    token: SubscriptionToken,
    observer: Weak<dyn Observer>,
}

/// Owns weak references to subscribers; a dropped `Arc<dyn Observer>`
/// unsubscribes itself the next time an event fires, rather than needing an
/// explicit `unsubscribe` call.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: &Arc<dyn Observer>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscription {
                token,
                observer: Arc::downgrade(observer),
            });
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .retain(|sub| sub.token != token);
    }

    /// Notify every live subscriber, dropping any whose `Arc` has since gone
    /// away.
    pub fn notify(&self, event: Event) {
        let mut subscriptions = self.subscriptions.lock().expect("event bus lock poisoned");
        subscriptions.retain(|sub| {
            if let Some(observer) = sub.observer.upgrade() {
                observer.on_event(&event);
                true
            } else {
                false
            }
        });
    }
}

impl From<Error> for Event {
    fn from(error: Error) -> Self {
        match error {
            Error::UntrustedIdentity { address, .. } => Event::IdentityKeyChanged { address },
            other => Event::SocketDisconnected {
                error: Some(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        count: Arc<AtomicUsize>,
    }

    impl Observer for CountingObserver {
        fn on_event(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_to_subscribed_observers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Observer> = Arc::new(CountingObserver { count: count.clone() });
        bus.subscribe(&observer);

        bus.notify(Event::QueueEmpty);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let observer: Arc<dyn Observer> = Arc::new(CountingObserver { count: count.clone() });
        let token = bus.subscribe(&observer);
        bus.unsubscribe(token);

        bus.notify(Event::QueueEmpty);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_observer_is_garbage_collected_lazily() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let observer: Arc<dyn Observer> = Arc::new(CountingObserver { count: count.clone() });
            bus.subscribe(&observer);
        }

        bus.notify(Event::QueueEmpty);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bus.subscriptions.lock().unwrap().is_empty());
    }
}
