//! Weak-referenced pub/sub bus.
//!
//! The bus never keeps a listener alive: it stores `Weak` references and
//! prunes lapsed ones while iterating, so a dropped strategy cannot be
//! pinned by a long-lived connector. Callers hold their own `Arc`s.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::{MarketEvent, MarketEventTag};

/// Receives events synchronously during `trigger_event`.
///
/// Listeners must not panic; a slow listener delays every listener behind it.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &MarketEvent);
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<MarketEventTag, Vec<Weak<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `tag`. Idempotent: re-adding the same
    /// listener is a no-op. Only a weak reference is stored.
    pub fn add_listener(&self, tag: MarketEventTag, listener: &Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        let entry = listeners.entry(tag).or_default();
        let weak = Arc::downgrade(listener);
        if !entry.iter().any(|existing| existing.ptr_eq(&weak)) {
            entry.push(weak);
        }
    }

    /// Unsubscribe `listener` from `tag`, pruning lapsed entries on the way.
    /// Tolerates listeners that were never added or have been collected.
    pub fn remove_listener(&self, tag: MarketEventTag, listener: &Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        if let Some(entry) = listeners.get_mut(&tag) {
            let weak = Arc::downgrade(listener);
            entry.retain(|existing| existing.strong_count() > 0 && !existing.ptr_eq(&weak));
        }
    }

    /// Deliver `event` to the live listeners of its tag, in registration
    /// order. Lapsed weak references are pruned.
    pub fn trigger_event(&self, event: MarketEvent) {
        let live = self.collect_live(event.tag());
        for listener in live {
            listener.on_event(&event);
        }
    }

    /// The currently-live listeners for `tag`, pruning lapsed ones.
    pub fn get_listeners(&self, tag: MarketEventTag) -> Vec<Arc<dyn EventListener>> {
        self.collect_live(tag)
    }

    fn collect_live(&self, tag: MarketEventTag) -> Vec<Arc<dyn EventListener>> {
        let mut listeners = self.listeners.write();
        match listeners.get_mut(&tag) {
            Some(entry) => {
                let mut live = Vec::with_capacity(entry.len());
                entry.retain(|weak| match weak.upgrade() {
                    Some(listener) => {
                        live.push(listener);
                        true
                    }
                    None => false,
                });
                live
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderCancelledEvent;
    use parking_lot::Mutex;

    struct RecordingListener {
        received: Mutex<Vec<MarketEventTag>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().len()
        }
    }

    impl EventListener for RecordingListener {
        fn on_event(&self, event: &MarketEvent) {
            self.received.lock().push(event.tag());
        }
    }

    fn cancelled_event() -> MarketEvent {
        MarketEvent::OrderCancelled(OrderCancelledEvent {
            timestamp_ms: 0,
            client_order_id: "oid-1".into(),
            exchange_order_id: None,
        })
    }

    #[test]
    fn delivers_only_to_matching_tag() {
        let bus = EventBus::new();
        let cancelled = RecordingListener::new();
        let filled = RecordingListener::new();
        bus.add_listener(
            MarketEventTag::OrderCancelled,
            &(cancelled.clone() as Arc<dyn EventListener>),
        );
        bus.add_listener(
            MarketEventTag::OrderFilled,
            &(filled.clone() as Arc<dyn EventListener>),
        );

        bus.trigger_event(cancelled_event());

        assert_eq!(cancelled.count(), 1);
        assert_eq!(filled.count(), 0);
    }

    #[test]
    fn add_listener_is_idempotent() {
        let bus = EventBus::new();
        let listener = RecordingListener::new();
        let as_dyn: Arc<dyn EventListener> = listener.clone();
        bus.add_listener(MarketEventTag::OrderCancelled, &as_dyn);
        bus.add_listener(MarketEventTag::OrderCancelled, &as_dyn);

        assert_eq!(bus.get_listeners(MarketEventTag::OrderCancelled).len(), 1);
        bus.trigger_event(cancelled_event());
        assert_eq!(listener.count(), 1);
    }

    #[test]
    fn dropped_listener_lapses() {
        let bus = EventBus::new();
        let listener = RecordingListener::new();
        bus.add_listener(
            MarketEventTag::OrderCancelled,
            &(listener.clone() as Arc<dyn EventListener>),
        );
        drop(listener);

        assert!(bus.get_listeners(MarketEventTag::OrderCancelled).is_empty());
        // Triggering after the lapse is a no-op rather than an error.
        bus.trigger_event(cancelled_event());
    }

    #[test]
    fn remove_listener_tolerates_collected_entries() {
        let bus = EventBus::new();
        let keep = RecordingListener::new();
        let dropped = RecordingListener::new();
        bus.add_listener(
            MarketEventTag::OrderCancelled,
            &(dropped.clone() as Arc<dyn EventListener>),
        );
        bus.add_listener(
            MarketEventTag::OrderCancelled,
            &(keep.clone() as Arc<dyn EventListener>),
        );
        drop(dropped);

        let keep_dyn: Arc<dyn EventListener> = keep.clone();
        bus.remove_listener(MarketEventTag::OrderCancelled, &keep_dyn);
        assert!(bus.get_listeners(MarketEventTag::OrderCancelled).is_empty());
    }

    #[test]
    fn delivery_follows_registration_order() {
        struct OrderedListener {
            id: usize,
            log: Arc<Mutex<Vec<usize>>>,
        }
        impl EventListener for OrderedListener {
            fn on_event(&self, _event: &MarketEvent) {
                self.log.lock().push(self.id);
            }
        }

        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<Arc<dyn EventListener>> = (0..4)
            .map(|id| {
                Arc::new(OrderedListener {
                    id,
                    log: log.clone(),
                }) as Arc<dyn EventListener>
            })
            .collect();
        for listener in &listeners {
            bus.add_listener(MarketEventTag::OrderCancelled, listener);
        }

        bus.trigger_event(cancelled_event());
        assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    }
}
