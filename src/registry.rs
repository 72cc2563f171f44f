//! Listener registry: event-name filters mapped to ordered callbacks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::Event;

/// Callback invoked with each matching event. Fire-and-forget.
pub type EventListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Which events a registration receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every event, regardless of name.
    All,
    /// Events whose `Event-Name` equals this exactly.
    Name(String),
}

impl EventFilter {
    /// Filter for an exact event name.
    pub fn name(name: impl Into<String>) -> Self {
        EventFilter::Name(name.into())
    }
}

impl From<&str> for EventFilter {
    fn from(name: &str) -> Self {
        EventFilter::Name(name.to_string())
    }
}

/// Opaque handle returned by registration, usable for unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    listener: EventListener,
}

/// Per-connection listener table.
///
/// Registration changes and dispatch scans are mutually exclusive; callback
/// invocation happens outside the lock, on a task spawned per event, so a
/// slow callback cannot stall frame ingestion.
pub(crate) struct ListenerRegistry {
    listeners: Mutex<HashMap<EventFilter, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a registration for `filter`. Callbacks sharing a filter fire in
    /// registration order.
    pub(crate) fn register(&self, filter: EventFilter, listener: EventListener) -> ListenerId {
        let id = ListenerId(
            self.next_id
                .fetch_add(1, Ordering::Relaxed),
        );
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .entry(filter)
            .or_default()
            .push(Registration { id, listener });
        id
    }

    /// Remove a registration. No-op when already removed.
    pub(crate) fn unregister(&self, id: ListenerId) {
        let mut listeners = self
            .listeners
            .lock()
            .expect("listener registry poisoned");
        for registrations in listeners.values_mut() {
            registrations.retain(|r| r.id != id);
        }
        listeners.retain(|_, registrations| !registrations.is_empty());
    }

    /// Collect the callbacks matching an event: exact-name registrations
    /// first, then wildcard-all, each in registration order. The full set for
    /// one event is captured under the lock before the next frame can scan.
    pub(crate) fn matching(&self, event_name: &str) -> Vec<EventListener> {
        let listeners = self
            .listeners
            .lock()
            .expect("listener registry poisoned");
        let mut matched = Vec::new();
        if !event_name.is_empty() {
            if let Some(registrations) = listeners.get(&EventFilter::Name(event_name.to_string())) {
                matched.extend(
                    registrations
                        .iter()
                        .map(|r| r.listener.clone()),
                );
            }
        }
        if let Some(registrations) = listeners.get(&EventFilter::All) {
            matched.extend(
                registrations
                    .iter()
                    .map(|r| r.listener.clone()),
            );
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventHeaders;
    use std::sync::atomic::AtomicUsize;

    fn named_event(name: &str) -> Event {
        let mut headers = EventHeaders::new();
        headers.insert("Event-Name", name);
        Event {
            headers,
            body: None,
        }
    }

    fn run_matching(registry: &ListenerRegistry, event: Event) {
        for listener in registry.matching(&event.name()) {
            listener(event.clone());
        }
    }

    #[test]
    fn test_exact_then_wildcard_in_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (filter, tag) in [
            (EventFilter::All, "all-1"),
            (EventFilter::name("HEARTBEAT"), "hb-1"),
            (EventFilter::name("HEARTBEAT"), "hb-2"),
            (EventFilter::All, "all-2"),
        ] {
            let order = order.clone();
            registry.register(
                filter,
                Arc::new(move |_| {
                    order
                        .lock()
                        .unwrap()
                        .push(tag)
                }),
            );
        }

        run_matching(&registry, named_event("HEARTBEAT"));
        assert_eq!(
            *order
                .lock()
                .unwrap(),
            vec!["hb-1", "hb-2", "all-1", "all-2"]
        );
    }

    #[test]
    fn test_non_matching_name_reaches_only_wildcard() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            registry.register(
                EventFilter::name("CHANNEL_ANSWER"),
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let count = count.clone();
            registry.register(
                EventFilter::All,
                Arc::new(move |_| {
                    count.fetch_add(10, Ordering::SeqCst);
                }),
            );
        }

        run_matching(&registry, named_event("HEARTBEAT"));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = {
            let count = count.clone();
            registry.register(
                EventFilter::All,
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        run_matching(&registry, named_event("HEARTBEAT"));
        registry.unregister(id);
        registry.unregister(id);
        run_matching(&registry, named_event("HEARTBEAT"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unnamed_event_skips_name_filters() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            registry.register(
                EventFilter::name(""),
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        run_matching(&registry, Event::new());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
