//! Progress events emitted during a run
//!
//! Events are an observation channel only; nothing is persisted. Events for one
//! resource are published from the thread processing it, in transition order.
//! Events of independent resources may interleave.

use statekit::ResourceStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// A status notification for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyEvent {
    /// FQN of the resource
    pub id: String,
    /// Resource kind
    pub kind: String,
    pub status: ResourceStatus,
    pub message: Option<String>,
    pub binding_id: Option<String>,
    /// Position in the bus-wide publication order
    pub seq_no: u64,
}

impl ApplyEvent {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, status: ResourceStatus) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status,
            message: None,
            binding_id: None,
            seq_no: 0,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_binding(mut self, binding_id: Option<String>) -> Self {
        self.binding_id = binding_id;
        self
    }
}

type Callback = Arc<dyn Fn(&ApplyEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    callbacks: RwLock<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl Subscribers {
    fn snapshot(&self) -> Vec<Callback> {
        let callbacks = match self.callbacks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    fn remove(&self, id: u64) {
        let mut callbacks = match self.callbacks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
}

/// Fan-out of [`ApplyEvent`]s to subscribed callbacks
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver events to `callback` until the returned subscription is dropped
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ApplyEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.callbacks.write() {
            Ok(mut guard) => guard.push((id, Arc::new(callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(callback))),
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Stamp the event with the next sequence number and deliver it
    pub fn publish(&self, mut event: ApplyEvent) {
        event.seq_no = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        for callback in self.inner.snapshot() {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.snapshot().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]; unsubscribes when dropped
#[derive(Debug)]
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<Subscribers>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(bus)) = (self.id.take(), self.bus.upgrade()) {
            bus.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Mirrors events to the `log` facade
pub struct LogSubscriber;

impl LogSubscriber {
    pub fn attach(bus: &EventBus) -> Subscription {
        bus.subscribe(|event| {
            let message = event
                .message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default();
            match event.status {
                ResourceStatus::Fail => {
                    log::warn!("{} [{}] {}{message}", event.id, event.kind, event.status);
                }
                ResourceStatus::Created | ResourceStatus::Updated | ResourceStatus::Deleted => {
                    log::info!("{} [{}] {}{message}", event.id, event.kind, event.status);
                }
                _ => log::debug!("{} [{}] {}{message}", event.id, event.kind, event.status),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector(bus: &EventBus) -> (Arc<Mutex<Vec<ApplyEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        (seen, sub)
    }

    #[test]
    fn test_publish_assigns_sequence() {
        let bus = EventBus::new();
        let (seen, _sub) = collector(&bus);

        bus.publish(ApplyEvent::new("app/dev/a", "bucket", ResourceStatus::Creating));
        bus.publish(
            ApplyEvent::new("app/dev/a", "bucket", ResourceStatus::Fail).with_message("boom"),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].seq_no, 0);
        assert_eq!(seen[1].seq_no, 1);
        assert_eq!(seen[1].message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let (seen, sub) = collector(&bus);
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(ApplyEvent::new("app/dev/a", "bucket", ResourceStatus::Success));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe_and_outliving_bus() {
        let bus = EventBus::new();
        let (_, sub) = collector(&bus);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        let (_, sub) = collector(&bus);
        drop(bus);
        drop(sub);
    }

    #[test]
    fn test_callback_may_subscribe_during_publish() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let nested_sink = Arc::clone(&nested);
        let _sub = bus.subscribe(move |_| {
            nested_sink.lock().unwrap().push(inner_bus.subscribe(|_| {}));
        });
        bus.publish(ApplyEvent::new("app/dev/a", "bucket", ResourceStatus::Success));
        assert_eq!(bus.subscriber_count(), 2);
    }
}
