//! Event types and the process-local pub/sub bus (§4.9).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Event type names (§3 "Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CommandStart,
    CommandComplete,
    StageStart,
    StageComplete,
    Error,
    ValidationFail,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandStart => "command.start",
            Self::CommandComplete => "command.complete",
            Self::StageStart => "stage.start",
            Self::StageComplete => "stage.complete",
            Self::Error => "error",
            Self::ValidationFail => "validation.fail",
        }
    }
}

/// Immutable event published on the bus. Events have no identity and
/// are not persisted; subscribers must treat delivery as best-effort
/// when using [`EventBus::publish_async`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl Event {
    pub fn new(event_type: EventType, name: impl Into<String>) -> Self {
        Self {
            event_type,
            name: name.into(),
            success: None,
            duration_ms: None,
            error: None,
            timestamp: Utc::now(),
            metadata: Value::Null,
        }
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

type Subscriber = (Option<EventType>, mpsc::Sender<Event>);

/// Process-local, thread-safe pub/sub bus. Cheap to clone (wraps its
/// state in an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to a single event type. The returned receiver gets
    /// every matching event published from this point forward.
    pub fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(64);
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        subs.push((Some(event_type), tx));
        rx
    }

    /// Subscribe to every event type.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(64);
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        subs.push((None, tx));
        rx
    }

    /// Deliver synchronously to every matching subscriber, blocking the
    /// producer until each subscriber's queue accepts the event.
    pub async fn publish(&self, event: Event) {
        let targets: Vec<mpsc::Sender<Event>> = self.matching_senders(&event);
        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Deliver with a bounded per-subscriber enqueue deadline; slow
    /// subscribers drop the event rather than block the producer.
    pub async fn publish_async(&self, event: Event) {
        let targets: Vec<mpsc::Sender<Event>> = self.matching_senders(&event);
        for tx in targets {
            let event = event.clone();
            let _ = tokio::time::timeout(Duration::from_millis(200), tx.send(event)).await;
        }
        self.prune_closed();
    }

    fn matching_senders(&self, event: &Event) -> Vec<mpsc::Sender<Event>> {
        let subs = self.subscribers.lock().expect("event bus lock poisoned");
        subs.iter()
            .filter(|(filter, _)| match filter {
                None => true,
                Some(t) => *t as u8 == event.event_type as u8,
            })
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn prune_closed(&self) {
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        subs.retain(|(_, tx)| !tx.is_closed());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriber_only() {
        let bus = EventBus::new();
        let mut stage_rx = bus.subscribe(EventType::StageStart);
        let mut err_rx = bus.subscribe(EventType::Error);

        bus.publish(Event::new(EventType::StageStart, "plan")).await;

        let got = stage_rx.try_recv().unwrap();
        assert_eq!(got.name, "plan");
        assert!(err_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_event_type() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        bus.publish(Event::new(EventType::CommandStart, "run")).await;
        bus.publish(Event::new(EventType::Error, "boom")).await;
        assert_eq!(rx.try_recv().unwrap().name, "run");
        assert_eq!(rx.try_recv().unwrap().name, "boom");
    }

    #[tokio::test]
    async fn publish_async_prunes_dropped_subscribers() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe_all();
            assert_eq!(bus.subscriber_count(), 1);
        }
        bus.publish_async(Event::new(EventType::CommandComplete, "run"))
            .await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
