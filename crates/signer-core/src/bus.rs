//! Event bus (spec §4.8): best-effort synchronous fan-out so an outer
//! dashboard/UI layer can observe daemon state changes.
//!
//! The spec describes a single-threaded in-process pub/sub; `tokio::sync::
//! broadcast` gives us that shape without hand-rolling listener lists, at
//! the cost of events being dropped for a subscriber that falls behind
//! (acceptable — spec says "no durability, no ordering guarantees across
//! event types").

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    RequestCreated { request_id: String, key_name: String, remote_pubkey: String, method: String },
    RequestApproved { request_id: String },
    RequestDenied { request_id: String, reason: String },
    RequestExpired { request_id: String },
    RequestAutoApproved { request_id: String },

    AppConnected { key_name: String, remote_pubkey: String },
    AppRevoked { key_name: String, remote_pubkey: String },
    AppUpdated { key_name: String, remote_pubkey: String },
    AppBulkUpdated,

    KeyCreated { key_name: String },
    KeyUnlocked { key_name: String },
    KeyLocked { key_name: String },
    KeyDeleted { key_name: String },
    KeyRenamed { old_name: String, new_name: String },
    KeyUpdated { key_name: String },

    StatsUpdated,
    RelaysUpdated,
    AdminEvent { detail: String },

    DeadmanPanic,
    DeadmanReset,
    DeadmanUpdated,

    LogEntry { level: String, message: String },
    HealthUpdated,
    Ping,
}

/// Handle shared across components. Clone is cheap (an `Arc`-backed sender).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors (no subscribers) are swallowed — spec: a
    /// publisher with no listeners is not a failure.
    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(event.clone()).is_err() {
            // No active receivers right now; nothing to log, this is routine
            // during startup before the dashboard layer has subscribed.
            let _ = event;
        }
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        let message = message.into();
        match level {
            "error" => warn!(target: "event_bus", "{message}"),
            _ => {}
        }
        self.publish(DomainEvent::LogEntry { level: level.to_string(), message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DomainEvent::Ping);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, DomainEvent::Ping));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(DomainEvent::StatsUpdated);
    }
}
