// In-process event bus for long-poll / SSE consumers
//
// Two address spaces: per-user and per-task. Subscribers receive over
// bounded queues; a full queue drops the event for that subscriber (the
// publisher never blocks). The bus is ephemeral by design — durable state
// lives in storage, and losing bus contents on restart is acceptable.
// For multi-process deployments this should be backed by a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-subscriber queue capacity
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Interval between heartbeat events
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Well-known event names
pub mod event_names {
    pub const TASK_UPDATED: &str = "task:updated";
    pub const INBOX_UPDATED: &str = "inbox:updated";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LOG: &str = "log";
    pub const STATUS: &str = "status";
}

/// An event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Short event id (for SSE `id:` fields)
    pub id: String,
    /// Event name (e.g. `task:updated`)
    pub event: String,
    /// Event payload
    pub data: serde_json::Value,
}

impl BusEvent {
    /// Create a new event
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().simple().to_string()[..8].to_string(),
            event: event.into(),
            data,
        }
    }

    /// Create a heartbeat event
    pub fn heartbeat() -> Self {
        Self::new(
            event_names::HEARTBEAT,
            serde_json::json!({ "timestamp": Utc::now().to_rfc3339() }),
        )
    }
}

/// A live subscription; events arrive on `receiver`
pub struct Subscription {
    pub receiver: mpsc::Receiver<BusEvent>,
    _heartbeat: tokio::task::JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self._heartbeat.abort();
    }
}

#[derive(Default)]
struct Channels {
    user_senders: HashMap<String, Vec<mpsc::Sender<BusEvent>>>,
    task_senders: HashMap<Uuid, Vec<mpsc::Sender<BusEvent>>>,
}

/// In-process topic-addressed pub/sub
///
/// The lock is held only for map operations, so publishing stays cheap and
/// never awaits.
pub struct EventBus {
    channels: parking_lot::Mutex<Channels>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new bus
    pub fn new() -> Self {
        Self {
            channels: parking_lot::Mutex::new(Channels::default()),
        }
    }

    /// Subscribe to a user's events
    pub fn subscribe_user(self: &Arc<Self>, user_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        {
            let mut channels = self.channels.lock();
            channels
                .user_senders
                .entry(user_id.to_string())
                .or_default()
                .push(tx.clone());
        }
        debug!(user_id, "user subscribed to events");
        Self::subscription(tx, rx)
    }

    /// Subscribe to a task's events (log/status streaming)
    pub fn subscribe_task(self: &Arc<Self>, task_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        {
            let mut channels = self.channels.lock();
            channels
                .task_senders
                .entry(task_id)
                .or_default()
                .push(tx.clone());
        }
        debug!(%task_id, "subscribed to task events");
        Self::subscription(tx, rx)
    }

    fn subscription(tx: mpsc::Sender<BusEvent>, rx: mpsc::Receiver<BusEvent>) -> Subscription {
        // Each subscriber gets its own heartbeat so idle streams stay alive
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // first tick is immediate; skip it
            loop {
                interval.tick().await;
                if tx.send(BusEvent::heartbeat()).await.is_err() {
                    break;
                }
            }
        });

        Subscription {
            receiver: rx,
            _heartbeat: heartbeat,
        }
    }

    /// Publish an event to all subscribers of a user
    pub fn publish_user(&self, user_id: &str, event: BusEvent) {
        let mut channels = self.channels.lock();
        if let Some(senders) = channels.user_senders.get_mut(user_id) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user_id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                channels.user_senders.remove(user_id);
            }
        }
    }

    /// Publish an event to all subscribers of a task
    pub fn publish_task(&self, task_id: Uuid, event: BusEvent) {
        let mut channels = self.channels.lock();
        if let Some(senders) = channels.task_senders.get_mut(&task_id) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%task_id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if senders.is_empty() {
                channels.task_senders.remove(&task_id);
            }
        }
    }

    /// Notify user subscribers that a task changed, and task subscribers of
    /// the new status
    pub fn notify_task_updated(&self, user_id: &str, task_id: Uuid, status: &str) {
        self.publish_user(
            user_id,
            BusEvent::new(
                event_names::TASK_UPDATED,
                serde_json::json!({ "task_id": task_id, "status": status }),
            ),
        );
        self.publish_task(
            task_id,
            BusEvent::new(
                event_names::STATUS,
                serde_json::json!({ "task_id": task_id, "status": status }),
            ),
        );
    }

    /// Notify user subscribers that the inbox changed
    pub fn notify_inbox_updated(&self, user_id: &str, item_id: Option<Uuid>) {
        let mut data = serde_json::Map::new();
        if let Some(item_id) = item_id {
            data.insert("item_id".to_string(), serde_json::json!(item_id));
        }
        self.publish_user(
            user_id,
            BusEvent::new(event_names::INBOX_UPDATED, serde_json::Value::Object(data)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe_user("user-1");

        bus.publish_user("user-1", BusEvent::new("task:updated", serde_json::json!({})));

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event, "task:updated");
    }

    #[tokio::test]
    async fn test_events_do_not_cross_users() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe_user("user-1");

        bus.publish_user("user-2", BusEvent::new("task:updated", serde_json::json!({})));

        assert!(tokio::time::timeout(Duration::from_millis(50), sub.receiver.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ordering_preserved_per_subscriber() {
        let bus = Arc::new(EventBus::new());
        let task_id = Uuid::now_v7();
        let mut sub = bus.subscribe_task(task_id);

        for i in 0..5 {
            bus.publish_task(task_id, BusEvent::new("log", serde_json::json!({ "n": i })));
        }

        for i in 0..5 {
            let event = sub.receiver.recv().await.unwrap();
            assert_eq!(event.data["n"], i);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let bus = Arc::new(EventBus::new());
        let task_id = Uuid::now_v7();
        let _sub = bus.subscribe_task(task_id);

        // Publish far more than the queue holds; must not block
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY * 2) {
            bus.publish_task(task_id, BusEvent::new("log", serde_json::json!({ "n": i })));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = Arc::new(EventBus::new());
        {
            let _sub = bus.subscribe_user("user-1");
        }
        // After the subscription dropped, publishing prunes the sender
        bus.publish_user("user-1", BusEvent::new("inbox:updated", serde_json::json!({})));
        bus.publish_user("user-1", BusEvent::new("inbox:updated", serde_json::json!({})));
    }
}
