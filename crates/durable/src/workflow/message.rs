//! Durable messages for inter-workflow communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A topic-addressed message delivered durably to a workflow
///
/// Messages are the only channel between workflows (and between the API
/// boundary and a workflow). They are enqueued atomically, delivered FIFO
/// per `(receiver, topic)` pair, and consumed exactly once.
///
/// # Example
///
/// ```ignore
/// let msg = WorkflowMessage::new("job_result", json!({ "status": "completed" }));
/// executor.send_message(task_id, msg).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMessage {
    /// Topic name used for selective receives
    pub topic: String,

    /// Message payload (JSON)
    pub payload: serde_json::Value,

    /// When the message was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowMessage {
    /// Create a new message on the given topic
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed value
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_roundtrip() {
        let msg = WorkflowMessage::new("plan_response", json!({ "action": "approve" }));

        let encoded = serde_json::to_string(&msg).unwrap();
        let parsed: WorkflowMessage = serde_json::from_str(&encoded).unwrap();

        assert_eq!(msg.topic, parsed.topic);
        assert_eq!(msg.payload, parsed.payload);
    }

    #[test]
    fn test_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Payload {
            action: String,
        }

        let msg = WorkflowMessage::new("plan_response", json!({ "action": "revise" }));
        let payload: Payload = msg.payload_as().unwrap();
        assert_eq!(payload.action, "revise");
    }
}
