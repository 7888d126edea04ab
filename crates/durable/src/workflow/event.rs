//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, WorkflowError, WorkflowMessage};
use crate::activity::ActivityError;

/// Events stored in the workflow event log
///
/// These events form the append-only log for a workflow. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled (via admin action or the cancel API)
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed (may or may not retry)
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Error details
        error: ActivityError,

        /// Whether the activity will be retried
        will_retry: bool,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        /// Timer identifier
        timer_id: String,

        /// Absolute deadline; restarts re-arm from this, preserving the
        /// remaining time
        fire_at: DateTime<Utc>,
    },

    /// Timer fired (deadline reached)
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Message Events
    // =========================================================================
    /// Workflow began waiting for a message
    MessageWaitStarted {
        /// Wait identifier
        wait_id: String,

        /// Topic filter; `None` accepts any topic
        topic: Option<String>,

        /// Absolute wait deadline
        expires_at: DateTime<Utc>,
    },

    /// A message was delivered to an open wait
    MessageReceived {
        /// The wait this message resolved
        wait_id: String,

        /// The delivered message
        message: WorkflowMessage,
    },

    /// An open wait timed out without a matching message
    MessageWaitTimedOut {
        /// The wait that expired
        wait_id: String,
    },

    /// A message was sent to another workflow
    MessageSent {
        /// Receiving workflow id
        target: Uuid,

        /// Topic of the sent message
        topic: String,
    },

    /// Queued messages on a topic were discarded
    MessagesDrained {
        /// Topic that was drained
        topic: String,

        /// Number of messages discarded
        count: usize,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Another top-level workflow was started by this one
    ChildWorkflowStarted {
        /// Child workflow id
        workflow_id: Uuid,

        /// Type of the child workflow
        workflow_type: String,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::WorkflowStarted {
            input: json!({"task_id": "t-1"}),
        };

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"type\":\"workflow_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_message_event_serialization() {
        let event = WorkflowEvent::MessageReceived {
            wait_id: "w-3".to_string(),
            message: WorkflowMessage::new("job_result", json!({"status": "completed"})),
        };

        let encoded = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "load-task-1".to_string(),
            result: json!({}),
        };
        assert_eq!(event.activity_id(), Some("load-task-1"));

        let start = WorkflowEvent::WorkflowStarted { input: json!({}) };
        assert_eq!(start.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new("boom")
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "cancelled".to_string()
        }
        .is_terminal());

        assert!(!WorkflowEvent::TimerFired {
            timer_id: "t".to_string()
        }
        .is_terminal());
    }
}
