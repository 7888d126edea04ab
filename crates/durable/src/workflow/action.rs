//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{WorkflowError, WorkflowMessage};
use crate::retry::RetryPolicy;

/// Actions a workflow can request
///
/// These are the commands a workflow can issue in response to events.
/// Each action is persisted as a [`WorkflowEvent`](super::WorkflowEvent)
/// before execution, which is what makes replay deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ///
    /// The activity's recorded result (not a re-execution) is what replay
    /// feeds back, so activities are the only place external side effects
    /// may happen.
    RunActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in the registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a durable timer that fires after the specified duration
    ///
    /// The absolute deadline is persisted, so a restart preserves the
    /// remaining time.
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Wait for the next message on a topic
    ///
    /// Resolves with `on_message` when a matching message arrives, or
    /// `on_message_timeout` when the timeout elapses first. A `topic` of
    /// `None` matches any topic. Matching is FIFO per `(receiver, topic)`.
    WaitForMessage {
        /// Unique identifier for this wait within the workflow
        wait_id: String,

        /// Topic filter; `None` accepts any topic
        topic: Option<String>,

        /// Maximum time to wait
        #[serde(with = "duration_serde")]
        timeout: Duration,
    },

    /// Send a durable message to another workflow
    SendMessage {
        /// Receiving workflow id
        target: Uuid,

        /// The message to deliver
        message: WorkflowMessage,
    },

    /// Discard all currently queued messages on a topic
    ///
    /// Used when a decision already arrived through another channel and any
    /// queued duplicates must not leak into a later phase.
    DrainMessages {
        /// Topic to drain
        topic: String,
    },

    /// Start another top-level workflow (fire-and-forget)
    ///
    /// The child reports back, if at all, via messages. Starting is
    /// idempotent per `workflow_id`.
    StartWorkflow {
        /// Id for the new workflow
        workflow_id: Uuid,

        /// Registered type of the workflow to start
        workflow_type: String,

        /// Input for the new workflow
        input: serde_json::Value,

        /// Admission queue, if the workflow should be throttled
        queue: Option<String>,

        /// Partition key within the queue (e.g. a user id)
        partition_key: Option<String>,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// No action (used when event handling doesn't trigger new work)
    None,
}

impl WorkflowAction {
    /// Create a schedule-activity action with default options
    pub fn activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::RunActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule-activity action with explicit options
    pub fn activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::RunActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a message-wait action
    pub fn wait(wait_id: impl Into<String>, topic: Option<&str>, timeout: Duration) -> Self {
        Self::WaitForMessage {
            wait_id: wait_id.into(),
            topic: topic.map(str::to_string),
            timeout,
        }
    }

    /// Create a send-message action
    pub fn send(target: Uuid, message: WorkflowMessage) -> Self {
        Self::SendMessage { target, message }
    }

    /// Create a complete-workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail-workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for activity execution (from claim to completion)
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// Serde support for Duration (as milliseconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_action() {
        let action = WorkflowAction::activity("step-1", "load_task", json!({"key": "value"}));

        match action {
            WorkflowAction::RunActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "load_task");
                assert_eq!(input, json!({"key": "value"}));
            }
            _ => panic!("Expected RunActivity"),
        }
    }

    #[test]
    fn test_wait_action_serialization() {
        let action = WorkflowAction::wait("w-1", Some("plan_response"), Duration::from_secs(10));

        let encoded = serde_json::to_string(&action).unwrap();
        assert!(encoded.contains("\"type\":\"wait_for_message\""));

        let parsed: WorkflowAction = serde_json::from_str(&encoded).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_timer_action() {
        let action = WorkflowAction::timer("pr-poll", Duration::from_secs(30));

        match action {
            WorkflowAction::StartTimer { timer_id, duration } => {
                assert_eq!(timer_id, "pr-poll");
                assert_eq!(duration, Duration::from_secs(30));
            }
            _ => panic!("Expected StartTimer"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(120));

        let encoded = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&encoded).unwrap();

        assert_eq!(parsed.start_to_close_timeout, Duration::from_secs(120));
    }
}
