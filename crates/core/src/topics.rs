// Topic registry: the typed envelopes that traverse workflow messaging
//
// A small, fixed set of topics; each has one writer role and one reader role.
//
// | Topic                  | Writer         | Reader      |
// |------------------------|----------------|-------------|
// | user_message           | API            | main-thread |
// | queue_response         | API            | main-thread |
// | worker_result          | worker         | main-thread |
// | job_result             | API (callback) | worker      |
// | question_response      | API            | worker      |
// | plan_response          | API            | worker      |
// | start_implementation   | API            | worker      |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::inbox::QueueItemType;

/// Topic names
pub mod topic {
    pub const USER_MESSAGE: &str = "user_message";
    pub const QUEUE_RESPONSE: &str = "queue_response";
    pub const WORKER_RESULT: &str = "worker_result";
    pub const JOB_RESULT: &str = "job_result";
    pub const QUESTION_RESPONSE: &str = "question_response";
    pub const PLAN_RESPONSE: &str = "plan_response";
    pub const START_IMPLEMENTATION: &str = "start_implementation";
}

/// A user message routed to the main thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// A user's response to an inbox entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueResponsePayload {
    pub queue_item_id: Uuid,
    pub response: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub item_type: QueueItemType,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Terminal status reported by a worker workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResultStatus {
    Completed,
    Failed,
    Cancelled,
    /// Non-terminal progress notification (plan ready, code ready, ...)
    Notification,
}

/// A worker workflow reporting back to its main thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResultPayload {
    pub task_id: Uuid,
    pub status: WorkerResultStatus,
    /// Inbox entry kind this result should materialize as
    pub kind: QueueItemType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Terminal status of an executor job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Executor-job callback relayed to the worker workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultPayload {
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Action carried by a question response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionAction {
    Answer,
    Cancel,
}

/// In-app answers to pending questions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponsePayload {
    pub action: QuestionAction,
    /// question id -> answer text
    #[serde(default)]
    pub answers: HashMap<String, String>,
}

/// Action carried by a plan response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Approve,
    Cancel,
    Revise,
}

/// In-app plan review decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponsePayload {
    pub action: PlanAction,
    /// Revision feedback when `action = revise`
    #[serde(default)]
    pub text: Option<String>,
}

/// Action carried by a start-implementation response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    Start,
    Cancel,
}

/// The explicit gate between an approved plan and implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartImplementationPayload {
    pub action: StartAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_response_wire_shape() {
        let payload: PlanResponsePayload =
            serde_json::from_value(json!({ "action": "revise", "text": "Use system preference" }))
                .unwrap();
        assert_eq!(payload.action, PlanAction::Revise);
        assert_eq!(payload.text.as_deref(), Some("Use system preference"));

        let payload: PlanResponsePayload =
            serde_json::from_value(json!({ "action": "approve" })).unwrap();
        assert_eq!(payload.action, PlanAction::Approve);
        assert!(payload.text.is_none());
    }

    #[test]
    fn test_job_result_wire_shape() {
        let payload: JobResultPayload = serde_json::from_value(json!({
            "status": "completed",
            "result": { "plan_text": "...", "questions": [] }
        }))
        .unwrap();
        assert_eq!(payload.status, JobStatus::Completed);
        assert!(payload.error.is_none());
    }

    #[test]
    fn test_question_response_answers() {
        let payload: QuestionResponsePayload = serde_json::from_value(json!({
            "action": "answer",
            "answers": { "q-1": "Use system preference" }
        }))
        .unwrap();
        assert_eq!(payload.action, QuestionAction::Answer);
        assert_eq!(
            payload.answers.get("q-1").map(String::as_str),
            Some("Use system preference")
        );
    }
}
