// Main-thread workflow
//
// One long-lived workflow per user, identified by the user's thread record.
// It multiplexes inbound events over a single any-topic wait:
//
//   loop {
//     msg <- recv(timeout = 1h)          // durable heartbeat
//     user_message   -> classify and reply, suggest routing, or spawn worker
//     queue_response -> persist and relay the decision to the target task
//     worker_result  -> materialize an inbox entry, update active tasks
//     _              -> error-class inbox entry
//   }
//
// The router makes no LLM or HTTP calls of its own; everything it does is
// persist inbox items, mutate the active-task list and publish bus events
// (all inside activities), plus spawn and message worker workflows.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use foreman_core::topics::{topic, QueueResponsePayload, UserMessagePayload, WorkerResultPayload};
use foreman_durable::{
    ActivityError, Workflow, WorkflowAction, WorkflowError, WorkflowMessage,
};

use crate::activities::{self, names, RouteDecision};

/// Heartbeat interval for the event loop
const RECV_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Queue name throttling concurrent worker workflows
pub const WORKER_QUEUE: &str = "worker_tasks";

/// Queue name partitioning main threads by user
pub const MAIN_THREAD_QUEUE: &str = "main_threads";

/// Input to the main-thread workflow; the workflow id is the thread id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainThreadInput {
    pub user_id: String,
    /// Thread record id, equal to the workflow id
    pub thread_id: Uuid,
    /// Handle forwarded to spawned worker workflows
    pub agent_handle: String,
}

/// Per-user event router
pub struct MainThreadWorkflow {
    input: MainThreadInput,
    seq: u32,
}

impl MainThreadWorkflow {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn id_prefix(id: &str) -> &str {
        id.rsplit_once('-').map(|(prefix, _)| prefix).unwrap_or(id)
    }

    fn wait_for_event(&mut self) -> Vec<WorkflowAction> {
        let id = self.next_id("event-wait");
        vec![WorkflowAction::wait(id, None, RECV_TIMEOUT)]
    }

    fn thread_id(&self) -> Uuid {
        self.input.thread_id
    }

    fn record_error(&mut self, title: &str, content: String) -> Vec<WorkflowAction> {
        let input = activities::RecordInboxErrorInput {
            thread_id: self.thread_id(),
            user_id: self.input.user_id.clone(),
            title: title.to_string(),
            content,
        };
        let id = self.next_id("record-error");
        vec![WorkflowAction::activity(
            id,
            names::RECORD_INBOX_ERROR,
            serde_json::to_value(input).unwrap_or_default(),
        )]
    }
}

impl Workflow for MainThreadWorkflow {
    const TYPE: &'static str = "main_thread";
    type Input = MainThreadInput;
    type Output = serde_json::Value;

    fn new(input: Self::Input) -> Self {
        Self { input, seq: 0 }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        let input = activities::EnsureThreadInput {
            user_id: self.input.user_id.clone(),
            thread_id: self.input.thread_id,
        };
        let id = self.next_id("ensure-thread");
        vec![WorkflowAction::activity(
            id,
            names::ENSURE_THREAD,
            serde_json::to_value(input).unwrap_or_default(),
        )]
    }

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        match Self::id_prefix(activity_id) {
            "ensure-thread" => {
                if serde_json::from_value::<activities::EnsureThreadResult>(result).is_err() {
                    return vec![WorkflowAction::fail(WorkflowError::new(
                        "malformed ensure_thread result",
                    ))];
                }
                self.wait_for_event()
            }

            "route-message" => {
                let routed: activities::RouteUserMessageResult =
                    match serde_json::from_value(result) {
                        Ok(routed) => routed,
                        Err(_) => return self.wait_for_event(),
                    };

                let mut actions = Vec::new();
                if let RouteDecision::Spawned { task } = routed.decision {
                    let input = crate::TaskWorkflowInput {
                        task_id: task.id,
                        agent_handle: self.input.agent_handle.clone(),
                    };
                    actions.push(WorkflowAction::StartWorkflow {
                        workflow_id: task.id,
                        workflow_type: crate::TaskWorkflow::TYPE.to_string(),
                        input: serde_json::to_value(input).unwrap_or_default(),
                        queue: Some(WORKER_QUEUE.to_string()),
                        partition_key: None,
                    });
                }
                actions.extend(self.wait_for_event());
                actions
            }

            "apply-response" => {
                let applied: activities::ApplyQueueResponseResult =
                    match serde_json::from_value(result) {
                        Ok(applied) => applied,
                        Err(_) => return self.wait_for_event(),
                    };

                let mut actions = Vec::new();
                if let Some(relay) = applied.relay {
                    actions.push(WorkflowAction::send(
                        relay.task_id,
                        WorkflowMessage::new(relay.topic, relay.payload),
                    ));
                }
                actions.extend(self.wait_for_event());
                actions
            }

            "record-result" | "record-error" => self.wait_for_event(),

            _ => self.wait_for_event(),
        }
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        if Self::id_prefix(activity_id) == "ensure-thread" {
            // Without a thread record the router cannot run
            return vec![WorkflowAction::fail(WorkflowError::new(format!(
                "failed to ensure main thread: {}",
                error.message
            )))];
        }

        // Handler errors surface to the user and the loop continues
        let mut actions = self.record_error(
            "Error processing message",
            format!("{activity_id}: {}", error.message),
        );
        actions.extend(self.wait_for_event());
        actions
    }

    fn on_message(&mut self, _wait_id: &str, message: &WorkflowMessage) -> Vec<WorkflowAction> {
        match message.topic.as_str() {
            topic::USER_MESSAGE => {
                let payload: UserMessagePayload = match message.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        let mut actions =
                            self.record_error("Malformed message", format!("user_message: {e}"));
                        actions.extend(self.wait_for_event());
                        return actions;
                    }
                };
                let input = activities::RouteUserMessageInput {
                    thread_id: self.thread_id(),
                    user_id: self.input.user_id.clone(),
                    payload,
                };
                let id = self.next_id("route-message");
                vec![WorkflowAction::activity(
                    id,
                    names::ROUTE_USER_MESSAGE,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            topic::QUEUE_RESPONSE => {
                let payload: QueueResponsePayload = match message.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        let mut actions =
                            self.record_error("Malformed message", format!("queue_response: {e}"));
                        actions.extend(self.wait_for_event());
                        return actions;
                    }
                };
                let input = activities::ApplyQueueResponseInput {
                    thread_id: self.thread_id(),
                    user_id: self.input.user_id.clone(),
                    payload,
                };
                let id = self.next_id("apply-response");
                vec![WorkflowAction::activity(
                    id,
                    names::APPLY_QUEUE_RESPONSE,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            topic::WORKER_RESULT => {
                let payload: WorkerResultPayload = match message.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        let mut actions =
                            self.record_error("Malformed message", format!("worker_result: {e}"));
                        actions.extend(self.wait_for_event());
                        return actions;
                    }
                };
                let input = activities::RecordWorkerResultInput {
                    thread_id: self.thread_id(),
                    user_id: self.input.user_id.clone(),
                    payload,
                };
                let id = self.next_id("record-result");
                vec![WorkflowAction::activity(
                    id,
                    names::RECORD_WORKER_RESULT,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            other => {
                let mut actions = self.record_error(
                    "Unknown message type",
                    format!("unhandled topic: {other}"),
                );
                actions.extend(self.wait_for_event());
                actions
            }
        }
    }

    fn on_message_timeout(&mut self, _wait_id: &str) -> Vec<WorkflowAction> {
        // Heartbeat: nothing arrived within the hour; keep listening
        self.wait_for_event()
    }

    fn on_cancel(&mut self, _reason: &str) -> Vec<WorkflowAction> {
        vec![]
    }

    fn is_completed(&self) -> bool {
        // The router lives as long as the user does
        false
    }

    fn result(&self) -> Option<Self::Output> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input() -> MainThreadInput {
        MainThreadInput {
            user_id: "user-1".to_string(),
            thread_id: Uuid::now_v7(),
            agent_handle: "@foreman".to_string(),
        }
    }

    #[test]
    fn test_on_start_ensures_thread() {
        let mut workflow = MainThreadWorkflow::new(input());

        let actions = workflow.on_start();
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            WorkflowAction::RunActivity { activity_type, .. }
                if activity_type == names::ENSURE_THREAD
        ));
    }

    #[test]
    fn test_heartbeat_rearms_wait() {
        let mut workflow = MainThreadWorkflow::new(input());

        let actions = workflow.on_message_timeout("event-wait-2");
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            WorkflowAction::WaitForMessage { topic: None, .. }
        ));
    }

    #[test]
    fn test_unknown_topic_files_error_and_keeps_listening() {
        let mut workflow = MainThreadWorkflow::new(input());

        let actions = workflow.on_message(
            "event-wait-2",
            &WorkflowMessage::new("mystery_topic", json!({})),
        );
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[0],
            WorkflowAction::RunActivity { activity_type, .. }
                if activity_type == names::RECORD_INBOX_ERROR
        ));
        assert!(matches!(&actions[1], WorkflowAction::WaitForMessage { .. }));
    }

    #[test]
    fn test_user_message_routes() {
        let mut workflow = MainThreadWorkflow::new(input());

        let actions = workflow.on_message(
            "event-wait-2",
            &WorkflowMessage::new(
                topic::USER_MESSAGE,
                json!({ "message": "fix the header", "conversation_id": null }),
            ),
        );
        assert!(matches!(
            &actions[0],
            WorkflowAction::RunActivity { activity_type, .. }
                if activity_type == names::ROUTE_USER_MESSAGE
        ));
    }

    #[test]
    fn test_never_self_completes() {
        let workflow = MainThreadWorkflow::new(input());
        assert!(!workflow.is_completed());
    }
}
