// Object-safe facade over the durable executor
//
// The executor is generic over its store; the HTTP layer only needs three
// operations, so it talks to this trait and the binary picks the store.

use async_trait::async_trait;
use foreman_durable::{Executor, ExecutorError, WorkflowMessage, WorkflowStore};
use uuid::Uuid;

/// The slice of the durable runtime the HTTP boundary uses
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Durably enqueue a message and process delivery
    async fn send_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), ExecutorError>;

    /// Start a workflow at most once per id
    async fn start_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        queue: Option<&str>,
        partition_key: Option<String>,
    ) -> Result<bool, ExecutorError>;

    /// Cancel a workflow externally
    async fn cancel_workflow(&self, workflow_id: Uuid, reason: &str)
        -> Result<(), ExecutorError>;
}

#[async_trait]
impl<S: WorkflowStore> Engine for Executor<S> {
    async fn send_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), ExecutorError> {
        Executor::send_message(self, workflow_id, message).await
    }

    async fn start_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        queue: Option<&str>,
        partition_key: Option<String>,
    ) -> Result<bool, ExecutorError> {
        Executor::start_workflow(self, workflow_id, workflow_type, input, queue, partition_key)
            .await
    }

    async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        Executor::cancel_workflow(self, workflow_id, reason).await
    }
}
