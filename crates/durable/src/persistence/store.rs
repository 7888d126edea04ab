//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, WorkflowError, WorkflowEvent, WorkflowMessage};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Workflow record status
///
/// `Enqueued` workflows are waiting for a queue slot; `Running` workflows
/// have a live event log. The three terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Waiting for queue admission
    Enqueued,

    /// Workflow is running (or recoverable)
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueued => write!(f, "enqueued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Options for starting a workflow
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Admission queue; `None` launches immediately
    pub queue: Option<String>,

    /// Partition key within the queue (e.g. a user id)
    pub partition_key: Option<String>,

    /// Application version compiled into the binary; recovery only resumes
    /// records whose version matches
    pub app_version: String,
}

impl StartOptions {
    /// Immediate launch with the given application version
    pub fn immediate(app_version: impl Into<String>) -> Self {
        Self {
            queue: None,
            partition_key: None,
            app_version: app_version.into(),
        }
    }

    /// Queued launch
    pub fn queued(
        queue: impl Into<String>,
        partition_key: Option<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue: Some(queue.into()),
            partition_key,
            app_version: app_version.into(),
        }
    }
}

/// Configuration of a named admission queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name
    pub name: String,

    /// Maximum concurrently running workflows started through this queue.
    /// For partitioned queues this cap applies per partition.
    pub concurrency: usize,

    /// Whether admission is tracked per partition key
    pub partitioned: bool,
}

impl QueueConfig {
    /// Global queue with the given concurrency cap
    pub fn global(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            partitioned: false,
        }
    }

    /// Partitioned queue with a per-partition cap
    pub fn partitioned(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            partitioned: true,
        }
    }
}

/// Workflow information stored in the database
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub queue: Option<String>,
    pub partition_key: Option<String>,
    pub app_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Definition of an activity task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// An activity task claimed for execution
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
}

/// Outcome of failing an activity task
#[derive(Debug, Clone)]
pub enum TaskFailureOutcome {
    /// Task will be retried after a delay
    WillRetry {
        next_attempt: u32,
        delay: std::time::Duration,
    },

    /// No retries left; the workflow must be notified
    ExhaustedRetries,
}

/// A claimed task whose execution deadline passed
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub activity_id: String,

    /// True when the timeout consumed the last allowed attempt
    pub exhausted: bool,
}

/// An open message wait registered by a workflow
#[derive(Debug, Clone)]
pub struct OpenWait {
    pub wait_id: String,
    pub topic: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Store for workflow records, event logs, activity tasks, messages, timers
/// and waits
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a workflow record with the caller-chosen id
    ///
    /// Returns `false` (without error) when a record with this id already
    /// exists — starting is at-most-once per workflow id.
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        options: &StartOptions,
    ) -> Result<bool, StoreError>;

    /// Get workflow status
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Update workflow status (and result/error for terminal transitions)
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    /// Append events to a workflow (with optimistic concurrency)
    ///
    /// Returns the new sequence number after appending.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError>;

    /// Load all events for a workflow (for replay)
    async fn load_events(&self, workflow_id: Uuid)
        -> Result<Vec<(i32, WorkflowEvent)>, StoreError>;

    /// List non-terminal workflows whose recorded application version matches
    ///
    /// Used by recovery; records with a different version are left untouched
    /// for operator inspection.
    async fn list_recoverable(&self, app_version: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Admit enqueued workflows while respecting queue concurrency caps
    ///
    /// Transitions the admitted workflows to `Running` and returns their ids,
    /// oldest first. For partitioned queues the cap applies per partition.
    /// Only workflows recorded under `app_version` are admitted.
    async fn claim_queue_admissions(
        &self,
        queues: &[QueueConfig],
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Count workflows that are enqueued or running
    async fn count_active_workflows(&self) -> Result<i64, StoreError>;

    // =========================================================================
    // Activity Task Queue Operations
    // =========================================================================

    /// Enqueue an activity task
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim up to `max_tasks` visible pending tasks for execution
    async fn claim_tasks(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Complete a claimed task successfully
    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fail a claimed task; may schedule a delayed retry
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Reclaim claimed tasks whose execution deadline passed
    ///
    /// Non-exhausted tasks return to pending (the timeout consumes an
    /// attempt); exhausted ones are failed and reported for notification.
    async fn reclaim_stale_tasks(&self, now: DateTime<Utc>)
        -> Result<Vec<StaleTask>, StoreError>;

    // =========================================================================
    // Message Operations
    // =========================================================================

    /// Durably enqueue a message for a workflow
    async fn enqueue_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), StoreError>;

    /// Peek the oldest unconsumed message matching the topic filter
    async fn next_message(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
    ) -> Result<Option<(i64, WorkflowMessage)>, StoreError>;

    /// Mark a message consumed
    async fn consume_message(&self, workflow_id: Uuid, seq: i64) -> Result<(), StoreError>;

    /// Discard all unconsumed messages on a topic, returning the count
    async fn drain_messages(&self, workflow_id: Uuid, topic: &str) -> Result<usize, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Schedule a durable timer
    async fn schedule_timer(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// List timers whose deadline passed (without removing them)
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, String)>, StoreError>;

    /// Remove a timer after it has been recorded as fired
    async fn clear_timer(&self, workflow_id: Uuid, timer_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Wait Operations
    // =========================================================================

    /// Register an open message wait
    async fn register_wait(
        &self,
        workflow_id: Uuid,
        wait_id: &str,
        topic: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Get the workflow's open wait, if any
    async fn open_wait(&self, workflow_id: Uuid) -> Result<Option<OpenWait>, StoreError>;

    /// Clear an open wait after it resolved or timed out
    async fn clear_wait(&self, workflow_id: Uuid, wait_id: &str) -> Result<(), StoreError>;

    /// List open waits whose deadline passed (without removing them)
    async fn due_wait_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>, StoreError>;

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Drop all pending work (tasks, timers, waits) for a workflow
    async fn cancel_workflow_work(&self, workflow_id: Uuid) -> Result<(), StoreError>;
}

/// Convert an [`ActivityError`] describing a timeout
pub(crate) fn timeout_error(activity_id: &str) -> ActivityError {
    ActivityError::retryable(format!("activity {activity_id} timed out"))
        .with_type("ACTIVITY_TIMEOUT")
}
