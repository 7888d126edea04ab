// Storage trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{
    MainThread, QueueItem, QueueItemStatus, WorkerTask, WorkerTaskPatch,
};
use uuid::Uuid;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Entity not found
    #[error("not found: {0}")]
    NotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Filter for inbox listings
#[derive(Debug, Clone, Default)]
pub struct InboxFilter {
    /// Only entries with this status
    pub status: Option<QueueItemStatus>,
    /// Only unread entries
    pub unread_only: bool,
    /// Only entries created after this instant (poll cursor)
    pub created_after: Option<DateTime<Utc>>,
    /// Maximum entries returned (0 = unlimited)
    pub limit: usize,
}

/// Persistence contract for orchestrator entities
///
/// Implementations must support concurrent access. No cross-table
/// transaction is required; `add_active_task`/`remove_active_task` must be
/// atomic with respect to concurrent mutations of the same thread.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Main Threads
    // =========================================================================

    /// Persist a new main thread
    async fn create_main_thread(&self, thread: &MainThread) -> Result<(), StorageError>;

    /// Get a thread by id
    async fn get_main_thread(&self, id: Uuid) -> Result<Option<MainThread>, StorageError>;

    /// Get a user's thread (at most one exists per user)
    async fn get_main_thread_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<MainThread>, StorageError>;

    /// Bind the thread record to its durable workflow run
    async fn set_main_thread_workflow(
        &self,
        id: Uuid,
        workflow_run_id: Uuid,
    ) -> Result<(), StorageError>;

    /// Replace the thread's free-form context and bump `last_activity_at`
    async fn update_main_thread_context(
        &self,
        id: Uuid,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError>;

    /// Atomically append a task id to `active_task_ids`
    async fn add_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError>;

    /// Atomically remove a task id from `active_task_ids`
    async fn remove_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError>;

    // =========================================================================
    // Worker Tasks
    // =========================================================================

    /// Persist a new worker task
    async fn create_worker_task(&self, task: &WorkerTask) -> Result<(), StorageError>;

    /// Get a task by id
    async fn get_worker_task(&self, id: Uuid) -> Result<Option<WorkerTask>, StorageError>;

    /// List a user's tasks, newest first; `active_only` excludes terminal ones
    async fn list_worker_tasks(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<WorkerTask>, StorageError>;

    /// Apply a partial update; returns the task after the write
    async fn update_worker_task(
        &self,
        id: Uuid,
        patch: WorkerTaskPatch,
    ) -> Result<WorkerTask, StorageError>;

    // =========================================================================
    // Queue Items (inbox)
    // =========================================================================

    /// Persist a new inbox entry
    async fn create_queue_item(&self, item: &QueueItem) -> Result<(), StorageError>;

    /// Get an entry by id
    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, StorageError>;

    /// List a user's inbox entries, newest first
    async fn list_queue_items(
        &self,
        user_id: &str,
        filter: InboxFilter,
    ) -> Result<Vec<QueueItem>, StorageError>;

    /// Record the user's response; transitions the entry to `responded`
    async fn respond_queue_item(
        &self,
        id: Uuid,
        response: &str,
    ) -> Result<QueueItem, StorageError>;

    /// Mark an entry read
    async fn mark_queue_item_read(&self, id: Uuid) -> Result<(), StorageError>;

    /// Set an entry's lifecycle status (expire / cancel)
    async fn set_queue_item_status(
        &self,
        id: Uuid,
        status: QueueItemStatus,
    ) -> Result<(), StorageError>;

    /// Number of pending unread entries for a user
    async fn unread_count(&self, user_id: &str) -> Result<i64, StorageError>;
}
