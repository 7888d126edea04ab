// In-memory Storage implementation for tests and dev mode

use async_trait::async_trait;
use chrono::Utc;
use foreman_core::{
    MainThread, QueueItem, QueueItemStatus, WorkerTask, WorkerTaskPatch,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::store::{InboxFilter, Storage, StorageError};

/// In-memory implementation of [`Storage`]
///
/// Same semantics as the PostgreSQL implementation, including terminal-task
/// write protection.
#[derive(Default)]
pub struct InMemoryStorage {
    threads: RwLock<HashMap<Uuid, MainThread>>,
    tasks: RwLock<HashMap<Uuid, WorkerTask>>,
    items: RwLock<HashMap<Uuid, QueueItem>>,
}

impl InMemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_main_thread(&self, thread: &MainThread) -> Result<(), StorageError> {
        self.threads.write().insert(thread.id, thread.clone());
        Ok(())
    }

    async fn get_main_thread(&self, id: Uuid) -> Result<Option<MainThread>, StorageError> {
        Ok(self.threads.read().get(&id).cloned())
    }

    async fn get_main_thread_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<MainThread>, StorageError> {
        Ok(self
            .threads
            .read()
            .values()
            .find(|t| t.user_id == user_id)
            .cloned())
    }

    async fn set_main_thread_workflow(
        &self,
        id: Uuid,
        workflow_run_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        thread.workflow_run_id = Some(workflow_run_id);
        Ok(())
    }

    async fn update_main_thread_context(
        &self,
        id: Uuid,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        thread.context = context;
        thread.last_activity_at = Utc::now();
        Ok(())
    }

    async fn add_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if !thread.active_task_ids.contains(&task_id) {
            thread.active_task_ids.push(task_id);
        }
        thread.last_activity_at = Utc::now();
        Ok(())
    }

    async fn remove_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        thread.active_task_ids.retain(|t| *t != task_id);
        thread.last_activity_at = Utc::now();
        Ok(())
    }

    async fn create_worker_task(&self, task: &WorkerTask) -> Result<(), StorageError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get_worker_task(&self, id: Uuid) -> Result<Option<WorkerTask>, StorageError> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn list_worker_tasks(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<WorkerTask>, StorageError> {
        let mut tasks: Vec<WorkerTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| !active_only || !t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn update_worker_task(
        &self,
        id: Uuid,
        patch: WorkerTaskPatch,
    ) -> Result<WorkerTask, StorageError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        // Terminal tasks accept timestamp-only updates
        if task.status.is_terminal() {
            let timestamps_only = WorkerTaskPatch {
                started_at: patch.started_at,
                completed_at: patch.completed_at,
                ..Default::default()
            };
            timestamps_only.apply(task);
            return Ok(task.clone());
        }

        patch.apply(task);
        Ok(task.clone())
    }

    async fn create_queue_item(&self, item: &QueueItem) -> Result<(), StorageError> {
        self.items.write().insert(item.id, item.clone());
        Ok(())
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, StorageError> {
        Ok(self.items.read().get(&id).cloned())
    }

    async fn list_queue_items(
        &self,
        user_id: &str,
        filter: InboxFilter,
    ) -> Result<Vec<QueueItem>, StorageError> {
        let mut items: Vec<QueueItem> = self
            .items
            .read()
            .values()
            .filter(|i| i.user_id == user_id)
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .filter(|i| !filter.unread_only || i.read_at.is_none())
            .filter(|i| filter.created_after.is_none_or(|ts| i.created_at > ts))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if filter.limit > 0 {
            items.truncate(filter.limit);
        }
        Ok(items)
    }

    async fn respond_queue_item(
        &self,
        id: Uuid,
        response: &str,
    ) -> Result<QueueItem, StorageError> {
        let mut items = self.items.write();
        let item = items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        item.response = Some(response.to_string());
        item.status = QueueItemStatus::Responded;
        item.responded_at = Some(Utc::now());
        Ok(item.clone())
    }

    async fn mark_queue_item_read(&self, id: Uuid) -> Result<(), StorageError> {
        let mut items = self.items.write();
        let item = items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if item.read_at.is_none() {
            item.read_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_queue_item_status(
        &self,
        id: Uuid,
        status: QueueItemStatus,
    ) -> Result<(), StorageError> {
        let mut items = self.items.write();
        let item = items.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        item.status = status;
        Ok(())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, StorageError> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|i| {
                i.user_id == user_id
                    && i.status == QueueItemStatus::Pending
                    && i.read_at.is_none()
            })
            .count() as i64)
    }
}
