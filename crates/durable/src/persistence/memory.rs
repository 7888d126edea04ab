//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and single-process dev mode. Provides the same
//! semantics as the PostgreSQL implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{WorkflowError, WorkflowEvent, WorkflowMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

/// Internal workflow state
struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    queue: Option<String>,
    partition_key: Option<String>,
    app_version: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<WorkflowEvent>,
}

/// Internal activity task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    visible_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
}

/// Internal message state
struct MessageState {
    seq: i64,
    message: WorkflowMessage,
    consumed: bool,
}

/// In-memory implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```
/// use foreman_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    messages: RwLock<HashMap<Uuid, Vec<MessageState>>>,
    message_seq: RwLock<HashMap<Uuid, i64>>,
    timers: RwLock<HashMap<(Uuid, String), DateTime<Utc>>>,
    waits: RwLock<HashMap<Uuid, OpenWait>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            message_seq: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            waits: RwLock::new(HashMap::new()),
        }
    }

    /// Number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Number of pending activity tasks
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Clear all data (for tests)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.messages.write().clear();
        self.message_seq.write().clear();
        self.timers.write().clear();
        self.waits.write().clear();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        options: &StartOptions,
    ) -> Result<bool, StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Ok(false);
        }

        let now = Utc::now();
        let status = if options.queue.is_some() {
            WorkflowStatus::Enqueued
        } else {
            WorkflowStatus::Running
        };

        workflows.insert(
            workflow_id,
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status,
                input,
                result: None,
                error: None,
                queue: options.queue.clone(),
                partition_key: options.partition_key.clone(),
                app_version: options.app_version.clone(),
                created_at: now,
                updated_at: now,
                events: vec![],
            },
        );
        Ok(true)
    }

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.status)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(WorkflowInfo {
            id: workflow_id,
            workflow_type: workflow.workflow_type.clone(),
            status: workflow.status,
            input: workflow.input.clone(),
            result: workflow.result.clone(),
            error: workflow.error.clone(),
            queue: workflow.queue.clone(),
            partition_key: workflow.partition_key.clone(),
            app_version: workflow.app_version.clone(),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        })
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.status = status;
        workflow.result = result;
        workflow.error = error;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let current_sequence = workflow.events.len() as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        workflow.events.extend(events);
        workflow.updated_at = Utc::now();
        Ok(workflow.events.len() as i32)
    }

    async fn load_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(i32, WorkflowEvent)>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(workflow
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i32, e.clone()))
            .collect())
    }

    async fn list_recoverable(&self, app_version: &str) -> Result<Vec<Uuid>, StoreError> {
        let workflows = self.workflows.read();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = workflows
            .iter()
            .filter(|(_, w)| w.status == WorkflowStatus::Running && w.app_version == app_version)
            .map(|(id, w)| (w.created_at, *id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn claim_queue_admissions(
        &self,
        queues: &[QueueConfig],
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut workflows = self.workflows.write();
        let mut admitted = Vec::new();

        for queue in queues {
            // Count running occupancy, per partition for partitioned queues
            let mut occupancy: HashMap<Option<String>, usize> = HashMap::new();
            for w in workflows.values() {
                if w.queue.as_deref() == Some(queue.name.as_str())
                    && w.status == WorkflowStatus::Running
                {
                    let key = if queue.partitioned {
                        w.partition_key.clone()
                    } else {
                        None
                    };
                    *occupancy.entry(key).or_default() += 1;
                }
            }

            let mut candidates: Vec<(DateTime<Utc>, Uuid, Option<String>)> = workflows
                .iter()
                .filter(|(_, w)| {
                    w.queue.as_deref() == Some(queue.name.as_str())
                        && w.status == WorkflowStatus::Enqueued
                        && w.app_version == app_version
                })
                .map(|(id, w)| {
                    let key = if queue.partitioned {
                        w.partition_key.clone()
                    } else {
                        None
                    };
                    (w.created_at, *id, key)
                })
                .collect();
            candidates.sort();

            for (_, id, key) in candidates {
                let slot = occupancy.entry(key).or_default();
                if *slot < queue.concurrency {
                    *slot += 1;
                    if let Some(w) = workflows.get_mut(&id) {
                        w.status = WorkflowStatus::Running;
                        w.updated_at = Utc::now();
                    }
                    admitted.push(id);
                }
            }
        }

        Ok(admitted)
    }

    async fn count_active_workflows(&self) -> Result<i64, StoreError> {
        let workflows = self.workflows.read();
        Ok(workflows
            .values()
            .filter(|w| !w.status.is_terminal())
            .count() as i64)
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let mut tasks = self.tasks.write();
        tasks.insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 1,
                visible_at: Utc::now(),
                deadline: None,
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        _worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let mut claimable: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Pending && t.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        claimable.sort();
        claimable.truncate(max_tasks);

        let mut claimed = Vec::new();
        for id in claimable {
            if let Some(t) = tasks.get_mut(&id) {
                t.status = TaskStatus::Claimed;
                t.deadline = Some(now + t.definition.options.start_to_close_timeout);
                claimed.push(ClaimedTask {
                    id,
                    workflow_id: t.definition.workflow_id,
                    activity_id: t.definition.activity_id.clone(),
                    activity_type: t.definition.activity_type.clone(),
                    input: t.definition.input.clone(),
                    options: t.definition.options.clone(),
                    attempt: t.attempt,
                });
            }
        }

        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Completed;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let policy = &task.definition.options.retry_policy;
        if error.retryable && policy.should_retry(task.attempt) {
            let next_attempt = task.attempt + 1;
            let delay = policy.delay_for_attempt(next_attempt);
            task.attempt = next_attempt;
            task.status = TaskStatus::Pending;
            task.visible_at = Utc::now() + delay;
            task.deadline = None;
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    async fn reclaim_stale_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleTask>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut stale = Vec::new();

        for (id, task) in tasks.iter_mut() {
            if task.status != TaskStatus::Claimed {
                continue;
            }
            let Some(deadline) = task.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }

            let policy = &task.definition.options.retry_policy;
            let exhausted = !policy.should_retry(task.attempt);
            if exhausted {
                task.status = TaskStatus::Failed;
            } else {
                let next_attempt = task.attempt + 1;
                task.attempt = next_attempt;
                task.status = TaskStatus::Pending;
                task.visible_at = now + policy.delay_for_attempt(next_attempt);
                task.deadline = None;
            }

            stale.push(StaleTask {
                task_id: *id,
                workflow_id: task.definition.workflow_id,
                activity_id: task.definition.activity_id.clone(),
                exhausted,
            });
        }

        Ok(stale)
    }

    async fn enqueue_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), StoreError> {
        // Single lock order: seq before messages
        let seq = {
            let mut seqs = self.message_seq.write();
            let counter = seqs.entry(workflow_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let mut messages = self.messages.write();
        messages.entry(workflow_id).or_default().push(MessageState {
            seq,
            message,
            consumed: false,
        });
        Ok(())
    }

    async fn next_message(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
    ) -> Result<Option<(i64, WorkflowMessage)>, StoreError> {
        let messages = self.messages.read();
        let Some(queue) = messages.get(&workflow_id) else {
            return Ok(None);
        };

        Ok(queue
            .iter()
            .filter(|m| !m.consumed)
            .filter(|m| topic.is_none_or(|t| m.message.topic == t))
            .min_by_key(|m| m.seq)
            .map(|m| (m.seq, m.message.clone())))
    }

    async fn consume_message(&self, workflow_id: Uuid, seq: i64) -> Result<(), StoreError> {
        let mut messages = self.messages.write();
        if let Some(queue) = messages.get_mut(&workflow_id) {
            if let Some(m) = queue.iter_mut().find(|m| m.seq == seq) {
                m.consumed = true;
            }
        }
        Ok(())
    }

    async fn drain_messages(&self, workflow_id: Uuid, topic: &str) -> Result<usize, StoreError> {
        let mut messages = self.messages.write();
        let Some(queue) = messages.get_mut(&workflow_id) else {
            return Ok(0);
        };

        let mut count = 0;
        for m in queue.iter_mut() {
            if !m.consumed && m.message.topic == topic {
                m.consumed = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn schedule_timer(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timers
            .write()
            .insert((workflow_id, timer_id.to_string()), fire_at);
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, String)>, StoreError> {
        let timers = self.timers.read();
        let mut due: Vec<((Uuid, String), DateTime<Utc>)> = timers
            .iter()
            .filter(|(_, fire_at)| **fire_at <= now)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        due.sort_by_key(|(_, fire_at)| *fire_at);
        Ok(due.into_iter().map(|(k, _)| k).collect())
    }

    async fn clear_timer(&self, workflow_id: Uuid, timer_id: &str) -> Result<(), StoreError> {
        self.timers
            .write()
            .remove(&(workflow_id, timer_id.to_string()));
        Ok(())
    }

    async fn register_wait(
        &self,
        workflow_id: Uuid,
        wait_id: &str,
        topic: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.waits.write().insert(
            workflow_id,
            OpenWait {
                wait_id: wait_id.to_string(),
                topic: topic.map(str::to_string),
                expires_at,
            },
        );
        Ok(())
    }

    async fn open_wait(&self, workflow_id: Uuid) -> Result<Option<OpenWait>, StoreError> {
        Ok(self.waits.read().get(&workflow_id).cloned())
    }

    async fn clear_wait(&self, workflow_id: Uuid, wait_id: &str) -> Result<(), StoreError> {
        let mut waits = self.waits.write();
        if waits
            .get(&workflow_id)
            .is_some_and(|w| w.wait_id == wait_id)
        {
            waits.remove(&workflow_id);
        }
        Ok(())
    }

    async fn due_wait_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>, StoreError> {
        let waits = self.waits.read();
        Ok(waits
            .iter()
            .filter(|(_, w)| w.expires_at <= now)
            .map(|(id, w)| (*id, w.wait_id.clone()))
            .collect())
    }

    async fn cancel_workflow_work(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        {
            let mut tasks = self.tasks.write();
            tasks.retain(|_, t| {
                t.definition.workflow_id != workflow_id || t.status == TaskStatus::Completed
            });
        }
        {
            let mut timers = self.timers.write();
            timers.retain(|(wf, _), _| *wf != workflow_id);
        }
        self.waits.write().remove(&workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> StartOptions {
        StartOptions::immediate("test-1")
    }

    #[tokio::test]
    async fn test_create_workflow_is_at_most_once() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();

        let created = store
            .create_workflow(id, "task_workflow", json!({}), &options())
            .await
            .unwrap();
        assert!(created);

        let created_again = store
            .create_workflow(id, "task_workflow", json!({}), &options())
            .await
            .unwrap();
        assert!(!created_again);
    }

    #[tokio::test]
    async fn test_append_events_detects_conflicts() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();
        store
            .create_workflow(id, "task_workflow", json!({}), &options())
            .await
            .unwrap();

        let seq = store
            .append_events(id, 0, vec![WorkflowEvent::WorkflowStarted { input: json!({}) }])
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let conflict = store
            .append_events(id, 0, vec![WorkflowEvent::WorkflowStarted { input: json!({}) }])
            .await;
        assert!(matches!(
            conflict,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_message_fifo_per_topic() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();

        store
            .enqueue_message(id, WorkflowMessage::new("a", json!(1)))
            .await
            .unwrap();
        store
            .enqueue_message(id, WorkflowMessage::new("b", json!(2)))
            .await
            .unwrap();
        store
            .enqueue_message(id, WorkflowMessage::new("a", json!(3)))
            .await
            .unwrap();

        // Topic filter picks the oldest matching message
        let (seq, msg) = store.next_message(id, Some("a")).await.unwrap().unwrap();
        assert_eq!(msg.payload, json!(1));
        store.consume_message(id, seq).await.unwrap();

        let (_, msg) = store.next_message(id, Some("a")).await.unwrap().unwrap();
        assert_eq!(msg.payload, json!(3));

        // Any-topic filter sees the "b" message (oldest unconsumed)
        let (_, msg) = store.next_message(id, None).await.unwrap().unwrap();
        assert_eq!(msg.payload, json!(2));
    }

    #[tokio::test]
    async fn test_drain_messages() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();

        store
            .enqueue_message(id, WorkflowMessage::new("plan_response", json!(1)))
            .await
            .unwrap();
        store
            .enqueue_message(id, WorkflowMessage::new("plan_response", json!(2)))
            .await
            .unwrap();
        store
            .enqueue_message(id, WorkflowMessage::new("job_result", json!(3)))
            .await
            .unwrap();

        let drained = store.drain_messages(id, "plan_response").await.unwrap();
        assert_eq!(drained, 2);

        assert!(store
            .next_message(id, Some("plan_response"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .next_message(id, Some("job_result"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_task_retry_schedule() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = Uuid::now_v7();

        let task_id = store
            .enqueue_task(TaskDefinition {
                workflow_id,
                activity_id: "a-1".to_string(),
                activity_type: "flaky".to_string(),
                input: json!({}),
                options: Default::default(),
            })
            .await
            .unwrap();

        let claimed = store.claim_tasks("w", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);

        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("boom"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TaskFailureOutcome::WillRetry { next_attempt: 2, .. }
        ));

        // Not visible until the backoff delay elapses
        let claimed = store.claim_tasks("w", 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_error_exhausts_immediately() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = Uuid::now_v7();

        let task_id = store
            .enqueue_task(TaskDefinition {
                workflow_id,
                activity_id: "a-1".to_string(),
                activity_type: "broken".to_string(),
                input: json!({}),
                options: Default::default(),
            })
            .await
            .unwrap();

        store.claim_tasks("w", 10).await.unwrap();
        let outcome = store
            .fail_task(task_id, &ActivityError::non_retryable("bad input"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskFailureOutcome::ExhaustedRetries));
    }

    #[tokio::test]
    async fn test_queue_admission_respects_concurrency() {
        let store = InMemoryWorkflowStore::new();
        let queue = QueueConfig::global("worker_tasks", 2);

        for _ in 0..4 {
            store
                .create_workflow(
                    Uuid::now_v7(),
                    "task_workflow",
                    json!({}),
                    &StartOptions::queued("worker_tasks", None, "test-1"),
                )
                .await
                .unwrap();
        }

        let admitted = store
            .claim_queue_admissions(std::slice::from_ref(&queue), "test-1")
            .await
            .unwrap();
        assert_eq!(admitted.len(), 2);

        // No more slots while the first two are running
        let admitted = store
            .claim_queue_admissions(std::slice::from_ref(&queue), "test-1")
            .await
            .unwrap();
        assert!(admitted.is_empty());
    }

    #[tokio::test]
    async fn test_partitioned_queue_admits_one_per_partition() {
        let store = InMemoryWorkflowStore::new();
        let queue = QueueConfig::partitioned("main_threads", 1);

        for user in ["alice", "alice", "bob"] {
            store
                .create_workflow(
                    Uuid::now_v7(),
                    "main_thread",
                    json!({}),
                    &StartOptions::queued("main_threads", Some(user.to_string()), "test-1"),
                )
                .await
                .unwrap();
        }

        let admitted = store
            .claim_queue_admissions(std::slice::from_ref(&queue), "test-1")
            .await
            .unwrap();
        // One for alice, one for bob; alice's second stays enqueued
        assert_eq!(admitted.len(), 2);
    }

    #[tokio::test]
    async fn test_version_gating_skips_other_versions() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();
        store
            .create_workflow(id, "task_workflow", json!({}), &StartOptions::immediate("v1"))
            .await
            .unwrap();

        assert!(store.list_recoverable("v2").await.unwrap().is_empty());
        assert_eq!(store.list_recoverable("v1").await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_timer_roundtrip() {
        let store = InMemoryWorkflowStore::new();
        let id = Uuid::now_v7();
        let past = Utc::now() - chrono::Duration::seconds(5);

        store.schedule_timer(id, "pr-poll-1", past).await.unwrap();

        let due = store.due_timers(Utc::now()).await.unwrap();
        assert_eq!(due, vec![(id, "pr-poll-1".to_string())]);

        store.clear_timer(id, "pr-poll-1").await.unwrap();
        assert!(store.due_timers(Utc::now()).await.unwrap().is_empty());
    }
}
