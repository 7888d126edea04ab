// Row types and conversions between database rows and domain entities

use chrono::{DateTime, Utc};
use foreman_core::{
    MainThread, QueueItem, QueueItemPriority, QueueItemStatus, QueueItemType, TaskQuestion,
    TaskStatus, TaskType, ThreadStatus, WorkerTask,
};
use sqlx::FromRow;
use uuid::Uuid;

use crate::store::StorageError;

fn parse_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StorageError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| StorageError::Serialization(format!("bad enum value {s}: {e}")))
}

pub(crate) fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(StorageError::Serialization(format!(
            "expected string-serializable enum, got {other}"
        ))),
        Err(e) => Err(StorageError::Serialization(e.to_string())),
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MainThreadRow {
    pub id: Uuid,
    pub user_id: String,
    pub workflow_run_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub active_task_ids: serde_json::Value,
    pub context: serde_json::Value,
}

impl MainThreadRow {
    pub fn into_entity(self) -> Result<MainThread, StorageError> {
        Ok(MainThread {
            id: self.id,
            user_id: self.user_id,
            workflow_run_id: self.workflow_run_id,
            status: parse_enum::<ThreadStatus>(&self.status)?,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            active_task_ids: parse_json(self.active_task_ids)?,
            context: parse_json(self.context)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct WorkerTaskRow {
    pub id: Uuid,
    pub main_thread_id: Uuid,
    pub user_id: String,
    pub task_type: String,
    pub description: String,
    pub prompt: String,
    pub model: Option<String>,
    pub repo_url: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: String,
    pub status: String,
    pub skip_plan: bool,
    pub plan_text: Option<String>,
    pub pending_questions: serde_json::Value,
    pub context: serde_json::Value,
    pub issue_number: Option<i64>,
    pub issue_url: Option<String>,
    pub issue_etag: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub pr_etag: Option<String>,
    pub commit_sha: Option<String>,
    pub conversation_id: Option<String>,
    pub keywords: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerTaskRow {
    pub fn into_entity(self) -> Result<WorkerTask, StorageError> {
        Ok(WorkerTask {
            id: self.id,
            main_thread_id: self.main_thread_id,
            user_id: self.user_id,
            task_type: parse_enum::<TaskType>(&self.task_type)?,
            description: self.description,
            prompt: self.prompt,
            model: self.model,
            repo_url: self.repo_url,
            branch_name: self.branch_name,
            base_branch: self.base_branch,
            status: parse_enum::<TaskStatus>(&self.status)?,
            skip_plan: self.skip_plan,
            plan_text: self.plan_text,
            pending_questions: parse_json::<Vec<TaskQuestion>>(self.pending_questions)?,
            context: parse_json(self.context)?,
            issue_number: self.issue_number,
            issue_url: self.issue_url,
            issue_etag: self.issue_etag,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            pr_etag: self.pr_etag,
            commit_sha: self.commit_sha,
            conversation_id: self.conversation_id,
            keywords: parse_json(self.keywords)?,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct QueueItemRow {
    pub id: Uuid,
    pub main_thread_id: Uuid,
    pub task_id: Option<Uuid>,
    pub user_id: String,
    pub item_type: String,
    pub priority: String,
    pub title: String,
    pub content: String,
    pub context: serde_json::Value,
    pub options: Option<serde_json::Value>,
    pub status: String,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl QueueItemRow {
    pub fn into_entity(self) -> Result<QueueItem, StorageError> {
        Ok(QueueItem {
            id: self.id,
            main_thread_id: self.main_thread_id,
            task_id: self.task_id,
            user_id: self.user_id,
            item_type: parse_enum::<QueueItemType>(&self.item_type)?,
            priority: parse_enum::<QueueItemPriority>(&self.priority)?,
            title: self.title,
            content: self.content,
            context: parse_json(self.context)?,
            options: self.options.map(parse_json).transpose()?,
            status: parse_enum::<QueueItemStatus>(&self.status)?,
            response: self.response,
            responded_at: self.responded_at,
            read_at: self.read_at,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_str_roundtrip() {
        assert_eq!(enum_str(&TaskStatus::WaitingPlanReview).unwrap(), "waiting_plan_review");
        assert_eq!(enum_str(&QueueItemType::CodeReady).unwrap(), "code_ready");
        let parsed: TaskStatus = parse_enum("waiting_plan_review").unwrap();
        assert_eq!(parsed, TaskStatus::WaitingPlanReview);
    }
}
