// Inbox (human queue) entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of an inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
    Question,
    Approval,
    Review,
    Error,
    Notification,
    /// Plan is ready for review
    PlanReady,
    /// Code is ready for review
    CodeReady,
    /// Worker addressed review feedback
    FeedbackAddressed,
    /// Suggestion to route a message to an existing task
    RoutingSuggestion,
}

/// Priority of an inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemPriority {
    Urgent,
    High,
    Normal,
    Low,
}

/// Lifecycle status of an inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Responded,
    Expired,
    Cancelled,
}

/// An entry in the user's inbox
///
/// Written only by the main-thread workflow; `read_at`, `response` and the
/// `responded` transition belong to the API boundary acting on user action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub main_thread_id: Uuid,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    pub user_id: String,

    pub item_type: QueueItemType,
    pub priority: QueueItemPriority,
    pub title: String,
    pub content: String,

    /// Extra context for responding (e.g. a PR URL)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Predefined response options, if any
    #[serde(default)]
    pub options: Option<Vec<String>>,

    pub status: QueueItemStatus,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Create a pending inbox entry
    pub fn new(
        main_thread_id: Uuid,
        user_id: impl Into<String>,
        item_type: QueueItemType,
        priority: QueueItemPriority,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            main_thread_id,
            task_id: None,
            user_id: user_id.into(),
            item_type,
            priority,
            title: title.into(),
            content: content.into(),
            context: serde_json::Map::new(),
            options: None,
            status: QueueItemStatus::Pending,
            response: None,
            responded_at: None,
            read_at: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Attach the related task
    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach predefined response options
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = Some(options);
        self
    }

    /// Attach a context value
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let task_id = Uuid::now_v7();
        let item = QueueItem::new(
            Uuid::now_v7(),
            "user-1",
            QueueItemType::CodeReady,
            QueueItemPriority::High,
            "PR ready for review",
            "Pull request created",
        )
        .with_task(task_id)
        .with_options(vec!["Approve".to_string(), "Request changes".to_string()])
        .with_context("pr_url", serde_json::json!("https://forge.test/o/r/pull/7"));

        assert_eq!(item.task_id, Some(task_id));
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.options.as_ref().map(Vec::len), Some(2));
        assert!(item.context.contains_key("pr_url"));
    }

    #[test]
    fn test_serialization_uses_snake_case_tags() {
        let encoded = serde_json::to_string(&QueueItemType::FeedbackAddressed).unwrap();
        assert_eq!(encoded, "\"feedback_addressed\"");
        let encoded = serde_json::to_string(&QueueItemPriority::Urgent).unwrap();
        assert_eq!(encoded, "\"urgent\"");
    }
}
