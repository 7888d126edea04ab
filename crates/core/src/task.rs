// Worker task entities and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Status of a worker task
///
/// Terminal statuses (`Completed`, `Failed`, `Cancelled`) are never left;
/// after a terminal transition only timestamps may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, worker not yet started
    Pending,

    /// A plan job is producing (or revising) the implementation plan
    Planning,

    /// The plan job asked clarifying questions; waiting on answers
    WaitingQuestions,

    /// Plan posted; waiting for approval or revision feedback
    WaitingPlanReview,

    /// Plan approved; waiting for the explicit start gate
    ReadyToImplement,

    /// An implement, fix or feedback job is writing code
    Implementing,

    /// PR open; watching for merge, close and review feedback
    UnderReview,

    /// PR merged
    Completed,

    /// Unrecoverable error
    Failed,

    /// Cancelled by the user (in-app or forge-side)
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::WaitingQuestions => "waiting_questions",
            Self::WaitingPlanReview => "waiting_plan_review",
            Self::ReadyToImplement => "ready_to_implement",
            Self::Implementing => "implementing",
            Self::UnderReview => "under_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "waiting_questions" => Ok(Self::WaitingQuestions),
            "waiting_plan_review" => Ok(Self::WaitingPlanReview),
            "ready_to_implement" => Ok(Self::ReadyToImplement),
            "implementing" => Ok(Self::Implementing),
            "under_review" => Ok(Self::UnderReview),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Kind of work a task represents; determines the branch prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Docs,
    Test,
    Chore,
}

impl TaskType {
    /// Branch prefix for this task type
    pub fn branch_prefix(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "fix",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Test => "test",
            Self::Chore => "chore",
        }
    }

    /// Parse a loosely specified task type; unknown kinds default to feature
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "feature" => Self::Feature,
            "bug" | "bugfix" | "fix" => Self::Bugfix,
            "refactor" => Self::Refactor,
            "docs" => Self::Docs,
            "test" => Self::Test,
            "chore" => Self::Chore,
            _ => Self::Feature,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Test => "test",
            Self::Chore => "chore",
        };
        write!(f, "{s}")
    }
}

/// One option offered for a clarifying question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A clarifying question raised by a plan job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQuestion {
    pub id: String,
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// A unit of agent work driven by a worker workflow
///
/// The row is mutated exclusively by the worker workflow with the matching
/// id; the API boundary cancels the workflow before any terminal write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: Uuid,
    pub main_thread_id: Uuid,
    pub user_id: String,

    // Task definition
    pub task_type: TaskType,
    pub description: String,
    pub prompt: String,
    /// Executor model override (e.g. a smaller model for chores)
    #[serde(default)]
    pub model: Option<String>,

    // Repository context
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    pub base_branch: String,

    // Execution state
    pub status: TaskStatus,
    #[serde(default)]
    pub skip_plan: bool,
    #[serde(default)]
    pub plan_text: Option<String>,
    #[serde(default)]
    pub pending_questions: Vec<TaskQuestion>,
    /// Requirements gathered from answered questions
    #[serde(default)]
    pub context: HashMap<String, String>,

    // Forge integration
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub issue_url: Option<String>,
    #[serde(default)]
    pub issue_etag: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_etag: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,

    // Conversation linking (for routing)
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,

    // Results
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerTask {
    /// Create a new pending task
    pub fn new(
        main_thread_id: Uuid,
        user_id: impl Into<String>,
        task_type: TaskType,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            main_thread_id,
            user_id: user_id.into(),
            task_type,
            description: description.into(),
            prompt: prompt.into(),
            model: None,
            repo_url: None,
            branch_name: None,
            base_branch: "main".to_string(),
            status: TaskStatus::Pending,
            skip_plan: false,
            plan_text: None,
            pending_questions: vec![],
            context: HashMap::new(),
            issue_number: None,
            issue_url: None,
            issue_etag: None,
            pr_number: None,
            pr_url: None,
            pr_etag: None,
            commit_sha: None,
            conversation_id: None,
            keywords: vec![],
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the repository context
    pub fn with_repo(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self
    }

    /// Skip the planning phase
    pub fn with_skip_plan(mut self, skip: bool) -> Self {
        self.skip_plan = skip;
        self
    }
}

/// Partial update applied to a worker task
///
/// `None` fields are left untouched. Double-`Option` fields distinguish
/// "don't touch" from "set to null".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerTaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_questions: Option<Vec<TaskQuestion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerTaskPatch {
    /// Patch that only changes the status
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Apply this patch to a task in place
    pub fn apply(self, task: &mut WorkerTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(branch_name) = self.branch_name {
            task.branch_name = Some(branch_name);
        }
        if let Some(plan_text) = self.plan_text {
            task.plan_text = Some(plan_text);
        }
        if let Some(pending_questions) = self.pending_questions {
            task.pending_questions = pending_questions;
        }
        if let Some(context) = self.context {
            task.context = context;
        }
        if let Some(issue_number) = self.issue_number {
            task.issue_number = Some(issue_number);
        }
        if let Some(issue_url) = self.issue_url {
            task.issue_url = Some(issue_url);
        }
        if let Some(issue_etag) = self.issue_etag {
            task.issue_etag = Some(issue_etag);
        }
        if let Some(pr_number) = self.pr_number {
            task.pr_number = Some(pr_number);
        }
        if let Some(pr_url) = self.pr_url {
            task.pr_url = Some(pr_url);
        }
        if let Some(pr_etag) = self.pr_etag {
            task.pr_etag = Some(pr_etag);
        }
        if let Some(commit_sha) = self.commit_sha {
            task.commit_sha = Some(commit_sha);
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(started_at) = self.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = Some(completed_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::UnderReview.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Planning,
            TaskStatus::WaitingQuestions,
            TaskStatus::WaitingPlanReview,
            TaskStatus::ReadyToImplement,
            TaskStatus::Implementing,
            TaskStatus::UnderReview,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_task_type_lenient_parsing() {
        assert_eq!(TaskType::parse_lenient("bug"), TaskType::Bugfix);
        assert_eq!(TaskType::parse_lenient("FIX"), TaskType::Bugfix);
        assert_eq!(TaskType::parse_lenient("docs"), TaskType::Docs);
        assert_eq!(TaskType::parse_lenient("banana"), TaskType::Feature);
    }

    #[test]
    fn test_patch_apply() {
        let mut task = WorkerTask::new(
            Uuid::now_v7(),
            "user-1",
            TaskType::Feature,
            "Add dark mode toggle",
            "Add dark mode toggle",
        );

        let patch = WorkerTaskPatch {
            status: Some(TaskStatus::Planning),
            issue_number: Some(12),
            issue_url: Some("https://forge.test/o/r/issues/12".to_string()),
            ..Default::default()
        };
        patch.apply(&mut task);

        assert_eq!(task.status, TaskStatus::Planning);
        assert_eq!(task.issue_number, Some(12));
        assert_eq!(task.description, "Add dark mode toggle");
    }
}
