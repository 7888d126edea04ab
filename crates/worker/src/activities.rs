// Activity implementations
//
// Activities are the only place external side effects happen. Each carries
// the adapter handles it needs; the workflows schedule them by type name and
// consume their recorded results on replay. Activities that read the clock
// return the timestamp in their result so workflow decisions stay
// deterministic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_core::routing::{extract_keywords, keyword_overlap};
use foreman_core::topics::{
    self, QueueResponsePayload, UserMessagePayload, WorkerResultPayload, WorkerResultStatus,
};
use foreman_core::{
    Config, EventBus, MainThread, QueueItem, QueueItemPriority, QueueItemType, TaskStatus,
    TaskType, WorkerTask, WorkerTaskPatch,
};
use foreman_durable::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use foreman_forge::{
    ArtifactState, CheckStatus, Comment, Forge, ForgeError, IssuePatch, PrStatus, Reaction,
};
use foreman_sandbox::{JobMode, JobSpec, Sandbox, SandboxError};
use foreman_storage::{Storage, StorageError};

use crate::Adapters;

/// Activity type names, shared between registration and scheduling
pub mod names {
    pub const LOAD_TASK: &str = "load_task";
    pub const UPDATE_TASK: &str = "update_task";
    pub const CREATE_SANDBOX: &str = "create_sandbox";
    pub const DESTROY_SANDBOX: &str = "destroy_sandbox";
    pub const CREATE_ISSUE: &str = "create_issue";
    pub const UPDATE_ISSUE_BODY: &str = "update_issue_body";
    pub const POST_ISSUE_COMMENT: &str = "post_issue_comment";
    pub const CLOSE_ISSUE: &str = "close_issue";
    pub const FETCH_ISSUE_SIGNALS: &str = "fetch_issue_signals";
    pub const LAUNCH_JOB: &str = "launch_job";
    pub const FETCH_PR_STATUS: &str = "fetch_pr_status";
    pub const FETCH_CHECK_STATUS: &str = "fetch_check_status";
    pub const FETCH_CHECK_LOGS: &str = "fetch_check_logs";
    pub const FETCH_PR_FEEDBACK: &str = "fetch_pr_feedback";
    pub const ACKNOWLEDGE_COMMENTS: &str = "acknowledge_comments";
    pub const ENSURE_THREAD: &str = "ensure_thread";
    pub const ROUTE_USER_MESSAGE: &str = "route_user_message";
    pub const APPLY_QUEUE_RESPONSE: &str = "apply_queue_response";
    pub const RECORD_WORKER_RESULT: &str = "record_worker_result";
    pub const RECORD_INBOX_ERROR: &str = "record_inbox_error";
}

fn forge_err(e: ForgeError) -> ActivityError {
    if e.is_transient() {
        ActivityError::retryable(e.to_string()).with_type("FORGE")
    } else {
        ActivityError::non_retryable(e.to_string()).with_type("FORGE")
    }
}

fn storage_err(e: StorageError) -> ActivityError {
    match e {
        StorageError::NotFound(_) => {
            ActivityError::non_retryable(e.to_string()).with_type("STORAGE")
        }
        _ => ActivityError::retryable(e.to_string()).with_type("STORAGE"),
    }
}

fn sandbox_err(e: SandboxError) -> ActivityError {
    ActivityError::retryable(e.to_string()).with_type("SANDBOX")
}

/// Register every activity with its dependencies
pub fn register(registry: &mut ActivityRegistry, adapters: &Adapters, config: &Config) {
    registry.register(LoadTask {
        storage: adapters.storage.clone(),
    });
    registry.register(UpdateTask {
        storage: adapters.storage.clone(),
        bus: adapters.bus.clone(),
    });
    registry.register(CreateSandbox {
        sandbox: adapters.sandbox.clone(),
    });
    registry.register(DestroySandbox {
        sandbox: adapters.sandbox.clone(),
    });
    registry.register(CreateIssue {
        forge: adapters.forge.clone(),
    });
    registry.register(UpdateIssueBody {
        forge: adapters.forge.clone(),
    });
    registry.register(PostIssueComment {
        forge: adapters.forge.clone(),
    });
    registry.register(CloseIssue {
        forge: adapters.forge.clone(),
    });
    registry.register(FetchIssueSignals {
        forge: adapters.forge.clone(),
    });
    registry.register(LaunchJob {
        sandbox: adapters.sandbox.clone(),
        internal_base_url: config.internal_base_url.clone(),
        default_model: config.worker_model.clone(),
    });
    registry.register(FetchPrStatus {
        forge: adapters.forge.clone(),
    });
    registry.register(FetchCheckStatus {
        forge: adapters.forge.clone(),
    });
    registry.register(FetchCheckLogs {
        forge: adapters.forge.clone(),
    });
    registry.register(FetchPrFeedback {
        forge: adapters.forge.clone(),
    });
    registry.register(AcknowledgeComments {
        forge: adapters.forge.clone(),
    });
    registry.register(EnsureThread {
        storage: adapters.storage.clone(),
    });
    registry.register(RouteUserMessage {
        storage: adapters.storage.clone(),
        bus: adapters.bus.clone(),
    });
    registry.register(ApplyQueueResponse {
        storage: adapters.storage.clone(),
        bus: adapters.bus.clone(),
    });
    registry.register(RecordWorkerResult {
        storage: adapters.storage.clone(),
        bus: adapters.bus.clone(),
    });
    registry.register(RecordInboxError {
        storage: adapters.storage.clone(),
        bus: adapters.bus.clone(),
    });
}

// ============================================================================
// Worker-task activities
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadTaskInput {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadTaskResult {
    pub task: Option<WorkerTask>,
    pub loaded_at: DateTime<Utc>,
}

pub struct LoadTask {
    pub storage: Arc<dyn Storage>,
}

#[async_trait]
impl Activity for LoadTask {
    const TYPE: &'static str = names::LOAD_TASK;
    type Input = LoadTaskInput;
    type Output = LoadTaskResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let task = self
            .storage
            .get_worker_task(input.task_id)
            .await
            .map_err(storage_err)?;
        Ok(LoadTaskResult {
            task,
            loaded_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateTaskInput {
    pub task_id: Uuid,
    pub patch: WorkerTaskPatch,
    #[serde(default)]
    pub set_started_now: bool,
    #[serde(default)]
    pub set_completed_now: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateTaskResult {
    pub status: TaskStatus,
    pub applied_at: DateTime<Utc>,
}

pub struct UpdateTask {
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl Activity for UpdateTask {
    const TYPE: &'static str = names::UPDATE_TASK;
    type Input = UpdateTaskInput;
    type Output = UpdateTaskResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let now = Utc::now();
        let mut patch = input.patch;
        if input.set_started_now {
            patch.started_at = Some(now);
        }
        if input.set_completed_now {
            patch.completed_at = Some(now);
        }

        let task = self
            .storage
            .update_worker_task(input.task_id, patch)
            .await
            .map_err(storage_err)?;

        self.bus
            .notify_task_updated(&task.user_id, task.id, &task.status.to_string());

        Ok(UpdateTaskResult {
            status: task.status,
            applied_at: now,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxInput {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxResult {
    pub sandbox_id: String,
}

pub struct CreateSandbox {
    pub sandbox: Arc<dyn Sandbox>,
}

#[async_trait]
impl Activity for CreateSandbox {
    const TYPE: &'static str = names::CREATE_SANDBOX;
    type Input = CreateSandboxInput;
    type Output = CreateSandboxResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let sandbox_id = self
            .sandbox
            .create(input.task_id)
            .await
            .map_err(sandbox_err)?;
        info!(task_id = %input.task_id, %sandbox_id, "sandbox ready");
        Ok(CreateSandboxResult { sandbox_id })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroySandboxInput {
    pub task_id: Uuid,
}

pub struct DestroySandbox {
    pub sandbox: Arc<dyn Sandbox>,
}

#[async_trait]
impl Activity for DestroySandbox {
    const TYPE: &'static str = names::DESTROY_SANDBOX;
    type Input = DestroySandboxInput;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        match self.sandbox.destroy(input.task_id).await {
            Ok(()) => Ok(json!({})),
            Err(e) => {
                warn!(task_id = %input.task_id, attempt = ctx.attempt, error = %e, "sandbox teardown failed");
                Err(sandbox_err(e))
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateIssueInput {
    pub repo_url: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateIssueResult {
    pub number: i64,
    pub url: String,
}

pub struct CreateIssue {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for CreateIssue {
    const TYPE: &'static str = names::CREATE_ISSUE;
    type Input = CreateIssueInput;
    type Output = CreateIssueResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let issue = self
            .forge
            .create_issue(&input.repo_url, &input.title, &input.body, &input.labels)
            .await
            .map_err(forge_err)?;
        Ok(CreateIssueResult {
            number: issue.number,
            url: issue.url,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateIssueBodyInput {
    pub repo_url: String,
    pub number: i64,
    pub body: String,
}

pub struct UpdateIssueBody {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for UpdateIssueBody {
    const TYPE: &'static str = names::UPDATE_ISSUE_BODY;
    type Input = UpdateIssueBodyInput;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.forge
            .update_issue(
                &input.repo_url,
                input.number,
                IssuePatch {
                    body: Some(input.body),
                    ..Default::default()
                },
            )
            .await
            .map_err(forge_err)?;
        Ok(json!({}))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostIssueCommentInput {
    pub repo_url: String,
    pub number: i64,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostIssueCommentResult {
    pub comment_id: i64,
    pub posted_at: DateTime<Utc>,
}

pub struct PostIssueComment {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for PostIssueComment {
    const TYPE: &'static str = names::POST_ISSUE_COMMENT;
    type Input = PostIssueCommentInput;
    type Output = PostIssueCommentResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let comment_id = self
            .forge
            .add_issue_comment(&input.repo_url, input.number, &input.body)
            .await
            .map_err(forge_err)?;
        Ok(PostIssueCommentResult {
            comment_id,
            posted_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseIssueInput {
    pub repo_url: String,
    pub number: i64,
    pub comment: String,
}

pub struct CloseIssue {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for CloseIssue {
    const TYPE: &'static str = names::CLOSE_ISSUE;
    type Input = CloseIssueInput;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.forge
            .add_issue_comment(&input.repo_url, input.number, &input.comment)
            .await
            .map_err(forge_err)?;
        self.forge
            .update_issue(
                &input.repo_url,
                input.number,
                IssuePatch {
                    state: Some(ArtifactState::Closed),
                    ..Default::default()
                },
            )
            .await
            .map_err(forge_err)?;
        Ok(json!({}))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchIssueSignalsInput {
    pub repo_url: String,
    pub number: i64,
    pub since: DateTime<Utc>,
    /// When set, this comment's reactions are fetched too
    #[serde(default)]
    pub plan_comment_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchIssueSignalsResult {
    pub comments: Vec<Comment>,
    pub plan_reactions: Vec<Reaction>,
    pub fetched_at: DateTime<Utc>,
}

pub struct FetchIssueSignals {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for FetchIssueSignals {
    const TYPE: &'static str = names::FETCH_ISSUE_SIGNALS;
    type Input = FetchIssueSignalsInput;
    type Output = FetchIssueSignalsResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let comments = self
            .forge
            .get_issue_comments(&input.repo_url, input.number, Some(input.since), None)
            .await
            .map_err(forge_err)?
            .value
            .unwrap_or_default();

        let plan_reactions = match input.plan_comment_id {
            Some(comment_id) => self
                .forge
                .get_comment_reactions(&input.repo_url, comment_id, false)
                .await
                .map_err(forge_err)?,
            None => vec![],
        };

        Ok(FetchIssueSignalsResult {
            comments,
            plan_reactions,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchJobInput {
    pub task_id: Uuid,
    pub sandbox_id: String,
    pub mode: JobMode,
    pub iteration: u32,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub feedback_context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchJobResult {
    pub job_name: String,
    pub launched_at: DateTime<Utc>,
}

pub struct LaunchJob {
    pub sandbox: Arc<dyn Sandbox>,
    pub internal_base_url: String,
    pub default_model: String,
}

#[async_trait]
impl Activity for LaunchJob {
    const TYPE: &'static str = names::LAUNCH_JOB;
    type Input = LaunchJobInput;
    type Output = LaunchJobResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let spec = JobSpec {
            task_id: input.task_id,
            sandbox_id: input.sandbox_id,
            mode: input.mode,
            iteration: input.iteration,
            prompt: input.prompt,
            callback_url: format!(
                "{}/internal/tasks/{}/complete",
                self.internal_base_url, input.task_id
            ),
            model: input.model.or_else(|| Some(self.default_model.clone())),
            repo_url: input.repo_url,
            issue_number: input.issue_number,
            pr_number: input.pr_number,
            branch_name: input.branch_name,
            feedback_context: input.feedback_context,
        };

        let job_name = self.sandbox.launch_job(&spec).await.map_err(sandbox_err)?;
        info!(task_id = %input.task_id, %job_name, mode = %input.mode, iteration = input.iteration, "executor job launched");
        Ok(LaunchJobResult {
            job_name,
            launched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchPrStatusInput {
    pub repo_url: String,
    pub number: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchPrStatusResult {
    pub pr: Option<PrStatus>,
    pub fetched_at: DateTime<Utc>,
}

pub struct FetchPrStatus {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for FetchPrStatus {
    const TYPE: &'static str = names::FETCH_PR_STATUS;
    type Input = FetchPrStatusInput;
    type Output = FetchPrStatusResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let pr = self
            .forge
            .get_pr_status(&input.repo_url, input.number)
            .await
            .map_err(forge_err)?;
        Ok(FetchPrStatusResult {
            pr,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchCheckStatusInput {
    pub repo_url: String,
    pub number: i64,
}

pub struct FetchCheckStatus {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for FetchCheckStatus {
    const TYPE: &'static str = names::FETCH_CHECK_STATUS;
    type Input = FetchCheckStatusInput;
    type Output = CheckStatus;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.forge
            .get_check_status(&input.repo_url, input.number)
            .await
            .map_err(forge_err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchCheckLogsInput {
    pub repo_url: String,
    pub number: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchCheckLogsResult {
    pub logs: String,
}

pub struct FetchCheckLogs {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for FetchCheckLogs {
    const TYPE: &'static str = names::FETCH_CHECK_LOGS;
    type Input = FetchCheckLogsInput;
    type Output = FetchCheckLogsResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let logs = self
            .forge
            .get_check_failure_logs(&input.repo_url, input.number)
            .await
            .map_err(forge_err)?;
        Ok(FetchCheckLogsResult { logs })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchPrFeedbackInput {
    pub repo_url: String,
    pub number: i64,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchPrFeedbackResult {
    pub comments: Vec<Comment>,
    pub fetched_at: DateTime<Utc>,
}

pub struct FetchPrFeedback {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for FetchPrFeedback {
    const TYPE: &'static str = names::FETCH_PR_FEEDBACK;
    type Input = FetchPrFeedbackInput;
    type Output = FetchPrFeedbackResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let comments = self
            .forge
            .get_pr_comments(&input.repo_url, input.number, Some(input.since))
            .await
            .map_err(forge_err)?;
        Ok(FetchPrFeedbackResult {
            comments,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcknowledgeCommentsInput {
    pub repo_url: String,
    /// (comment id, is inline review comment)
    pub comments: Vec<(i64, bool)>,
}

pub struct AcknowledgeComments {
    pub forge: Arc<dyn Forge>,
}

#[async_trait]
impl Activity for AcknowledgeComments {
    const TYPE: &'static str = names::ACKNOWLEDGE_COMMENTS;
    type Input = AcknowledgeCommentsInput;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        for (comment_id, is_review) in input.comments {
            // Acknowledgement is best-effort; a failed reaction never blocks
            // the feedback round
            if let Err(e) = self
                .forge
                .add_reaction(&input.repo_url, comment_id, "eyes", is_review)
                .await
            {
                warn!(comment_id, error = %e, "failed to acknowledge comment");
            }
        }
        Ok(json!({}))
    }
}

// ============================================================================
// Main-thread activities
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct EnsureThreadInput {
    pub user_id: String,
    /// The workflow id; doubles as the thread record id, which is how "one
    /// main thread per user" stays tied to "at most one workflow per id"
    pub thread_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnsureThreadResult {
    pub thread: MainThread,
}

pub struct EnsureThread {
    pub storage: Arc<dyn Storage>,
}

#[async_trait]
impl Activity for EnsureThread {
    const TYPE: &'static str = names::ENSURE_THREAD;
    type Input = EnsureThreadInput;
    type Output = EnsureThreadResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if let Some(thread) = self
            .storage
            .get_main_thread_by_user(&input.user_id)
            .await
            .map_err(storage_err)?
        {
            return Ok(EnsureThreadResult { thread });
        }

        let mut thread = MainThread::new(&input.user_id);
        thread.id = input.thread_id;
        thread.workflow_run_id = Some(input.thread_id);
        self.storage
            .create_main_thread(&thread)
            .await
            .map_err(storage_err)?;
        info!(user_id = %input.user_id, thread_id = %thread.id, "created main thread");
        Ok(EnsureThreadResult { thread })
    }
}

/// Keywords whose presence marks a message as a work request
const WORK_VERBS: &[&str] = &[
    "build", "fix", "create", "update", "implement", "add", "remove", "refactor",
];

/// Minimum keyword overlap to suggest routing to an existing task
const ROUTING_THRESHOLD: f64 = 0.5;

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteUserMessageInput {
    pub thread_id: Uuid,
    pub user_id: String,
    pub payload: UserMessagePayload,
}

/// What the router decided; the workflow acts on `Spawned`
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteDecision {
    /// A new worker task was created and must be started
    Spawned { task: WorkerTask },
    /// An existing task matched; a routing suggestion was filed
    Suggested { task_id: Uuid },
    /// Conversational message; a reply notification was filed
    Replied,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteUserMessageResult {
    pub decision: RouteDecision,
}

pub struct RouteUserMessage {
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl Activity for RouteUserMessage {
    const TYPE: &'static str = names::ROUTE_USER_MESSAGE;
    type Input = RouteUserMessageInput;
    type Output = RouteUserMessageResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let message = input.payload.message.as_str();
        let lower = message.to_lowercase();
        let needs_worker = WORK_VERBS.iter().any(|verb| lower.contains(verb));

        if !needs_worker {
            let item = QueueItem::new(
                input.thread_id,
                &input.user_id,
                QueueItemType::Notification,
                QueueItemPriority::Normal,
                "Response",
                format!(
                    "I received your message: {message}. I can spawn workers for tasks that \
                     involve building, fixing, or implementing something."
                ),
            );
            self.storage
                .create_queue_item(&item)
                .await
                .map_err(storage_err)?;
            self.bus.notify_inbox_updated(&input.user_id, Some(item.id));
            return Ok(RouteUserMessageResult {
                decision: RouteDecision::Replied,
            });
        }

        let keywords = extract_keywords(message);

        // Routing pass: a strongly matching active task gets a suggestion
        // instead of a duplicate worker
        let active = self
            .storage
            .list_worker_tasks(&input.user_id, true)
            .await
            .map_err(storage_err)?;
        let best = active
            .iter()
            .map(|t| (keyword_overlap(&keywords, &t.keywords), t))
            .filter(|(score, _)| *score >= ROUTING_THRESHOLD)
            .max_by(|(a, _), (b, _)| a.total_cmp(b));

        if let Some((score, task)) = best {
            let item = QueueItem::new(
                input.thread_id,
                &input.user_id,
                QueueItemType::RoutingSuggestion,
                QueueItemPriority::High,
                "Related task in progress",
                format!(
                    "This sounds related to \"{}\". Route this message to that task?",
                    task.description
                ),
            )
            .with_task(task.id)
            .with_options(vec!["Yes, route it".to_string(), "No, new task".to_string()])
            .with_context("message", json!(message))
            .with_context("confidence", json!(score));
            self.storage
                .create_queue_item(&item)
                .await
                .map_err(storage_err)?;
            self.bus.notify_inbox_updated(&input.user_id, Some(item.id));
            return Ok(RouteUserMessageResult {
                decision: RouteDecision::Suggested { task_id: task.id },
            });
        }

        // Fresh task. Repo: explicit URL in the message wins, else the most
        // recently used repo
        let thread = self
            .storage
            .get_main_thread(input.thread_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| ActivityError::non_retryable("main thread row missing"))?;
        let repo_url = message
            .split_whitespace()
            .find(|w| w.starts_with("https://") || w.starts_with("http://"))
            .map(str::to_string)
            .or_else(|| thread.recent_repos().into_iter().next());

        let mut task = WorkerTask::new(
            input.thread_id,
            &input.user_id,
            TaskType::parse_lenient(
                keywords
                    .iter()
                    .find(|k| ["bug", "fix"].contains(&k.as_str()))
                    .map(|_| "bugfix")
                    .unwrap_or("feature"),
            ),
            message,
            message,
        );
        task.keywords = keywords;
        task.conversation_id = input.payload.conversation_id.clone();
        if let Some(repo_url) = repo_url {
            task.repo_url = Some(repo_url.clone());
            let mut updated = thread.clone();
            updated.push_recent_repo(&repo_url);
            self.storage
                .update_main_thread_context(input.thread_id, updated.context)
                .await
                .map_err(storage_err)?;
        }

        self.storage
            .create_worker_task(&task)
            .await
            .map_err(storage_err)?;
        self.storage
            .add_active_task(input.thread_id, task.id)
            .await
            .map_err(storage_err)?;

        let ack = QueueItem::new(
            input.thread_id,
            &input.user_id,
            QueueItemType::Notification,
            QueueItemPriority::Normal,
            "Task started",
            format!("Working on: {}", task.description),
        )
        .with_task(task.id);
        self.storage
            .create_queue_item(&ack)
            .await
            .map_err(storage_err)?;
        self.bus.notify_inbox_updated(&input.user_id, Some(ack.id));

        info!(task_id = %task.id, "spawning worker task");
        Ok(RouteUserMessageResult {
            decision: RouteDecision::Spawned { task },
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyQueueResponseInput {
    pub thread_id: Uuid,
    pub user_id: String,
    pub payload: QueueResponsePayload,
}

/// A message the main thread should relay to a worker workflow
#[derive(Debug, Serialize, Deserialize)]
pub struct RelaySpec {
    pub task_id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyQueueResponseResult {
    pub relay: Option<RelaySpec>,
}

pub struct ApplyQueueResponse {
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl Activity for ApplyQueueResponse {
    const TYPE: &'static str = names::APPLY_QUEUE_RESPONSE;
    type Input = ApplyQueueResponseInput;
    type Output = ApplyQueueResponseResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let payload = &input.payload;
        let item = self
            .storage
            .respond_queue_item(payload.queue_item_id, &payload.response)
            .await
            .map_err(storage_err)?;
        self.bus.notify_inbox_updated(&input.user_id, Some(item.id));

        let Some(task_id) = payload.task_id.or(item.task_id) else {
            return Ok(ApplyQueueResponseResult { relay: None });
        };

        let relay = match payload.item_type {
            QueueItemType::RoutingSuggestion => {
                let accepted = payload.response.to_lowercase().starts_with("yes");
                accepted
                    .then(|| {
                        item.context.get("message").and_then(|m| m.as_str()).map(
                            |message| RelaySpec {
                                task_id,
                                topic: topics::topic::PLAN_RESPONSE.to_string(),
                                payload: json!({ "action": "revise", "text": message }),
                            },
                        )
                    })
                    .flatten()
            }
            QueueItemType::Question => Some(RelaySpec {
                task_id,
                topic: topics::topic::QUESTION_RESPONSE.to_string(),
                payload: json!({
                    "action": "answer",
                    "answers": HashMap::from([("*".to_string(), payload.response.clone())]),
                }),
            }),
            QueueItemType::PlanReady => {
                let lower = payload.response.to_lowercase();
                let value = if lower.starts_with("approve") {
                    json!({ "action": "approve" })
                } else if lower.starts_with("cancel") {
                    json!({ "action": "cancel" })
                } else {
                    json!({ "action": "revise", "text": payload.response })
                };
                Some(RelaySpec {
                    task_id,
                    topic: topics::topic::PLAN_RESPONSE.to_string(),
                    payload: value,
                })
            }
            QueueItemType::Approval => {
                let lower = payload.response.to_lowercase();
                let action = if lower.starts_with("cancel") { "cancel" } else { "start" };
                Some(RelaySpec {
                    task_id,
                    topic: topics::topic::START_IMPLEMENTATION.to_string(),
                    payload: json!({ "action": action }),
                })
            }
            // Review feedback flows through the forge; other kinds carry no
            // relayable decision
            _ => None,
        };

        Ok(ApplyQueueResponseResult { relay })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordWorkerResultInput {
    pub thread_id: Uuid,
    pub user_id: String,
    pub payload: WorkerResultPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordWorkerResultResult {
    pub item_id: Uuid,
}

pub struct RecordWorkerResult {
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl Activity for RecordWorkerResult {
    const TYPE: &'static str = names::RECORD_WORKER_RESULT;
    type Input = RecordWorkerResultInput;
    type Output = RecordWorkerResultResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let payload = &input.payload;

        let (priority, options) = match payload.kind {
            QueueItemType::Error => (
                QueueItemPriority::Urgent,
                Some(vec!["Retry".to_string(), "Cancel".to_string()]),
            ),
            QueueItemType::Approval => (
                QueueItemPriority::High,
                Some(vec!["Start".to_string(), "Cancel".to_string()]),
            ),
            QueueItemType::Question
            | QueueItemType::PlanReady
            | QueueItemType::CodeReady
            | QueueItemType::Review => (QueueItemPriority::High, None),
            _ => (QueueItemPriority::Normal, None),
        };

        let mut item = QueueItem::new(
            input.thread_id,
            &input.user_id,
            payload.kind,
            priority,
            &payload.title,
            &payload.content,
        )
        .with_task(payload.task_id);
        if let Some(options) = options {
            item = item.with_options(options);
        }
        if let Some(result) = &payload.result {
            item = item.with_context("result", result.clone());
        }

        self.storage
            .create_queue_item(&item)
            .await
            .map_err(storage_err)?;

        // Terminal results leave the active set
        if matches!(
            payload.status,
            WorkerResultStatus::Completed | WorkerResultStatus::Failed | WorkerResultStatus::Cancelled
        ) {
            self.storage
                .remove_active_task(input.thread_id, payload.task_id)
                .await
                .map_err(storage_err)?;
        }

        self.bus.notify_inbox_updated(&input.user_id, Some(item.id));

        Ok(RecordWorkerResultResult { item_id: item.id })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordInboxErrorInput {
    pub thread_id: Uuid,
    pub user_id: String,
    pub title: String,
    pub content: String,
}

pub struct RecordInboxError {
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<EventBus>,
}

#[async_trait]
impl Activity for RecordInboxError {
    const TYPE: &'static str = names::RECORD_INBOX_ERROR;
    type Input = RecordInboxErrorInput;
    type Output = serde_json::Value;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let item = QueueItem::new(
            input.thread_id,
            &input.user_id,
            QueueItemType::Error,
            QueueItemPriority::High,
            &input.title,
            &input.content,
        );
        self.storage
            .create_queue_item(&item)
            .await
            .map_err(storage_err)?;
        self.bus.notify_inbox_updated(&input.user_id, Some(item.id));
        Ok(json!({}))
    }
}
