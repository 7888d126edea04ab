// HTTP routes
//
// Decision endpoints validate the target task's state here, at the boundary,
// before anything is sent into the durable runtime — an invalid transition
// (e.g. a plan response for a task that isn't waiting for plan review) never
// reaches a workflow.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use foreman_core::topics::{
    topic, JobStatus, PlanAction, QuestionAction, QueueResponsePayload, StartAction,
};
use foreman_core::{MainThread, QueueItem, QueueItemStatus, TaskStatus, WorkerTask, WorkerTaskPatch};
use foreman_durable::{ExecutorError, StoreError, WorkflowMessage};
use foreman_storage::InboxFilter;
use foreman_worker::main_thread::MAIN_THREAD_QUEUE;
use foreman_worker::MainThreadInput;

use crate::state::AppState;

/// Comment left on forge artifacts when a task is cancelled
const CANCELLED_COMMENT: &str = "❌ Task cancelled by user.";

/// Build the API router
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/messages", post(post_message))
        .route("/inbox", get(list_inbox))
        .route("/inbox/:item_id/respond", post(respond_inbox_item))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/plan-response", post(plan_response))
        .route("/tasks/:task_id/question-response", post(question_response))
        .route(
            "/tasks/:task_id/start-implementation",
            post(start_implementation),
        )
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/internal/tasks/:task_id/complete", post(job_complete))
        .with_state(state)
}

/// Error body returned by every failing route
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

fn engine_error(e: ExecutorError) -> (StatusCode, Json<ApiError>) {
    match &e {
        ExecutorError::WorkflowCompleted(_) => {
            api_error(StatusCode::CONFLICT, "workflow already finished")
        }
        ExecutorError::WorkflowNotFound(_)
        | ExecutorError::Store(StoreError::WorkflowNotFound(_)) => {
            api_error(StatusCode::NOT_FOUND, "workflow not found")
        }
        _ => {
            warn!(error = %e, "engine call failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    warn!(error = %e, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Resolve the caller from the `X-User-ID` header
///
/// Authentication itself is out of scope; an ingress in front of this
/// service is expected to have verified the identity.
fn user_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing X-User-ID header"))
}

async fn load_task(state: &AppState, task_id: Uuid) -> ApiResult<WorkerTask> {
    state
        .storage
        .get_worker_task(task_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "task not found"))
}

fn require_status(task: &WorkerTask, expected: TaskStatus) -> ApiResult<()> {
    if task.status != expected {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!(
                "task is {}, expected {expected} for this action",
                task.status
            ),
        ));
    }
    Ok(())
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Conversation entry
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct PostMessageRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PostMessageResponse {
    pub thread_id: Uuid,
}

/// Deliver a user message to the user's main-thread workflow, creating the
/// thread (and its workflow) on first contact
#[utoipa::path(
    post,
    path = "/messages",
    request_body = PostMessageRequest,
    responses(
        (status = 202, body = PostMessageResponse),
        (status = 401, body = ApiError)
    )
)]
pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PostMessageRequest>,
) -> ApiResult<(StatusCode, Json<PostMessageResponse>)> {
    let user_id = user_id(&headers)?;

    // One thread per user; the record id doubles as the workflow id
    let thread = match state
        .storage
        .get_main_thread_by_user(&user_id)
        .await
        .map_err(internal)?
    {
        Some(thread) => thread,
        None => {
            let thread = MainThread::new(&user_id);
            state
                .storage
                .create_main_thread(&thread)
                .await
                .map_err(internal)?;
            thread
        }
    };

    let input = MainThreadInput {
        user_id: user_id.clone(),
        thread_id: thread.id,
        agent_handle: state.config.agent_handle.clone(),
    };
    state
        .engine
        .start_workflow(
            thread.id,
            "main_thread",
            serde_json::to_value(input).map_err(internal)?,
            Some(MAIN_THREAD_QUEUE),
            Some(user_id.clone()),
        )
        .await
        .map_err(engine_error)?;

    state
        .engine
        .send_message(
            thread.id,
            WorkflowMessage::new(
                topic::USER_MESSAGE,
                json!({
                    "message": request.message,
                    "conversation_id": request.conversation_id,
                }),
            ),
        )
        .await
        .map_err(engine_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PostMessageResponse {
            thread_id: thread.id,
        }),
    ))
}

// ============================================================================
// Inbox
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub items: Vec<QueueItem>,
    pub unread_count: i64,
}

#[utoipa::path(
    get,
    path = "/inbox",
    responses((status = 200), (status = 401, body = ApiError))
)]
pub async fn list_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<InboxQuery>,
) -> ApiResult<Json<InboxResponse>> {
    let user_id = user_id(&headers)?;

    let items = state
        .storage
        .list_queue_items(
            &user_id,
            InboxFilter {
                unread_only: query.unread,
                created_after: query.since,
                ..Default::default()
            },
        )
        .await
        .map_err(internal)?;
    let unread_count = state.storage.unread_count(&user_id).await.map_err(internal)?;

    Ok(Json(InboxResponse {
        items,
        unread_count,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RespondRequest {
    pub response: String,
}

/// Answer an inbox entry; the response is routed through the user's
/// main-thread workflow, which relays decisions to the owning task
#[utoipa::path(
    post,
    path = "/inbox/{item_id}/respond",
    request_body = RespondRequest,
    responses(
        (status = 202),
        (status = 404, body = ApiError),
        (status = 409, body = ApiError)
    )
)]
pub async fn respond_inbox_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<StatusCode> {
    let item = state
        .storage
        .get_queue_item(item_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "inbox entry not found"))?;

    if item.status != QueueItemStatus::Pending {
        return Err(api_error(
            StatusCode::CONFLICT,
            "inbox entry already resolved",
        ));
    }

    state
        .storage
        .mark_queue_item_read(item_id)
        .await
        .map_err(internal)?;

    let payload = QueueResponsePayload {
        queue_item_id: item.id,
        response: request.response,
        task_id: item.task_id,
        item_type: item.item_type,
        context: item.context.clone(),
    };
    state
        .engine
        .send_message(
            item.main_thread_id,
            WorkflowMessage::new(
                topic::QUEUE_RESPONSE,
                serde_json::to_value(payload).map_err(internal)?,
            ),
        )
        .await
        .map_err(engine_error)?;

    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    #[serde(default)]
    pub active: bool,
}

#[utoipa::path(
    get,
    path = "/tasks",
    responses((status = 200), (status = 401, body = ApiError))
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Json<Vec<WorkerTask>>> {
    let user_id = user_id(&headers)?;
    let tasks = state
        .storage
        .list_worker_tasks(&user_id, query.active)
        .await
        .map_err(internal)?;
    Ok(Json(tasks))
}

#[utoipa::path(
    get,
    path = "/tasks/{task_id}",
    responses((status = 200), (status = 404, body = ApiError))
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<WorkerTask>> {
    Ok(Json(load_task(&state, task_id).await?))
}

// ============================================================================
// Task decisions
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct PlanResponseRequest {
    #[schema(value_type = String)]
    pub action: PlanAction,
    #[serde(default)]
    pub text: Option<String>,
}

#[utoipa::path(
    post,
    path = "/tasks/{task_id}/plan-response",
    request_body = PlanResponseRequest,
    responses((status = 202), (status = 404, body = ApiError), (status = 409, body = ApiError))
)]
pub async fn plan_response(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<PlanResponseRequest>,
) -> ApiResult<StatusCode> {
    let task = load_task(&state, task_id).await?;
    require_status(&task, TaskStatus::WaitingPlanReview)?;

    if request.action == PlanAction::Revise && request.text.as_deref().unwrap_or("").is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "revision requires feedback text",
        ));
    }

    state
        .engine
        .send_message(
            task_id,
            WorkflowMessage::new(
                topic::PLAN_RESPONSE,
                json!({ "action": request.action, "text": request.text }),
            ),
        )
        .await
        .map_err(engine_error)?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QuestionResponseRequest {
    #[schema(value_type = String)]
    pub action: QuestionAction,
    #[serde(default)]
    pub answers: std::collections::HashMap<String, String>,
}

#[utoipa::path(
    post,
    path = "/tasks/{task_id}/question-response",
    request_body = QuestionResponseRequest,
    responses((status = 202), (status = 404, body = ApiError), (status = 409, body = ApiError))
)]
pub async fn question_response(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<QuestionResponseRequest>,
) -> ApiResult<StatusCode> {
    let task = load_task(&state, task_id).await?;
    require_status(&task, TaskStatus::WaitingQuestions)?;

    if request.action == QuestionAction::Answer && request.answers.is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "answers are required",
        ));
    }

    state
        .engine
        .send_message(
            task_id,
            WorkflowMessage::new(
                topic::QUESTION_RESPONSE,
                json!({ "action": request.action, "answers": request.answers }),
            ),
        )
        .await
        .map_err(engine_error)?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartImplementationRequest {
    #[schema(value_type = String)]
    pub action: StartAction,
}

#[utoipa::path(
    post,
    path = "/tasks/{task_id}/start-implementation",
    request_body = StartImplementationRequest,
    responses((status = 202), (status = 404, body = ApiError), (status = 409, body = ApiError))
)]
pub async fn start_implementation(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<StartImplementationRequest>,
) -> ApiResult<StatusCode> {
    let task = load_task(&state, task_id).await?;
    require_status(&task, TaskStatus::ReadyToImplement)?;

    state
        .engine
        .send_message(
            task_id,
            WorkflowMessage::new(
                topic::START_IMPLEMENTATION,
                json!({ "action": request.action }),
            ),
        )
        .await
        .map_err(engine_error)?;

    Ok(StatusCode::ACCEPTED)
}

/// Cancel a task
///
/// The workflow is cancelled first (eliminating write contention), then the
/// boundary performs the terminal write and closes the forge artifacts with
/// the standard comment.
#[utoipa::path(
    post,
    path = "/tasks/{task_id}/cancel",
    responses((status = 202), (status = 404, body = ApiError), (status = 409, body = ApiError))
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let task = load_task(&state, task_id).await?;
    if task.status.is_terminal() {
        return Err(api_error(StatusCode::CONFLICT, "task already finished"));
    }

    state
        .engine
        .cancel_workflow(task_id, "cancelled by user")
        .await
        .map_err(engine_error)?;

    state
        .storage
        .update_worker_task(
            task_id,
            WorkerTaskPatch {
                status: Some(TaskStatus::Cancelled),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .map_err(internal)?;

    // Forge and sandbox cleanup is best-effort
    if let Some(repo_url) = &task.repo_url {
        if let Some(issue_number) = task.issue_number {
            if let Err(e) = state
                .forge
                .add_issue_comment(repo_url, issue_number, CANCELLED_COMMENT)
                .await
            {
                warn!(error = %e, issue_number, "failed to comment on issue");
            }
            if let Err(e) = state
                .forge
                .update_issue(
                    repo_url,
                    issue_number,
                    foreman_forge::IssuePatch {
                        state: Some(foreman_forge::ArtifactState::Closed),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(error = %e, issue_number, "failed to close issue");
            }
        }
        if let Some(pr_number) = task.pr_number {
            if let Err(e) = state
                .forge
                .add_issue_comment(repo_url, pr_number, CANCELLED_COMMENT)
                .await
            {
                warn!(error = %e, pr_number, "failed to comment on PR");
            }
            if let Err(e) = state.forge.close_pr(repo_url, pr_number).await {
                warn!(error = %e, pr_number, "failed to close PR");
            }
        }
    }
    if let Err(e) = state.sandbox.destroy(task_id).await {
        warn!(error = %e, "failed to tear down sandbox on cancel");
    }

    state
        .storage
        .remove_active_task(task.main_thread_id, task_id)
        .await
        .map_err(internal)?;
    state
        .bus
        .notify_task_updated(&task.user_id, task_id, "cancelled");

    info!(%task_id, "task cancelled via API");
    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// Executor-job callback
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobCompleteRequest {
    pub task_id: Uuid,
    #[schema(value_type = String)]
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The one-shot result POST every executor job makes; translated into a
/// `job_result` message for the task's workflow
#[utoipa::path(
    post,
    path = "/internal/tasks/{task_id}/complete",
    request_body = JobCompleteRequest,
    responses(
        (status = 202),
        (status = 404, body = ApiError),
        (status = 422, body = ApiError)
    )
)]
pub async fn job_complete(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<JobCompleteRequest>,
) -> ApiResult<StatusCode> {
    if request.task_id != task_id {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "task id mismatch between path and body",
        ));
    }

    state
        .engine
        .send_message(
            task_id,
            WorkflowMessage::new(
                topic::JOB_RESULT,
                json!({
                    "status": request.status,
                    "result": request.result,
                    "error": request.error,
                }),
            ),
        )
        .await
        .map_err(engine_error)?;

    info!(%task_id, status = ?request.status, "executor job reported result");
    Ok(StatusCode::ACCEPTED)
}
