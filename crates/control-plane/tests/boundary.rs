// Boundary validation tests
//
// Invalid state transitions are rejected here, before anything reaches a
// workflow; valid decisions and callbacks are relayed as typed messages.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use uuid::Uuid;

use foreman_control_plane::{app, AppState};
use foreman_core::{Config, EventBus, TaskStatus, TaskType, WorkerTask, WorkerTaskPatch};
use foreman_durable::{
    ActivityRegistry, Executor, ExecutorConfig, InMemoryWorkflowStore, QueueConfig, Runtime,
    RuntimeConfig, WorkflowRegistry,
};
use foreman_forge::InMemoryForge;
use foreman_sandbox::InMemorySandbox;
use foreman_storage::{InMemoryStorage, Storage};
use foreman_worker::main_thread::{MAIN_THREAD_QUEUE, WORKER_QUEUE};
use foreman_worker::{Adapters, TaskWorkflowInput};

struct Fixture {
    router: axum::Router,
    runtime: Runtime<InMemoryWorkflowStore>,
    storage: Arc<InMemoryStorage>,
    forge: Arc<InMemoryForge>,
}

impl Fixture {
    async fn new() -> Self {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let storage = Arc::new(InMemoryStorage::new());
        let forge = Arc::new(InMemoryForge::new());
        let sandbox = Arc::new(InMemorySandbox::new());
        let bus = Arc::new(EventBus::new());

        let adapters = Adapters {
            storage: storage.clone(),
            forge: forge.clone(),
            sandbox: sandbox.clone(),
            bus: bus.clone(),
        };
        let config = Config::default();

        let mut workflows = WorkflowRegistry::new();
        foreman_worker::register_workflows(&mut workflows);
        let mut activities = ActivityRegistry::new();
        foreman_worker::register_activities(&mut activities, &adapters, &config);

        let executor = Arc::new(Executor::new(
            store,
            Arc::new(workflows),
            ExecutorConfig::new("test-1"),
        ));
        let runtime = Runtime::new(
            executor.clone(),
            Arc::new(activities),
            RuntimeConfig {
                queues: vec![
                    QueueConfig::global(WORKER_QUEUE, 3),
                    QueueConfig::partitioned(MAIN_THREAD_QUEUE, 1),
                ],
                ..Default::default()
            },
        );

        let state = AppState {
            engine: executor,
            storage: storage.clone(),
            forge: forge.clone(),
            sandbox,
            bus,
            config: Arc::new(config),
        };

        Self {
            router: app(state),
            runtime,
            storage,
            forge,
        }
    }

    async fn idle(&self) {
        self.runtime
            .run_until_idle(chrono::Utc::now())
            .await
            .expect("idle");
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        user: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    /// Seed a task row and run its workflow until it reaches plan review
    async fn task_in_plan_review(&self) -> WorkerTask {
        let thread = foreman_core::MainThread::new("user-1");
        self.storage.create_main_thread(&thread).await.expect("thread");

        let task = WorkerTask::new(
            thread.id,
            "user-1",
            TaskType::Feature,
            "Add dark mode toggle",
            "Add dark mode toggle",
        )
        .with_repo("https://forge.test/o/r");
        self.storage.create_worker_task(&task).await.expect("task");

        let input = TaskWorkflowInput {
            task_id: task.id,
            agent_handle: "@foreman".to_string(),
        };
        self.runtime
            .executor()
            .start_workflow(
                task.id,
                "task_workflow",
                serde_json::to_value(input).expect("input"),
                None,
                None,
            )
            .await
            .expect("start");
        self.idle().await;

        // Plan job completes via the callback route
        let (status, _) = self
            .request(
                "POST",
                &format!("/internal/tasks/{}/complete", task.id),
                None,
                Some(json!({
                    "task_id": task.id,
                    "status": "completed",
                    "result": { "plan_text": "1. do it", "questions": [] },
                })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        self.idle().await;

        let loaded = self
            .storage
            .get_worker_task(task.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.status, TaskStatus::WaitingPlanReview);
        loaded
    }
}

#[tokio::test]
async fn health_endpoint() {
    let f = Fixture::new().await;
    let (status, body) = f.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn messages_require_identity() {
    let f = Fixture::new().await;
    let (status, _) = f
        .request("POST", "/messages", None, Some(json!({ "message": "hi" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn message_creates_thread_and_accepts() {
    let f = Fixture::new().await;
    let (status, body) = f
        .request(
            "POST",
            "/messages",
            Some("user-1"),
            Some(json!({ "message": "hello" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let thread_id: Uuid = serde_json::from_value(body["thread_id"].clone()).expect("thread id");

    // The thread row exists and is bound to the workflow id
    let thread = f
        .storage
        .get_main_thread(thread_id)
        .await
        .expect("get")
        .expect("created");
    assert_eq!(thread.user_id, "user-1");

    // A second message reuses the same thread
    let (_, body) = f
        .request(
            "POST",
            "/messages",
            Some("user-1"),
            Some(json!({ "message": "again" })),
        )
        .await;
    assert_eq!(body["thread_id"], json!(thread_id));
}

#[tokio::test]
async fn plan_response_rejected_outside_plan_review() {
    let f = Fixture::new().await;

    let thread = foreman_core::MainThread::new("user-1");
    f.storage.create_main_thread(&thread).await.expect("thread");
    let task = WorkerTask::new(
        thread.id,
        "user-1",
        TaskType::Feature,
        "Add dark mode toggle",
        "Add dark mode toggle",
    );
    f.storage.create_worker_task(&task).await.expect("task");

    // Task is pending: a plan response is an invalid transition
    let (status, body) = f
        .request(
            "POST",
            &format!("/tasks/{}/plan-response", task.id),
            None,
            Some(json!({ "action": "approve" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap_or_default().contains("pending"));
}

#[tokio::test]
async fn plan_response_approve_relays_to_workflow() {
    let f = Fixture::new().await;
    let task = f.task_in_plan_review().await;

    let (status, _) = f
        .request(
            "POST",
            &format!("/tasks/{}/plan-response", task.id),
            None,
            Some(json!({ "action": "approve" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    f.idle().await;

    let loaded = f
        .storage
        .get_worker_task(task.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded.status, TaskStatus::ReadyToImplement);
}

#[tokio::test]
async fn revise_requires_text() {
    let f = Fixture::new().await;
    let task = f.task_in_plan_review().await;

    let (status, _) = f
        .request(
            "POST",
            &format!("/tasks/{}/plan-response", task.id),
            None,
            Some(json!({ "action": "revise" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn question_response_rejected_outside_waiting_questions() {
    let f = Fixture::new().await;
    let task = f.task_in_plan_review().await;

    let (status, _) = f
        .request(
            "POST",
            &format!("/tasks/{}/question-response", task.id),
            None,
            Some(json!({ "action": "answer", "answers": { "q-1": "yes" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn callback_rejects_task_id_mismatch() {
    let f = Fixture::new().await;
    let task = f.task_in_plan_review().await;

    let (status, _) = f
        .request(
            "POST",
            &format!("/internal/tasks/{}/complete", task.id),
            None,
            Some(json!({
                "task_id": Uuid::now_v7(),
                "status": "completed",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn callback_for_unknown_workflow_is_not_found() {
    let f = Fixture::new().await;
    let bogus = Uuid::now_v7();

    let (status, _) = f
        .request(
            "POST",
            &format!("/internal/tasks/{bogus}/complete"),
            None,
            Some(json!({ "task_id": bogus, "status": "completed" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_closes_forge_artifacts_and_task() {
    let f = Fixture::new().await;
    let task = f.task_in_plan_review().await;

    let (status, _) = f
        .request("POST", &format!("/tasks/{}/cancel", task.id), None, None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let loaded = f
        .storage
        .get_worker_task(task.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(loaded.status, TaskStatus::Cancelled);
    assert!(loaded.completed_at.is_some());

    // Issue closed with the standard comment
    let issue = f.forge.issue(1).expect("issue");
    assert_eq!(issue.state, foreman_forge::ArtifactState::Closed);
    assert!(f
        .forge
        .issue_comments(1)
        .iter()
        .any(|c| c.body.contains("❌ Task cancelled by user.")));

    // Cancelling again conflicts
    let (status, _) = f
        .request("POST", &format!("/tasks/{}/cancel", task.id), None, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn terminal_cancel_does_not_resurrect_task() {
    let f = Fixture::new().await;
    let thread = foreman_core::MainThread::new("user-1");
    f.storage.create_main_thread(&thread).await.expect("thread");
    let task = WorkerTask::new(
        thread.id,
        "user-1",
        TaskType::Feature,
        "done",
        "done",
    );
    f.storage.create_worker_task(&task).await.expect("task");
    f.storage
        .update_worker_task(
            task.id,
            WorkerTaskPatch {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .expect("seed");

    let (status, _) = f
        .request("POST", &format!("/tasks/{}/cancel", task.id), None, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
