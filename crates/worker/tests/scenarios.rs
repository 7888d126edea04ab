// End-to-end scenarios: real engine, real workflows, in-memory adapters.
//
// Each test drives the durable runtime explicitly: `idle()` pumps until
// quiescent, `advance(secs)` fires timers/wait deadlines as if that much
// wall-clock time had passed. Executor-job completions arrive the way they
// do in production, as `job_result` messages on the task workflow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use foreman_core::{
    Config, EventBus, QueueItemType, TaskStatus, TaskType, WorkerTask,
};
use foreman_durable::{
    Executor, ExecutorConfig, InMemoryWorkflowStore, QueueConfig, Runtime, RuntimeConfig,
    WorkflowMessage, WorkflowRegistry, WorkflowStatus, WorkflowStore,
};
use foreman_forge::{ArtifactState, CheckOutcome, CheckRun, CheckStatus, InMemoryForge, PrStatus};
use foreman_sandbox::{InMemorySandbox, JobMode};
use foreman_storage::{InboxFilter, InMemoryStorage, Storage};
use foreman_worker::{
    main_thread::{MAIN_THREAD_QUEUE, WORKER_QUEUE},
    Adapters, MainThreadInput, TaskWorkflowInput,
};

const REPO: &str = "https://forge.test/o/r";
const USER: &str = "user-1";
const HANDLE: &str = "@foreman";

struct Harness {
    runtime: Runtime<InMemoryWorkflowStore>,
    store: Arc<InMemoryWorkflowStore>,
    storage: Arc<InMemoryStorage>,
    forge: Arc<InMemoryForge>,
    sandbox: Arc<InMemorySandbox>,
    bus: Arc<EventBus>,
    thread_id: Uuid,
}

impl Harness {
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
        let mut activities = foreman_durable::ActivityRegistry::new();
        foreman_worker::register_activities(&mut activities, &adapters, &config);

        let executor = Arc::new(Executor::new(
            store.clone(),
            Arc::new(workflows),
            ExecutorConfig::new("test-1"),
        ));
        let runtime = Runtime::new(
            executor,
            Arc::new(activities),
            RuntimeConfig {
                queues: vec![
                    QueueConfig::global(WORKER_QUEUE, 3),
                    QueueConfig::partitioned(MAIN_THREAD_QUEUE, 1),
                ],
                ..Default::default()
            },
        );

        // Start the user's main thread so worker results materialize as
        // inbox entries
        let thread_id = Uuid::now_v7();
        let input = MainThreadInput {
            user_id: USER.to_string(),
            thread_id,
            agent_handle: HANDLE.to_string(),
        };
        runtime
            .executor()
            .start_workflow(
                thread_id,
                "main_thread",
                serde_json::to_value(input).expect("input"),
                Some(MAIN_THREAD_QUEUE),
                Some(USER.to_string()),
            )
            .await
            .expect("start main thread");

        let harness = Self {
            runtime,
            store,
            storage,
            forge,
            sandbox,
            bus,
            thread_id,
        };
        harness.idle().await;
        harness
    }

    async fn idle(&self) {
        self.runtime
            .run_until_idle(Utc::now())
            .await
            .expect("runtime idle");
    }

    /// Fire everything due within the next `secs` seconds, then settle
    async fn advance(&self, secs: i64) {
        let later = Utc::now() + chrono::Duration::seconds(secs);
        self.runtime.tick(later).await.expect("tick");
        self.runtime.run_until_idle(later).await.expect("idle");
    }

    async fn create_task(&self, description: &str, skip_plan: bool) -> WorkerTask {
        let task = WorkerTask::new(self.thread_id, USER, TaskType::Feature, description, description)
            .with_repo(REPO)
            .with_skip_plan(skip_plan);
        self.storage.create_worker_task(&task).await.expect("create task");
        task
    }

    async fn start_task(&self, task: &WorkerTask) {
        let input = TaskWorkflowInput {
            task_id: task.id,
            agent_handle: HANDLE.to_string(),
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
            .expect("start task workflow");
        self.idle().await;
    }

    async fn send(&self, workflow_id: Uuid, topic: &str, payload: serde_json::Value) {
        self.runtime
            .executor()
            .send_message(workflow_id, WorkflowMessage::new(topic, payload))
            .await
            .expect("send message");
        self.idle().await;
    }

    async fn job_completed(&self, task_id: Uuid, result: serde_json::Value) {
        self.send(
            task_id,
            "job_result",
            json!({ "status": "completed", "result": result }),
        )
        .await;
    }

    async fn job_failed(&self, task_id: Uuid, error: &str) {
        self.send(
            task_id,
            "job_result",
            json!({ "status": "failed", "error": error }),
        )
        .await;
    }

    async fn task(&self, task_id: Uuid) -> WorkerTask {
        self.storage
            .get_worker_task(task_id)
            .await
            .expect("get task")
            .expect("task exists")
    }

    async fn inbox(&self) -> Vec<foreman_core::QueueItem> {
        self.storage
            .list_queue_items(USER, InboxFilter::default())
            .await
            .expect("inbox")
    }

    async fn inbox_count(&self, kind: QueueItemType) -> usize {
        self.inbox()
            .await
            .iter()
            .filter(|i| i.item_type == kind)
            .count()
    }

    fn open_pr(&self, number: i64) {
        self.forge.set_pr(PrStatus {
            number,
            state: ArtifactState::Open,
            merged: false,
            title: "Add dark mode toggle".to_string(),
            head_branch: "feature/1-add-dark-mode-toggle".to_string(),
            head_sha: "abc123".to_string(),
            base_branch: "main".to_string(),
            url: format!("{REPO}/pull/{number}"),
            mergeable: Some(true),
        });
    }

    /// Drive a fresh task through planning to `waiting_plan_review`
    async fn to_plan_review(&self, description: &str) -> WorkerTask {
        let task = self.create_task(description, false).await;
        self.start_task(&task).await;

        assert_eq!(self.task(task.id).await.status, TaskStatus::Planning);
        assert_eq!(self.sandbox.launches_of(JobMode::Plan).len(), 1);

        self.job_completed(
            task.id,
            json!({ "plan_text": "1. Add the toggle\n2. Wire the preference", "questions": [] }),
        )
        .await;

        assert_eq!(
            self.task(task.id).await.status,
            TaskStatus::WaitingPlanReview
        );
        task
    }

    /// Approve the plan and pass the start gate, landing in the CI loop
    async fn to_ci_loop(&self, task: &WorkerTask) {
        self.send(task.id, "plan_response", json!({ "action": "approve" }))
            .await;
        assert_eq!(
            self.task(task.id).await.status,
            TaskStatus::ReadyToImplement
        );

        self.send(task.id, "start_implementation", json!({ "action": "start" }))
            .await;
        assert_eq!(self.task(task.id).await.status, TaskStatus::Implementing);
        assert_eq!(self.sandbox.launches_of(JobMode::Implement).len(), 1);

        self.open_pr(7);
        self.job_completed(task.id, json!({ "pr_url": format!("{REPO}/pull/7") }))
            .await;

        let loaded = self.task(task.id).await;
        assert_eq!(loaded.pr_number, Some(7));
        assert_eq!(loaded.pr_url.as_deref(), Some("https://forge.test/o/r/pull/7"));
    }
}

// ============================================================================
// S1 — happy path, no questions
// ============================================================================

#[tokio::test]
async fn s1_happy_path_no_questions() {
    let h = Harness::new().await;
    let mut statuses = h.bus.subscribe_user(USER);

    let task = h.to_plan_review("Add dark mode toggle").await;

    // The tracking issue carries the original request
    let issue = h.forge.issue(1).expect("issue created");
    assert!(issue.body.contains("> Add dark mode toggle"));
    assert!(issue.labels.contains(&"foreman".to_string()));

    h.to_ci_loop(&task).await;

    // Branch derived from (issue number, title, type)
    assert_eq!(
        h.task(task.id).await.branch_name.as_deref(),
        Some("feature/1-add-dark-mode-toggle")
    );

    // First check poll: success -> under review
    h.advance(31).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::UnderReview);

    // PR merged -> completed
    h.forge.merge_pr(7);
    h.advance(31).await;

    let done = h.task(task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());

    // Workflow record is terminal and the sandbox was torn down
    let info = h.store.get_workflow_info(task.id).await.expect("info");
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert!(!h.sandbox.exists(task.id));

    // Observed status sequence (deduplicated) matches the state machine
    let mut observed = Vec::new();
    while let Ok(event) = statuses.receiver.try_recv() {
        if event.event == "task:updated" {
            let status = event.data["status"].as_str().unwrap_or_default().to_string();
            if observed.last() != Some(&status) {
                observed.push(status);
            }
        }
    }
    assert_eq!(
        observed,
        vec![
            "planning",
            "waiting_plan_review",
            "ready_to_implement",
            "implementing",
            "under_review",
            "completed",
        ]
    );

    // Exactly one code-ready entry and one completion entry
    assert_eq!(h.inbox_count(QueueItemType::CodeReady).await, 1);
    let completions = h
        .inbox()
        .await
        .into_iter()
        .filter(|i| i.item_type == QueueItemType::Notification && i.title == "Task completed")
        .count();
    assert_eq!(completions, 1);
}

// ============================================================================
// S2 — revision cycle
// ============================================================================

#[tokio::test]
async fn s2_revision_cycle() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;

    h.send(
        task.id,
        "plan_response",
        json!({ "action": "revise", "text": "Use system preference" }),
    )
    .await;

    // Second plan job launched with the revision feedback
    let plan_jobs = h.sandbox.launches_of(JobMode::Plan);
    assert_eq!(plan_jobs.len(), 2);
    assert!(plan_jobs[1]
        .spec
        .feedback_context
        .as_deref()
        .unwrap_or_default()
        .contains("Use system preference"));
    // Each launch has a distinct identity
    assert_ne!(plan_jobs[0].spec.iteration, plan_jobs[1].spec.iteration);

    assert_eq!(h.task(task.id).await.status, TaskStatus::Planning);

    h.job_completed(
        task.id,
        json!({ "plan_text": "1. Follow the system preference", "questions": [] }),
    )
    .await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::WaitingPlanReview);

    h.send(task.id, "plan_response", json!({ "action": "approve" }))
        .await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::ReadyToImplement);
}

// ============================================================================
// S3 — CI fix loop
// ============================================================================

#[tokio::test]
async fn s3_ci_fix_loop() {
    let h = Harness::new().await;

    // First poll fails, second succeeds
    h.forge.push_check_status(CheckStatus {
        overall: CheckOutcome::Failure,
        runs: vec![],
        failed: vec![CheckRun {
            name: "lint".to_string(),
            completed: true,
            conclusion: Some("failure".to_string()),
            details_url: None,
            output_title: None,
            output_summary: Some("LINT: missing semicolon".to_string()),
        }],
    });
    h.forge.push_check_status(CheckStatus {
        overall: CheckOutcome::Success,
        runs: vec![],
        failed: vec![],
    });

    let task = h.to_plan_review("Add dark mode toggle").await;
    h.to_ci_loop(&task).await;

    // Failure poll -> exactly one fix job, carrying the failure logs
    h.advance(31).await;
    let fix_jobs = h.sandbox.launches_of(JobMode::Fix);
    assert_eq!(fix_jobs.len(), 1);
    assert!(fix_jobs[0]
        .spec
        .feedback_context
        .as_deref()
        .unwrap_or_default()
        .contains("LINT: missing semicolon"));
    assert_eq!(h.task(task.id).await.status, TaskStatus::Implementing);

    // Fix job finishes, next poll is green
    h.job_completed(task.id, json!({})).await;
    h.advance(31).await;

    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::UnderReview);
    assert_eq!(h.sandbox.launches_of(JobMode::Fix).len(), 1);
}

// ============================================================================
// S4 — cancel during plan review
// ============================================================================

#[tokio::test]
async fn s4_cancel_during_plan_review() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;
    let launches_before = h.sandbox.launches().len();

    h.send(task.id, "plan_response", json!({ "action": "cancel" }))
        .await;

    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::Cancelled);

    // Issue closed with the standard comment
    let issue = h.forge.issue(1).expect("issue");
    assert_eq!(issue.state, ArtifactState::Closed);
    let comments = h.forge.issue_comments(1);
    assert!(comments
        .iter()
        .any(|c| c.body.contains("❌ Task cancelled by user.")));

    // No further executor jobs, sandbox torn down, workflow terminal
    assert_eq!(h.sandbox.launches().len(), launches_before);
    assert!(!h.sandbox.exists(task.id));
    let info = h.store.get_workflow_info(task.id).await.expect("info");
    assert_eq!(info.status, WorkflowStatus::Completed);
}

// ============================================================================
// S5 — dual-source approval race
// ============================================================================

#[tokio::test]
async fn s5_dual_source_approval_race() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;

    // The plan comment is on the issue; the user reacts on the forge side
    let plan_comment = h
        .forge
        .issue_comments(1)
        .into_iter()
        .find(|c| c.body.contains("Proposed Implementation Plan"))
        .expect("plan comment");
    h.forge.user_reaction(plan_comment.id, "+1", "alice");

    // The in-app approval lands first
    h.send(task.id, "plan_response", json!({ "action": "approve" }))
        .await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::ReadyToImplement);

    // The forge-side signal changes nothing: still exactly one transition
    h.advance(15).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::ReadyToImplement);
    assert_eq!(h.sandbox.launches_of(JobMode::Plan).len(), 1);
    assert_eq!(h.sandbox.launches_of(JobMode::Implement).len(), 0);
}

#[tokio::test]
async fn s5b_forge_side_approval_via_reaction() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;

    let plan_comment = h
        .forge
        .issue_comments(1)
        .into_iter()
        .find(|c| c.body.contains("Proposed Implementation Plan"))
        .expect("plan comment");
    h.forge.user_reaction(plan_comment.id, "rocket", "alice");

    // No in-app message; the first poll timeout reads the reaction
    h.advance(11).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::ReadyToImplement);
}

#[tokio::test]
async fn forge_side_revision_via_command_comment() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;

    h.forge
        .user_issue_comment(1, "alice", "/revise Use system preference");

    h.advance(11).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::Planning);

    let plan_jobs = h.sandbox.launches_of(JobMode::Plan);
    assert_eq!(plan_jobs.len(), 2);
    assert!(plan_jobs[1]
        .spec
        .feedback_context
        .as_deref()
        .unwrap_or_default()
        .contains("Use system preference"));
}

// ============================================================================
// S6 — resume with existing PR
// ============================================================================

#[tokio::test]
async fn s6_resume_with_existing_pr() {
    let h = Harness::new().await;

    let task = h.create_task("Add dark mode toggle", false).await;
    h.storage
        .update_worker_task(
            task.id,
            foreman_core::WorkerTaskPatch {
                status: Some(TaskStatus::UnderReview),
                pr_number: Some(42),
                pr_url: Some(format!("{REPO}/pull/42")),
                ..Default::default()
            },
        )
        .await
        .expect("seed task");
    h.open_pr(42);

    h.start_task(&task).await;

    // Straight into the review loop: no plan, no implement job
    assert!(h.sandbox.launches_of(JobMode::Plan).is_empty());
    assert!(h.sandbox.launches_of(JobMode::Implement).is_empty());
    assert_eq!(h.forge.issue_count(), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::UnderReview);

    // Merge completes the task
    h.forge.merge_pr(42);
    h.advance(31).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::Completed);
}

// ============================================================================
// Question round
// ============================================================================

#[tokio::test]
async fn question_round_roundtrip() {
    let h = Harness::new().await;
    let task = h.create_task("Add dark mode toggle", false).await;
    h.start_task(&task).await;

    h.job_completed(
        task.id,
        json!({
            "plan_text": "draft",
            "questions": [{
                "id": "q-1",
                "header": "Default theme",
                "question": "Which theme should be the default?",
                "options": [],
                "multi_select": false,
            }],
        }),
    )
    .await;

    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::WaitingQuestions);
    assert_eq!(loaded.pending_questions.len(), 1);

    // Answer in-app: back to planning with the answer folded in
    h.send(
        task.id,
        "question_response",
        json!({ "action": "answer", "answers": { "q-1": "system preference" } }),
    )
    .await;

    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::Planning);
    assert!(loaded.pending_questions.is_empty());
    assert_eq!(
        loaded.context.get("Default theme").map(String::as_str),
        Some("system preference")
    );

    // Second plan round carries the Q/A as feedback
    let plan_jobs = h.sandbox.launches_of(JobMode::Plan);
    assert_eq!(plan_jobs.len(), 2);
    assert!(plan_jobs[1]
        .spec
        .feedback_context
        .as_deref()
        .unwrap_or_default()
        .contains("system preference"));

    // The issue body now lists the requirement
    let issue = h.forge.issue(1).expect("issue");
    assert!(issue.body.contains("- Default theme: system preference"));
}

#[tokio::test]
async fn question_answers_from_forge_comment() {
    let h = Harness::new().await;
    let task = h.create_task("Add dark mode toggle", false).await;
    h.start_task(&task).await;

    h.job_completed(
        task.id,
        json!({
            "plan_text": "draft",
            "questions": [{
                "id": "q-1",
                "header": "Default theme",
                "question": "Which theme should be the default?",
                "options": [],
                "multi_select": false,
            }],
        }),
    )
    .await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::WaitingQuestions);

    h.forge.user_issue_comment(1, "alice", "1. dark only");

    h.advance(11).await;
    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::Planning);
    assert_eq!(
        loaded.context.get("Default theme").map(String::as_str),
        Some("dark only")
    );
}

// ============================================================================
// Job retries and the CI iteration cap
// ============================================================================

#[tokio::test]
async fn job_failure_retries_then_fails_task() {
    let h = Harness::new().await;
    let task = h.create_task("Add dark mode toggle", false).await;
    h.start_task(&task).await;

    // Initial attempt + 5 retries, every one failing
    for attempt in 0..6 {
        assert_eq!(h.sandbox.launches_of(JobMode::Plan).len(), attempt + 1);
        h.job_failed(task.id, "agent crashed").await;
        // Cross the retry backoff (2..32s)
        h.advance(40).await;
    }

    let loaded = h.task(task.id).await;
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert!(loaded.error.as_deref().unwrap_or_default().contains("agent crashed"));

    // Every launch had a distinct iteration
    let iterations: Vec<u32> = h
        .sandbox
        .launches_of(JobMode::Plan)
        .iter()
        .map(|l| l.spec.iteration)
        .collect();
    let mut deduped = iterations.clone();
    deduped.dedup();
    assert_eq!(iterations.len(), 6);
    assert_eq!(iterations, deduped);

    // Failure materializes as an urgent error inbox entry
    assert_eq!(h.inbox_count(QueueItemType::Error).await, 1);
}

#[tokio::test]
async fn ci_loop_fails_after_iteration_cap() {
    let h = Harness::new().await;

    // Checks never go green
    for _ in 0..7 {
        h.forge.push_check_status(CheckStatus {
            overall: CheckOutcome::Failure,
            runs: vec![],
            failed: vec![CheckRun {
                name: "test".to_string(),
                completed: true,
                conclusion: Some("failure".to_string()),
                details_url: None,
                output_title: None,
                output_summary: Some("3 tests failed".to_string()),
            }],
        });
    }

    let task = h.to_plan_review("Add dark mode toggle").await;
    h.to_ci_loop(&task).await;

    // Five failure polls each spawn a fix job; the sixth fails the task
    for _ in 0..5 {
        h.advance(31).await;
        h.job_completed(task.id, json!({})).await;
    }
    h.advance(31).await;

    assert_eq!(h.sandbox.launches_of(JobMode::Fix).len(), 5);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Failed);
}

// ============================================================================
// Code review feedback
// ============================================================================

#[tokio::test]
async fn review_feedback_spawns_feedback_job_and_acknowledges() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;
    h.to_ci_loop(&task).await;
    h.advance(31).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::UnderReview);

    // One actionable mention, one ignorable aside
    let actionable = h
        .forge
        .user_pr_comment(7, "alice", "@foreman please rename the flag", false);
    h.forge.user_pr_comment(7, "bob", "nice work", false);

    h.advance(31).await;

    let feedback_jobs = h.sandbox.launches_of(JobMode::Feedback);
    assert_eq!(feedback_jobs.len(), 1);
    let context = feedback_jobs[0].spec.feedback_context.clone().unwrap_or_default();
    assert!(context.contains("rename the flag"));
    assert!(!context.contains("nice work"));

    // Actionable comment acknowledged with the eyes reaction
    assert!(h
        .forge
        .reactions(actionable)
        .iter()
        .any(|r| r.kind == "eyes"));

    // Round trip: back under review, feedback-addressed entry filed
    h.job_completed(task.id, json!({})).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::UnderReview);
    assert_eq!(h.inbox_count(QueueItemType::FeedbackAddressed).await, 1);
}

#[tokio::test]
async fn closed_unmerged_pr_cancels_task() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;
    h.to_ci_loop(&task).await;
    h.advance(31).await;

    h.forge.close_pr(7);
    h.advance(31).await;

    assert_eq!(h.task(task.id).await.status, TaskStatus::Cancelled);
}

// ============================================================================
// Re-entry, skip-plan and the main-thread router
// ============================================================================

#[tokio::test]
async fn reentering_terminal_task_is_noop() {
    let h = Harness::new().await;
    let task = h.create_task("already done", false).await;
    h.storage
        .update_worker_task(
            task.id,
            foreman_core::WorkerTaskPatch {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .expect("seed");

    h.start_task(&task).await;

    // No sandbox, no jobs, workflow completed immediately
    assert!(h.sandbox.launches().is_empty());
    assert!(!h.sandbox.exists(task.id));
    let info = h.store.get_workflow_info(task.id).await.expect("info");
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn skip_plan_goes_straight_to_implementation() {
    let h = Harness::new().await;
    let task = h.create_task("Add dark mode toggle", true).await;
    h.start_task(&task).await;

    assert!(h.sandbox.launches_of(JobMode::Plan).is_empty());
    assert_eq!(h.sandbox.launches_of(JobMode::Implement).len(), 1);
    assert_eq!(h.forge.issue_count(), 0);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Implementing);
}

#[tokio::test]
async fn user_message_spawns_worker_through_router() {
    let h = Harness::new().await;

    h.send(
        h.thread_id,
        "user_message",
        json!({ "message": format!("implement a dark mode toggle in {REPO}"), "conversation_id": null }),
    )
    .await;

    // The router created and started a worker task
    let tasks = h.storage.list_worker_tasks(USER, true).await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.repo_url.as_deref(), Some(REPO));

    let info = h.store.get_workflow_info(task.id).await.expect("workflow");
    assert!(!info.status.is_terminal());

    // Acknowledgement inbox entry exists and the thread tracks the task
    let thread = h
        .storage
        .get_main_thread(h.thread_id)
        .await
        .expect("thread")
        .expect("exists");
    assert!(thread.active_task_ids.contains(&task.id));
    assert!(h
        .inbox()
        .await
        .iter()
        .any(|i| i.title == "Task started"));
}

#[tokio::test]
async fn conversational_message_gets_reply_not_worker() {
    let h = Harness::new().await;

    h.send(
        h.thread_id,
        "user_message",
        json!({ "message": "hello there", "conversation_id": null }),
    )
    .await;

    let tasks = h.storage.list_worker_tasks(USER, true).await.expect("tasks");
    assert!(tasks.is_empty());
    assert!(h.inbox().await.iter().any(|i| i.title == "Response"));
}

#[tokio::test]
async fn inbox_approval_response_relays_start_to_worker() {
    let h = Harness::new().await;
    let task = h.to_plan_review("Add dark mode toggle").await;

    h.send(task.id, "plan_response", json!({ "action": "approve" }))
        .await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::ReadyToImplement);

    // The approval inbox entry the worker emitted
    let approval = h
        .inbox()
        .await
        .into_iter()
        .find(|i| i.item_type == QueueItemType::Approval)
        .expect("approval entry");

    // Responding "Start" through the router relays start_implementation
    h.send(
        h.thread_id,
        "queue_response",
        json!({
            "queue_item_id": approval.id,
            "response": "Start",
            "task_id": task.id,
            "item_type": "approval",
            "context": {},
        }),
    )
    .await;

    assert_eq!(h.task(task.id).await.status, TaskStatus::Implementing);
}
