// Worker-task workflow
//
// Drives one agent task through its state machine:
//
//   pending -> planning -> (waiting_questions -> planning)* ->
//   waiting_plan_review -> ready_to_implement -> implementing ->
//   under_review -> completed | failed | cancelled
//
// The workflow owns the correlation between executor-job results (arriving
// as `job_result` messages via the callback), forge signals (comments and
// reactions, fetched by activities) and in-app decisions (typed messages).
// Every user-decision wait is dual-source: the first valid signal from
// either channel wins and queued duplicates on the decision topic are
// drained so they cannot leak into a later phase.
//
// A task loaded with an existing PR resumes directly in the code-review
// loop with `task.created_at` as the comments-since watermark, which makes
// the workflow self-resuming across redeploys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use foreman_core::derive_branch_name;
use foreman_core::topics::{
    topic, JobResultPayload, JobStatus, PlanAction, PlanResponsePayload, QuestionAction,
    QuestionResponsePayload, StartAction, StartImplementationPayload, WorkerResultPayload,
    WorkerResultStatus,
};
use foreman_core::{QueueItemType, TaskQuestion, TaskStatus, WorkerTask, WorkerTaskPatch};
use foreman_durable::{
    ActivityError, ActivityOptions, RetryPolicy, Workflow, WorkflowAction, WorkflowError,
    WorkflowMessage,
};
use foreman_forge::{
    is_actionable_feedback, is_approval_reaction, parse_answer_block, parse_command, CheckOutcome,
    CheckStatus, Comment, IssueBody, IssueCommand,
};
use foreman_sandbox::JobMode;

use crate::activities::{self, names};

/// Maximum executor-job launch attempts per round (initial + retries)
const MAX_JOB_RETRIES: u32 = 5;

/// Base of the job-retry backoff: 2, 4, 8, 16, 32 seconds
const JOB_RETRY_BASE_SECS: u64 = 2;

/// How long to wait for one executor job's callback
const JOB_RESULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Total budget for any user-decision wait
const DECISION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Dual-source poll: initial interval, growth factor 1.5, cap
const POLL_INITIAL_MS: u64 = 10_000;
const POLL_CAP_MS: u64 = 300_000;

/// PR status / check polling interval
const PR_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum CI fix jobs before the task fails
const MAX_CI_ITERATIONS: u32 = 5;

/// Sandbox teardown attempts
const CLEANUP_RETRIES: u32 = 3;

/// Comment posted when the user cancels
const CANCELLED_COMMENT: &str = "❌ Task cancelled by user.";

/// Label applied to tracking issues
const ISSUE_LABEL: &str = "foreman";

/// Input to the worker-task workflow; the workflow id is the task id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowInput {
    pub task_id: uuid::Uuid,
    /// Handle whose mentions make PR comments actionable
    pub agent_handle: String,
}

/// Terminal summary returned by the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowOutput {
    pub status: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Which user decision a dual-source poll is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Answers to clarifying questions
    Questions,
    /// Plan approval / revision
    PlanReview,
    /// The explicit start-implementation gate
    StartGate,
}

impl Decision {
    fn topic(&self) -> &'static str {
        match self {
            Self::Questions => topic::QUESTION_RESPONSE,
            Self::PlanReview => topic::PLAN_RESPONSE,
            Self::StartGate => topic::START_IMPLEMENTATION,
        }
    }
}

/// State of an in-flight dual-source poll
#[derive(Debug, Clone)]
struct PollState {
    decision: Decision,
    /// Comments after this instant count as new
    watermark: DateTime<Utc>,
    /// Poll budget exhaustion point
    deadline: DateTime<Utc>,
    /// Current wait interval (grows 1.5x, capped)
    interval_ms: u64,
    /// Plan comment whose reactions may approve
    comment_id: Option<i64>,
}

/// How the workflow is finishing
#[derive(Debug, Clone)]
enum Finish {
    Completed { result: serde_json::Value },
    Cancelled,
    Failed { error: String },
    /// PR vanished: leave the task untouched, tear down and exit
    Abandoned { reason: String },
}

/// Worker-task workflow state machine
pub struct TaskWorkflow {
    input: TaskWorkflowInput,
    seq: u32,

    task: Option<WorkerTask>,
    sandbox_id: Option<String>,
    resume_review: bool,

    // Planning
    plan_feedback: Vec<String>,
    plan_text: Option<String>,
    pending_questions: Vec<TaskQuestion>,
    requirements: Vec<(String, String)>,

    // Executor jobs
    job_mode: Option<JobMode>,
    job_attempt: u32,
    iterations: HashMap<String, u32>,

    // Decision polling
    poll: Option<PollState>,

    // CI and review
    ci_fixes: u32,
    last_check: Option<DateTime<Utc>>,

    // Termination
    finishing: Option<Finish>,
    done: bool,
}

impl TaskWorkflow {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn id_prefix(activity_id: &str) -> &str {
        activity_id
            .rsplit_once('-')
            .map(|(prefix, _)| prefix)
            .unwrap_or(activity_id)
    }

    fn task(&self) -> &WorkerTask {
        self.task.as_ref().expect("task loaded before use")
    }

    fn repo_url(&self) -> String {
        self.task().repo_url.clone().unwrap_or_default()
    }

    fn next_iteration(&mut self, mode: JobMode) -> u32 {
        let counter = self.iterations.entry(mode.as_str().to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    // =========================================================================
    // Activity builders
    // =========================================================================

    fn update_task(&mut self, tag: &str, input: activities::UpdateTaskInput) -> WorkflowAction {
        let id = self.next_id(tag);
        WorkflowAction::activity(
            id,
            names::UPDATE_TASK,
            serde_json::to_value(input).unwrap_or_default(),
        )
    }

    fn plain_update(&mut self, patch: WorkerTaskPatch) -> WorkflowAction {
        let task_id = self.input.task_id;
        self.update_task(
            "utask",
            activities::UpdateTaskInput {
                task_id,
                patch,
                set_started_now: false,
                set_completed_now: false,
            },
        )
    }

    fn send_worker_result(
        &mut self,
        status: WorkerResultStatus,
        kind: QueueItemType,
        title: impl Into<String>,
        content: impl Into<String>,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> WorkflowAction {
        let payload = WorkerResultPayload {
            task_id: self.input.task_id,
            status,
            kind,
            title: title.into(),
            content: content.into(),
            result,
            error,
        };
        WorkflowAction::send(
            self.task().main_thread_id,
            WorkflowMessage::new(
                topic::WORKER_RESULT,
                serde_json::to_value(payload).unwrap_or_default(),
            ),
        )
    }

    fn launch_job(&mut self, mode: JobMode, feedback_context: Option<String>) -> Vec<WorkflowAction> {
        let iteration = self.next_iteration(mode);
        self.job_mode = Some(mode);
        self.job_attempt += 1;

        let task = self.task().clone();
        let prompt = match mode {
            JobMode::Implement => match &self.plan_text {
                Some(plan) => format!("{}\n\n## Approved Plan\n{plan}", task.prompt),
                None => task.prompt.clone(),
            },
            _ => task.prompt.clone(),
        };

        let input = activities::LaunchJobInput {
            task_id: task.id,
            sandbox_id: self.sandbox_id.clone().unwrap_or_default(),
            mode,
            iteration,
            prompt,
            model: task.model.clone(),
            repo_url: task.repo_url.clone(),
            issue_number: self.issue_number(),
            pr_number: task.pr_number,
            branch_name: task.branch_name.clone(),
            feedback_context,
        };

        let id = self.next_id("launch-job");
        vec![WorkflowAction::activity(
            id,
            names::LAUNCH_JOB,
            serde_json::to_value(input).unwrap_or_default(),
        )]
    }

    fn issue_number(&self) -> Option<i64> {
        self.task.as_ref().and_then(|t| t.issue_number)
    }

    fn wait_for_job(&mut self) -> WorkflowAction {
        let id = self.next_id("job-wait");
        WorkflowAction::wait(id, Some(topic::JOB_RESULT), JOB_RESULT_TIMEOUT)
    }

    fn issue_body(&self, status: &str, with_plan: bool) -> String {
        let mut body = IssueBody::new(
            self.task().description.clone(),
            self.input.task_id,
            status,
        );
        for (key, value) in &self.requirements {
            body.set_requirement(key.clone(), value.clone());
        }
        if with_plan {
            body.plan = self.plan_text.clone();
        }
        body.render()
    }

    fn start_decision_poll(&mut self, decision: Decision, watermark: DateTime<Utc>, comment_id: Option<i64>) -> Vec<WorkflowAction> {
        self.poll = Some(PollState {
            decision,
            watermark,
            deadline: watermark
                + chrono::Duration::from_std(DECISION_TIMEOUT).unwrap_or_default(),
            interval_ms: POLL_INITIAL_MS,
            comment_id,
        });
        let id = self.next_id("decision-wait");
        vec![WorkflowAction::wait(
            id,
            Some(decision.topic()),
            Duration::from_millis(POLL_INITIAL_MS),
        )]
    }

    // =========================================================================
    // Phase transitions
    // =========================================================================

    fn begin_planning_round(&mut self) -> Vec<WorkflowAction> {
        self.job_attempt = 0;
        let feedback = if self.plan_feedback.is_empty() {
            None
        } else {
            Some(self.plan_feedback.join("\n\n---\n\n"))
        };
        self.launch_job(JobMode::Plan, feedback)
    }

    fn begin_implementation(&mut self) -> Vec<WorkflowAction> {
        let branch_name = self.ensure_branch_name();
        let mut actions = vec![self.update_task(
            "utask",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch {
                    status: Some(TaskStatus::Implementing),
                    branch_name: Some(branch_name),
                    ..Default::default()
                },
                set_started_now: self.task().started_at.is_none(),
                set_completed_now: false,
            },
        )];
        self.job_attempt = 0;
        actions.extend(self.launch_job(JobMode::Implement, None));
        actions
    }

    fn ensure_branch_name(&mut self) -> String {
        if let Some(branch) = self.task().branch_name.clone() {
            return branch;
        }
        let task = self.task();
        let branch = match task.issue_number {
            Some(issue_number) => {
                derive_branch_name(issue_number, &task.description, task.task_type)
            }
            // Plan-skipping tasks have no issue; slug off the task id instead
            None => {
                let derived = derive_branch_name(0, &task.description, task.task_type);
                let task8 = &task.id.simple().to_string()[..8];
                derived.replacen("/0", &format!("/{task8}"), 1)
            }
        };
        if let Some(task) = self.task.as_mut() {
            task.branch_name = Some(branch.clone());
        }
        branch
    }

    fn enter_ci_loop(&mut self) -> Vec<WorkflowAction> {
        let id = self.next_id("ci-poll");
        vec![WorkflowAction::timer(id, PR_POLL_INTERVAL)]
    }

    fn enter_review_loop(&mut self) -> Vec<WorkflowAction> {
        let id = self.next_id("review-poll");
        vec![WorkflowAction::timer(id, PR_POLL_INTERVAL)]
    }

    // =========================================================================
    // Terminal handling
    // =========================================================================

    fn finish(&mut self, finish: Finish) -> Vec<WorkflowAction> {
        self.poll = None;
        self.finishing = Some(finish.clone());

        match &finish {
            Finish::Cancelled => {
                // Close the tracking issue first, then write the terminal row
                if let Some(issue_number) = self.issue_number() {
                    let input = activities::CloseIssueInput {
                        repo_url: self.repo_url(),
                        number: issue_number,
                        comment: CANCELLED_COMMENT.to_string(),
                    };
                    let id = self.next_id("close-issue");
                    return vec![WorkflowAction::activity(
                        id,
                        names::CLOSE_ISSUE,
                        serde_json::to_value(input).unwrap_or_default(),
                    )];
                }
                self.terminal_update()
            }
            Finish::Abandoned { .. } => self.teardown(),
            _ => self.terminal_update(),
        }
    }

    fn terminal_update(&mut self) -> Vec<WorkflowAction> {
        let Some(finish) = self.finishing.clone() else {
            return vec![];
        };

        let patch = match &finish {
            Finish::Completed { result } => WorkerTaskPatch {
                status: Some(TaskStatus::Completed),
                result: Some(result.clone()),
                ..Default::default()
            },
            Finish::Cancelled => WorkerTaskPatch {
                status: Some(TaskStatus::Cancelled),
                ..Default::default()
            },
            Finish::Failed { error } => WorkerTaskPatch {
                status: Some(TaskStatus::Failed),
                error: Some(error.clone()),
                ..Default::default()
            },
            Finish::Abandoned { .. } => return self.teardown(),
        };

        vec![self.update_task(
            "utask-terminal",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch,
                set_started_now: false,
                set_completed_now: true,
            },
        )]
    }

    fn teardown(&mut self) -> Vec<WorkflowAction> {
        let input = activities::DestroySandboxInput {
            task_id: self.input.task_id,
        };
        let id = self.next_id("destroy-sandbox");
        vec![WorkflowAction::activity_with(
            id,
            names::DESTROY_SANDBOX,
            serde_json::to_value(input).unwrap_or_default(),
            ActivityOptions::default().with_retry(
                RetryPolicy::exponential()
                    .with_max_attempts(CLEANUP_RETRIES)
                    .with_initial_interval(Duration::from_secs(2)),
            ),
        )]
    }

    fn conclude(&mut self) -> Vec<WorkflowAction> {
        self.done = true;
        let Some(finish) = self.finishing.clone() else {
            return vec![WorkflowAction::complete(json!({ "status": "done" }))];
        };

        match finish {
            Finish::Completed { result } => {
                vec![WorkflowAction::complete(json!({
                    "status": "completed",
                    "result": result,
                }))]
            }
            Finish::Cancelled => {
                vec![WorkflowAction::complete(json!({ "status": "cancelled" }))]
            }
            Finish::Abandoned { reason } => {
                vec![WorkflowAction::complete(json!({
                    "status": "abandoned",
                    "reason": reason,
                }))]
            }
            Finish::Failed { error } => vec![WorkflowAction::fail(
                WorkflowError::new(error).with_code("TASK_FAILED"),
            )],
        }
    }

    /// Notification sent to the main thread alongside the terminal update
    fn terminal_notification(&mut self) -> Option<WorkflowAction> {
        let finish = self.finishing.clone()?;
        let task = self.task.as_ref()?;
        let description = task.description.clone();
        let pr_url = task.pr_url.clone();

        Some(match finish {
            Finish::Completed { result } => self.send_worker_result(
                WorkerResultStatus::Completed,
                QueueItemType::Notification,
                "Task completed",
                format!(
                    "\"{description}\" is done{}",
                    pr_url
                        .as_deref()
                        .map(|url| format!(": {url} merged"))
                        .unwrap_or_default()
                ),
                Some(result),
                None,
            ),
            Finish::Cancelled => self.send_worker_result(
                WorkerResultStatus::Cancelled,
                QueueItemType::Notification,
                "Task cancelled",
                format!("\"{description}\" was cancelled"),
                None,
                None,
            ),
            Finish::Failed { error } => self.send_worker_result(
                WorkerResultStatus::Failed,
                QueueItemType::Error,
                "Task failed",
                format!("\"{description}\" failed: {error}"),
                None,
                Some(error),
            ),
            Finish::Abandoned { .. } => return None,
        })
    }

    // =========================================================================
    // Executor-job result handling
    // =========================================================================

    fn on_job_result(&mut self, payload: JobResultPayload) -> Vec<WorkflowAction> {
        match payload.status {
            JobStatus::Completed => {
                self.job_attempt = 0;
                let result = payload.result.unwrap_or(serde_json::Value::Null);
                match self.job_mode {
                    Some(JobMode::Plan) => self.on_plan_result(result),
                    Some(JobMode::Implement) => self.on_implement_result(result),
                    Some(JobMode::Fix) => {
                        // Give CI a beat before re-polling
                        self.enter_ci_loop()
                    }
                    Some(JobMode::Feedback) => self.on_feedback_addressed(),
                    None => vec![],
                }
            }
            JobStatus::Failed => {
                self.retry_or_fail(payload.error.unwrap_or_else(|| "executor job failed".into()))
            }
        }
    }

    fn retry_or_fail(&mut self, error: String) -> Vec<WorkflowAction> {
        // MAX_JOB_RETRIES retries on top of the initial attempt
        if self.job_attempt > MAX_JOB_RETRIES {
            return self.finish(Finish::Failed {
                error: format!("executor job failed after {MAX_JOB_RETRIES} retries: {error}"),
            });
        }

        // Exponential backoff: 2, 4, 8, 16, 32 seconds
        let delay = Duration::from_secs(JOB_RETRY_BASE_SECS.saturating_pow(self.job_attempt));
        let id = self.next_id("retry");
        vec![WorkflowAction::timer(id, delay)]
    }

    fn on_plan_result(&mut self, result: serde_json::Value) -> Vec<WorkflowAction> {
        let Some(plan_text) = result
            .get("plan_text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return self.retry_or_fail("plan job returned no plan".into());
        };
        let questions: Vec<TaskQuestion> = result
            .get("questions")
            .cloned()
            .map(|q| serde_json::from_value(q).unwrap_or_default())
            .unwrap_or_default();

        self.plan_text = Some(plan_text);

        if questions.is_empty() {
            self.enter_plan_review()
        } else {
            self.enter_questions(questions)
        }
    }

    fn enter_questions(&mut self, questions: Vec<TaskQuestion>) -> Vec<WorkflowAction> {
        self.pending_questions = questions.clone();

        let mut actions = vec![self.update_task(
            "utask",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch {
                    status: Some(TaskStatus::WaitingQuestions),
                    pending_questions: Some(questions.clone()),
                    ..Default::default()
                },
                set_started_now: false,
                set_completed_now: false,
            },
        )];

        if let Some(issue_number) = self.issue_number() {
            let input = activities::PostIssueCommentInput {
                repo_url: self.repo_url(),
                number: issue_number,
                body: format_questions_comment(&questions),
            };
            let id = self.next_id("post-comment-questions");
            actions.push(WorkflowAction::activity(
                id,
                names::POST_ISSUE_COMMENT,
                serde_json::to_value(input).unwrap_or_default(),
            ));
        }

        let summary = questions
            .iter()
            .map(|q| q.question.clone())
            .collect::<Vec<_>>()
            .join(" · ");
        actions.push(self.send_worker_result(
            WorkerResultStatus::Notification,
            QueueItemType::Question,
            "Worker needs input",
            summary,
            None,
            None,
        ));

        actions
    }

    fn enter_plan_review(&mut self) -> Vec<WorkflowAction> {
        let mut actions = vec![self.update_task(
            "utask",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch {
                    status: Some(TaskStatus::WaitingPlanReview),
                    plan_text: self.plan_text.clone(),
                    ..Default::default()
                },
                set_started_now: false,
                set_completed_now: false,
            },
        )];

        if let Some(issue_number) = self.issue_number() {
            let body_input = activities::UpdateIssueBodyInput {
                repo_url: self.repo_url(),
                number: issue_number,
                body: self.issue_body("waiting_plan_review", true),
            };
            let id = self.next_id("issue-body");
            actions.push(WorkflowAction::activity(
                id,
                names::UPDATE_ISSUE_BODY,
                serde_json::to_value(body_input).unwrap_or_default(),
            ));

            let comment_input = activities::PostIssueCommentInput {
                repo_url: self.repo_url(),
                number: issue_number,
                body: format_plan_comment(self.plan_text.as_deref().unwrap_or_default()),
            };
            let id = self.next_id("post-comment-plan");
            actions.push(WorkflowAction::activity(
                id,
                names::POST_ISSUE_COMMENT,
                serde_json::to_value(comment_input).unwrap_or_default(),
            ));
        }

        actions.push(self.send_worker_result(
            WorkerResultStatus::Notification,
            QueueItemType::PlanReady,
            "Plan ready for review",
            self.plan_text.clone().unwrap_or_default(),
            None,
            None,
        ));

        actions
    }

    fn on_implement_result(&mut self, result: serde_json::Value) -> Vec<WorkflowAction> {
        let Some((pr_number, pr_url)) = extract_pr_reference(&result) else {
            return self.retry_or_fail("implement job produced no pull request".into());
        };

        if let Some(task) = self.task.as_mut() {
            task.pr_number = Some(pr_number);
            task.pr_url = Some(pr_url.clone());
        }
        self.ci_fixes = 0;

        let mut actions = vec![self.plain_update(WorkerTaskPatch {
            pr_number: Some(pr_number),
            pr_url: Some(pr_url),
            ..Default::default()
        })];
        actions.extend(self.enter_ci_loop());
        actions
    }

    fn on_feedback_addressed(&mut self) -> Vec<WorkflowAction> {
        vec![self.update_task(
            "utask-review",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch::status(TaskStatus::UnderReview),
                set_started_now: false,
                set_completed_now: false,
            },
        )]
    }

    // =========================================================================
    // Decision handling (in-app and forge-side converge here)
    // =========================================================================

    fn apply_question_answers(&mut self, answers: HashMap<String, String>) -> Vec<WorkflowAction> {
        let wildcard = answers.get("*").cloned();
        let questions = std::mem::take(&mut self.pending_questions);
        for question in &questions {
            let answer = answers
                .get(&question.id)
                .cloned()
                .or_else(|| wildcard.clone());
            if let Some(answer) = answer {
                self.requirements.push((question.header.clone(), answer.clone()));
                self.plan_feedback
                    .push(format!("Q: {}\nA: {answer}", question.question));
            }
        }

        let context: HashMap<String, String> = self.requirements.iter().cloned().collect();
        let mut actions = vec![self.update_task(
            "utask",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch {
                    status: Some(TaskStatus::Planning),
                    pending_questions: Some(vec![]),
                    context: Some(context),
                    ..Default::default()
                },
                set_started_now: false,
                set_completed_now: false,
            },
        )];

        if let Some(issue_number) = self.issue_number() {
            let input = activities::UpdateIssueBodyInput {
                repo_url: self.repo_url(),
                number: issue_number,
                body: self.issue_body("planning", false),
            };
            let id = self.next_id("issue-body");
            actions.push(WorkflowAction::activity(
                id,
                names::UPDATE_ISSUE_BODY,
                serde_json::to_value(input).unwrap_or_default(),
            ));
        }

        actions.extend(self.begin_planning_round());
        actions
    }

    fn apply_plan_decision(&mut self, action: PlanAction, text: Option<String>) -> Vec<WorkflowAction> {
        match action {
            PlanAction::Approve => self.approve_plan(),
            PlanAction::Revise => {
                if let Some(text) = text {
                    self.plan_feedback.push(text);
                }
                let mut actions = vec![self.plain_update(WorkerTaskPatch::status(TaskStatus::Planning))];
                actions.extend(self.begin_planning_round());
                actions
            }
            PlanAction::Cancel => self.finish(Finish::Cancelled),
        }
    }

    fn approve_plan(&mut self) -> Vec<WorkflowAction> {
        let branch_name = self.ensure_branch_name();
        let mut actions = vec![self.update_task(
            "utask-ready",
            activities::UpdateTaskInput {
                task_id: self.input.task_id,
                patch: WorkerTaskPatch {
                    status: Some(TaskStatus::ReadyToImplement),
                    branch_name: Some(branch_name),
                    ..Default::default()
                },
                set_started_now: false,
                set_completed_now: false,
            },
        )];
        actions.push(self.send_worker_result(
            WorkerResultStatus::Notification,
            QueueItemType::Approval,
            "Ready to implement",
            format!("Plan approved for \"{}\". Start implementation?", self.task().description),
            None,
            None,
        ));
        actions
    }

    fn apply_start_decision(&mut self, action: StartAction) -> Vec<WorkflowAction> {
        match action {
            StartAction::Start => self.begin_implementation(),
            StartAction::Cancel => self.finish(Finish::Cancelled),
        }
    }

    /// Interpret fetched forge signals for the current poll; `None` means no
    /// valid signal appeared
    fn forge_decision(
        &self,
        poll: &PollState,
        comments: &[Comment],
        plan_reactions: &[foreman_forge::Reaction],
    ) -> Option<ForgeSignal> {
        match poll.decision {
            Decision::Questions => {
                for comment in comments {
                    let parsed = parse_answer_block(&comment.body);
                    if !parsed.is_empty() {
                        let mut answers = HashMap::new();
                        for (index, answer) in parsed {
                            if let Some(question) = self.pending_questions.get(index - 1) {
                                answers.insert(question.id.clone(), answer);
                            }
                        }
                        if !answers.is_empty() {
                            return Some(ForgeSignal::Answers(answers));
                        }
                    }
                }
                None
            }
            Decision::PlanReview => {
                for comment in comments {
                    match parse_command(&comment.body) {
                        Some(IssueCommand::ApprovePlan) => return Some(ForgeSignal::Approve),
                        Some(IssueCommand::RevisePlan(text)) => {
                            return Some(ForgeSignal::Revise(text))
                        }
                        None => {}
                    }
                }
                if plan_reactions.iter().any(|r| is_approval_reaction(&r.kind)) {
                    return Some(ForgeSignal::Approve);
                }
                None
            }
            Decision::StartGate => {
                for comment in comments {
                    if matches!(parse_command(&comment.body), Some(IssueCommand::ApprovePlan)) {
                        return Some(ForgeSignal::Start);
                    }
                }
                None
            }
        }
    }

    fn apply_forge_signal(&mut self, signal: ForgeSignal) -> Vec<WorkflowAction> {
        let drained_topic = self.poll.as_ref().map(|p| p.decision.topic().to_string());
        self.poll = None;

        // The forge won this race: discard any queued in-app duplicate so it
        // cannot leak into a later phase
        let mut actions = Vec::new();
        if let Some(drained_topic) = drained_topic {
            actions.push(WorkflowAction::DrainMessages {
                topic: drained_topic,
            });
        }

        actions.extend(match signal {
            ForgeSignal::Answers(answers) => self.apply_question_answers(answers),
            ForgeSignal::Approve => self.apply_plan_decision(PlanAction::Approve, None),
            ForgeSignal::Revise(text) => {
                self.apply_plan_decision(PlanAction::Revise, Some(text))
            }
            ForgeSignal::Start => self.apply_start_decision(StartAction::Start),
        });
        actions
    }

    // =========================================================================
    // CI and review handling
    // =========================================================================

    fn on_check_status(&mut self, status: CheckStatus) -> Vec<WorkflowAction> {
        match status.overall {
            CheckOutcome::Success => {
                vec![self.update_task(
                    "utask-review",
                    activities::UpdateTaskInput {
                        task_id: self.input.task_id,
                        patch: WorkerTaskPatch::status(TaskStatus::UnderReview),
                        set_started_now: false,
                        set_completed_now: false,
                    },
                )]
            }
            CheckOutcome::Pending => self.enter_ci_loop(),
            CheckOutcome::Failure => {
                if self.ci_fixes >= MAX_CI_ITERATIONS {
                    return self.finish(Finish::Failed {
                        error: format!("checks still failing after {MAX_CI_ITERATIONS} fix attempts"),
                    });
                }
                self.ci_fixes += 1;

                let input = activities::FetchCheckLogsInput {
                    repo_url: self.repo_url(),
                    number: self.task().pr_number.unwrap_or_default(),
                };
                let id = self.next_id("fetch-logs");
                vec![WorkflowAction::activity(
                    id,
                    names::FETCH_CHECK_LOGS,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }
        }
    }

    fn on_pr_status(&mut self, result: activities::FetchPrStatusResult) -> Vec<WorkflowAction> {
        let Some(pr) = result.pr else {
            return self.finish(Finish::Abandoned {
                reason: "pull request not found".into(),
            });
        };

        if pr.merged {
            let pr_url = pr.url.clone();
            if let Some(task) = self.task.as_mut() {
                task.commit_sha = Some(pr.head_sha.clone());
            }
            return self.finish(Finish::Completed {
                result: json!({
                    "pr_url": pr_url,
                    "pr_number": pr.number,
                    "commit_sha": pr.head_sha,
                }),
            });
        }

        if pr.state == foreman_forge::ArtifactState::Closed {
            return self.finish(Finish::Cancelled);
        }

        // Still open: look for new feedback since the watermark
        let since = self.last_check.unwrap_or(self.task().created_at);
        let input = activities::FetchPrFeedbackInput {
            repo_url: self.repo_url(),
            number: pr.number,
            since,
        };
        let id = self.next_id("fetch-feedback");
        vec![WorkflowAction::activity(
            id,
            names::FETCH_PR_FEEDBACK,
            serde_json::to_value(input).unwrap_or_default(),
        )]
    }

    fn on_pr_feedback(&mut self, result: activities::FetchPrFeedbackResult) -> Vec<WorkflowAction> {
        let actionable: Vec<Comment> = result
            .comments
            .iter()
            .filter(|c| is_actionable_feedback(c, &self.input.agent_handle))
            .cloned()
            .collect();

        if actionable.is_empty() {
            return self.enter_review_loop();
        }

        self.last_check = Some(result.fetched_at);

        let ack_input = activities::AcknowledgeCommentsInput {
            repo_url: self.repo_url(),
            comments: actionable.iter().map(|c| (c.id, c.is_review_comment)).collect(),
        };
        let ack_id = self.next_id("ack-comments");

        let feedback = foreman_forge::format_feedback(&actionable, &self.input.agent_handle);

        let mut actions = vec![
            WorkflowAction::activity(
                ack_id,
                names::ACKNOWLEDGE_COMMENTS,
                serde_json::to_value(ack_input).unwrap_or_default(),
            ),
            self.plain_update(WorkerTaskPatch::status(TaskStatus::Implementing)),
        ];
        self.job_attempt = 0;
        actions.extend(self.launch_job(JobMode::Feedback, Some(feedback)));
        actions
    }
}

/// A decision observed on the forge side
enum ForgeSignal {
    Answers(HashMap<String, String>),
    Approve,
    Revise(String),
    Start,
}

impl Workflow for TaskWorkflow {
    const TYPE: &'static str = "task_workflow";
    type Input = TaskWorkflowInput;
    type Output = TaskWorkflowOutput;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            seq: 0,
            task: None,
            sandbox_id: None,
            resume_review: false,
            plan_feedback: vec![],
            plan_text: None,
            pending_questions: vec![],
            requirements: vec![],
            job_mode: None,
            job_attempt: 0,
            iterations: HashMap::new(),
            poll: None,
            ci_fixes: 0,
            last_check: None,
            finishing: None,
            done: false,
        }
    }

    fn on_start(&mut self) -> Vec<WorkflowAction> {
        let input = activities::LoadTaskInput {
            task_id: self.input.task_id,
        };
        let id = self.next_id("load-task");
        vec![WorkflowAction::activity(
            id,
            names::LOAD_TASK,
            serde_json::to_value(input).unwrap_or_default(),
        )]
    }

    fn on_activity_completed(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        match Self::id_prefix(activity_id) {
            "load-task" => {
                let loaded: activities::LoadTaskResult = match serde_json::from_value(result) {
                    Ok(loaded) => loaded,
                    Err(_) => {
                        return vec![WorkflowAction::fail(WorkflowError::new(
                            "malformed load_task result",
                        ))]
                    }
                };

                let Some(task) = loaded.task else {
                    self.done = true;
                    return vec![WorkflowAction::fail(
                        WorkflowError::new("task not found").with_code("TASK_NOT_FOUND"),
                    )];
                };

                // Re-entering a terminal task is a no-op
                if task.status.is_terminal() {
                    self.done = true;
                    return vec![WorkflowAction::complete(json!({
                        "status": task.status.to_string(),
                        "noop": true,
                    }))];
                }

                if task.repo_url.is_none() {
                    self.task = Some(task);
                    return self.finish(Finish::Failed {
                        error: "task has no repository".into(),
                    });
                }

                self.resume_review = task.pr_number.is_some();
                self.plan_text = task.plan_text.clone();
                self.requirements = task
                    .context
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.task = Some(task);

                let input = activities::CreateSandboxInput {
                    task_id: self.input.task_id,
                };
                let id = self.next_id("create-sandbox");
                vec![WorkflowAction::activity(
                    id,
                    names::CREATE_SANDBOX,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            "create-sandbox" => {
                let created: activities::CreateSandboxResult =
                    match serde_json::from_value(result) {
                        Ok(created) => created,
                        Err(_) => {
                            return self.finish(Finish::Failed {
                                error: "malformed create_sandbox result".into(),
                            })
                        }
                    };
                self.sandbox_id = Some(created.sandbox_id);

                if self.resume_review {
                    // Self-resume: straight into the code-review loop with the
                    // task's creation time as the comments watermark
                    self.last_check = Some(self.task().created_at);
                    let mut actions =
                        vec![self.plain_update(WorkerTaskPatch::status(TaskStatus::UnderReview))];
                    actions.extend(self.enter_review_loop());
                    return actions;
                }

                if self.task().skip_plan {
                    return self.begin_implementation();
                }

                let task = self.task().clone();
                let title: String = task.description.chars().take(80).collect();
                let input = activities::CreateIssueInput {
                    repo_url: self.repo_url(),
                    title,
                    body: self.issue_body("planning", false),
                    labels: vec![ISSUE_LABEL.to_string()],
                };
                let id = self.next_id("create-issue");
                vec![WorkflowAction::activity(
                    id,
                    names::CREATE_ISSUE,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            "create-issue" => {
                let issue: activities::CreateIssueResult = match serde_json::from_value(result) {
                    Ok(issue) => issue,
                    Err(_) => {
                        return self.finish(Finish::Failed {
                            error: "malformed create_issue result".into(),
                        })
                    }
                };

                if let Some(task) = self.task.as_mut() {
                    task.issue_number = Some(issue.number);
                    task.issue_url = Some(issue.url.clone());
                }

                let mut actions = vec![self.update_task(
                    "utask",
                    activities::UpdateTaskInput {
                        task_id: self.input.task_id,
                        patch: WorkerTaskPatch {
                            status: Some(TaskStatus::Planning),
                            issue_number: Some(issue.number),
                            issue_url: Some(issue.url),
                            ..Default::default()
                        },
                        set_started_now: true,
                        set_completed_now: false,
                    },
                )];
                actions.extend(self.begin_planning_round());
                actions
            }

            "launch-job" => {
                // Job is running; wait for its callback
                vec![self.wait_for_job()]
            }

            // Question/plan comments start the dual-source poll with the
            // posting time as watermark
            "post-comment-questions" => {
                let posted: activities::PostIssueCommentResult =
                    match serde_json::from_value(result) {
                        Ok(posted) => posted,
                        Err(_) => return vec![],
                    };
                self.start_decision_poll(Decision::Questions, posted.posted_at, None)
            }

            "post-comment-plan" => {
                let posted: activities::PostIssueCommentResult =
                    match serde_json::from_value(result) {
                        Ok(posted) => posted,
                        Err(_) => return vec![],
                    };
                self.start_decision_poll(
                    Decision::PlanReview,
                    posted.posted_at,
                    Some(posted.comment_id),
                )
            }

            // Plan approved and recorded: open the explicit start gate
            "utask-ready" => {
                let updated: activities::UpdateTaskResult = match serde_json::from_value(result) {
                    Ok(updated) => updated,
                    Err(_) => return vec![],
                };
                self.start_decision_poll(Decision::StartGate, updated.applied_at, None)
            }

            // Entered (or returned to) under_review
            "utask-review" => {
                let updated: activities::UpdateTaskResult = match serde_json::from_value(result) {
                    Ok(updated) => updated,
                    Err(_) => return vec![],
                };
                let first_entry = self.last_check.is_none();
                self.last_check = Some(updated.applied_at);

                let mut actions = Vec::new();
                if first_entry {
                    let pr_url = self.task().pr_url.clone().unwrap_or_default();
                    actions.push(self.send_worker_result(
                        WorkerResultStatus::Notification,
                        QueueItemType::CodeReady,
                        "PR ready for review",
                        format!("Pull request ready: {pr_url}"),
                        None,
                        None,
                    ));
                } else {
                    actions.push(self.send_worker_result(
                        WorkerResultStatus::Notification,
                        QueueItemType::FeedbackAddressed,
                        "Feedback addressed",
                        format!(
                            "Review feedback on \"{}\" has been addressed",
                            self.task().description
                        ),
                        None,
                        None,
                    ));
                }
                actions.extend(self.enter_review_loop());
                actions
            }

            "fetch-signals" => {
                let signals: activities::FetchIssueSignalsResult =
                    match serde_json::from_value(result) {
                        Ok(signals) => signals,
                        Err(_) => return vec![],
                    };
                let Some(poll) = self.poll.clone() else {
                    return vec![];
                };

                if let Some(signal) =
                    self.forge_decision(&poll, &signals.comments, &signals.plan_reactions)
                {
                    return self.apply_forge_signal(signal);
                }

                // No signal: give up at the deadline, otherwise back off and
                // re-arm the in-app wait
                if signals.fetched_at >= poll.deadline {
                    return self.finish(Finish::Failed {
                        error: "timed out waiting for user decision".into(),
                    });
                }

                let interval_ms = (poll.interval_ms * 3 / 2).min(POLL_CAP_MS);
                if let Some(state) = self.poll.as_mut() {
                    state.interval_ms = interval_ms;
                }
                let topic = poll.decision.topic();
                let id = self.next_id("decision-wait");
                vec![WorkflowAction::wait(
                    id,
                    Some(topic),
                    Duration::from_millis(interval_ms),
                )]
            }

            "fetch-checks" => {
                let status: CheckStatus = match serde_json::from_value(result) {
                    Ok(status) => status,
                    Err(_) => return self.enter_ci_loop(),
                };
                self.on_check_status(status)
            }

            "fetch-logs" => {
                let logs: activities::FetchCheckLogsResult = match serde_json::from_value(result) {
                    Ok(logs) => logs,
                    Err(_) => return self.enter_ci_loop(),
                };
                self.job_attempt = 0;
                self.launch_job(JobMode::Fix, Some(logs.logs))
            }

            "fetch-pr" => {
                let status: activities::FetchPrStatusResult = match serde_json::from_value(result)
                {
                    Ok(status) => status,
                    Err(_) => return self.enter_review_loop(),
                };
                self.on_pr_status(status)
            }

            "fetch-feedback" => {
                let feedback: activities::FetchPrFeedbackResult =
                    match serde_json::from_value(result) {
                        Ok(feedback) => feedback,
                        Err(_) => return self.enter_review_loop(),
                    };
                self.on_pr_feedback(feedback)
            }

            "ack-comments" => vec![],

            "close-issue" => self.terminal_update(),

            "utask-terminal" => {
                let mut actions = Vec::new();
                if let Some(notification) = self.terminal_notification() {
                    actions.push(notification);
                }
                actions.extend(self.teardown());
                actions
            }

            "destroy-sandbox" => self.conclude(),

            // Status-only updates need no follow-up
            "utask" => vec![],

            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        match Self::id_prefix(activity_id) {
            // Cleanup failures are logged but never alter the task's state
            "destroy-sandbox" => self.conclude(),

            // The issue close is best-effort; still record the terminal state
            "close-issue" => self.terminal_update(),

            // If the terminal write itself fails there is nothing left to
            // persist; surface the failure
            "utask-terminal" => {
                self.done = true;
                vec![WorkflowAction::fail(
                    WorkflowError::new(format!("terminal task update failed: {}", error.message))
                        .with_code("TERMINAL_UPDATE_FAILED"),
                )]
            }

            // Any other exhausted activity is an unrecoverable task failure
            _ => {
                if self.finishing.is_some() {
                    // Already tearing down; push through to the end
                    return self.teardown();
                }
                self.finish(Finish::Failed {
                    error: format!("{activity_id}: {}", error.message),
                })
            }
        }
    }

    fn on_timer_fired(&mut self, timer_id: &str) -> Vec<WorkflowAction> {
        match Self::id_prefix(timer_id) {
            // Job retry backoff elapsed: relaunch the current mode with a
            // fresh iteration (distinct job identity)
            "retry" => match self.job_mode {
                Some(mode) => {
                    let feedback = match mode {
                        JobMode::Plan if !self.plan_feedback.is_empty() => {
                            Some(self.plan_feedback.join("\n\n---\n\n"))
                        }
                        _ => None,
                    };
                    self.launch_job(mode, feedback)
                }
                None => vec![],
            },

            "ci-poll" => {
                let input = activities::FetchCheckStatusInput {
                    repo_url: self.repo_url(),
                    number: self.task().pr_number.unwrap_or_default(),
                };
                let id = self.next_id("fetch-checks");
                vec![WorkflowAction::activity(
                    id,
                    names::FETCH_CHECK_STATUS,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            "review-poll" => {
                let input = activities::FetchPrStatusInput {
                    repo_url: self.repo_url(),
                    number: self.task().pr_number.unwrap_or_default(),
                };
                let id = self.next_id("fetch-pr");
                vec![WorkflowAction::activity(
                    id,
                    names::FETCH_PR_STATUS,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            _ => vec![],
        }
    }

    fn on_message(&mut self, wait_id: &str, message: &WorkflowMessage) -> Vec<WorkflowAction> {
        match Self::id_prefix(wait_id) {
            "job-wait" => {
                let payload: JobResultPayload = match message.payload_as() {
                    Ok(payload) => payload,
                    Err(_) => return vec![],
                };
                self.on_job_result(payload)
            }

            "decision-wait" => {
                let Some(poll) = self.poll.clone() else {
                    return vec![];
                };
                self.poll = None;

                // First valid signal wins; discard queued duplicates on this
                // topic so none leak into a later phase
                let mut actions = vec![WorkflowAction::DrainMessages {
                    topic: poll.decision.topic().to_string(),
                }];
                actions.extend(match poll.decision {
                    Decision::Questions => {
                        let payload: QuestionResponsePayload = match message.payload_as() {
                            Ok(payload) => payload,
                            Err(_) => return vec![],
                        };
                        match payload.action {
                            QuestionAction::Answer => self.apply_question_answers(payload.answers),
                            QuestionAction::Cancel => self.finish(Finish::Cancelled),
                        }
                    }
                    Decision::PlanReview => {
                        let payload: PlanResponsePayload = match message.payload_as() {
                            Ok(payload) => payload,
                            Err(_) => return vec![],
                        };
                        self.apply_plan_decision(payload.action, payload.text)
                    }
                    Decision::StartGate => {
                        let payload: StartImplementationPayload = match message.payload_as() {
                            Ok(payload) => payload,
                            Err(_) => return vec![],
                        };
                        self.apply_start_decision(payload.action)
                    }
                });
                actions
            }

            _ => vec![],
        }
    }

    fn on_message_timeout(&mut self, wait_id: &str) -> Vec<WorkflowAction> {
        match Self::id_prefix(wait_id) {
            // No callback within the window: count it as a failed attempt
            "job-wait" => {
                let mut actions = vec![WorkflowAction::DrainMessages {
                    topic: topic::JOB_RESULT.to_string(),
                }];
                actions.extend(self.retry_or_fail("timed out waiting for executor job".into()));
                actions
            }

            // Poll interval elapsed without an in-app decision: ask the forge
            "decision-wait" => {
                let Some(poll) = self.poll.clone() else {
                    return vec![];
                };
                let Some(issue_number) = self.issue_number() else {
                    // No issue to poll (plan-skipping tasks): keep waiting
                    // in-app only
                    let id = self.next_id("decision-wait");
                    return vec![WorkflowAction::wait(
                        id,
                        Some(poll.decision.topic()),
                        Duration::from_millis(poll.interval_ms),
                    )];
                };

                let input = activities::FetchIssueSignalsInput {
                    repo_url: self.repo_url(),
                    number: issue_number,
                    since: poll.watermark,
                    plan_comment_id: poll.comment_id,
                };
                let id = self.next_id("fetch-signals");
                vec![WorkflowAction::activity(
                    id,
                    names::FETCH_ISSUE_SIGNALS,
                    serde_json::to_value(input).unwrap_or_default(),
                )]
            }

            _ => vec![],
        }
    }

    fn on_cancel(&mut self, _reason: &str) -> Vec<WorkflowAction> {
        // External cancellation (API boundary): the engine records the
        // terminal state; forge/sandbox cleanup belongs to the canceller
        self.done = true;
        vec![]
    }

    fn is_completed(&self) -> bool {
        self.done
    }

    fn result(&self) -> Option<Self::Output> {
        if !self.done {
            return None;
        }
        match &self.finishing {
            Some(Finish::Completed { result }) => Some(TaskWorkflowOutput {
                status: "completed".into(),
                pr_url: result.get("pr_url").and_then(|v| v.as_str()).map(str::to_string),
                error: None,
            }),
            Some(Finish::Cancelled) => Some(TaskWorkflowOutput {
                status: "cancelled".into(),
                pr_url: None,
                error: None,
            }),
            Some(Finish::Abandoned { reason }) => Some(TaskWorkflowOutput {
                status: "abandoned".into(),
                pr_url: None,
                error: Some(reason.clone()),
            }),
            Some(Finish::Failed { .. }) => None,
            None => Some(TaskWorkflowOutput {
                status: "noop".into(),
                pr_url: None,
                error: None,
            }),
        }
    }

    fn error(&self) -> Option<WorkflowError> {
        match &self.finishing {
            Some(Finish::Failed { error }) => {
                Some(WorkflowError::new(error.clone()).with_code("TASK_FAILED"))
            }
            _ => None,
        }
    }
}

/// Extract `(number, url)` of the PR an implement job opened
///
/// Looks for a `pr_url` field first, then regex-matches the canonical
/// `/pull/<n>` shape anywhere in the result.
fn extract_pr_reference(result: &serde_json::Value) -> Option<(i64, String)> {
    let haystack = match result.get("pr_url").and_then(|v| v.as_str()) {
        Some(url) => url.to_string(),
        None => result.to_string(),
    };

    let re = regex::Regex::new(r"(https?://[^\s\\\x22]+/pull/(\d+))").ok()?;
    let captures = re.captures(&haystack)?;
    let url = captures.get(1)?.as_str().to_string();
    let number: i64 = captures.get(2)?.as_str().parse().ok()?;
    Some((number, url))
}

/// Format pending questions as an issue comment
fn format_questions_comment(questions: &[TaskQuestion]) -> String {
    let mut lines = vec!["## Questions before planning continues".to_string(), String::new()];

    for (index, question) in questions.iter().enumerate() {
        lines.push(format!("{}. **{}** — {}", index + 1, question.header, question.question));
        for option in &question.options {
            match &option.description {
                Some(description) => lines.push(format!("   - {}: {}", option.label, description)),
                None => lines.push(format!("   - {}", option.label)),
            }
        }
    }

    lines.push(String::new());
    lines.push(
        "Reply in the app, or answer here with numbered lines (e.g. `1. your answer`).".to_string(),
    );
    lines.join("\n")
}

/// Format the plan comment with approval instructions
fn format_plan_comment(plan: &str) -> String {
    format!(
        "## Proposed Implementation Plan\n\n{plan}\n\n---\n\
         **Approve:** comment `/implement` or `/lgtm`, or react 👍 to this comment.\n\
         **Revise:** comment `/revise <feedback>`.\n\
         **Cancel:** use the app."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_prefix_strips_sequence() {
        assert_eq!(TaskWorkflow::id_prefix("load-task-1"), "load-task");
        assert_eq!(TaskWorkflow::id_prefix("utask-ready-12"), "utask-ready");
        assert_eq!(TaskWorkflow::id_prefix("bare"), "bare");
    }

    #[test]
    fn test_extract_pr_reference_from_field() {
        let result = json!({ "pr_url": "https://forge.test/o/r/pull/7" });
        assert_eq!(
            extract_pr_reference(&result),
            Some((7, "https://forge.test/o/r/pull/7".to_string()))
        );
    }

    #[test]
    fn test_extract_pr_reference_from_free_text() {
        let result = json!({ "summary": "Opened https://forge.test/o/r/pull/123 for review" });
        let (number, url) = extract_pr_reference(&result).unwrap();
        assert_eq!(number, 123);
        assert_eq!(url, "https://forge.test/o/r/pull/123");
    }

    #[test]
    fn test_extract_pr_reference_absent() {
        assert_eq!(extract_pr_reference(&json!({ "summary": "no pr" })), None);
    }

    #[test]
    fn test_questions_comment_format() {
        let questions = vec![TaskQuestion {
            id: "q-1".to_string(),
            header: "Default theme".to_string(),
            question: "Which theme should be the default?".to_string(),
            options: vec![
                foreman_core::task::QuestionOption {
                    label: "System".to_string(),
                    description: Some("follow the OS preference".to_string()),
                },
                foreman_core::task::QuestionOption {
                    label: "Dark".to_string(),
                    description: None,
                },
            ],
            multi_select: false,
            response: None,
        }];

        let comment = format_questions_comment(&questions);
        assert!(comment.contains("1. **Default theme**"));
        assert!(comment.contains("- System: follow the OS preference"));
        assert!(comment.contains("- Dark"));
        assert!(comment.contains("numbered lines"));
    }

    #[test]
    fn test_plan_comment_lists_commands() {
        let comment = format_plan_comment("1. do the thing");
        assert!(comment.contains("/implement"));
        assert!(comment.contains("/lgtm"));
        assert!(comment.contains("/revise"));
        assert!(comment.contains("1. do the thing"));
    }

    #[test]
    fn test_retry_backoff_schedule() {
        // 2^1..2^5 = 2, 4, 8, 16, 32 seconds
        for (attempt, expected) in [(1u32, 2u64), (2, 4), (3, 8), (4, 16), (5, 32)] {
            assert_eq!(
                Duration::from_secs(JOB_RETRY_BASE_SECS.saturating_pow(attempt)),
                Duration::from_secs(expected)
            );
        }
    }
}
