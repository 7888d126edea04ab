// Sandbox adapter
//
// A sandbox is an isolated execution environment keyed to a task. Executor
// jobs are one-shot runners launched inside it; each job POSTs its result to
// the callback URL exactly once, which the HTTP boundary relays to the
// worker workflow as a `job_result` message.

mod kubernetes;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use kubernetes::KubernetesSandbox;
pub use memory::{InMemorySandbox, LaunchRecord};

/// Error type for sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Provisioning the sandbox failed
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    /// Launching a job failed
    #[error("failed to launch job: {0}")]
    Launch(String),

    /// Tearing the sandbox down failed
    #[error("failed to tear down sandbox: {0}")]
    Teardown(String),

    /// Platform API error
    #[error("platform error: {0}")]
    Platform(String),
}

/// Executor-job mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Produce an implementation plan (and possibly questions)
    Plan,
    /// Implement the approved plan and open a PR
    Implement,
    /// Address review feedback on the PR
    Feedback,
    /// Fix failing checks
    Fix,
}

impl JobMode {
    /// Short mode tag used in job names
    pub fn short(&self) -> &'static str {
        match self {
            Self::Plan => "pla",
            Self::Implement => "imp",
            Self::Feedback => "fee",
            Self::Fix => "fix",
        }
    }

    /// Full mode name passed to the runner via `MODE`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Feedback => "feedback",
            Self::Fix => "fix",
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Specification of an executor job
///
/// Job identity is `(task_id, mode, iteration)`; callers supply
/// monotonically increasing iterations within a mode so every retry gets a
/// distinct identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_id: Uuid,
    pub sandbox_id: String,
    pub mode: JobMode,
    pub iteration: u32,
    pub prompt: String,
    pub callback_url: String,
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

impl JobSpec {
    /// Deterministic job name from the job identity
    pub fn job_name(&self) -> String {
        let task8 = &self.task_id.simple().to_string()[..8];
        if self.iteration > 0 {
            format!("worker-{task8}-{}-{}", self.mode.short(), self.iteration)
        } else {
            format!("worker-{task8}-{}", self.mode.short())
        }
    }

    /// Environment variables handed to the runner
    ///
    /// This is the callback contract: the runner reads exactly these names.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("TASK_ID".to_string(), self.task_id.to_string()),
            ("TASK_PROMPT".to_string(), self.prompt.clone()),
            ("CALLBACK_URL".to_string(), self.callback_url.clone()),
            ("MODE".to_string(), self.mode.as_str().to_string()),
        ];
        if let Some(model) = &self.model {
            env.push(("CLAUDE_MODEL".to_string(), model.clone()));
        }
        if let Some(repo_url) = &self.repo_url {
            env.push(("REPO_URL".to_string(), repo_url.clone()));
        }
        if let Some(issue_number) = self.issue_number {
            env.push(("ISSUE_NUMBER".to_string(), issue_number.to_string()));
        }
        if let Some(pr_number) = self.pr_number {
            env.push(("PR_NUMBER".to_string(), pr_number.to_string()));
        }
        if let Some(branch_name) = &self.branch_name {
            env.push(("BRANCH_NAME".to_string(), branch_name.clone()));
        }
        if let Some(feedback_context) = &self.feedback_context {
            env.push(("FEEDBACK_CONTEXT".to_string(), feedback_context.clone()));
        }
        env
    }
}

/// Abstraction over the sandbox platform
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    /// Provision an isolated sandbox for a task; idempotent on repeat
    async fn create(&self, task_id: Uuid) -> Result<String, SandboxError>;

    /// Tear down a task's sandbox; idempotent, succeeds if already gone
    async fn destroy(&self, task_id: Uuid) -> Result<(), SandboxError>;

    /// Launch a one-shot executor job; returns the job name
    ///
    /// Relaunching a completed job of the same identity replaces it.
    async fn launch_job(&self, spec: &JobSpec) -> Result<String, SandboxError>;

    /// Fetch current logs of the task's running (or finished) job
    async fn job_logs(&self, task_id: Uuid) -> Result<Option<String>, SandboxError>;
}
