// In-memory Sandbox implementation for tests and dev mode

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::{JobSpec, Sandbox, SandboxError};

/// A recorded job launch
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub job_name: String,
    pub spec: JobSpec,
}

#[derive(Default)]
struct State {
    sandboxes: HashSet<Uuid>,
    destroyed: Vec<Uuid>,
    launches: Vec<LaunchRecord>,
    logs: HashMap<Uuid, String>,
    /// Scripted teardown failures remaining (for cleanup-retry tests)
    destroy_failures: u32,
}

/// In-memory implementation of [`Sandbox`]
///
/// Records every launch for assertions; tests drive job completion through
/// the callback path, not through the sandbox.
#[derive(Default)]
pub struct InMemorySandbox {
    state: RwLock<State>,
}

impl InMemorySandbox {
    /// Create an empty sandbox manager
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded launches, in order
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.read().launches.clone()
    }

    /// Launches of a given mode, in order
    pub fn launches_of(&self, mode: crate::JobMode) -> Vec<LaunchRecord> {
        self.state
            .read()
            .launches
            .iter()
            .filter(|l| l.spec.mode == mode)
            .cloned()
            .collect()
    }

    /// Whether the task's sandbox currently exists
    pub fn exists(&self, task_id: Uuid) -> bool {
        self.state.read().sandboxes.contains(&task_id)
    }

    /// How many times destroy was attempted for this task
    pub fn destroy_count(&self, task_id: Uuid) -> usize {
        self.state
            .read()
            .destroyed
            .iter()
            .filter(|t| **t == task_id)
            .count()
    }

    /// Script the next `n` destroy calls to fail
    pub fn fail_next_destroys(&self, n: u32) {
        self.state.write().destroy_failures = n;
    }

    /// Provide logs for a task
    pub fn set_logs(&self, task_id: Uuid, logs: impl Into<String>) {
        self.state.write().logs.insert(task_id, logs.into());
    }
}

#[async_trait]
impl Sandbox for InMemorySandbox {
    async fn create(&self, task_id: Uuid) -> Result<String, SandboxError> {
        self.state.write().sandboxes.insert(task_id);
        Ok(format!("task-{}", &task_id.simple().to_string()[..8]))
    }

    async fn destroy(&self, task_id: Uuid) -> Result<(), SandboxError> {
        let mut state = self.state.write();
        state.destroyed.push(task_id);
        if state.destroy_failures > 0 {
            state.destroy_failures -= 1;
            return Err(SandboxError::Teardown("scripted failure".to_string()));
        }
        state.sandboxes.remove(&task_id);
        Ok(())
    }

    async fn launch_job(&self, spec: &JobSpec) -> Result<String, SandboxError> {
        let job_name = spec.job_name();
        self.state.write().launches.push(LaunchRecord {
            job_name: job_name.clone(),
            spec: spec.clone(),
        });
        Ok(job_name)
    }

    async fn job_logs(&self, task_id: Uuid) -> Result<Option<String>, SandboxError> {
        Ok(self.state.read().logs.get(&task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobMode;

    fn spec(task_id: Uuid, mode: JobMode, iteration: u32) -> JobSpec {
        JobSpec {
            task_id,
            sandbox_id: "task-x".to_string(),
            mode,
            iteration,
            prompt: "p".to_string(),
            callback_url: "http://backend/cb".to_string(),
            model: None,
            repo_url: None,
            issue_number: None,
            pr_number: None,
            branch_name: None,
            feedback_context: None,
        }
    }

    #[tokio::test]
    async fn test_lifecycle_recording() {
        let sandbox = InMemorySandbox::new();
        let task_id = Uuid::now_v7();

        sandbox.create(task_id).await.unwrap();
        assert!(sandbox.exists(task_id));

        sandbox
            .launch_job(&spec(task_id, JobMode::Plan, 0))
            .await
            .unwrap();
        sandbox
            .launch_job(&spec(task_id, JobMode::Plan, 1))
            .await
            .unwrap();
        assert_eq!(sandbox.launches_of(JobMode::Plan).len(), 2);

        sandbox.destroy(task_id).await.unwrap();
        assert!(!sandbox.exists(task_id));
        // Destroying again is fine
        sandbox.destroy(task_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_destroy_failures() {
        let sandbox = InMemorySandbox::new();
        let task_id = Uuid::now_v7();
        sandbox.create(task_id).await.unwrap();

        sandbox.fail_next_destroys(2);
        assert!(sandbox.destroy(task_id).await.is_err());
        assert!(sandbox.destroy(task_id).await.is_err());
        assert!(sandbox.destroy(task_id).await.is_ok());
        assert_eq!(sandbox.destroy_count(task_id), 3);
    }
}
