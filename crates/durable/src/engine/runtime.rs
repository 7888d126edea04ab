//! Runtime: the engine's pump
//!
//! Owns the executor, the activity registry and the queue configuration.
//! On every tick it:
//! 1. Admits enqueued workflows into free queue slots
//! 2. Fires due timers
//! 3. Times out expired message waits
//! 4. Reclaims activity tasks whose execution deadline passed
//! 5. Claims pending activity tasks and executes them on the worker pool
//!
//! Recovery (`recover`) resumes every non-terminal workflow whose recorded
//! application version matches the binary's version.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityContext, ActivityRegistry};
use crate::persistence::{QueueConfig, TaskFailureOutcome, WorkflowStore};

use super::executor::{Executor, ExecutorError};

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker identity used when claiming activity tasks
    pub worker_id: String,

    /// Admission queues and their concurrency caps
    pub queues: Vec<QueueConfig>,

    /// Maximum concurrently executing activities
    pub max_concurrent_activities: usize,

    /// Pump interval
    pub tick_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("runtime-{}", uuid::Uuid::now_v7()),
            queues: vec![],
            max_concurrent_activities: 8,
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// The engine pump
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::new(executor, activities, RuntimeConfig::default());
/// runtime.recover().await?;
/// runtime.run(shutdown_token).await;
/// ```
pub struct Runtime<S: WorkflowStore> {
    executor: Arc<Executor<S>>,
    activities: Arc<ActivityRegistry>,
    config: RuntimeConfig,
    semaphore: Arc<tokio::sync::Semaphore>,
    inflight: Arc<AtomicUsize>,
}

impl<S: WorkflowStore> Runtime<S> {
    /// Create a new runtime
    pub fn new(
        executor: Arc<Executor<S>>,
        activities: Arc<ActivityRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_activities));
        Self {
            executor,
            activities,
            config,
            semaphore,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the executor
    pub fn executor(&self) -> &Arc<Executor<S>> {
        &self.executor
    }

    /// Resume non-terminal workflows recorded under this binary's version
    ///
    /// Records with a different version are left untouched for operator
    /// inspection.
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let ids = self
            .executor
            .store()
            .list_recoverable(self.executor.app_version())
            .await?;
        let count = ids.len();

        for id in ids {
            // Launch degenerates to a process pass for workflows that already
            // have history; workflows admitted but never launched get their
            // on_start here
            if let Err(e) = self.executor.launch(id).await {
                error!(workflow_id = %id, error = %e, "failed to recover workflow");
            }
        }

        if count > 0 {
            info!(count, "recovered workflows");
        }
        Ok(count)
    }

    /// Run the pump until the token is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            queues = self.config.queues.len(),
            max_concurrent = self.config.max_concurrent_activities,
            "runtime started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("runtime shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "runtime tick failed");
                    }
                }
            }
        }
    }

    /// One pump iteration at the given instant; returns whether any work was
    /// started or applied
    ///
    /// Taking `now` as a parameter keeps timer and wait deadlines testable.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<bool, ExecutorError> {
        let mut did_work = false;

        // 1. Queue admissions
        let admitted = self
            .executor
            .store()
            .claim_queue_admissions(&self.config.queues, self.executor.app_version())
            .await?;
        for id in admitted {
            did_work = true;
            if let Err(e) = self.executor.launch(id).await {
                error!(workflow_id = %id, error = %e, "failed to launch admitted workflow");
            }
        }

        // 2. Due timers
        for (workflow_id, timer_id) in self.executor.store().due_timers(now).await? {
            did_work = true;
            if let Err(e) = self.executor.on_timer_fired(workflow_id, &timer_id).await {
                error!(%workflow_id, %timer_id, error = %e, "timer firing failed");
            }
        }

        // 3. Expired waits
        for (workflow_id, wait_id) in self.executor.store().due_wait_timeouts(now).await? {
            did_work = true;
            if let Err(e) = self.executor.on_wait_timeout(workflow_id, &wait_id).await {
                error!(%workflow_id, %wait_id, error = %e, "wait timeout failed");
            }
        }

        // 4. Stale claimed tasks
        for stale in self.executor.store().reclaim_stale_tasks(now).await? {
            did_work = true;
            warn!(
                workflow_id = %stale.workflow_id,
                activity_id = %stale.activity_id,
                exhausted = stale.exhausted,
                "reclaimed stale activity task"
            );
            if stale.exhausted {
                let error = crate::persistence::timeout_error(&stale.activity_id);
                if let Err(e) = self
                    .executor
                    .on_activity_failed(stale.workflow_id, &stale.activity_id, error, false)
                    .await
                {
                    error!(error = %e, "failed to notify activity timeout");
                }
            }
        }

        // 5. Claim and execute activity tasks
        let available = self.semaphore.available_permits();
        if available > 0 {
            let claimed = self
                .executor
                .store()
                .claim_tasks(&self.config.worker_id, available)
                .await?;

            for task in claimed {
                did_work = true;
                self.spawn_activity(task);
            }
        }

        Ok(did_work)
    }

    /// Pump until there is nothing left to do right now (for tests)
    ///
    /// Does not wait for future timer deadlines; pair with explicit
    /// [`Runtime::tick`] calls using advanced clocks to cross them.
    pub async fn run_until_idle(&self, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        loop {
            let did_work = self.tick(now).await?;
            let inflight = self.inflight.load(Ordering::SeqCst);
            if !did_work && inflight == 0 {
                return Ok(());
            }
            // Let spawned activities make progress
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_activity(&self, task: crate::persistence::ClaimedTask) {
        let executor = Arc::clone(&self.executor);
        let activities = Arc::clone(&self.activities);
        let semaphore = Arc::clone(&self.semaphore);
        let inflight = Arc::clone(&self.inflight);

        inflight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    inflight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };

            let ctx = ActivityContext::new(task.workflow_id, task.activity_id.clone(), task.attempt);
            debug!(
                workflow_id = %task.workflow_id,
                activity_id = %task.activity_id,
                activity_type = %task.activity_type,
                attempt = task.attempt,
                "executing activity"
            );

            let outcome = match activities.get(&task.activity_type) {
                Some(activity) => activity.execute_json(&ctx, task.input.clone()).await,
                None => Err(crate::activity::ActivityError::non_retryable(format!(
                    "unknown activity type: {}",
                    task.activity_type
                ))
                .with_type("UNKNOWN_ACTIVITY")),
            };

            match outcome {
                Ok(result) => {
                    if let Err(e) = executor.store().complete_task(task.id, result.clone()).await {
                        error!(error = %e, "failed to mark task completed");
                    }
                    if let Err(e) = executor
                        .on_activity_completed(task.workflow_id, &task.activity_id, result)
                        .await
                    {
                        error!(error = %e, "failed to apply activity completion");
                    }
                }
                Err(activity_error) => {
                    warn!(
                        workflow_id = %task.workflow_id,
                        activity_id = %task.activity_id,
                        error = %activity_error,
                        retryable = activity_error.retryable,
                        "activity failed"
                    );

                    let will_retry = match executor.store().fail_task(task.id, &activity_error).await
                    {
                        Ok(TaskFailureOutcome::WillRetry { .. }) => true,
                        Ok(TaskFailureOutcome::ExhaustedRetries) => false,
                        Err(e) => {
                            error!(error = %e, "failed to record task failure");
                            false
                        }
                    };

                    if let Err(e) = executor
                        .on_activity_failed(
                            task.workflow_id,
                            &task.activity_id,
                            activity_error,
                            will_retry,
                        )
                        .await
                    {
                        error!(error = %e, "failed to apply activity failure");
                    }
                }
            }

            inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
