//! Workflow executor with replay support
//!
//! The [`Executor`] is responsible for:
//! - Starting new workflows (at most once per workflow id)
//! - Rebuilding workflow state by replaying the event history
//! - Applying new stimuli (activity results, timers, messages, timeouts)
//! - Processing workflow actions (scheduling activities, timers, waits,
//!   sending messages, starting child workflows)
//!
//! Replay rebuilds in-memory state only: actions produced while replaying
//! recorded events are discarded, because they were already processed when
//! the events were first appended. Only the actions produced by a *new*
//! stimulus are processed and persisted.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{
    StartOptions, StoreError, TaskDefinition, WorkflowStatus, WorkflowStore,
};
use crate::workflow::{WorkflowAction, WorkflowError, WorkflowEvent, WorkflowMessage};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (safety bound; long-lived router
    /// workflows need headroom)
    pub max_events_per_workflow: usize,

    /// Application version recorded on every workflow this executor starts
    pub app_version: String,
}

impl ExecutorConfig {
    /// Create a config with the given application version
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            max_events_per_workflow: 100_000,
            app_version: app_version.into(),
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow already in a terminal state
    #[error("workflow {0} already completed")]
    WorkflowCompleted(Uuid),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Replay error (corrupt or non-deterministic history)
    #[error("replay error: {0}")]
    ReplayError(String),

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of processing a workflow
#[derive(Debug, Default)]
pub struct ProcessResult {
    /// Whether the workflow is now in a terminal state
    pub completed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of activity tasks enqueued
    pub tasks_enqueued: usize,

    /// Number of messages delivered to waits
    pub messages_delivered: usize,
}

/// A new external input applied to a workflow after replay
enum Stimulus {
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        will_retry: bool,
    },
    TimerFired {
        timer_id: String,
    },
    WaitTimedOut {
        wait_id: String,
    },
}

/// Deferred work discovered while processing a workflow
enum Followup {
    /// Process a workflow that received a message
    Process(Uuid),

    /// Launch a freshly created (unqueued) workflow
    Launch(Uuid),
}

/// Terminal transition produced by action processing
enum TerminalOutcome {
    Completed(serde_json::Value),
    Failed(WorkflowError),
}

/// Workflow executor
///
/// Drives workflow state machines by replaying events and processing
/// actions. Uses optimistic concurrency in the store plus a per-workflow
/// async lock to serialize concurrent stimuli for the same workflow.
pub struct Executor<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    config: ExecutorConfig,
    locks: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: WorkflowStore> Executor<S> {
    /// Create a new executor
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry>, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The application version this executor records on new workflows
    pub fn app_version(&self) -> &str {
        &self.config.app_version
    }

    fn lock_for(&self, workflow_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(workflow_id).or_default().clone()
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Start a workflow with a caller-chosen id
    ///
    /// Starting is at-most-once per id: if the workflow already exists this
    /// returns `Ok(false)` and leaves the existing run untouched. Workflows
    /// started with a queue stay `Enqueued` until the runtime admits them.
    #[instrument(skip(self, input), fields(workflow_type))]
    pub async fn start_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        queue: Option<&str>,
        partition_key: Option<String>,
    ) -> Result<bool, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(
                workflow_type.to_string(),
            )));
        }

        let options = StartOptions {
            queue: queue.map(str::to_string),
            partition_key,
            app_version: self.config.app_version.clone(),
        };

        let created = self
            .store
            .create_workflow(workflow_id, workflow_type, input, &options)
            .await?;

        if !created {
            debug!(%workflow_id, "workflow already exists, returning existing run");
            return Ok(false);
        }

        info!(%workflow_id, %workflow_type, queued = options.queue.is_some(), "started workflow");

        if options.queue.is_none() {
            self.drive(Followup::Launch(workflow_id)).await?;
        }

        Ok(true)
    }

    /// Launch an admitted or freshly created workflow
    ///
    /// Appends `WorkflowStarted` and processes `on_start` actions. Safe to
    /// call on an already launched workflow (it degenerates to a process
    /// pass), which makes crash recovery between admission and launch safe.
    pub async fn launch(&self, workflow_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        self.drive(Followup::Launch(workflow_id)).await
    }

    /// Process a workflow: deliver queued messages to its open wait
    pub async fn process_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<ProcessResult, ExecutorError> {
        self.drive(Followup::Process(workflow_id)).await
    }

    /// Send a durable message to a workflow and process delivery
    #[instrument(skip(self, message), fields(topic = %message.topic))]
    pub async fn send_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), ExecutorError> {
        let status = self.store.get_workflow_status(workflow_id).await?;
        if status.is_terminal() {
            warn!(%workflow_id, %status, "cannot send message to terminal workflow");
            return Err(ExecutorError::WorkflowCompleted(workflow_id));
        }

        self.store.enqueue_message(workflow_id, message).await?;
        self.drive(Followup::Process(workflow_id)).await?;
        Ok(())
    }

    /// Handle activity completion
    pub async fn on_activity_completed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<ProcessResult, ExecutorError> {
        self.drive_with_stimulus(
            workflow_id,
            Stimulus::ActivityCompleted {
                activity_id: activity_id.to_string(),
                result,
            },
        )
        .await
    }

    /// Handle activity failure
    ///
    /// With `will_retry` the failure is recorded but the workflow is not
    /// notified; only the final failure reaches `on_activity_failed`.
    pub async fn on_activity_failed(
        &self,
        workflow_id: Uuid,
        activity_id: &str,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<ProcessResult, ExecutorError> {
        self.drive_with_stimulus(
            workflow_id,
            Stimulus::ActivityFailed {
                activity_id: activity_id.to_string(),
                error,
                will_retry,
            },
        )
        .await
    }

    /// Handle a timer deadline
    pub async fn on_timer_fired(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
    ) -> Result<ProcessResult, ExecutorError> {
        self.drive_with_stimulus(
            workflow_id,
            Stimulus::TimerFired {
                timer_id: timer_id.to_string(),
            },
        )
        .await
    }

    /// Handle an expired message wait
    pub async fn on_wait_timeout(
        &self,
        workflow_id: Uuid,
        wait_id: &str,
    ) -> Result<ProcessResult, ExecutorError> {
        self.drive_with_stimulus(
            workflow_id,
            Stimulus::WaitTimedOut {
                wait_id: wait_id.to_string(),
            },
        )
        .await
    }

    /// Cancel a workflow externally
    ///
    /// Surfaces as `on_cancel` to the workflow, then records
    /// `WorkflowCancelled`, drops pending work and marks the record
    /// cancelled. Idempotent on terminal workflows.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let info = self.store.get_workflow_info(workflow_id).await?;
        if info.status.is_terminal() {
            return Ok(());
        }

        let mut followups = VecDeque::new();

        if info.status == WorkflowStatus::Running {
            let events = self.store.load_events(workflow_id).await?;
            if !events.is_empty() {
                let mut workflow = self
                    .registry
                    .create(&info.workflow_type, info.input.clone())?;
                for (_, event) in &events {
                    self.replay_event(&mut *workflow, event);
                }

                let mut seq = events.len() as i32;
                let actions = workflow.on_cancel(reason);
                let (new_seq, _, _) = self
                    .process_actions(workflow_id, seq, actions, &mut followups)
                    .await?;
                seq = new_seq;

                self.store
                    .append_events(
                        workflow_id,
                        seq,
                        vec![WorkflowEvent::WorkflowCancelled {
                            reason: reason.to_string(),
                        }],
                    )
                    .await?;
            }
        }

        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Cancelled, None, None)
            .await?;
        self.store.cancel_workflow_work(workflow_id).await?;

        info!(%workflow_id, reason, "workflow cancelled");

        drop(_guard);
        self.drain_followups(followups).await?;
        Ok(())
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn drive(&self, initial: Followup) -> Result<ProcessResult, ExecutorError> {
        let mut queue = VecDeque::from([initial]);
        let mut first_result = None;
        let mut iterations = 0usize;

        while let Some(followup) = queue.pop_front() {
            iterations += 1;
            if iterations > 256 {
                warn!("followup chain exceeded bound, stopping");
                break;
            }

            let (workflow_id, launch) = match followup {
                Followup::Process(id) => (id, false),
                Followup::Launch(id) => (id, true),
            };

            let result = self
                .cycle(workflow_id, launch, None, &mut queue)
                .await?;
            first_result.get_or_insert(result);
        }

        Ok(first_result.unwrap_or_default())
    }

    async fn drive_with_stimulus(
        &self,
        workflow_id: Uuid,
        stimulus: Stimulus,
    ) -> Result<ProcessResult, ExecutorError> {
        let mut queue = VecDeque::new();
        let result = self
            .cycle(workflow_id, false, Some(stimulus), &mut queue)
            .await?;
        self.drain_followups(queue).await?;
        Ok(result)
    }

    async fn drain_followups(
        &self,
        mut queue: VecDeque<Followup>,
    ) -> Result<(), ExecutorError> {
        let mut iterations = 0usize;
        while let Some(followup) = queue.pop_front() {
            iterations += 1;
            if iterations > 256 {
                warn!("followup chain exceeded bound, stopping");
                break;
            }
            let (workflow_id, launch) = match followup {
                Followup::Process(id) => (id, false),
                Followup::Launch(id) => (id, true),
            };
            self.cycle(workflow_id, launch, None, &mut queue).await?;
        }
        Ok(())
    }

    /// One locked processing cycle for a workflow
    async fn cycle(
        &self,
        workflow_id: Uuid,
        launch: bool,
        stimulus: Option<Stimulus>,
        followups: &mut VecDeque<Followup>,
    ) -> Result<ProcessResult, ExecutorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let info = match self.store.get_workflow_info(workflow_id).await {
            Ok(info) => info,
            // A plain process pass against a workflow that doesn't exist yet
            // is a no-op: its messages stay queued until it launches
            Err(StoreError::WorkflowNotFound(_)) if !launch && stimulus.is_none() => {
                debug!(%workflow_id, "process pass on unknown workflow, skipping");
                return Ok(ProcessResult::default());
            }
            Err(e) => return Err(e.into()),
        };
        if info.status.is_terminal() {
            debug!(%workflow_id, status = %info.status, "workflow already terminal");
            return Ok(ProcessResult {
                completed: true,
                ..Default::default()
            });
        }

        let events = self.store.load_events(workflow_id).await?;

        if events.len() > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                workflow_id,
                events.len(),
                self.config.max_events_per_workflow,
            ));
        }

        let mut result = ProcessResult::default();
        let mut workflow = self
            .registry
            .create(&info.workflow_type, info.input.clone())?;
        let mut seq;
        let mut terminal: Option<TerminalOutcome> = None;

        if events.is_empty() {
            if !launch {
                // Nothing to do for a workflow that hasn't launched yet
                // (messages stay queued until launch)
                return Ok(result);
            }

            // First launch: record the start and process initial actions
            seq = self
                .store
                .append_events(
                    workflow_id,
                    0,
                    vec![WorkflowEvent::WorkflowStarted {
                        input: info.input.clone(),
                    }],
                )
                .await?;
            result.events_written += 1;

            let actions = workflow.on_start();
            let (new_seq, stats, term) = self
                .process_actions(workflow_id, seq, actions, followups)
                .await?;
            seq = new_seq;
            result.events_written += stats.0;
            result.tasks_enqueued += stats.1;
            terminal = term;
        } else {
            if !matches!(&events[0].1, WorkflowEvent::WorkflowStarted { .. }) {
                return Err(ExecutorError::ReplayError(
                    "first event must be WorkflowStarted".to_string(),
                ));
            }

            // Rebuild state; actions from replay were already processed when
            // their events were first appended
            for (_, event) in &events {
                self.replay_event(&mut *workflow, event);
            }
            seq = events.len() as i32;

            debug!(%workflow_id, seq, "replayed events");

            if let Some(stimulus) = stimulus {
                let (new_seq, stats, term) = self
                    .apply_stimulus(workflow_id, &mut *workflow, seq, stimulus, &events, followups)
                    .await?;
                seq = new_seq;
                result.events_written += stats.0;
                result.tasks_enqueued += stats.1;
                terminal = term;
            }
        }

        // Deliver queued messages to the open wait, first-in first-out
        while terminal.is_none() && !workflow.is_completed() {
            let Some(wait) = self.store.open_wait(workflow_id).await? else {
                break;
            };
            let Some((msg_seq, message)) = self
                .store
                .next_message(workflow_id, wait.topic.as_deref())
                .await?
            else {
                break;
            };

            seq = self
                .store
                .append_events(
                    workflow_id,
                    seq,
                    vec![WorkflowEvent::MessageReceived {
                        wait_id: wait.wait_id.clone(),
                        message: message.clone(),
                    }],
                )
                .await?;
            result.events_written += 1;
            self.store.consume_message(workflow_id, msg_seq).await?;
            self.store.clear_wait(workflow_id, &wait.wait_id).await?;
            result.messages_delivered += 1;

            let actions = workflow.on_message(&wait.wait_id, &message);
            let (new_seq, stats, term) = self
                .process_actions(workflow_id, seq, actions, followups)
                .await?;
            seq = new_seq;
            result.events_written += stats.0;
            result.tasks_enqueued += stats.1;
            terminal = term;
        }

        // Record the terminal transition, if any
        match terminal {
            Some(TerminalOutcome::Completed(value)) => {
                self.store
                    .update_workflow_status(
                        workflow_id,
                        WorkflowStatus::Completed,
                        Some(value),
                        None,
                    )
                    .await?;
                self.store.cancel_workflow_work(workflow_id).await?;
                result.completed = true;
            }
            Some(TerminalOutcome::Failed(error)) => {
                self.store
                    .update_workflow_status(workflow_id, WorkflowStatus::Failed, None, Some(error))
                    .await?;
                self.store.cancel_workflow_work(workflow_id).await?;
                result.completed = true;
            }
            None => {
                // Workflows that consider themselves done without an explicit
                // terminal action still complete
                if workflow.is_completed() {
                    if let Some(error) = workflow.error() {
                        self.store
                            .update_workflow_status(
                                workflow_id,
                                WorkflowStatus::Failed,
                                None,
                                Some(error),
                            )
                            .await?;
                    } else {
                        self.store
                            .update_workflow_status(
                                workflow_id,
                                WorkflowStatus::Completed,
                                workflow.result_json(),
                                None,
                            )
                            .await?;
                    }
                    self.store.cancel_workflow_work(workflow_id).await?;
                    result.completed = true;
                }
            }
        }

        Ok(result)
    }

    /// Apply a new stimulus after replay, with idempotence checks
    #[allow(clippy::too_many_arguments)]
    async fn apply_stimulus(
        &self,
        workflow_id: Uuid,
        workflow: &mut dyn AnyWorkflow,
        seq: i32,
        stimulus: Stimulus,
        events: &[(i32, WorkflowEvent)],
        followups: &mut VecDeque<Followup>,
    ) -> Result<(i32, (usize, usize), Option<TerminalOutcome>), ExecutorError> {
        let mut seq = seq;
        let mut written = 0usize;

        match stimulus {
            Stimulus::ActivityCompleted {
                activity_id,
                result,
            } => {
                if activity_resolved(events, &activity_id) {
                    debug!(%workflow_id, %activity_id, "duplicate activity completion ignored");
                    return Ok((seq, (0, 0), None));
                }

                seq = self
                    .store
                    .append_events(
                        workflow_id,
                        seq,
                        vec![WorkflowEvent::ActivityCompleted {
                            activity_id: activity_id.clone(),
                            result: result.clone(),
                        }],
                    )
                    .await?;
                written += 1;

                let actions = workflow.on_activity_completed(&activity_id, result);
                let (new_seq, stats, terminal) = self
                    .process_actions(workflow_id, seq, actions, followups)
                    .await?;
                Ok((new_seq, (written + stats.0, stats.1), terminal))
            }

            Stimulus::ActivityFailed {
                activity_id,
                error,
                will_retry,
            } => {
                if activity_resolved(events, &activity_id) {
                    debug!(%workflow_id, %activity_id, "duplicate activity failure ignored");
                    return Ok((seq, (0, 0), None));
                }

                seq = self
                    .store
                    .append_events(
                        workflow_id,
                        seq,
                        vec![WorkflowEvent::ActivityFailed {
                            activity_id: activity_id.clone(),
                            error: error.clone(),
                            will_retry,
                        }],
                    )
                    .await?;
                written += 1;

                if will_retry {
                    return Ok((seq, (written, 0), None));
                }

                let actions = workflow.on_activity_failed(&activity_id, &error);
                let (new_seq, stats, terminal) = self
                    .process_actions(workflow_id, seq, actions, followups)
                    .await?;
                Ok((new_seq, (written + stats.0, stats.1), terminal))
            }

            Stimulus::TimerFired { timer_id } => {
                let already = events.iter().any(|(_, e)| {
                    matches!(e, WorkflowEvent::TimerFired { timer_id: t } if *t == timer_id)
                });
                self.store.clear_timer(workflow_id, &timer_id).await?;
                if already {
                    debug!(%workflow_id, %timer_id, "duplicate timer firing ignored");
                    return Ok((seq, (0, 0), None));
                }

                seq = self
                    .store
                    .append_events(
                        workflow_id,
                        seq,
                        vec![WorkflowEvent::TimerFired {
                            timer_id: timer_id.clone(),
                        }],
                    )
                    .await?;
                written += 1;

                let actions = workflow.on_timer_fired(&timer_id);
                let (new_seq, stats, terminal) = self
                    .process_actions(workflow_id, seq, actions, followups)
                    .await?;
                Ok((new_seq, (written + stats.0, stats.1), terminal))
            }

            Stimulus::WaitTimedOut { wait_id } => {
                // A message may have resolved the wait concurrently
                let open = self.store.open_wait(workflow_id).await?;
                if open.as_ref().map(|w| w.wait_id.as_str()) != Some(wait_id.as_str()) {
                    debug!(%workflow_id, %wait_id, "stale wait timeout ignored");
                    return Ok((seq, (0, 0), None));
                }

                seq = self
                    .store
                    .append_events(
                        workflow_id,
                        seq,
                        vec![WorkflowEvent::MessageWaitTimedOut {
                            wait_id: wait_id.clone(),
                        }],
                    )
                    .await?;
                written += 1;
                self.store.clear_wait(workflow_id, &wait_id).await?;

                let actions = workflow.on_message_timeout(&wait_id);
                let (new_seq, stats, terminal) = self
                    .process_actions(workflow_id, seq, actions, followups)
                    .await?;
                Ok((new_seq, (written + stats.0, stats.1), terminal))
            }
        }
    }

    /// Replay a single event on a workflow, discarding actions
    fn replay_event(&self, workflow: &mut dyn AnyWorkflow, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted { .. } => {
                let _ = workflow.on_start();
            }
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
            } => {
                let _ = workflow.on_activity_completed(activity_id, result.clone());
            }
            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry,
            } => {
                if !will_retry {
                    let _ = workflow.on_activity_failed(activity_id, error);
                }
            }
            WorkflowEvent::TimerFired { timer_id } => {
                let _ = workflow.on_timer_fired(timer_id);
            }
            WorkflowEvent::MessageReceived { wait_id, message } => {
                let _ = workflow.on_message(wait_id, message);
            }
            WorkflowEvent::MessageWaitTimedOut { wait_id } => {
                let _ = workflow.on_message_timeout(wait_id);
            }
            WorkflowEvent::WorkflowCancelled { reason } => {
                let _ = workflow.on_cancel(reason);
            }

            // Informational during replay
            WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::ActivityScheduled { .. }
            | WorkflowEvent::TimerStarted { .. }
            | WorkflowEvent::MessageWaitStarted { .. }
            | WorkflowEvent::MessageSent { .. }
            | WorkflowEvent::MessagesDrained { .. }
            | WorkflowEvent::ChildWorkflowStarted { .. } => {}
        }
    }

    /// Process actions from a workflow, returning the new sequence number,
    /// (events_written, tasks_enqueued) and any terminal outcome
    async fn process_actions(
        &self,
        workflow_id: Uuid,
        mut sequence: i32,
        actions: Vec<WorkflowAction>,
        followups: &mut VecDeque<Followup>,
    ) -> Result<(i32, (usize, usize), Option<TerminalOutcome>), ExecutorError> {
        let mut events_written = 0usize;
        let mut tasks_enqueued = 0usize;
        let mut terminal = None;

        for action in actions {
            match action {
                WorkflowAction::RunActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%workflow_id, %activity_id, %activity_type, "scheduling activity");

                    let event = WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .enqueue_task(TaskDefinition {
                            workflow_id,
                            activity_id,
                            activity_type,
                            input,
                            options,
                        })
                        .await?;
                    tasks_enqueued += 1;
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    let fire_at = Utc::now()
                        + chrono::Duration::from_std(duration).unwrap_or_default();
                    debug!(%workflow_id, %timer_id, %fire_at, "starting timer");

                    let event = WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        fire_at,
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .schedule_timer(workflow_id, &timer_id, fire_at)
                        .await?;
                }

                WorkflowAction::WaitForMessage {
                    wait_id,
                    topic,
                    timeout,
                } => {
                    let expires_at =
                        Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();
                    debug!(%workflow_id, %wait_id, ?topic, %expires_at, "waiting for message");

                    let event = WorkflowEvent::MessageWaitStarted {
                        wait_id: wait_id.clone(),
                        topic: topic.clone(),
                        expires_at,
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store
                        .register_wait(workflow_id, &wait_id, topic.as_deref(), expires_at)
                        .await?;
                }

                WorkflowAction::SendMessage { target, message } => {
                    debug!(%workflow_id, %target, topic = %message.topic, "sending message");

                    let event = WorkflowEvent::MessageSent {
                        target,
                        topic: message.topic.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    self.store.enqueue_message(target, message).await?;
                    followups.push_back(Followup::Process(target));
                }

                WorkflowAction::DrainMessages { topic } => {
                    let count = self.store.drain_messages(workflow_id, &topic).await?;
                    debug!(%workflow_id, %topic, count, "drained messages");

                    let event = WorkflowEvent::MessagesDrained { topic, count };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;
                }

                WorkflowAction::StartWorkflow {
                    workflow_id: child_id,
                    workflow_type,
                    input,
                    queue,
                    partition_key,
                } => {
                    debug!(%workflow_id, %child_id, %workflow_type, "starting child workflow");

                    let options = StartOptions {
                        queue: queue.clone(),
                        partition_key,
                        app_version: self.config.app_version.clone(),
                    };
                    let created = self
                        .store
                        .create_workflow(child_id, &workflow_type, input, &options)
                        .await?;

                    let event = WorkflowEvent::ChildWorkflowStarted {
                        workflow_id: child_id,
                        workflow_type,
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;

                    if created && queue.is_none() {
                        followups.push_back(Followup::Launch(child_id));
                    }
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!(%workflow_id, "completing workflow");

                    let event = WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;
                    terminal = Some(TerminalOutcome::Completed(result));
                }

                WorkflowAction::FailWorkflow { error } => {
                    warn!(%workflow_id, error = %error.message, "failing workflow");

                    let event = WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    };
                    sequence = self
                        .store
                        .append_events(workflow_id, sequence, vec![event])
                        .await?;
                    events_written += 1;
                    terminal = Some(TerminalOutcome::Failed(error));
                }

                WorkflowAction::None => {}
            }
        }

        Ok((sequence, (events_written, tasks_enqueued), terminal))
    }
}

/// Whether an activity already has a terminal event recorded
fn activity_resolved(events: &[(i32, WorkflowEvent)], activity_id: &str) -> bool {
    events.iter().any(|(_, e)| match e {
        WorkflowEvent::ActivityCompleted { activity_id: a, .. } => a == activity_id,
        WorkflowEvent::ActivityFailed {
            activity_id: a,
            will_retry,
            ..
        } => a == activity_id && !will_retry,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::workflow::Workflow;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CounterInput {
        start: i32,
        target: i32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CounterOutput {
        final_value: i32,
    }

    struct CounterWorkflow {
        current: i32,
        target: i32,
        completed: bool,
        error_message: Option<String>,
    }

    impl Workflow for CounterWorkflow {
        const TYPE: &'static str = "counter_workflow";
        type Input = CounterInput;
        type Output = CounterOutput;

        fn new(input: Self::Input) -> Self {
            Self {
                current: input.start,
                target: input.target,
                completed: false,
                error_message: None,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            if self.current >= self.target {
                self.completed = true;
                vec![WorkflowAction::complete(
                    json!({ "final_value": self.current }),
                )]
            } else {
                vec![WorkflowAction::activity(
                    format!("increment-{}", self.current),
                    "increment",
                    json!({ "value": self.current }),
                )]
            }
        }

        fn on_activity_completed(
            &mut self,
            _activity_id: &str,
            result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            self.current = result.get("value").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

            if self.current >= self.target {
                self.completed = true;
                vec![WorkflowAction::complete(
                    json!({ "final_value": self.current }),
                )]
            } else {
                vec![WorkflowAction::activity(
                    format!("increment-{}", self.current),
                    "increment",
                    json!({ "value": self.current }),
                )]
            }
        }

        fn on_activity_failed(
            &mut self,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            self.error_message = Some(error.message.clone());
            vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
        }

        fn is_completed(&self) -> bool {
            self.completed
        }

        fn result(&self) -> Option<Self::Output> {
            self.completed.then(|| CounterOutput {
                final_value: self.current,
            })
        }

        fn error(&self) -> Option<WorkflowError> {
            self.error_message.as_ref().map(WorkflowError::new)
        }
    }

    /// Workflow that waits for a single message and completes with its payload
    struct EchoWaitWorkflow {
        received: Option<serde_json::Value>,
        timed_out: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EmptyInput {}

    impl Workflow for EchoWaitWorkflow {
        const TYPE: &'static str = "echo_wait";
        type Input = EmptyInput;
        type Output = serde_json::Value;

        fn new(_input: Self::Input) -> Self {
            Self {
                received: None,
                timed_out: false,
            }
        }

        fn on_start(&mut self) -> Vec<WorkflowAction> {
            vec![WorkflowAction::wait(
                "w-1",
                Some("greeting"),
                Duration::from_secs(60),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _activity_id: &str,
            _result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _activity_id: &str,
            _error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_message(
            &mut self,
            _wait_id: &str,
            message: &WorkflowMessage,
        ) -> Vec<WorkflowAction> {
            self.received = Some(message.payload.clone());
            vec![WorkflowAction::complete(message.payload.clone())]
        }

        fn on_message_timeout(&mut self, _wait_id: &str) -> Vec<WorkflowAction> {
            self.timed_out = true;
            vec![WorkflowAction::fail(WorkflowError::new("timed out"))]
        }

        fn is_completed(&self) -> bool {
            self.received.is_some() || self.timed_out
        }

        fn result(&self) -> Option<Self::Output> {
            self.received.clone()
        }
    }

    fn make_executor(
        store: Arc<InMemoryWorkflowStore>,
    ) -> Executor<InMemoryWorkflowStore> {
        let mut registry = WorkflowRegistry::new();
        registry.register::<CounterWorkflow>();
        registry.register::<EchoWaitWorkflow>();
        Executor::new(store, Arc::new(registry), ExecutorConfig::new("test-1"))
    }

    #[tokio::test]
    async fn test_start_workflow_schedules_first_activity() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        let created = executor
            .start_workflow(id, "counter_workflow", json!({"start": 0, "target": 3}), None, None)
            .await
            .expect("should start");
        assert!(created);

        let events = store.load_events(id).await.unwrap();
        assert!(matches!(events[0].1, WorkflowEvent::WorkflowStarted { .. }));
        assert!(matches!(events[1].1, WorkflowEvent::ActivityScheduled { .. }));
        assert_eq!(store.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_start_workflow_is_at_most_once() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        let input = json!({"start": 0, "target": 3});
        assert!(executor
            .start_workflow(id, "counter_workflow", input.clone(), None, None)
            .await
            .unwrap());
        assert!(!executor
            .start_workflow(id, "counter_workflow", input, None, None)
            .await
            .unwrap());

        // Only one start event was recorded
        let events = store.load_events(id).await.unwrap();
        let starts = events
            .iter()
            .filter(|(_, e)| matches!(e, WorkflowEvent::WorkflowStarted { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_activity_completion_drives_progress() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "counter_workflow", json!({"start": 0, "target": 2}), None, None)
            .await
            .unwrap();

        let result = executor
            .on_activity_completed(id, "increment-0", json!({ "value": 1 }))
            .await
            .unwrap();
        assert!(!result.completed);
        // The next increment was scheduled as a consequence of the completion
        assert_eq!(result.tasks_enqueued, 1);

        let result = executor
            .on_activity_completed(id, "increment-1", json!({ "value": 2 }))
            .await
            .unwrap();
        assert!(result.completed);

        let info = store.get_workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!({ "final_value": 2 })));
    }

    #[tokio::test]
    async fn test_duplicate_activity_completion_is_ignored() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "counter_workflow", json!({"start": 0, "target": 2}), None, None)
            .await
            .unwrap();

        executor
            .on_activity_completed(id, "increment-0", json!({ "value": 1 }))
            .await
            .unwrap();
        let before = store.load_events(id).await.unwrap().len();

        // Redelivery of the same completion must not write events
        executor
            .on_activity_completed(id, "increment-0", json!({ "value": 1 }))
            .await
            .unwrap();
        let after = store.load_events(id).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_final_activity_failure_fails_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "counter_workflow", json!({"start": 0, "target": 5}), None, None)
            .await
            .unwrap();

        // Retryable failure: recorded, workflow not notified
        let result = executor
            .on_activity_failed(
                id,
                "increment-0",
                ActivityError::retryable("transient"),
                true,
            )
            .await
            .unwrap();
        assert!(!result.completed);
        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Running
        );

        // Final failure fails the workflow
        let result = executor
            .on_activity_failed(
                id,
                "increment-0",
                ActivityError::non_retryable("boom"),
                false,
            )
            .await
            .unwrap();
        assert!(result.completed);
        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_message_delivery_resolves_wait() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "echo_wait", json!({}), None, None)
            .await
            .unwrap();

        executor
            .send_message(id, WorkflowMessage::new("greeting", json!({"hello": "world"})))
            .await
            .unwrap();

        let info = store.get_workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn test_message_sent_before_wait_is_delivered_on_launch() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        store
            .create_workflow(id, "echo_wait", json!({}), &StartOptions::immediate("test-1"))
            .await
            .unwrap();
        store
            .enqueue_message(id, WorkflowMessage::new("greeting", json!(1)))
            .await
            .unwrap();

        // Launch registers the wait, then finds the queued message
        let result = executor.launch(id).await.unwrap();
        assert!(result.completed);
        assert_eq!(result.messages_delivered, 1);
    }

    #[tokio::test]
    async fn test_off_topic_message_stays_queued() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "echo_wait", json!({}), None, None)
            .await
            .unwrap();

        executor
            .send_message(id, WorkflowMessage::new("other_topic", json!(1)))
            .await
            .unwrap();

        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Running
        );
        // The message is still there, unconsumed
        assert!(store
            .next_message(id, Some("other_topic"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_wait_timeout_fails_echo_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "echo_wait", json!({}), None, None)
            .await
            .unwrap();

        executor.on_wait_timeout(id, "w-1").await.unwrap();

        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_stale_wait_timeout_is_ignored() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "echo_wait", json!({}), None, None)
            .await
            .unwrap();

        // Message wins the race; the wait is cleared
        executor
            .send_message(id, WorkflowMessage::new("greeting", json!(1)))
            .await
            .unwrap();

        // A late timeout for the already-resolved wait is a no-op
        let result = executor.on_wait_timeout(id, "w-1").await.unwrap();
        assert!(result.completed);
        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "echo_wait", json!({}), None, None)
            .await
            .unwrap();

        executor.cancel_workflow(id, "operator request").await.unwrap();

        let info = store.get_workflow_info(id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Cancelled);
        assert!(store.open_wait(id).await.unwrap().is_none());

        // Cancelling again is a no-op
        executor.cancel_workflow(id, "again").await.unwrap();
    }

    #[tokio::test]
    async fn test_cannot_send_to_terminal_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = make_executor(store.clone());

        let id = Uuid::now_v7();
        executor
            .start_workflow(id, "counter_workflow", json!({"start": 5, "target": 3}), None, None)
            .await
            .unwrap();

        let result = executor
            .send_message(id, WorkflowMessage::new("greeting", json!(1)))
            .await;
        assert!(matches!(result, Err(ExecutorError::WorkflowCompleted(_))));
    }

    #[tokio::test]
    async fn test_replay_after_restart_preserves_state() {
        let store = Arc::new(InMemoryWorkflowStore::new());

        let id = Uuid::now_v7();
        {
            let executor = make_executor(store.clone());
            executor
                .start_workflow(id, "counter_workflow", json!({"start": 0, "target": 2}), None, None)
                .await
                .unwrap();
            executor
                .on_activity_completed(id, "increment-0", json!({ "value": 1 }))
                .await
                .unwrap();
        }

        // New executor over the same store (simulated restart)
        let executor = make_executor(store.clone());
        let result = executor
            .on_activity_completed(id, "increment-1", json!({ "value": 2 }))
            .await
            .unwrap();
        assert!(result.completed);
        assert_eq!(
            store.get_workflow_info(id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }
}
