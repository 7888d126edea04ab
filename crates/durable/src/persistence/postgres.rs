//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Activity task claiming with SKIP LOCKED
//! - Durable messages, timers and waits in dedicated tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, WorkflowError, WorkflowEvent, WorkflowMessage};

/// Schema for the durable engine tables
///
/// Applied idempotently on startup via [`PostgresWorkflowStore::ensure_schema`].
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS durable_workflows (
    id UUID PRIMARY KEY,
    workflow_type TEXT NOT NULL,
    status TEXT NOT NULL,
    input JSONB NOT NULL,
    result JSONB,
    error JSONB,
    queue TEXT,
    partition_key TEXT,
    app_version TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_durable_workflows_queue
    ON durable_workflows (queue, status, created_at);

CREATE TABLE IF NOT EXISTS durable_workflow_events (
    workflow_id UUID NOT NULL REFERENCES durable_workflows(id),
    sequence_num INT NOT NULL,
    event_data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (workflow_id, sequence_num)
);

CREATE TABLE IF NOT EXISTS durable_tasks (
    id UUID PRIMARY KEY,
    workflow_id UUID NOT NULL,
    activity_id TEXT NOT NULL,
    activity_type TEXT NOT NULL,
    input JSONB NOT NULL,
    options JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt INT NOT NULL DEFAULT 1,
    visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deadline TIMESTAMPTZ,
    claimed_by TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_durable_tasks_claimable
    ON durable_tasks (status, visible_at);

CREATE TABLE IF NOT EXISTS durable_messages (
    workflow_id UUID NOT NULL,
    seq BIGINT NOT NULL,
    topic TEXT NOT NULL,
    message JSONB NOT NULL,
    consumed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (workflow_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_durable_messages_pending
    ON durable_messages (workflow_id, topic, seq) WHERE NOT consumed;

CREATE TABLE IF NOT EXISTS durable_timers (
    workflow_id UUID NOT NULL,
    timer_id TEXT NOT NULL,
    fire_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (workflow_id, timer_id)
);

CREATE INDEX IF NOT EXISTS idx_durable_timers_due ON durable_timers (fire_at);

CREATE TABLE IF NOT EXISTS durable_waits (
    workflow_id UUID PRIMARY KEY,
    wait_id TEXT NOT NULL,
    topic TEXT,
    expires_at TIMESTAMPTZ NOT NULL
);
"#;

/// PostgreSQL implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```ignore
/// use foreman_durable::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/foreman").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine tables if they don't exist
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_workflow_status(status: &str) -> Result<WorkflowStatus, StoreError> {
    match status {
        "enqueued" => Ok(WorkflowStatus::Enqueued),
        "running" => Ok(WorkflowStatus::Running),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(StoreError::Database(format!(
            "unknown workflow status: {other}"
        ))),
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, input, options))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
        options: &StartOptions,
    ) -> Result<bool, StoreError> {
        let status = if options.queue.is_some() {
            "enqueued"
        } else {
            "running"
        };

        let result = sqlx::query(
            r#"
            INSERT INTO durable_workflows (id, workflow_type, status, input, queue, partition_key, app_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(status)
        .bind(&input)
        .bind(&options.queue)
        .bind(&options.partition_key)
        .bind(&options.app_version)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        if created {
            debug!(%workflow_id, %workflow_type, "created workflow");
        }
        Ok(created)
    }

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM durable_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status: String = row.get("status");
        parse_workflow_status(&status)
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, queue, partition_key,
                   app_version, created_at, updated_at
            FROM durable_workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let status: String = row.get("status");
        let error: Option<serde_json::Value> = row.get("error");

        Ok(WorkflowInfo {
            id: row.get("id"),
            workflow_type: row.get("workflow_type"),
            status: parse_workflow_status(&status)?,
            input: row.get("input"),
            result: row.get("result"),
            error: error.and_then(|v| serde_json::from_value::<WorkflowError>(v).ok()),
            queue: row.get("queue"),
            partition_key: row.get("partition_key"),
            app_version: row.get("app_version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            UPDATE durable_workflows
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(status.to_string())
        .bind(&result)
        .bind(&error_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serialize appends per workflow by locking the instance row
        let locked = sqlx::query("SELECT id FROM durable_workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_num) + 1, 0) AS next_seq
            FROM durable_workflow_events
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await?;

        let current_sequence: i32 = row.get::<i32, _>("next_seq");

        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut new_sequence = current_sequence;
        for event in events {
            let event_data = serde_json::to_value(&event)?;

            sqlx::query(
                r#"
                INSERT INTO durable_workflow_events (workflow_id, sequence_num, event_data)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(workflow_id)
            .bind(new_sequence)
            .bind(&event_data)
            .execute(&mut *tx)
            .await?;

            new_sequence += 1;
        }

        tx.commit().await?;

        debug!(%workflow_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    async fn load_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(i32, WorkflowEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data
            FROM durable_workflow_events
            WHERE workflow_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i32 = row.get("sequence_num");
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data)?;
            events.push((seq, event));
        }

        Ok(events)
    }

    async fn list_recoverable(&self, app_version: &str) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM durable_workflows
            WHERE status = 'running' AND app_version = $1
            ORDER BY created_at
            "#,
        )
        .bind(app_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    async fn claim_queue_admissions(
        &self,
        queues: &[QueueConfig],
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut admitted = Vec::new();

        for queue in queues {
            let mut tx = self.pool.begin().await?;

            // Candidates oldest-first, locked so concurrent schedulers don't
            // admit the same workflow twice
            let candidates = sqlx::query(
                r#"
                SELECT id, partition_key FROM durable_workflows
                WHERE queue = $1 AND status = 'enqueued' AND app_version = $2
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(&queue.name)
            .bind(app_version)
            .fetch_all(&mut *tx)
            .await?;

            let occupancy_rows = sqlx::query(
                r#"
                SELECT partition_key, COUNT(*) AS running
                FROM durable_workflows
                WHERE queue = $1 AND status = 'running'
                GROUP BY partition_key
                "#,
            )
            .bind(&queue.name)
            .fetch_all(&mut *tx)
            .await?;

            let mut occupancy: std::collections::HashMap<Option<String>, i64> = occupancy_rows
                .into_iter()
                .map(|r| {
                    let key: Option<String> = r.get("partition_key");
                    let count: i64 = r.get("running");
                    (if queue.partitioned { key } else { None }, count)
                })
                .fold(std::collections::HashMap::new(), |mut acc, (k, v)| {
                    *acc.entry(k).or_default() += v;
                    acc
                });

            for row in candidates {
                let id: Uuid = row.get("id");
                let partition: Option<String> = row.get("partition_key");
                let key = if queue.partitioned { partition } else { None };

                let slot = occupancy.entry(key).or_default();
                if *slot < queue.concurrency as i64 {
                    *slot += 1;
                    sqlx::query(
                        "UPDATE durable_workflows SET status = 'running', updated_at = NOW() WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    admitted.push(id);
                }
            }

            tx.commit().await?;
        }

        Ok(admitted)
    }

    async fn count_active_workflows(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM durable_workflows WHERE status IN ('enqueued', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("active"))
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let options = serde_json::to_value(&task.options)?;

        sqlx::query(
            r#"
            INSERT INTO durable_tasks (id, workflow_id, activity_id, activity_type, input, options)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(task_id)
        .bind(task.workflow_id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(&task.input)
        .bind(&options)
        .execute(&self.pool)
        .await?;

        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'claimed',
                claimed_by = $1,
                deadline = NOW() + ((options->>'start_to_close_timeout')::BIGINT * INTERVAL '1 millisecond')
            WHERE id IN (
                SELECT id FROM durable_tasks
                WHERE status = 'pending' AND visible_at <= NOW()
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, workflow_id, activity_id, activity_type, input, options, attempt
            "#,
        )
        .bind(worker_id)
        .bind(max_tasks as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let options: serde_json::Value = row.get("options");
            let options: ActivityOptions = serde_json::from_value(options)?;
            claimed.push(ClaimedTask {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                activity_id: row.get("activity_id"),
                activity_type: row.get("activity_type"),
                input: row.get("input"),
                options,
                attempt: row.get::<i32, _>("attempt") as u32,
            });
        }

        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE durable_tasks SET status = 'completed' WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT options, attempt FROM durable_tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let options: serde_json::Value = row.get("options");
        let options: ActivityOptions = serde_json::from_value(options)?;
        let attempt = row.get::<i32, _>("attempt") as u32;

        let outcome = if error.retryable && options.retry_policy.should_retry(attempt) {
            let next_attempt = attempt + 1;
            let delay = options.retry_policy.delay_for_attempt(next_attempt);
            sqlx::query(
                r#"
                UPDATE durable_tasks
                SET status = 'pending',
                    attempt = $2,
                    visible_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond'),
                    deadline = NULL,
                    claimed_by = NULL
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(next_attempt as i32)
            .bind(delay.as_millis() as i64)
            .execute(&mut *tx)
            .await?;
            TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            }
        } else {
            sqlx::query("UPDATE durable_tasks SET status = 'failed' WHERE id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            TaskFailureOutcome::ExhaustedRetries
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reclaim_stale_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleTask>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, activity_id, options, attempt
            FROM durable_tasks
            WHERE status = 'claimed' AND deadline IS NOT NULL AND deadline <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut stale = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: Uuid = row.get("id");
            let options: serde_json::Value = row.get("options");
            let options: ActivityOptions = serde_json::from_value(options)?;
            let attempt = row.get::<i32, _>("attempt") as u32;

            let exhausted = !options.retry_policy.should_retry(attempt);
            if exhausted {
                sqlx::query("UPDATE durable_tasks SET status = 'failed' WHERE id = $1")
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                let next_attempt = attempt + 1;
                let delay = options.retry_policy.delay_for_attempt(next_attempt);
                sqlx::query(
                    r#"
                    UPDATE durable_tasks
                    SET status = 'pending',
                        attempt = $2,
                        visible_at = $3 + ($4::BIGINT * INTERVAL '1 millisecond'),
                        deadline = NULL,
                        claimed_by = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(next_attempt as i32)
                .bind(now)
                .bind(delay.as_millis() as i64)
                .execute(&mut *tx)
                .await?;
            }

            stale.push(StaleTask {
                task_id,
                workflow_id: row.get("workflow_id"),
                activity_id: row.get("activity_id"),
                exhausted,
            });
        }

        tx.commit().await?;
        Ok(stale)
    }

    async fn enqueue_message(
        &self,
        workflow_id: Uuid,
        message: WorkflowMessage,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&message)?;

        sqlx::query(
            r#"
            INSERT INTO durable_messages (workflow_id, seq, topic, message)
            VALUES (
                $1,
                COALESCE((SELECT MAX(seq) FROM durable_messages WHERE workflow_id = $1), 0) + 1,
                $2,
                $3
            )
            "#,
        )
        .bind(workflow_id)
        .bind(&message.topic)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn next_message(
        &self,
        workflow_id: Uuid,
        topic: Option<&str>,
    ) -> Result<Option<(i64, WorkflowMessage)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT seq, message FROM durable_messages
            WHERE workflow_id = $1 AND NOT consumed AND ($2::TEXT IS NULL OR topic = $2)
            ORDER BY seq
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let seq: i64 = row.get("seq");
                let message: serde_json::Value = row.get("message");
                let message: WorkflowMessage = serde_json::from_value(message)?;
                Ok(Some((seq, message)))
            }
            None => Ok(None),
        }
    }

    async fn consume_message(&self, workflow_id: Uuid, seq: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE durable_messages SET consumed = TRUE WHERE workflow_id = $1 AND seq = $2",
        )
        .bind(workflow_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drain_messages(&self, workflow_id: Uuid, topic: &str) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_messages SET consumed = TRUE
            WHERE workflow_id = $1 AND topic = $2 AND NOT consumed
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn schedule_timer(
        &self,
        workflow_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_timers (workflow_id, timer_id, fire_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, timer_id) DO UPDATE SET fire_at = EXCLUDED.fire_at
            "#,
        )
        .bind(workflow_id)
        .bind(timer_id)
        .bind(fire_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT workflow_id, timer_id FROM durable_timers WHERE fire_at <= $1 ORDER BY fire_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("workflow_id"), r.get("timer_id")))
            .collect())
    }

    async fn clear_timer(&self, workflow_id: Uuid, timer_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM durable_timers WHERE workflow_id = $1 AND timer_id = $2")
            .bind(workflow_id)
            .bind(timer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_wait(
        &self,
        workflow_id: Uuid,
        wait_id: &str,
        topic: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_waits (workflow_id, wait_id, topic, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id) DO UPDATE
                SET wait_id = EXCLUDED.wait_id,
                    topic = EXCLUDED.topic,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(workflow_id)
        .bind(wait_id)
        .bind(topic)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_wait(&self, workflow_id: Uuid) -> Result<Option<OpenWait>, StoreError> {
        let row = sqlx::query(
            "SELECT wait_id, topic, expires_at FROM durable_waits WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| OpenWait {
            wait_id: r.get("wait_id"),
            topic: r.get("topic"),
            expires_at: r.get("expires_at"),
        }))
    }

    async fn clear_wait(&self, workflow_id: Uuid, wait_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM durable_waits WHERE workflow_id = $1 AND wait_id = $2")
            .bind(workflow_id)
            .bind(wait_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_wait_timeouts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>, StoreError> {
        let rows =
            sqlx::query("SELECT workflow_id, wait_id FROM durable_waits WHERE expires_at <= $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("workflow_id"), r.get("wait_id")))
            .collect())
    }

    async fn cancel_workflow_work(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM durable_tasks WHERE workflow_id = $1 AND status IN ('pending', 'claimed')",
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to drop pending tasks: {e}");
            StoreError::Database(e.to_string())
        })?;

        sqlx::query("DELETE FROM durable_timers WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM durable_waits WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
