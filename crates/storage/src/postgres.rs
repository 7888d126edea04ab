// PostgreSQL Storage implementation

use async_trait::async_trait;
use chrono::Utc;
use foreman_core::{
    MainThread, QueueItem, QueueItemStatus, WorkerTask, WorkerTaskPatch,
};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::models::{enum_str, MainThreadRow, QueueItemRow, WorkerTaskRow};
use crate::store::{InboxFilter, Storage, StorageError};

/// Schema for the orchestrator entity tables
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS main_threads (
    id UUID PRIMARY KEY,
    user_id TEXT NOT NULL UNIQUE,
    workflow_run_id UUID,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_activity_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    active_task_ids JSONB NOT NULL DEFAULT '[]',
    context JSONB NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS worker_tasks (
    id UUID PRIMARY KEY,
    main_thread_id UUID NOT NULL,
    user_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    description TEXT NOT NULL,
    prompt TEXT NOT NULL,
    model TEXT,
    repo_url TEXT,
    branch_name TEXT,
    base_branch TEXT NOT NULL DEFAULT 'main',
    status TEXT NOT NULL DEFAULT 'pending',
    skip_plan BOOLEAN NOT NULL DEFAULT FALSE,
    plan_text TEXT,
    pending_questions JSONB NOT NULL DEFAULT '[]',
    context JSONB NOT NULL DEFAULT '{}',
    issue_number BIGINT,
    issue_url TEXT,
    issue_etag TEXT,
    pr_number BIGINT,
    pr_url TEXT,
    pr_etag TEXT,
    commit_sha TEXT,
    conversation_id TEXT,
    keywords JSONB NOT NULL DEFAULT '[]',
    result JSONB,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_worker_tasks_user ON worker_tasks (user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS queue_items (
    id UUID PRIMARY KEY,
    main_thread_id UUID NOT NULL,
    task_id UUID,
    user_id TEXT NOT NULL,
    item_type TEXT NOT NULL,
    priority TEXT NOT NULL DEFAULT 'normal',
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    context JSONB NOT NULL DEFAULT '{}',
    options JSONB,
    status TEXT NOT NULL DEFAULT 'pending',
    response TEXT,
    responded_at TIMESTAMPTZ,
    read_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_queue_items_user ON queue_items (user_id, created_at DESC)
"#;

const TASK_COLUMNS: &str = "id, main_thread_id, user_id, task_type, description, prompt, model, \
     repo_url, branch_name, base_branch, status, skip_plan, plan_text, pending_questions, \
     context, issue_number, issue_url, issue_etag, pr_number, pr_url, pr_etag, commit_sha, \
     conversation_id, keywords, result, error, created_at, started_at, completed_at";

const ITEM_COLUMNS: &str = "id, main_thread_id, task_id, user_id, item_type, priority, title, \
     content, context, options, status, response, responded_at, read_at, created_at, expires_at";

/// PostgreSQL implementation of [`Storage`]
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the entity tables if they don't exist
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn write_task(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task: &WorkerTask,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE worker_tasks
            SET task_type = $2, description = $3, prompt = $4, model = $5, repo_url = $6,
                branch_name = $7, base_branch = $8, status = $9, skip_plan = $10,
                plan_text = $11, pending_questions = $12, context = $13, issue_number = $14,
                issue_url = $15, issue_etag = $16, pr_number = $17, pr_url = $18,
                pr_etag = $19, commit_sha = $20, conversation_id = $21, keywords = $22,
                result = $23, error = $24, started_at = $25, completed_at = $26
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(enum_str(&task.task_type)?)
        .bind(&task.description)
        .bind(&task.prompt)
        .bind(&task.model)
        .bind(&task.repo_url)
        .bind(&task.branch_name)
        .bind(&task.base_branch)
        .bind(enum_str(&task.status)?)
        .bind(task.skip_plan)
        .bind(&task.plan_text)
        .bind(serde_json::to_value(&task.pending_questions)?)
        .bind(serde_json::to_value(&task.context)?)
        .bind(task.issue_number)
        .bind(&task.issue_url)
        .bind(&task.issue_etag)
        .bind(task.pr_number)
        .bind(&task.pr_url)
        .bind(&task.pr_etag)
        .bind(&task.commit_sha)
        .bind(&task.conversation_id)
        .bind(serde_json::to_value(&task.keywords)?)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_main_thread(&self, thread: &MainThread) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO main_threads
                (id, user_id, workflow_run_id, status, created_at, last_activity_at,
                 active_task_ids, context)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(thread.id)
        .bind(&thread.user_id)
        .bind(thread.workflow_run_id)
        .bind(enum_str(&thread.status)?)
        .bind(thread.created_at)
        .bind(thread.last_activity_at)
        .bind(serde_json::to_value(&thread.active_task_ids)?)
        .bind(serde_json::Value::Object(thread.context.clone()))
        .execute(&self.pool)
        .await?;

        debug!(thread_id = %thread.id, user_id = %thread.user_id, "created main thread");
        Ok(())
    }

    async fn get_main_thread(&self, id: Uuid) -> Result<Option<MainThread>, StorageError> {
        let row = sqlx::query_as::<_, MainThreadRow>(
            "SELECT * FROM main_threads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MainThreadRow::into_entity).transpose()
    }

    async fn get_main_thread_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<MainThread>, StorageError> {
        let row = sqlx::query_as::<_, MainThreadRow>(
            "SELECT * FROM main_threads WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MainThreadRow::into_entity).transpose()
    }

    async fn set_main_thread_workflow(
        &self,
        id: Uuid,
        workflow_run_id: Uuid,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE main_threads SET workflow_run_id = $2 WHERE id = $1")
            .bind(id)
            .bind(workflow_run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_main_thread_context(
        &self,
        id: Uuid,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE main_threads SET context = $2, last_activity_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::Value::Object(context))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError> {
        // Atomic append with dedup, no read-modify-write race
        sqlx::query(
            r#"
            UPDATE main_threads
            SET active_task_ids = CASE
                    WHEN active_task_ids @> to_jsonb(ARRAY[$2::TEXT])
                    THEN active_task_ids
                    ELSE active_task_ids || to_jsonb(ARRAY[$2::TEXT])
                END,
                last_activity_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_active_task(&self, id: Uuid, task_id: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE main_threads
            SET active_task_ids = active_task_ids - $2::TEXT,
                last_activity_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_worker_task(&self, task: &WorkerTask) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO worker_tasks
                (id, main_thread_id, user_id, task_type, description, prompt, model,
                 repo_url, branch_name, base_branch, status, skip_plan, plan_text,
                 pending_questions, context, issue_number, issue_url, issue_etag,
                 pr_number, pr_url, pr_etag, commit_sha, conversation_id, keywords,
                 result, error, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
            "#,
        )
        .bind(task.id)
        .bind(task.main_thread_id)
        .bind(&task.user_id)
        .bind(enum_str(&task.task_type)?)
        .bind(&task.description)
        .bind(&task.prompt)
        .bind(&task.model)
        .bind(&task.repo_url)
        .bind(&task.branch_name)
        .bind(&task.base_branch)
        .bind(enum_str(&task.status)?)
        .bind(task.skip_plan)
        .bind(&task.plan_text)
        .bind(serde_json::to_value(&task.pending_questions)?)
        .bind(serde_json::to_value(&task.context)?)
        .bind(task.issue_number)
        .bind(&task.issue_url)
        .bind(&task.issue_etag)
        .bind(task.pr_number)
        .bind(&task.pr_url)
        .bind(&task.pr_etag)
        .bind(&task.commit_sha)
        .bind(&task.conversation_id)
        .bind(serde_json::to_value(&task.keywords)?)
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        debug!(task_id = %task.id, "created worker task");
        Ok(())
    }

    async fn get_worker_task(&self, id: Uuid) -> Result<Option<WorkerTask>, StorageError> {
        let row = sqlx::query_as::<_, WorkerTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM worker_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkerTaskRow::into_entity).transpose()
    }

    async fn list_worker_tasks(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<WorkerTask>, StorageError> {
        let rows = if active_only {
            sqlx::query_as::<_, WorkerTaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM worker_tasks \
                 WHERE user_id = $1 AND status NOT IN ('completed', 'failed', 'cancelled') \
                 ORDER BY created_at DESC"
            ))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, WorkerTaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM worker_tasks WHERE user_id = $1 \
                 ORDER BY created_at DESC"
            ))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(WorkerTaskRow::into_entity).collect()
    }

    async fn update_worker_task(
        &self,
        id: Uuid,
        patch: WorkerTaskPatch,
    ) -> Result<WorkerTask, StorageError> {
        // Read-apply-write under the row lock so terminal protection matches
        // the in-memory semantics exactly
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, WorkerTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM worker_tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StorageError::NotFound(id))?;

        let mut task = row.into_entity()?;

        let effective = if task.status.is_terminal() {
            WorkerTaskPatch {
                started_at: patch.started_at,
                completed_at: patch.completed_at,
                ..Default::default()
            }
        } else {
            patch
        };
        effective.apply(&mut task);

        self.write_task(&mut tx, &task).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn create_queue_item(&self, item: &QueueItem) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO queue_items
                (id, main_thread_id, task_id, user_id, item_type, priority, title, content,
                 context, options, status, response, responded_at, read_at, created_at,
                 expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(item.id)
        .bind(item.main_thread_id)
        .bind(item.task_id)
        .bind(&item.user_id)
        .bind(enum_str(&item.item_type)?)
        .bind(enum_str(&item.priority)?)
        .bind(&item.title)
        .bind(&item.content)
        .bind(serde_json::Value::Object(item.context.clone()))
        .bind(item.options.as_ref().map(serde_json::to_value).transpose()?)
        .bind(enum_str(&item.status)?)
        .bind(&item.response)
        .bind(item.responded_at)
        .bind(item.read_at)
        .bind(item.created_at)
        .bind(item.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, StorageError> {
        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueItemRow::into_entity).transpose()
    }

    async fn list_queue_items(
        &self,
        user_id: &str,
        filter: InboxFilter,
    ) -> Result<Vec<QueueItem>, StorageError> {
        let status = filter
            .status
            .map(|s| enum_str(&s))
            .transpose()?;
        let limit = if filter.limit > 0 {
            filter.limit as i64
        } else {
            i64::MAX
        };

        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM queue_items
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND (NOT $3 OR read_at IS NULL)
              AND ($4::TIMESTAMPTZ IS NULL OR created_at > $4)
            ORDER BY created_at DESC
            LIMIT $5
            "#
        ))
        .bind(user_id)
        .bind(status)
        .bind(filter.unread_only)
        .bind(filter.created_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueItemRow::into_entity).collect()
    }

    async fn respond_queue_item(
        &self,
        id: Uuid,
        response: &str,
    ) -> Result<QueueItem, StorageError> {
        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            UPDATE queue_items
            SET response = $2, status = 'responded', responded_at = $3
            WHERE id = $1
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(response)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound(id))?;

        row.into_entity()
    }

    async fn mark_queue_item_read(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE queue_items SET read_at = NOW() WHERE id = $1 AND read_at IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_queue_item_status(
        &self,
        id: Uuid,
        status: QueueItemStatus,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE queue_items SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(enum_str(&status)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_items \
             WHERE user_id = $1 AND status = 'pending' AND read_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
