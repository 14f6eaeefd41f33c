//! Scheduled task rows and their SQLite storage.

use crate::db::{from_millis, to_millis};
use crate::error::{DbError, Result};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Deferred relevance evaluation of one or more coalesced messages.
    Analysis,
    /// Hand a respond verdict to the responder and send the result.
    ResponseDispatch,
    /// Proactive message into a conversation that scored as worth revisiting.
    ConversationFollowup,
    /// Periodic conversation-level relevance refresh.
    Monitoring,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Analysis,
        TaskKind::ResponseDispatch,
        TaskKind::ConversationFollowup,
        TaskKind::Monitoring,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Analysis => "analysis",
            TaskKind::ResponseDispatch => "response_dispatch",
            TaskKind::ConversationFollowup => "conversation_followup",
            TaskKind::Monitoring => "monitoring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analysis" => Some(TaskKind::Analysis),
            "response_dispatch" => Some(TaskKind::ResponseDispatch),
            "conversation_followup" => Some(TaskKind::ConversationFollowup),
            "monitoring" => Some(TaskKind::Monitoring),
            _ => None,
        }
    }

    /// Only delivery tasks get the bounded backoff. Decision tasks are dropped on failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TaskKind::ResponseDispatch | TaskKind::ConversationFollowup
        )
    }

    pub fn default_priority(self) -> i64 {
        match self {
            TaskKind::ResponseDispatch => 3,
            TaskKind::Analysis => 2,
            TaskKind::ConversationFollowup => 1,
            TaskKind::Monitoring => 0,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retry,
    Stopped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retry,
        TaskStatus::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
            TaskStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "retry" => Some(TaskStatus::Retry),
            "stopped" => Some(TaskStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status only moves forward, except `retry -> processing`.
pub fn can_transition(current: TaskStatus, next: TaskStatus) -> bool {
    if current.is_finished() {
        return false;
    }

    if next == TaskStatus::Stopped {
        return true;
    }

    matches!(
        (current, next),
        (TaskStatus::Pending, TaskStatus::Processing)
            | (TaskStatus::Processing, TaskStatus::Completed)
            | (TaskStatus::Processing, TaskStatus::Failed)
            | (TaskStatus::Processing, TaskStatus::Retry)
            | (TaskStatus::Retry, TaskStatus::Processing)
    )
}

/// A persisted one-shot job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: i64,
    pub payload: Value,
    pub next_execution_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        kind: TaskKind,
        payload: Value,
        execute_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            status: TaskStatus::Pending,
            priority: kind.default_priority(),
            payload,
            next_execution_at: execute_at,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// When the task should next fire.
    pub fn due_at(&self) -> DateTime<Utc> {
        match (self.status, self.next_retry_at) {
            (TaskStatus::Retry, Some(next_retry_at)) => next_retry_at,
            _ => self.next_execution_at,
        }
    }
}

/// Row count for one kind/status pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCount {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub count: i64,
}

/// Durable storage for scheduled tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// Insert or replace the row for `task.id`.
    async fn save(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Set the status, stamping `completed_at`/`failed_at` when relevant.
    async fn update_status(&self, id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<()>;

    async fn reschedule(
        &self,
        id: &str,
        next_execution_at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<()>;

    /// Move a task to `retry` with its new attempt count and due time.
    async fn record_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Pending and retry rows, highest priority first, then oldest first.
    async fn load_restorable(&self) -> Result<Vec<Task>>;

    /// Unfinished rows whose due time is before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Delete completed, failed and stopped rows.
    async fn delete_finished(&self) -> Result<u64>;

    async fn counts(&self) -> Result<Vec<TaskCount>>;
}

const TASK_COLUMNS: &str = "scheduler_id, kind, status, priority, data, next_execution, created_at, completed_at, failed_at, retry_count, next_retry_at";

/// SQLite-backed task store.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the task table.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                scheduler_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL DEFAULT '{}',
                next_execution INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                failed_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_status ON scheduled_tasks (status, next_execution)",
        )
        .execute(&self.pool)
        .await
        .context("failed to create scheduled_tasks index")?;

        Ok(())
    }

    /// The earliest pending or retrying row.
    pub async fn next_pending(&self) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE status IN ('pending', 'retry') \
             ORDER BY COALESCE(next_retry_at, next_execution) ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch next pending task")?;

        row.map(task_from_row).transpose()
    }

    /// Map rows, deleting any that no longer parse.
    async fn tasks_from_rows(&self, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("scheduler_id")
                .context("failed to read task scheduler_id")?;
            match task_from_row(row) {
                Ok(task) => tasks.push(task),
                Err(error) => {
                    tracing::warn!(task_id = %id, %error, "deleting unreadable task row");
                    self.delete(&id).await?;
                }
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskStore {
    async fn save(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (
                scheduler_id, kind, status, priority, data, next_execution, created_at,
                completed_at, failed_at, retry_count, next_retry_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scheduler_id) DO UPDATE SET
                kind = excluded.kind,
                status = excluded.status,
                priority = excluded.priority,
                data = excluded.data,
                next_execution = excluded.next_execution,
                completed_at = excluded.completed_at,
                failed_at = excluded.failed_at,
                retry_count = excluded.retry_count,
                next_retry_at = excluded.next_retry_at
            "#,
        )
        .bind(&task.id)
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.payload.to_string())
        .bind(to_millis(task.next_execution_at))
        .bind(to_millis(task.created_at))
        .bind(task.completed_at.map(to_millis))
        .bind(task.failed_at.map(to_millis))
        .bind(i64::from(task.retry_count))
        .bind(task.next_retry_at.map(to_millis))
        .execute(&self.pool)
        .await
        .context("failed to save task")?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE scheduler_id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch task")?;

        row.map(task_from_row).transpose()
    }

    async fn update_status(&self, id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        let completed_at = (status == TaskStatus::Completed).then(|| to_millis(at));
        let failed_at = (status == TaskStatus::Failed).then(|| to_millis(at));

        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = ?,
                completed_at = COALESCE(?, completed_at),
                failed_at = COALESCE(?, failed_at)
            WHERE scheduler_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(failed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update task status")?;

        Ok(())
    }

    async fn reschedule(
        &self,
        id: &str,
        next_execution_at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET next_execution = ?, data = COALESCE(?, data)
            WHERE scheduler_id = ?
            "#,
        )
        .bind(to_millis(next_execution_at))
        .bind(payload.map(Value::to_string))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to reschedule task")?;

        Ok(())
    }

    async fn record_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = 'retry', retry_count = ?, next_retry_at = ?
            WHERE scheduler_id = ?
            "#,
        )
        .bind(i64::from(retry_count))
        .bind(to_millis(next_retry_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to record task retry")?;

        Ok(())
    }

    async fn load_restorable(&self) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE status IN ('pending', 'retry') \
             ORDER BY priority DESC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to load restorable tasks")?;

        self.tasks_from_rows(rows).await
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE status IN ('pending', 'processing', 'retry') \
             AND COALESCE(next_retry_at, next_execution) < ?"
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await
            .context("failed to load overdue tasks")?;

        self.tasks_from_rows(rows).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE scheduler_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete task")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_finished(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduled_tasks WHERE status IN ('completed', 'failed', 'stopped')",
        )
        .execute(&self.pool)
        .await
        .context("failed to delete finished tasks")?;

        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<Vec<TaskCount>> {
        let rows = sqlx::query(
            "SELECT kind, status, COUNT(*) AS count FROM scheduled_tasks GROUP BY kind, status ORDER BY kind, status",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to count tasks")?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind").context("failed to read task kind")?;
            let status: String = row.try_get("status").context("failed to read task status")?;
            let (Some(kind), Some(status)) = (TaskKind::parse(&kind), TaskStatus::parse(&status))
            else {
                continue;
            };
            counts.push(TaskCount {
                kind,
                status,
                count: row.try_get("count").context("failed to read task count")?,
            });
        }
        Ok(counts)
    }
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Task> {
    let kind_value: String = row.try_get("kind").context("failed to read task kind")?;
    let status_value: String = row
        .try_get("status")
        .context("failed to read task status")?;

    let kind = TaskKind::parse(&kind_value).ok_or(DbError::InvalidColumn {
        column: "kind",
        value: kind_value,
    })?;
    let status = TaskStatus::parse(&status_value).ok_or(DbError::InvalidColumn {
        column: "status",
        value: status_value,
    })?;

    // Corrupt payloads surface as null and are rejected by payload validation.
    let data: String = row.try_get("data").unwrap_or_default();
    let payload = serde_json::from_str(&data).unwrap_or(Value::Null);

    let optional_time = |column: &'static str| -> Result<Option<DateTime<Utc>>> {
        row.try_get::<Option<i64>, _>(column)
            .ok()
            .flatten()
            .map(|millis| from_millis(millis, column))
            .transpose()
    };

    Ok(Task {
        id: row
            .try_get("scheduler_id")
            .context("failed to read task scheduler_id")?,
        kind,
        status,
        priority: row.try_get("priority").unwrap_or(0),
        payload,
        next_execution_at: from_millis(
            row.try_get("next_execution")
                .context("failed to read task next_execution")?,
            "next_execution",
        )?,
        created_at: from_millis(
            row.try_get("created_at")
                .context("failed to read task created_at")?,
            "created_at",
        )?,
        completed_at: optional_time("completed_at")?,
        failed_at: optional_time("failed_at")?,
        retry_count: row
            .try_get::<i64, _>("retry_count")
            .map(|count| count.max(0) as u32)
            .unwrap_or(0),
        next_retry_at: optional_time("next_retry_at")?,
    })
}
