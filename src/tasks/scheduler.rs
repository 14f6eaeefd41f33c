//! Task scheduler: one-shot timers, persistence and restoration.
//!
//! Every scheduled task gets its own tokio timer. When a timer fires the task
//! is marked `processing` and sent over the fired-task channel; the owner of
//! the receiver hands it back to [`TaskScheduler::execute`] with the handler
//! registry. Completion, bounded retries, cancellation and grace-period
//! deletion all go through this type.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::tasks::payload;
use crate::tasks::store::{Task, TaskKind, TaskRepository, TaskStatus, can_transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Executes fired tasks of one kind.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, task: &Task) -> Result<()>;
}

/// Handlers resolved once at startup, keyed by task kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: TaskKind, handler: impl TaskHandler) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A task with an armed timer.
struct LiveTask {
    task: Task,
    handle: JoinHandle<()>,
}

/// Operator-facing view of a live task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub due_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            status: task.status,
            due_at: task.due_at(),
            retry_count: task.retry_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub active_task_count: usize,
    pub next_task: Option<TaskSummary>,
    pub config: SchedulerConfig,
}

/// Scheduler that owns every live task timer.
pub struct TaskScheduler {
    timers: Arc<RwLock<HashMap<String, LiveTask>>>,
    reapers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    store: Arc<dyn TaskRepository>,
    fired_tx: mpsc::UnboundedSender<Task>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler").finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Create a scheduler and the receiver its timers deliver fired tasks to.
    pub fn new(
        store: Arc<dyn TaskRepository>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: Arc::new(RwLock::new(HashMap::new())),
            reapers: Arc::new(Mutex::new(HashMap::new())),
            store,
            fired_tx,
            config,
        };
        (scheduler, fired_rx)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist a task and arm its timer.
    ///
    /// Returns `false` without touching anything when `id` is already live.
    pub async fn schedule(
        &self,
        id: &str,
        execute_at: DateTime<Utc>,
        kind: TaskKind,
        payload: Value,
    ) -> Result<bool> {
        if self.is_live(id).await {
            tracing::info!(task_id = %id, %kind, "task already scheduled, ignoring duplicate");
            return Ok(false);
        }

        let task = Task::new(id, kind, payload, execute_at);

        // A reused id must not be reaped by the deletion of its previous run.
        if let Some(reaper) = self.reapers.lock().await.remove(id) {
            reaper.abort();
        }

        if let Err(error) = self.store.save(&task).await {
            tracing::warn!(task_id = %id, %error, "failed to persist task, keeping it in memory only");
        }

        // The store call suspended; another caller may have armed the same id meanwhile.
        if !self.arm(task).await {
            tracing::info!(task_id = %id, %kind, "task armed concurrently, ignoring duplicate");
            return Ok(false);
        }

        tracing::info!(task_id = %id, %kind, %execute_at, "task scheduled");
        Ok(true)
    }

    /// Move a pending task to a new due time, optionally replacing its payload.
    ///
    /// Returns `false` when the task is not live or has already fired.
    pub async fn reschedule(
        &self,
        id: &str,
        execute_at: DateTime<Utc>,
        payload: Option<Value>,
    ) -> Result<bool> {
        {
            let mut timers = self.timers.write().await;
            let Some(live) = timers.get_mut(id) else {
                return Ok(false);
            };
            if live.task.status != TaskStatus::Pending {
                return Ok(false);
            }

            live.handle.abort();
            live.task.next_execution_at = execute_at;
            if let Some(payload) = &payload {
                live.task.payload = payload.clone();
            }
            live.handle = self.spawn_timer(&live.task);
        }

        if let Err(error) = self
            .store
            .reschedule(id, execute_at, payload.as_ref())
            .await
        {
            tracing::warn!(task_id = %id, %error, "failed to persist rescheduled task");
        }

        tracing::debug!(task_id = %id, %execute_at, "task rescheduled");
        Ok(true)
    }

    /// Cancel a live task and mark its row stopped. Unknown ids are a no-op.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let removed = self.timers.write().await.remove(id);
        let Some(live) = removed else {
            tracing::debug!(task_id = %id, "cancel requested for unknown task, ignoring");
            return Ok(());
        };

        live.handle.abort();
        if can_transition(live.task.status, TaskStatus::Stopped)
            && let Err(error) = self
                .store
                .update_status(id, TaskStatus::Stopped, Utc::now())
                .await
        {
            tracing::warn!(task_id = %id, %error, "failed to persist stopped task");
        }

        tracing::info!(task_id = %id, kind = %live.task.kind, "task cancelled");
        Ok(())
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.timers.read().await.contains_key(id)
    }

    /// A live task that has not fired yet.
    pub async fn pending_task(&self, id: &str) -> Option<Task> {
        self.timers
            .read()
            .await
            .get(id)
            .filter(|live| live.task.status == TaskStatus::Pending)
            .map(|live| live.task.clone())
    }

    /// Re-arm persisted tasks after a restart.
    ///
    /// Each timer runs for the time remaining until the task's due time. Rows
    /// that are already overdue or whose payload no longer validates are
    /// deleted without executing. Returns the restored tasks.
    pub async fn restore(&self) -> Result<Vec<Task>> {
        let tasks = self.store.load_restorable().await?;
        let now = Utc::now();
        let mut restored = Vec::new();

        for task in tasks {
            if self.is_live(&task.id).await {
                continue;
            }

            if let Err(reason) = payload::validate(task.kind, &task.payload) {
                tracing::warn!(task_id = %task.id, kind = %task.kind, %reason, "deleting task with invalid payload");
                self.delete_row(&task.id).await;
                continue;
            }

            if task.due_at() <= now {
                tracing::info!(task_id = %task.id, kind = %task.kind, due_at = %task.due_at(), "task expired while offline, deleting");
                self.delete_row(&task.id).await;
                continue;
            }

            if self.arm(task.clone()).await {
                tracing::debug!(task_id = %task.id, due_at = %task.due_at(), "task restored");
                restored.push(task);
            }
        }

        tracing::info!(count = restored.len(), "scheduled tasks restored");
        Ok(restored)
    }

    /// Run a fired task through its handler and record the outcome.
    ///
    /// The handler runs in its own tokio task so a panic is contained here.
    pub async fn execute(&self, task: Task, registry: &HandlerRegistry) {
        let span = tracing::info_span!("task", task_id = %task.id, kind = %task.kind);

        async {
            let still_processing = {
                let timers = self.timers.read().await;
                timers
                    .get(&task.id)
                    .is_some_and(|live| live.task.status == TaskStatus::Processing)
            };
            if !still_processing {
                tracing::debug!("task no longer live, skipping execution");
                return;
            }

            let Some(handler) = registry.get(task.kind) else {
                let error = SchedulerError::MissingHandler {
                    kind: task.kind.to_string(),
                };
                self.fail(&task.id, &error.into()).await;
                return;
            };

            let run_task = task.clone();
            let outcome = tokio::spawn(
                async move { handler.run(&run_task).await }.instrument(tracing::Span::current()),
            )
            .await;

            match outcome {
                Ok(Ok(())) => self.complete(&task.id).await,
                Ok(Err(error)) => self.fail(&task.id, &error).await,
                Err(join_error) => {
                    tracing::error!(%join_error, "task handler aborted");
                    let error = SchedulerError::HandlerPanicked {
                        id: task.id.clone(),
                    };
                    self.fail(&task.id, &error.into()).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Cancel every live timer and pending deletion, marking rows stopped.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, LiveTask)> = self.timers.write().await.drain().collect();
        let count = drained.len();

        for (id, live) in drained {
            live.handle.abort();
            if can_transition(live.task.status, TaskStatus::Stopped)
                && let Err(error) = self
                    .store
                    .update_status(&id, TaskStatus::Stopped, Utc::now())
                    .await
            {
                tracing::warn!(task_id = %id, %error, "failed to persist stopped task");
            }
        }

        for (_, handle) in self.reapers.lock().await.drain() {
            handle.abort();
        }

        tracing::info!(count, "scheduler stopped");
    }

    /// Abort every timer without touching the rows, so pending tasks are
    /// restored on the next start.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, LiveTask)> = self.timers.write().await.drain().collect();
        for (_, live) in &drained {
            live.handle.abort();
        }
        for (_, handle) in self.reapers.lock().await.drain() {
            handle.abort();
        }
        tracing::info!(count = drained.len(), "scheduler shut down, pending tasks left for restore");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let timers = self.timers.read().await;
        let next_task = timers
            .values()
            .filter(|live| live.task.status != TaskStatus::Processing)
            .min_by_key(|live| live.task.due_at())
            .map(|live| TaskSummary::from(&live.task));

        SchedulerStatus {
            active_task_count: timers.len(),
            next_task,
            config: self.config,
        }
    }

    /// Delete finished rows and overdue rows that no timer owns.
    pub async fn cleanup(&self) -> Result<u64> {
        let mut removed = self.store.delete_finished().await?;

        let live: HashSet<String> = self.timers.read().await.keys().cloned().collect();
        for task in self.store.list_overdue(Utc::now()).await? {
            if !live.contains(&task.id) && self.store.delete(&task.id).await? {
                removed += 1;
            }
        }

        tracing::info!(removed, "task cleanup finished");
        Ok(removed)
    }

    /// Insert a task into the timer map and spawn its timer.
    async fn arm(&self, task: Task) -> bool {
        let mut timers = self.timers.write().await;
        if timers.contains_key(&task.id) {
            return false;
        }
        let handle = self.spawn_timer(&task);
        timers.insert(task.id.clone(), LiveTask { task, handle });
        true
    }

    fn spawn_timer(&self, task: &Task) -> JoinHandle<()> {
        let id = task.id.clone();
        let delay = remaining_until(task.due_at());
        let timers = self.timers.clone();
        let store = self.store.clone();
        let fired_tx = self.fired_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let fired = {
                let mut timers = timers.write().await;
                let Some(live) = timers.get_mut(&id) else {
                    return;
                };
                if !can_transition(live.task.status, TaskStatus::Processing) {
                    return;
                }
                live.task.status = TaskStatus::Processing;
                live.task.clone()
            };

            tracing::info!(task_id = %id, kind = %fired.kind, retry_count = fired.retry_count, "task firing");

            if let Err(error) = store
                .update_status(&id, TaskStatus::Processing, Utc::now())
                .await
            {
                tracing::warn!(task_id = %id, %error, "failed to persist processing status");
            }

            if fired_tx.send(fired).is_err() {
                tracing::debug!(task_id = %id, "fired-task receiver dropped");
            }
        })
    }

    async fn complete(&self, id: &str) {
        let removed = self.timers.write().await.remove(id);
        if removed.is_none() {
            tracing::debug!(task_id = %id, "task finished after cancellation");
            return;
        }

        if let Err(error) = self
            .store
            .update_status(id, TaskStatus::Completed, Utc::now())
            .await
        {
            tracing::warn!(task_id = %id, %error, "failed to persist completed task");
        }

        tracing::info!(task_id = %id, "task completed");
        self.schedule_deletion(id).await;
    }

    async fn fail(&self, id: &str, error: &crate::Error) {
        let retry = {
            let mut timers = self.timers.write().await;
            let Some(live) = timers.get_mut(id) else {
                tracing::debug!(task_id = %id, %error, "task failed after cancellation");
                return;
            };

            if live.task.kind.is_retryable() && live.task.retry_count < self.config.max_retries {
                live.task.retry_count += 1;
                live.task.status = TaskStatus::Retry;
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(self.config.retry_delay(live.task.retry_count))
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                live.task.next_retry_at = Some(next_retry_at);
                live.handle = self.spawn_timer(&live.task);
                Some((live.task.retry_count, next_retry_at))
            } else {
                timers.remove(id);
                None
            }
        };

        match retry {
            Some((retry_count, next_retry_at)) => {
                tracing::warn!(task_id = %id, %error, retry_count, %next_retry_at, "task failed, retry scheduled");
                if let Err(error) = self
                    .store
                    .record_retry(id, retry_count, next_retry_at)
                    .await
                {
                    tracing::warn!(task_id = %id, %error, "failed to persist task retry");
                }
            }
            None => {
                tracing::error!(task_id = %id, %error, "task failed");
                if let Err(error) = self
                    .store
                    .update_status(id, TaskStatus::Failed, Utc::now())
                    .await
                {
                    tracing::warn!(task_id = %id, %error, "failed to persist failed task");
                }
            }
        }
    }

    /// Delete a completed row once the grace period has passed.
    async fn schedule_deletion(&self, id: &str) {
        let grace_period = self.config.grace_period();
        let store = self.store.clone();
        let reapers = self.reapers.clone();
        let task_id = id.to_string();

        let mut reaper_map = self.reapers.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            match store.delete(&task_id).await {
                Ok(_) => tracing::debug!(task_id = %task_id, "completed task deleted"),
                Err(error) => {
                    tracing::warn!(task_id = %task_id, %error, "failed to delete completed task")
                }
            }
            reapers.lock().await.remove(&task_id);
        });
        if let Some(previous) = reaper_map.insert(id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn delete_row(&self, id: &str) {
        if let Err(error) = self.store.delete(id).await {
            tracing::warn!(task_id = %id, %error, "failed to delete task row");
        }
    }
}

/// Time left until `due`, zero when already past.
fn remaining_until(due: DateTime<Utc>) -> std::time::Duration {
    (due - Utc::now()).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTaskStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn monitoring_payload() -> Value {
        json!({ "key": { "channel_id": "c1", "guild_id": "g1" }, "kind": "guild" })
    }

    fn dispatch_payload() -> Value {
        json!({
            "key": { "channel_id": "c1", "guild_id": "g1" },
            "kind": "guild",
            "message_id": "m1",
            "author_id": "u1",
            "author_name": "alice",
            "content": "hello",
            "relevance_score": 0.8,
            "has_key_info": false
        })
    }

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    fn setup() -> (
        Arc<TaskScheduler>,
        mpsc::UnboundedReceiver<Task>,
        Arc<MemoryTaskStore>,
    ) {
        let store = Arc::new(MemoryTaskStore::default());
        let (scheduler, fired_rx) = TaskScheduler::new(store.clone(), SchedulerConfig::default());
        (Arc::new(scheduler), fired_rx, store)
    }

    struct Succeed;

    #[async_trait]
    impl TaskHandler for Succeed {
        async fn run(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFail {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for AlwaysFail {
        async fn run(&self, _task: &Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("delivery failed").into())
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn run(&self, _task: &Task) -> Result<()> {
            panic!("handler bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_persists_and_fires_once() {
        let (scheduler, mut fired_rx, store) = setup();

        let scheduled = scheduler
            .schedule("job-1", in_secs(30), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule should succeed");
        assert!(scheduled);
        assert_eq!(store.status_of("job-1"), Some(TaskStatus::Pending));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(fired_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fired = fired_rx.try_recv().expect("task should have fired");
        assert_eq!(fired.id, "job-1");
        assert_eq!(fired.status, TaskStatus::Processing);
        assert_eq!(store.status_of("job-1"), Some(TaskStatus::Processing));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_schedule_is_ignored() {
        let (scheduler, _fired_rx, store) = setup();

        assert!(
            scheduler
                .schedule("dup", in_secs(30), TaskKind::Monitoring, monitoring_payload())
                .await
                .expect("first schedule")
        );
        assert!(
            !scheduler
                .schedule("dup", in_secs(90), TaskKind::Monitoring, json!({ "other": true }))
                .await
                .expect("duplicate schedule")
        );

        assert_eq!(scheduler.status().await.active_task_count, 1);
        let row = store.get_task("dup").expect("row should exist");
        assert_eq!(row.payload, monitoring_payload());
    }

    #[tokio::test(start_paused = true)]
    async fn success_completes_then_deletes_after_grace_period() {
        let (scheduler, mut fired_rx, store) = setup();
        let registry = HandlerRegistry::new().register(TaskKind::Monitoring, Succeed);

        scheduler
            .schedule("ok", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");

        let fired = fired_rx.recv().await.expect("task should fire");
        scheduler.execute(fired, &registry).await;

        assert_eq!(store.status_of("ok"), Some(TaskStatus::Completed));
        assert!(!scheduler.is_live("ok").await);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.get_task("ok").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let (scheduler, mut fired_rx, store) = setup();

        scheduler
            .schedule("c", in_secs(10), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        scheduler.cancel("c").await.expect("cancel");
        scheduler.cancel("c").await.expect("second cancel");
        scheduler.cancel("never-existed").await.expect("unknown cancel");

        assert_eq!(store.status_of("c"), Some(TaskStatus::Stopped));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_completion_keeps_completed_status() {
        let (scheduler, mut fired_rx, store) = setup();
        let registry = HandlerRegistry::new().register(TaskKind::Monitoring, Succeed);

        scheduler
            .schedule("done", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let fired = fired_rx.recv().await.expect("fired");
        scheduler.execute(fired, &registry).await;

        scheduler.cancel("done").await.expect("cancel");
        assert_eq!(store.status_of("done"), Some(TaskStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_moves_the_timer() {
        let (scheduler, mut fired_rx, store) = setup();

        scheduler
            .schedule("r", in_secs(10), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let moved = scheduler
            .reschedule("r", in_secs(15), None)
            .await
            .expect("reschedule");
        assert!(moved);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(fired_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired_rx.try_recv().expect("fired").id, "r");
        assert!(store.get_task("r").is_some());

        assert!(!scheduler.reschedule("missing", in_secs(5), None).await.expect("noop"));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_uses_remaining_delay() {
        let (scheduler, mut fired_rx, store) = setup();

        let mut task = Task::new("restored", TaskKind::Monitoring, monitoring_payload(), in_secs(30));
        task.created_at = Utc::now() - chrono::Duration::seconds(90);
        store.insert(task);

        let restored = scheduler.restore().await.expect("restore");
        assert_eq!(restored.len(), 1);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(fired_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired_rx.try_recv().expect("fired").id, "restored");
    }

    #[tokio::test(start_paused = true)]
    async fn restore_deletes_overdue_and_corrupt_rows() {
        let (scheduler, mut fired_rx, store) = setup();

        store.insert(Task::new("late", TaskKind::Monitoring, monitoring_payload(), in_secs(-5)));
        store.insert(Task::new("corrupt", TaskKind::Monitoring, Value::Null, in_secs(60)));
        store.insert(Task::new(
            "incomplete",
            TaskKind::ResponseDispatch,
            json!({ "key": { "channel_id": "c1" }, "kind": "guild" }),
            in_secs(60),
        ));

        let restored = scheduler.restore().await.expect("restore");
        assert!(restored.is_empty());
        assert!(store.get_task("late").is_none());
        assert!(store.get_task("corrupt").is_none());
        assert!(store.get_task("incomplete").is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_fail() {
        let (scheduler, mut fired_rx, store) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::new().register(
            TaskKind::ResponseDispatch,
            AlwaysFail {
                calls: calls.clone(),
            },
        );

        scheduler
            .schedule("send", in_secs(1), TaskKind::ResponseDispatch, dispatch_payload())
            .await
            .expect("schedule");

        let expected_delays = [5u64, 10, 20];
        let fired = fired_rx.recv().await.expect("first attempt");
        scheduler.execute(fired, &registry).await;

        for (attempt, minutes) in expected_delays.iter().enumerate() {
            let row = store.get_task("send").expect("row");
            assert_eq!(row.status, TaskStatus::Retry);
            assert_eq!(row.retry_count, attempt as u32 + 1);

            tokio::time::sleep(Duration::from_secs(minutes * 60 - 2)).await;
            assert!(fired_rx.try_recv().is_err(), "retry fired early");

            tokio::time::sleep(Duration::from_secs(4)).await;
            let fired = fired_rx.try_recv().expect("retry should fire");
            scheduler.execute(fired, &registry).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.status_of("send"), Some(TaskStatus::Failed));
        assert!(!scheduler.is_live("send").await);
    }

    #[tokio::test(start_paused = true)]
    async fn decision_tasks_are_not_retried() {
        let (scheduler, mut fired_rx, store) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::new().register(
            TaskKind::Monitoring,
            AlwaysFail {
                calls: calls.clone(),
            },
        );

        scheduler
            .schedule("m", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let fired = fired_rx.recv().await.expect("fired");
        scheduler.execute(fired, &registry).await;

        assert_eq!(store.status_of("m"), Some(TaskStatus::Failed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_is_contained() {
        let (scheduler, mut fired_rx, store) = setup();
        let registry = HandlerRegistry::new().register(TaskKind::Monitoring, Panics);

        scheduler
            .schedule("boom", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let fired = fired_rx.recv().await.expect("fired");
        scheduler.execute(fired, &registry).await;

        assert_eq!(store.status_of("boom"), Some(TaskStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handler_fails_the_task() {
        let (scheduler, mut fired_rx, store) = setup();

        scheduler
            .schedule("orphan", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let fired = fired_rx.recv().await.expect("fired");
        scheduler.execute(fired, &HandlerRegistry::new()).await;

        assert_eq!(store.status_of("orphan"), Some(TaskStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_everything() {
        let (scheduler, mut fired_rx, store) = setup();

        for id in ["a", "b", "c"] {
            scheduler
                .schedule(id, in_secs(10), TaskKind::Monitoring, monitoring_payload())
                .await
                .expect("schedule");
        }
        scheduler.stop_all().await;

        let status = scheduler.status().await;
        assert_eq!(status.active_task_count, 0);
        assert!(status.next_task.is_none());
        for id in ["a", "b", "c"] {
            assert_eq!(store.status_of(id), Some(TaskStatus::Stopped));
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fired_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_the_earliest_task() {
        let (scheduler, _fired_rx, _store) = setup();

        scheduler
            .schedule("later", in_secs(100), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        scheduler
            .schedule("sooner", in_secs(20), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");

        let status = scheduler.status().await;
        assert_eq!(status.active_task_count, 2);
        assert_eq!(status.next_task.map(|task| task.id), Some("sooner".to_string()));
        assert_eq!(status.config, SchedulerConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_skips_live_tasks() {
        let (scheduler, _fired_rx, store) = setup();

        store.insert(Task::new("stale", TaskKind::Monitoring, monitoring_payload(), in_secs(-60)));
        let mut finished = Task::new("finished", TaskKind::Monitoring, monitoring_payload(), in_secs(-60));
        finished.status = TaskStatus::Completed;
        store.insert(finished);
        scheduler
            .schedule("live", in_secs(60), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");

        let removed = scheduler.cleanup().await.expect("cleanup");
        assert_eq!(removed, 2);
        assert!(store.get_task("live").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_keeps_timer_armed() {
        let (scheduler, mut fired_rx, store) = setup();
        store.fail_writes(true);

        assert!(
            scheduler
                .schedule("offline", in_secs(5), TaskKind::Monitoring, monitoring_payload())
                .await
                .expect("schedule should not surface store errors")
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired_rx.try_recv().expect("fired").id, "offline");
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_a_completed_id_survives_its_grace_period() {
        let (scheduler, mut fired_rx, store) = setup();
        let registry = HandlerRegistry::new().register(TaskKind::Monitoring, Succeed);

        scheduler
            .schedule("again", in_secs(1), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        let fired = fired_rx.recv().await.expect("fired");
        scheduler.execute(fired, &registry).await;

        scheduler
            .schedule("again", in_secs(60), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule again");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(store.status_of("again"), Some(TaskStatus::Pending));
        assert!(scheduler.pending_task("again").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_rows_for_restore() {
        let (scheduler, mut fired_rx, store) = setup();

        scheduler
            .schedule("keep", in_secs(30), TaskKind::Monitoring, monitoring_payload())
            .await
            .expect("schedule");
        scheduler.shutdown().await;

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(fired_rx.try_recv().is_err());
        assert!(scheduler.pending_task("keep").await.is_none());
        assert_eq!(store.status_of("keep"), Some(TaskStatus::Pending));
    }
}
