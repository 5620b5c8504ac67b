//! Stateful long-running task contract and runner.
//!
//! A [`StatefulTask`] enumerates its items once, then the [`TaskRunner`]
//! processes them under the transaction shape and failure policy chosen by
//! [`TaskConfig`]: one shared transaction or one per item, each either
//! stopping at the first failed item or recording it and continuing.
//! Processed item keys are persisted so an interrupted run can resume
//! without repeating work.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::{StoreError, StoreResult};

/// Error from a task or its runner.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Storage failed; the run aborts.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Processing one item failed; the run's config decides what happens.
    #[error("item processing failed: {0}")]
    Item(String),

    /// Another run of the same task is already active.
    #[error("task '{0}' is already running")]
    AlreadyRunning(String),
}

impl TaskError {
    /// Item-level failure with the given message.
    pub fn item(message: impl Into<String>) -> Self {
        TaskError::Item(message.into())
    }
}

/// Result type for task operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Final state of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Run in progress.
    Running,
    /// Completed (possibly with failed items, see the counts).
    Executed,
    /// Aborted by an item failure under stop-on-failure config, or by an
    /// infrastructure error.
    Exception,
    /// Canceled or interrupted before completion.
    Canceled,
}

impl TaskState {
    /// String form used in persisted state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Executed => "executed",
            TaskState::Exception => "exception",
            TaskState::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskState::Running),
            "executed" => Ok(TaskState::Executed),
            "exception" => Ok(TaskState::Exception),
            "canceled" => Ok(TaskState::Canceled),
            _ => Err(format!("unknown task state: {s}")),
        }
    }
}

/// Transaction shape and failure policy for a run.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Keep going after an item fails. With per-item transactions each
    /// surviving item commits on its own; with a shared transaction the
    /// failed item is recorded and the surviving items still commit
    /// together at the end.
    pub continue_on_exception: bool,
    /// Commit each item in its own transaction instead of one shared
    /// transaction for the whole run.
    pub require_new_transaction: bool,
    /// Optional pause between items, interruptible by cancellation.
    pub delay_between_items: Option<Duration>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            continue_on_exception: false,
            require_new_transaction: false,
            delay_between_items: None,
        }
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Items processed and committed this run.
    pub succeeded: u32,
    /// Items that failed this run.
    pub failed: u32,
    /// Items skipped because a previous run already processed them.
    pub skipped: u32,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Run id.
    pub run_id: Uuid,
    /// Final state.
    pub state: TaskState,
    /// Item counters.
    pub counts: TaskCounts,
}

/// A resumable unit of batch work.
///
/// `Tx` is whatever the task stages work in: a database transaction, an
/// in-memory mutation buffer, or `()` for tasks with no staging.
#[async_trait]
pub trait StatefulTask: Send + Sync {
    /// Item being processed.
    type Item: Send + Sync;
    /// Staged work unit, committed or rolled back by the runner.
    type Tx: Send;

    /// Stable task name; also the resume scope for processed-item keys.
    fn name(&self) -> &str;

    /// Enumerate the items to process, in order.
    async fn items(&self) -> TaskResult<Vec<Self::Item>>;

    /// Stable key identifying an item across runs.
    fn item_key(&self, item: &Self::Item) -> String;

    /// Open a staging unit.
    async fn begin(&self) -> TaskResult<Self::Tx>;

    /// Process one item into the staging unit.
    ///
    /// A failing call must leave `tx` unchanged; under a shared
    /// transaction the runner keeps using it for the remaining items.
    async fn process_item(&self, tx: &mut Self::Tx, item: &Self::Item) -> TaskResult<()>;

    /// Make staged work durable.
    async fn commit(&self, tx: Self::Tx) -> TaskResult<()>;

    /// Discard staged work.
    async fn rollback(&self, tx: Self::Tx) -> TaskResult<()>;

    /// Hook invoked after an item failed and its staged work was
    /// discarded or skipped.
    ///
    /// Use it to record the failure where a rollback cannot erase it.
    async fn on_item_failed(&self, _item: &Self::Item, _error: &TaskError) -> TaskResult<()> {
        Ok(())
    }
}

/// Record of one run, for operator visibility and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    /// Run id.
    pub id: Uuid,
    /// Task name.
    pub task_name: String,
    /// Worker instance that started the run.
    pub instance_id: Uuid,
    /// Final state; `Running` while active.
    pub state: TaskState,
    /// Item counters.
    pub counts: TaskCounts,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp, None while active.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Storage for run records and the processed-item queue.
#[async_trait]
pub trait TaskStateStore: Send + Sync {
    /// Record the start of a run. Fails with a conflict when the task
    /// already has an active run.
    async fn start_run(&self, run: &TaskRun) -> StoreResult<()>;

    /// Record the end of a run.
    async fn finish_run(&self, run_id: Uuid, state: TaskState, counts: TaskCounts)
        -> StoreResult<()>;

    /// Fetch a run.
    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<TaskRun>>;

    /// Whether the task has an active run.
    async fn is_running(&self, task_name: &str) -> StoreResult<bool>;

    /// Mark runs held by other instances as canceled.
    ///
    /// Called on startup: a run still marked running under a dead
    /// instance id will never finish on its own.
    async fn recover_stale_runs(&self, live_instance_id: Uuid) -> StoreResult<u64>;

    /// Keys already processed for a task (across runs).
    async fn processed_keys(&self, task_name: &str) -> StoreResult<HashSet<String>>;

    /// Mark an item key processed.
    async fn mark_processed(&self, task_name: &str, key: &str) -> StoreResult<()>;

    /// Forget processed keys for a task, so the next run starts fresh.
    async fn clear_processed(&self, task_name: &str) -> StoreResult<()>;

    /// Record one item's outcome within a run.
    async fn log_item(
        &self,
        run_id: Uuid,
        key: &str,
        success: bool,
        error: Option<&str>,
    ) -> StoreResult<()>;
}

/// Cooperative cancellation handle shared with a running task.
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    /// New, uncancelled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect at the next item boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Request cancellation and wake any inter-item sleep immediately.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.notify.notified() => {}
        }
    }
}

/// Drives a [`StatefulTask`] run under a [`TaskConfig`].
pub struct TaskRunner<T: StatefulTask> {
    task: T,
    store: Arc<dyn TaskStateStore>,
    config: TaskConfig,
    instance_id: Uuid,
    cancel: Arc<CancelSignal>,
}

impl<T: StatefulTask> TaskRunner<T> {
    /// Create a runner for one task.
    pub fn new(task: T, store: Arc<dyn TaskStateStore>, config: TaskConfig) -> Self {
        Self {
            task,
            store,
            config,
            instance_id: Uuid::new_v4(),
            cancel: Arc::new(CancelSignal::new()),
        }
    }

    /// Tag runs with a specific worker instance id.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Share an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancelSignal>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling this runner from another task.
    pub fn cancel_signal(&self) -> Arc<CancelSignal> {
        Arc::clone(&self.cancel)
    }

    /// The wrapped task.
    pub fn task(&self) -> &T {
        &self.task
    }

    /// Execute one run to completion, cancellation, or failure.
    ///
    /// Items whose keys are already in the processed queue are skipped,
    /// which makes a rerun after interruption pick up where the previous
    /// run stopped and a rerun after success a no-op. The queue persists
    /// until [`TaskStateStore::clear_processed`] resets the task.
    #[instrument(skip(self), fields(task = self.task.name(), instance_id = %self.instance_id))]
    pub async fn run(&self) -> TaskResult<TaskOutcome> {
        let name = self.task.name().to_string();
        if self.store.is_running(&name).await? {
            return Err(TaskError::AlreadyRunning(name));
        }

        let run = TaskRun {
            id: Uuid::new_v4(),
            task_name: name.clone(),
            instance_id: self.instance_id,
            state: TaskState::Running,
            counts: TaskCounts::default(),
            started_at: Utc::now(),
            ended_at: None,
        };
        self.store.start_run(&run).await?;
        info!(run_id = %run.id, "task run started");

        let result = self.run_items(run.id).await;
        let (state, counts) = match result {
            Ok((state, counts)) => (state, counts),
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "task run aborted");
                self.store
                    .finish_run(run.id, TaskState::Exception, TaskCounts::default())
                    .await?;
                return Err(err);
            }
        };

        self.store.finish_run(run.id, state, counts).await?;
        info!(
            run_id = %run.id,
            state = state.as_str(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "task run finished"
        );
        Ok(TaskOutcome {
            run_id: run.id,
            state,
            counts,
        })
    }

    async fn run_items(&self, run_id: Uuid) -> TaskResult<(TaskState, TaskCounts)> {
        let name = self.task.name().to_string();
        let items = self.task.items().await?;
        let processed = self.store.processed_keys(&name).await?;
        let mut counts = TaskCounts::default();

        if self.config.require_new_transaction {
            // One transaction per item; each success is durable on its own.
            for item in &items {
                if self.cancel.is_cancelled() {
                    return Ok((TaskState::Canceled, counts));
                }
                let key = self.task.item_key(item);
                if processed.contains(&key) {
                    counts.skipped += 1;
                    continue;
                }
                let mut tx = self.task.begin().await?;
                match self.task.process_item(&mut tx, item).await {
                    Ok(()) => {
                        self.task.commit(tx).await?;
                        self.store.mark_processed(&name, &key).await?;
                        self.store.log_item(run_id, &key, true, None).await?;
                        counts.succeeded += 1;
                    }
                    Err(err) => {
                        self.task.rollback(tx).await?;
                        self.store
                            .log_item(run_id, &key, false, Some(&err.to_string()))
                            .await?;
                        self.task.on_item_failed(item, &err).await?;
                        counts.failed += 1;
                        if !self.config.continue_on_exception {
                            // Prior items stay committed.
                            return Ok((TaskState::Exception, counts));
                        }
                    }
                }
                self.pause().await;
            }
            return Ok((TaskState::Executed, counts));
        }

        // Single shared transaction: keys are only marked processed after
        // the outer commit. An item failure either rolls the whole run
        // back or, when continuing, skips the item and keeps staging.
        let mut tx = self.task.begin().await?;
        let mut committed_keys: Vec<String> = Vec::new();
        for item in &items {
            if self.cancel.is_cancelled() {
                self.task.rollback(tx).await?;
                return Ok((TaskState::Canceled, counts));
            }
            let key = self.task.item_key(item);
            if processed.contains(&key) {
                counts.skipped += 1;
                continue;
            }
            match self.task.process_item(&mut tx, item).await {
                Ok(()) => {
                    committed_keys.push(key);
                    counts.succeeded += 1;
                }
                Err(err) if self.config.continue_on_exception => {
                    self.store
                        .log_item(run_id, &key, false, Some(&err.to_string()))
                        .await?;
                    self.task.on_item_failed(item, &err).await?;
                    counts.failed += 1;
                }
                Err(err) => {
                    self.task.rollback(tx).await?;
                    self.store
                        .log_item(run_id, &key, false, Some(&err.to_string()))
                        .await?;
                    self.task.on_item_failed(item, &err).await?;
                    counts.failed += 1;
                    counts.succeeded = 0;
                    debug!(key, "shared transaction rolled back");
                    return Ok((TaskState::Exception, counts));
                }
            }
            self.pause().await;
        }
        self.task.commit(tx).await?;
        for key in &committed_keys {
            self.store.mark_processed(&name, key).await?;
            self.store.log_item(run_id, key, true, None).await?;
        }
        Ok((TaskState::Executed, counts))
    }

    async fn pause(&self) {
        if let Some(delay) = self.config.delay_between_items {
            self.cancel.sleep(delay).await;
        }
    }
}
