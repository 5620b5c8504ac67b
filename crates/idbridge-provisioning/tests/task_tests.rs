//! Task runner tests: transaction shapes, resume, and cancellation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use idbridge_provisioning::{
    CancelSignal, MemoryStore, StatefulTask, TaskConfig, TaskCounts, TaskError, TaskResult,
    TaskRun, TaskRunner, TaskState, TaskStateStore,
};

/// Task over a fixed item list, with scripted failures and an applied set
/// standing in for durable writes.
struct ScriptedTask {
    items: Vec<&'static str>,
    fail_on: Mutex<HashSet<String>>,
    applied: Mutex<Vec<String>>,
    cancel_after: Option<(String, Arc<CancelSignal>)>,
}

impl ScriptedTask {
    fn new(items: Vec<&'static str>) -> Self {
        Self {
            items,
            fail_on: Mutex::new(HashSet::new()),
            applied: Mutex::new(Vec::new()),
            cancel_after: None,
        }
    }

    fn failing_on(self, item: &str) -> Self {
        self.fail_on.lock().unwrap().insert(item.to_string());
        self
    }

    fn cancelling_after(mut self, item: &str, signal: Arc<CancelSignal>) -> Self {
        self.cancel_after = Some((item.to_string(), signal));
        self
    }

    fn heal(&self, item: &str) {
        self.fail_on.lock().unwrap().remove(item);
    }

    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatefulTask for ScriptedTask {
    type Item = &'static str;
    type Tx = Vec<String>;

    fn name(&self) -> &str {
        "scripted"
    }

    async fn items(&self) -> TaskResult<Vec<&'static str>> {
        Ok(self.items.clone())
    }

    fn item_key(&self, item: &&'static str) -> String {
        (*item).to_string()
    }

    async fn begin(&self) -> TaskResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn process_item(&self, tx: &mut Vec<String>, item: &&'static str) -> TaskResult<()> {
        if self.fail_on.lock().unwrap().contains(*item) {
            return Err(TaskError::item(format!("scripted failure on {item}")));
        }
        tx.push((*item).to_string());
        if let Some((after, signal)) = &self.cancel_after {
            if after == *item {
                signal.cancel();
            }
        }
        Ok(())
    }

    async fn commit(&self, tx: Vec<String>) -> TaskResult<()> {
        self.applied.lock().unwrap().extend(tx);
        Ok(())
    }

    async fn rollback(&self, _tx: Vec<String>) -> TaskResult<()> {
        Ok(())
    }
}

fn per_item(continue_on_exception: bool) -> TaskConfig {
    TaskConfig {
        continue_on_exception,
        require_new_transaction: true,
        delay_between_items: None,
    }
}

#[tokio::test]
async fn test_per_item_stop_on_first_failure() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b", "c"]).failing_on("b");
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false));

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Exception);
    assert_eq!(
        outcome.counts,
        TaskCounts {
            succeeded: 1,
            failed: 1,
            skipped: 0
        }
    );
    // Item "a" committed before the run stopped; "c" never ran.
    assert_eq!(runner.task().applied(), vec!["a"]);
}

#[tokio::test]
async fn test_per_item_continue_past_failure() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b", "c"]).failing_on("b");
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(true));

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Executed);
    assert_eq!(
        outcome.counts,
        TaskCounts {
            succeeded: 2,
            failed: 1,
            skipped: 0
        }
    );
    assert_eq!(runner.task().applied(), vec!["a", "c"]);
}

#[tokio::test]
async fn test_shared_transaction_rolls_back_everything() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b", "c"]).failing_on("c");
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, TaskConfig::default());

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Exception);
    assert_eq!(outcome.counts.succeeded, 0);
    assert_eq!(outcome.counts.failed, 1);
    // Nothing committed and nothing marked processed.
    assert!(runner.task().applied().is_empty());
    assert!(store.processed_keys("scripted").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_transaction_continues_past_failure() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b", "c"]).failing_on("b");
    let runner = TaskRunner::new(
        task,
        Arc::clone(&store) as _,
        TaskConfig {
            continue_on_exception: true,
            require_new_transaction: false,
            delay_between_items: None,
        },
    );

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Executed);
    assert_eq!(
        outcome.counts,
        TaskCounts {
            succeeded: 2,
            failed: 1,
            skipped: 0
        }
    );
    // The survivors committed together; the failed item stays unprocessed
    // so a rerun picks it up.
    assert_eq!(runner.task().applied(), vec!["a", "c"]);
    let processed = store.processed_keys("scripted").await.unwrap();
    assert!(processed.contains("a"));
    assert!(processed.contains("c"));
    assert!(!processed.contains("b"));
}

#[tokio::test]
async fn test_interrupted_run_resumes_where_it_stopped() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b", "c"]).failing_on("b");
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false));

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Exception);

    // The failure is gone; the rerun skips "a" and picks up at "b".
    runner.task().heal("b");
    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Executed);
    assert_eq!(
        outcome.counts,
        TaskCounts {
            succeeded: 2,
            failed: 0,
            skipped: 1
        }
    );
    assert_eq!(runner.task().applied(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_rerun_after_success_processes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let task = ScriptedTask::new(vec!["a", "b"]);
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false));

    runner.run().await.unwrap();
    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Executed);
    assert_eq!(outcome.counts.succeeded, 0);
    assert_eq!(outcome.counts.skipped, 2);

    // An explicit reset makes the next run process everything again.
    store.clear_processed("scripted").await.unwrap();
    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.counts.succeeded, 2);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let active = TaskRun {
        id: Uuid::new_v4(),
        task_name: "scripted".to_string(),
        instance_id: Uuid::new_v4(),
        state: TaskState::Running,
        counts: TaskCounts::default(),
        started_at: Utc::now(),
        ended_at: None,
    };
    store.start_run(&active).await.unwrap();

    let task = ScriptedTask::new(vec!["a"]);
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false));
    match runner.run().await {
        Err(TaskError::AlreadyRunning(name)) => assert_eq!(name, "scripted"),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_stops_at_item_boundary() {
    let store = Arc::new(MemoryStore::new());
    let cancel = Arc::new(CancelSignal::new());
    let task =
        ScriptedTask::new(vec!["a", "b", "c"]).cancelling_after("a", Arc::clone(&cancel));
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false))
        .with_cancel(Arc::clone(&cancel));

    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.state, TaskState::Canceled);
    assert_eq!(outcome.counts.succeeded, 1);
    assert_eq!(runner.task().applied(), vec!["a"]);

    // "a" stays processed, so a fresh run finishes the remainder.
    let task = ScriptedTask::new(vec!["a", "b", "c"]);
    let runner = TaskRunner::new(task, Arc::clone(&store) as _, per_item(false));
    let outcome = runner.run().await.unwrap();
    assert_eq!(outcome.counts.skipped, 1);
    assert_eq!(outcome.counts.succeeded, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_wakes_inter_item_delay() {
    let store = Arc::new(MemoryStore::new());
    let cancel = Arc::new(CancelSignal::new());
    let task = ScriptedTask::new(vec!["a", "b"]);
    let runner = TaskRunner::new(
        task,
        Arc::clone(&store) as _,
        TaskConfig {
            continue_on_exception: false,
            require_new_transaction: true,
            delay_between_items: Some(Duration::from_secs(30)),
        },
    )
    .with_cancel(Arc::clone(&cancel));

    let handle = tokio::spawn(async move { runner.run().await });
    // Let the runner reach the inter-item sleep, then wake it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.interrupt();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runner did not wake from the delay")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, TaskState::Canceled);
    assert_eq!(outcome.counts.succeeded, 1);
}

#[tokio::test]
async fn test_stale_runs_are_recovered_on_startup() {
    let store = Arc::new(MemoryStore::new());
    let dead_instance = Uuid::new_v4();
    let stale = TaskRun {
        id: Uuid::new_v4(),
        task_name: "scripted".to_string(),
        instance_id: dead_instance,
        state: TaskState::Running,
        counts: TaskCounts::default(),
        started_at: Utc::now(),
        ended_at: None,
    };
    store.start_run(&stale).await.unwrap();
    assert!(store.is_running("scripted").await.unwrap());

    let recovered = store.recover_stale_runs(Uuid::new_v4()).await.unwrap();
    assert_eq!(recovered, 1);
    assert!(!store.is_running("scripted").await.unwrap());

    let run = store.get_run(stale.id).await.unwrap().unwrap();
    assert_eq!(run.state, TaskState::Canceled);
}
