//! End-to-end provisioning tests over the in-memory backend.

mod common;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use common::{MockConnector, TestStack};
use idbridge_connector::{AttributeSet, OperationType, ResolvedAttributes};
use idbridge_provisioning::notify::NotificationTemplate;
use idbridge_provisioning::{
    Account, AccountStore, BackoffPolicy, BreakConfig, BreakConfigStore, EnqueueRequest,
    EntityAccountLink, EntityStore, LinkService, OperationState, Page, QueueStore, RegistryEntity,
};

fn attrs(uid: &str) -> ResolvedAttributes {
    ResolvedAttributes::plain(AttributeSet::new().with("uid", uid).with("cn", "Jane Doe"))
}

async fn seeded_account(stack: &TestStack, uid: &str) -> Account {
    let account = Account::new(stack.system_id, uid, "identity");
    stack.store.upsert_account(&account).await.unwrap();
    account
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_enqueues_share_one_batch() {
    let stack = Arc::new(TestStack::new(MockConnector::new()));
    let account = seeded_account(&stack, "jdoe").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let stack = Arc::clone(&stack);
        let account = account.clone();
        handles.push(tokio::spawn(async move {
            stack
                .queue
                .enqueue(
                    &account,
                    EnqueueRequest::new(OperationType::Update, "account")
                        .with_attributes(attrs("jdoe")),
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .expect("one open batch");
    let requests = stack.store.requests_for_batch(batch.id).await.unwrap();
    assert_eq!(requests.len(), 8);

    let mut seqs: Vec<i64> = requests.iter().map(|(r, _)| r.seq).collect();
    seqs.dedup();
    assert_eq!(seqs.len(), 8, "request seqs must be unique");

    // Only one worker can hold the claim.
    let first = stack
        .queue
        .claim_batch(batch.id, Uuid::new_v4())
        .await
        .unwrap();
    let second = stack
        .queue
        .claim_batch(batch.id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn test_batch_drains_in_fifo_order() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;

    for op in [
        OperationType::Create,
        OperationType::Update,
        OperationType::Update,
    ] {
        stack
            .queue
            .enqueue(
                &account,
                EnqueueRequest::new(op, "account").with_attributes(attrs("jdoe")),
            )
            .await
            .unwrap();
    }
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.executed, 3);
    assert_eq!(
        stack.connector.call_log(),
        vec!["create:jdoe", "update:jdoe", "update:jdoe"]
    );

    // Drained batch is gone, operations are archived as executed.
    assert!(stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .is_none());
    let archived = stack.store.archived_operations();
    assert_eq!(archived.len(), 3);
    assert!(archived.iter().all(|op| op.state == OperationState::Executed));
}

#[tokio::test]
async fn test_transient_failure_reschedules_batch() {
    let stack = TestStack::new(MockConnector::new().failing_transient(1));
    let account = seeded_account(&stack, "jdoe").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Update, "account").with_attributes(attrs("jdoe")),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert!(outcome.rescheduled);
    assert_eq!(outcome.executed, 0);

    let batch = stack.store.get_batch(batch.id).await.unwrap().unwrap();
    let next = batch.next_attempt.expect("retry scheduled");
    assert!(next > Utc::now());

    let (_, operation) = stack
        .store
        .requests_for_batch(batch.id)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(operation.state, OperationState::Created);
    assert_eq!(operation.attempt, 1);

    // Next execution succeeds and clears the schedule.
    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.executed, 1);
    assert!(stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_backoff_delays_never_shrink() {
    let stack = TestStack::new(MockConnector::new().failing_transient(4));
    let account = seeded_account(&stack, "jdoe").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Update, "account").with_attributes(attrs("jdoe")),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let mut last_delay = 0i64;
    for _ in 0..4 {
        let before = Utc::now();
        let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
        assert!(outcome.rescheduled);
        let scheduled = stack
            .store
            .get_batch(batch.id)
            .await
            .unwrap()
            .unwrap()
            .next_attempt
            .unwrap();
        let delay = (scheduled - before).num_seconds();
        assert!(delay >= last_delay - 1, "delay regressed: {delay} < {last_delay}");
        last_delay = delay;
    }
    // Fixed phase first, exponential phase after.
    assert!(last_delay >= 115, "expected exponential delay, got {last_delay}");
}

#[tokio::test]
async fn test_validation_failure_skips_without_retry_budget() {
    let stack = TestStack::new(MockConnector::new().failing_validation(1));
    let account = seeded_account(&stack, "jdoe").await;
    for _ in 0..2 {
        stack
            .queue
            .enqueue(
                &account,
                EnqueueRequest::new(OperationType::Update, "account")
                    .with_attributes(attrs("jdoe")),
            )
            .await
            .unwrap();
    }
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.executed, 1);
    assert!(!outcome.rescheduled);

    let archived = stack.store.archived_operations();
    let rejected = archived
        .iter()
        .find(|op| op.state == OperationState::NotExecuted)
        .expect("rejected operation archived");
    assert_eq!(rejected.result_code.as_deref(), Some("VALUE_REJECTED"));
    assert_eq!(rejected.attempt, 0, "validation must not consume retries");
}

#[tokio::test]
async fn test_exhausted_retries_go_terminal_with_notification() {
    let retry = BackoffPolicy {
        max_attempts: 1,
        ..BackoffPolicy::default().without_jitter()
    };
    let stack = TestStack::with_retry(MockConnector::new().failing_transient(1), retry);
    let account = seeded_account(&stack, "jdoe").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Update, "account").with_attributes(attrs("jdoe")),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.failed, 1);

    let archived = stack.store.archived_operations();
    assert_eq!(archived[0].state, OperationState::Exception);
    assert_eq!(
        stack.notifier.sent_templates(),
        vec![NotificationTemplate::OperationFailed]
    );
}

#[tokio::test]
async fn test_breaker_opens_with_single_notification() {
    let retry = BackoffPolicy {
        max_attempts: 1,
        ..BackoffPolicy::default().without_jitter()
    };
    let stack = TestStack::with_retry(MockConnector::new().failing_transient(3), retry);
    stack
        .store
        .upsert(
            &BreakConfig::global(OperationType::Update, 3, 600)
                .with_warning(2)
                .with_recipients(vec!["ops@example.com".to_string()]),
        )
        .await
        .unwrap();

    for i in 0..3 {
        let account = seeded_account(&stack, &format!("user{i}")).await;
        stack
            .queue
            .enqueue(
                &account,
                EnqueueRequest::new(OperationType::Update, "account")
                    .with_attributes(attrs(&format!("user{i}"))),
            )
            .await
            .unwrap();
        let batch = stack
            .store
            .open_batch_for_account(account.id)
            .await
            .unwrap()
            .unwrap();
        stack.executor.execute_batch(batch.id).await.unwrap();
    }

    let templates = stack.notifier.sent_templates();
    let warnings = templates
        .iter()
        .filter(|t| **t == NotificationTemplate::BreakerWarning)
        .count();
    let disables = templates
        .iter()
        .filter(|t| **t == NotificationTemplate::BreakerDisabled)
        .count();
    assert_eq!(warnings, 1, "warning threshold notifies exactly once");
    assert_eq!(disables, 1, "disable threshold notifies exactly once");

    // Queued work for the tripped pair is skipped by the scan.
    let account = seeded_account(&stack, "user9").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Update, "account").with_attributes(attrs("user9")),
        )
        .await
        .unwrap();
    let due = stack
        .queue
        .find_batches_to_process(&stack.breaker, Page::default())
        .await
        .unwrap();
    assert!(due.is_empty(), "open breaker must hide due batches");
}

#[tokio::test]
async fn test_protected_delete_is_a_noop_that_renews_protection() {
    let stack = TestStack::new(MockConnector::new());
    let mut account = Account::new(stack.system_id, "jdoe", "identity");
    account.protect(Utc::now());
    stack.store.upsert_account(&account).await.unwrap();

    stack
        .queue
        .enqueue(&account, EnqueueRequest::new(OperationType::Delete, "account"))
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(stack.connector.delete_calls(), 0, "no connector delete");

    let archived = stack.store.archived_operations();
    assert_eq!(archived[0].state, OperationState::NotExecuted);
    assert_eq!(archived[0].result_code.as_deref(), Some("PROTECTED"));

    let account = stack
        .store
        .get_account(account.id)
        .await
        .unwrap()
        .expect("account survives");
    assert!(account.is_protected(Utc::now()));
    assert!(account.protected_until.is_some(), "interval renewed from now");
}

#[tokio::test]
async fn test_override_deletes_protected_account() {
    let stack = TestStack::new(MockConnector::new());
    let mut account = Account::new(stack.system_id, "jdoe", "identity");
    account.protect(Utc::now());
    stack.store.upsert_account(&account).await.unwrap();

    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Delete, "account").overriding_protection(),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.executed, 1);
    assert_eq!(stack.connector.delete_calls(), 1);
    assert!(stack.store.get_account(account.id).await.unwrap().is_none());
}

async fn linked_entity(stack: &TestStack, account: &Account) -> RegistryEntity {
    let entity = RegistryEntity::new("identity", AttributeSet::new().with("uid", account.uid.as_str()));
    stack.store.insert_entity(&entity).await.unwrap();
    stack
        .store
        .add_link(&EntityAccountLink::new(entity.id, account.id))
        .await
        .unwrap();
    entity
}

fn link_service(stack: &TestStack) -> LinkService {
    LinkService::new(Arc::clone(&stack.store) as _, Arc::clone(&stack.queue))
}

#[tokio::test]
async fn test_unlinking_last_entity_deprovisions_the_account() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;
    let entity = linked_entity(&stack, &account).await;

    let operation = link_service(&stack)
        .unlink(entity.id, account.id, "account")
        .await
        .unwrap()
        .expect("delete queued for orphaned account");
    assert_eq!(operation.operation_type, OperationType::Delete);

    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();
    stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(stack.connector.delete_calls(), 1);
    assert!(stack.store.get_account(account.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unlinking_protected_account_skips_the_delete() {
    let stack = TestStack::new(MockConnector::new());
    let mut account = Account::new(stack.system_id, "jdoe", "identity");
    account.protect(Utc::now());
    stack.store.upsert_account(&account).await.unwrap();
    let entity = linked_entity(&stack, &account).await;

    link_service(&stack)
        .unlink(entity.id, account.id, "account")
        .await
        .unwrap()
        .expect("delete queued despite protection");

    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();
    let outcome = stack.executor.execute_batch(batch.id).await.unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(stack.connector.delete_calls(), 0);

    let archived = stack.store.archived_operations();
    assert_eq!(archived[0].result_code.as_deref(), Some("PROTECTED"));

    // The account survives with its protection window renewed.
    let account = stack
        .store
        .get_account(account.id)
        .await
        .unwrap()
        .expect("account survives");
    assert!(account.is_protected(Utc::now()));
    assert!(account.protected_until.is_some());
}

#[tokio::test]
async fn test_unlinking_with_remaining_links_keeps_the_account() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;
    let first = linked_entity(&stack, &account).await;
    linked_entity(&stack, &account).await;

    let operation = link_service(&stack)
        .unlink(first.id, account.id, "account")
        .await
        .unwrap();
    assert!(operation.is_none(), "still-linked account must not be deprovisioned");
    assert!(stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        stack.store.links_for_account(account.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_cancel_batch_archives_pending_operations() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;
    for _ in 0..2 {
        stack
            .queue
            .enqueue(
                &account,
                EnqueueRequest::new(OperationType::Update, "account")
                    .with_attributes(attrs("jdoe")),
            )
            .await
            .unwrap();
    }
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    let canceled = stack.queue.cancel_batch(batch.id).await.unwrap();
    assert_eq!(canceled, 2);
    assert!(stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .is_none());
    let archived = stack.store.archived_operations();
    assert!(archived.iter().all(|op| op.state == OperationState::Canceled));
}

#[tokio::test]
async fn test_archive_never_keeps_secrets() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Password, "account")
                .with_attributes(attrs("jdoe").with_secret("password", "hunter2")),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();

    stack.executor.execute_batch(batch.id).await.unwrap();
    let archived = stack.store.archived_operations();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].secrets.is_none());
}

#[tokio::test]
async fn test_stale_claim_release() {
    let stack = TestStack::new(MockConnector::new());
    let account = seeded_account(&stack, "jdoe").await;
    stack
        .queue
        .enqueue(
            &account,
            EnqueueRequest::new(OperationType::Update, "account").with_attributes(attrs("jdoe")),
        )
        .await
        .unwrap();
    let batch = stack
        .store
        .open_batch_for_account(account.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stack
        .queue
        .claim_batch(batch.id, Uuid::new_v4())
        .await
        .unwrap());

    // A cutoff in the future treats the fresh claim as abandoned.
    let released = stack
        .store
        .release_stale_claims(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(released, 1);
    assert!(stack
        .queue
        .claim_batch(batch.id, Uuid::new_v4())
        .await
        .unwrap());
}
