//! Provisioning operation queue.
//!
//! Operations against the same account are serialized through a
//! [`ProvisioningBatch`]: each account has at most one open batch, requests
//! inside it execute in FIFO order, and at most one batch per account is in
//! execution at any time. Claiming a batch is a single atomic read-and-mark
//! in the store, which is what upholds the serialization guarantee across
//! concurrent workers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use idbridge_connector::{OperationType, ResolvedAttributes};

use crate::account::Account;
use crate::breaker::{BreakConfigStore, BreakerCache};
use crate::store::{Page, StoreError, StoreResult};

/// Error from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Operation payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Lifecycle state of a provisioning operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Queued, not yet picked up.
    Created,
    /// Claimed by a worker and executing.
    Running,
    /// Completed successfully.
    Executed,
    /// Terminal failure after the retry budget, or a fatal error.
    Exception,
    /// Skipped without execution (validation failure, protection rule).
    NotExecuted,
    /// Canceled before completion.
    Canceled,
}

impl OperationState {
    /// String form used in persisted state and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Created => "created",
            OperationState::Running => "running",
            OperationState::Executed => "executed",
            OperationState::Exception => "exception",
            OperationState::NotExecuted => "not_executed",
            OperationState::Canceled => "canceled",
        }
    }

    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Executed
                | OperationState::Exception
                | OperationState::NotExecuted
                | OperationState::Canceled
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OperationState::Created),
            "running" => Ok(OperationState::Running),
            "executed" => Ok(OperationState::Executed),
            "exception" => Ok(OperationState::Exception),
            "not_executed" => Ok(OperationState::NotExecuted),
            "canceled" => Ok(OperationState::Canceled),
            _ => Err(format!("unknown operation state: {s}")),
        }
    }
}

/// One queued change against a target system.
///
/// The plain attribute payload is serialized into `attributes`; guarded
/// values go to `secrets` and are never logged or archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningOperation {
    /// Operation id.
    pub id: Uuid,
    /// Target system.
    pub system_id: Uuid,
    /// Account the operation applies to.
    pub account_id: Uuid,
    /// Entity type of the account.
    pub entity_type: String,
    /// Registry entity that triggered the operation, when known.
    pub entity_id: Option<Uuid>,
    /// What to do on the target system.
    pub operation_type: OperationType,
    /// Target object class.
    pub object_class: String,
    /// Target-system uid at enqueue time.
    pub uid: String,
    /// Serialized plain attribute payload.
    pub attributes: serde_json::Value,
    /// Serialized guarded payload, kept out of logs and archives.
    pub secrets: Option<serde_json::Value>,
    /// Current state.
    pub state: OperationState,
    /// Failures so far.
    pub attempt: u32,
    /// Delete despite account protection.
    pub override_protection: bool,
    /// Human-readable outcome message.
    pub result_message: Option<String>,
    /// Stable outcome code for filtering.
    pub result_code: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

impl ProvisioningOperation {
    /// Record an outcome message and code.
    pub fn set_result(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.result_code = Some(code.into());
        self.result_message = Some(message.into());
        self.modified_at = Utc::now();
    }
}

/// Per-account serialization unit.
///
/// At most one batch per account is open at a time; all queued requests for
/// the account belong to it. `next_attempt` gates retry scheduling for the
/// whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningBatch {
    /// Batch id.
    pub id: Uuid,
    /// Account the batch serializes.
    pub account_id: Uuid,
    /// System the account lives on.
    pub system_id: Uuid,
    /// Earliest next execution. None means due now.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Claimed by a worker right now.
    pub in_execution: bool,
    /// Worker instance holding the claim.
    pub claimed_by: Option<Uuid>,
    /// When the claim was taken, for stale-claim recovery.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ProvisioningBatch {
    /// New open batch for an account.
    pub fn new(account_id: Uuid, system_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            system_id,
            next_attempt: None,
            in_execution: false,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// FIFO position of an operation inside its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Request id.
    pub id: Uuid,
    /// Owning batch.
    pub batch_id: Uuid,
    /// The queued operation.
    pub operation_id: Uuid,
    /// Position within the batch. Strictly increasing per batch.
    pub seq: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Storage for batches, requests, operations, and the archive.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// The open batch for an account, if any.
    async fn open_batch_for_account(&self, account_id: Uuid)
        -> StoreResult<Option<ProvisioningBatch>>;

    /// Fetch a batch by id.
    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ProvisioningBatch>>;

    /// Insert a new batch.
    async fn insert_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()>;

    /// Update a batch's scheduling fields.
    async fn update_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()>;

    /// Delete a batch (after its last request is archived).
    async fn delete_batch(&self, id: Uuid) -> StoreResult<()>;

    /// Batches due for execution, oldest first: not in execution, with
    /// `next_attempt` unset or in the past.
    async fn due_batches(&self, now: DateTime<Utc>, page: Page)
        -> StoreResult<Vec<ProvisioningBatch>>;

    /// Atomically claim a batch for a worker instance.
    ///
    /// Returns false when another worker already holds it. This is the
    /// single point that keeps one batch per account in execution.
    async fn claim_batch(&self, batch_id: Uuid, instance_id: Uuid) -> StoreResult<bool>;

    /// Release a claim.
    async fn release_batch(&self, batch_id: Uuid) -> StoreResult<()>;

    /// Release claims older than the cutoff. Returns how many were
    /// released. Covers workers that died mid-batch.
    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Insert a queued operation.
    async fn insert_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()>;

    /// Update an operation's state and result fields.
    async fn update_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()>;

    /// Fetch an operation by id.
    async fn get_operation(&self, id: Uuid) -> StoreResult<Option<ProvisioningOperation>>;

    /// Insert a request.
    async fn insert_request(&self, request: &ProvisioningRequest) -> StoreResult<()>;

    /// Requests of a batch with their operations, in seq order.
    async fn requests_for_batch(
        &self,
        batch_id: Uuid,
    ) -> StoreResult<Vec<(ProvisioningRequest, ProvisioningOperation)>>;

    /// Highest seq in a batch, or None when empty.
    async fn max_seq(&self, batch_id: Uuid) -> StoreResult<Option<i64>>;

    /// Move an operation to the archive and drop its request.
    ///
    /// The archived copy is immutable; `secrets` are not carried over.
    async fn archive_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()>;

    /// Archived operations for an account, newest first.
    async fn archived_for_account(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<ProvisioningOperation>>;
}

/// Parameters for [`OperationQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// What to do.
    pub operation_type: OperationType,
    /// Target object class.
    pub object_class: String,
    /// Registry entity behind the change, when known.
    pub entity_id: Option<Uuid>,
    /// Resolved attribute payload.
    pub attributes: ResolvedAttributes,
    /// Delete despite protection.
    pub override_protection: bool,
}

impl EnqueueRequest {
    /// Request with the given type and object class, no payload.
    pub fn new(operation_type: OperationType, object_class: impl Into<String>) -> Self {
        Self {
            operation_type,
            object_class: object_class.into(),
            entity_id: None,
            attributes: ResolvedAttributes::default(),
            override_protection: false,
        }
    }

    /// Attach the resolved payload.
    #[must_use]
    pub fn with_attributes(mut self, attributes: ResolvedAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Attach the originating entity.
    #[must_use]
    pub fn with_entity(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Delete despite protection.
    #[must_use]
    pub fn overriding_protection(mut self) -> Self {
        self.override_protection = true;
        self
    }
}

/// Front door of the queue: enqueue, scan, cancel.
pub struct OperationQueue {
    store: Arc<dyn QueueStore>,
    break_configs: Arc<dyn BreakConfigStore>,
}

impl OperationQueue {
    /// Create a queue over the given store.
    pub fn new(store: Arc<dyn QueueStore>, break_configs: Arc<dyn BreakConfigStore>) -> Self {
        Self {
            store,
            break_configs,
        }
    }

    /// Queue an operation for an account.
    ///
    /// Joins the account's open batch, creating one when none exists, and
    /// appends at the batch tail.
    #[instrument(skip(self, request), fields(account_id = %account.id, operation = %request.operation_type))]
    pub async fn enqueue(
        &self,
        account: &Account,
        request: EnqueueRequest,
    ) -> QueueResult<ProvisioningOperation> {
        let batch = match self.store.open_batch_for_account(account.id).await? {
            Some(batch) => batch,
            None => {
                let batch = ProvisioningBatch::new(account.id, account.system_id);
                match self.store.insert_batch(&batch).await {
                    Ok(()) => batch,
                    // A concurrent enqueue opened the batch first.
                    Err(StoreError::Conflict(_)) => self
                        .store
                        .open_batch_for_account(account.id)
                        .await?
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("batch for account {}", account.id))
                        })?,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let now = Utc::now();
        let secrets = if request.attributes.has_secrets() {
            Some(serde_json::to_value(&request.attributes.secrets)?)
        } else {
            None
        };
        let operation = ProvisioningOperation {
            id: Uuid::new_v4(),
            system_id: account.system_id,
            account_id: account.id,
            entity_type: account.entity_type.clone(),
            entity_id: request.entity_id,
            operation_type: request.operation_type,
            object_class: request.object_class,
            uid: account.uid.clone(),
            attributes: serde_json::to_value(&request.attributes.attributes)?,
            secrets,
            state: OperationState::Created,
            attempt: 0,
            override_protection: request.override_protection,
            result_message: None,
            result_code: None,
            created_at: now,
            modified_at: now,
        };
        self.store.insert_operation(&operation).await?;

        // Concurrent enqueues can race on the tail seq; the unique
        // (batch, seq) constraint arbitrates and the loser re-reads.
        let mut seq;
        loop {
            seq = self.store.max_seq(batch.id).await?.unwrap_or(0) + 1;
            let request = ProvisioningRequest {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                operation_id: operation.id,
                seq,
                created_at: now,
            };
            match self.store.insert_request(&request).await {
                Ok(()) => break,
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        debug!(batch_id = %batch.id, operation_id = %operation.id, seq, "operation queued");
        Ok(operation)
    }

    /// Due batches ready for claiming, oldest first.
    ///
    /// Batches whose head operation hits an open breaker are left queued
    /// and skipped; they come back once the breaker closes.
    pub async fn find_batches_to_process(
        &self,
        breaker: &BreakerCache,
        page: Page,
    ) -> QueueResult<Vec<ProvisioningBatch>> {
        let now = Utc::now();
        let candidates = self.store.due_batches(now, page).await?;
        let mut ready = Vec::with_capacity(candidates.len());
        for batch in candidates {
            if let Some((_, head)) = self
                .store
                .requests_for_batch(batch.id)
                .await?
                .into_iter()
                .find(|(_, op)| !op.state.is_terminal())
            {
                let config = self
                    .break_configs
                    .resolve(batch.system_id, head.operation_type)
                    .await?;
                let blocked = config
                    .map(|c| breaker.is_open(batch.system_id, head.operation_type, &c, now))
                    .unwrap_or(false);
                if !blocked {
                    ready.push(batch);
                }
            }
        }
        Ok(ready)
    }

    /// Atomically claim a batch for execution.
    pub async fn claim_batch(&self, batch_id: Uuid, instance_id: Uuid) -> QueueResult<bool> {
        Ok(self.store.claim_batch(batch_id, instance_id).await?)
    }

    /// Cancel every non-terminal operation in a batch and archive them.
    #[instrument(skip(self))]
    pub async fn cancel_batch(&self, batch_id: Uuid) -> QueueResult<u32> {
        let mut canceled = 0;
        for (_, mut operation) in self.store.requests_for_batch(batch_id).await? {
            if operation.state.is_terminal() {
                continue;
            }
            operation.state = OperationState::Canceled;
            operation.set_result("CANCELED", "canceled before execution");
            self.store.archive_operation(&operation).await?;
            canceled += 1;
        }
        self.store.delete_batch(batch_id).await?;
        debug!(canceled, "batch canceled");
        Ok(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state_roundtrip() {
        for state in [
            OperationState::Created,
            OperationState::Running,
            OperationState::Executed,
            OperationState::Exception,
            OperationState::NotExecuted,
            OperationState::Canceled,
        ] {
            let parsed: OperationState = state.as_str().parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OperationState::Created.is_terminal());
        assert!(!OperationState::Running.is_terminal());
        assert!(OperationState::Executed.is_terminal());
        assert!(OperationState::Exception.is_terminal());
        assert!(OperationState::NotExecuted.is_terminal());
        assert!(OperationState::Canceled.is_terminal());
    }
}
