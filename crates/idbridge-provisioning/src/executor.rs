//! Batch execution against connectors.
//!
//! The executor drains one claimed batch at a time: requests run in FIFO
//! order, a success advances to the next request, a retryable failure
//! reschedules the whole batch, and terminal outcomes are archived. All
//! retry and breaker decisions happen here, driven by the typed
//! [`FailureClass`] of the connector error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use idbridge_connector::{
    AttributeSet, Connector, ConnectorError, FailureClass, OperationType, ResolvedAttributes, Uid,
};

use crate::account::AccountStore;
use crate::breaker::{BreakConfig, BreakConfigStore, BreakerCache, BreakerTransition};
use crate::notify::{NotificationTemplate, Notifier};
use crate::queue::{OperationState, ProvisioningBatch, ProvisioningOperation, QueueStore};
use crate::retry::RetryPolicy;
use crate::store::StoreError;

/// Error from the executor itself (not from a connector call, which is an
/// operation outcome rather than an executor failure).
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Payload could not be deserialized from the queue.
    #[error("operation payload corrupt: {0}")]
    Payload(#[from] serde_json::Error),

    /// No connector is registered for the system.
    #[error("no connector registered for system {0}")]
    NoConnector(Uuid),

    /// The batch vanished between claim and execution.
    #[error("batch {0} not found")]
    BatchNotFound(Uuid),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Resolves a system id to its connector instance.
#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    /// The connector for a system, or None when unregistered.
    async fn connector(&self, system_id: Uuid) -> Option<Arc<dyn Connector>>;
}

/// Tunables for batch execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Protection interval granted when a delete hits a protected account.
    pub protection_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            protection_grace: Duration::days(30),
        }
    }
}

/// Counters from draining one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Operations completed successfully.
    pub executed: u32,
    /// Operations that went terminal with an exception.
    pub failed: u32,
    /// Operations skipped (validation rejections, protection rule).
    pub skipped: u32,
    /// A retryable failure rescheduled the batch; remaining requests wait.
    pub rescheduled: bool,
}

enum Outcome {
    Executed(Option<Uid>),
    Skipped(&'static str, String),
    Failed(ConnectorError),
}

enum FailureDisposition {
    Rescheduled,
    Terminal,
}

/// Executes claimed batches against connectors.
pub struct ProvisioningExecutor {
    queue_store: Arc<dyn QueueStore>,
    accounts: Arc<dyn AccountStore>,
    connectors: Arc<dyn ConnectorRegistry>,
    retry: Arc<dyn RetryPolicy>,
    breaker: Arc<BreakerCache>,
    break_configs: Arc<dyn BreakConfigStore>,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
}

impl ProvisioningExecutor {
    /// Wire up an executor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_store: Arc<dyn QueueStore>,
        accounts: Arc<dyn AccountStore>,
        connectors: Arc<dyn ConnectorRegistry>,
        retry: Arc<dyn RetryPolicy>,
        breaker: Arc<BreakerCache>,
        break_configs: Arc<dyn BreakConfigStore>,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue_store,
            accounts,
            connectors,
            retry,
            breaker,
            break_configs,
            notifier,
            config,
        }
    }

    /// Drain a claimed batch.
    ///
    /// The caller must hold the claim. The claim is released before
    /// returning on every path; the batch row is deleted once its last
    /// request is archived.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn execute_batch(&self, batch_id: Uuid) -> ExecutorResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let result = self.drain(batch_id, &mut outcome).await;
        // Always release; a poisoned claim would wedge the account forever.
        self.queue_store.release_batch(batch_id).await?;
        result?;
        info!(
            executed = outcome.executed,
            failed = outcome.failed,
            skipped = outcome.skipped,
            rescheduled = outcome.rescheduled,
            "batch drained"
        );
        Ok(outcome)
    }

    async fn drain(&self, batch_id: Uuid, outcome: &mut BatchOutcome) -> ExecutorResult<()> {
        loop {
            let Some(batch) = self.queue_store.get_batch(batch_id).await? else {
                return Ok(());
            };
            let head = self
                .queue_store
                .requests_for_batch(batch_id)
                .await?
                .into_iter()
                .find(|(_, op)| !op.state.is_terminal());
            let Some((_, mut operation)) = head else {
                self.queue_store.delete_batch(batch_id).await?;
                return Ok(());
            };

            let break_config = self
                .break_configs
                .resolve(batch.system_id, operation.operation_type)
                .await?;
            if let Some(cfg) = &break_config {
                if self
                    .breaker
                    .is_open(batch.system_id, operation.operation_type, cfg, Utc::now())
                {
                    debug!(operation_id = %operation.id, "breaker open, leaving batch queued");
                    return Ok(());
                }
            }

            operation.state = OperationState::Running;
            operation.modified_at = Utc::now();
            self.queue_store.update_operation(&operation).await?;

            match self.invoke(&operation).await? {
                Outcome::Executed(uid) => {
                    self.handle_successful(&batch, &mut operation, uid).await?;
                    outcome.executed += 1;
                }
                Outcome::Skipped(code, message) => {
                    operation.state = OperationState::NotExecuted;
                    operation.set_result(code, message);
                    self.queue_store.archive_operation(&operation).await?;
                    outcome.skipped += 1;
                }
                Outcome::Failed(err) => {
                    match self
                        .handle_failed(&batch, &mut operation, err, break_config.as_ref())
                        .await?
                    {
                        FailureDisposition::Rescheduled => {
                            outcome.rescheduled = true;
                            return Ok(());
                        }
                        FailureDisposition::Terminal => {
                            if operation.state == OperationState::Exception {
                                outcome.failed += 1;
                            } else {
                                outcome.skipped += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run one operation against its connector, applying the protection
    /// rule before any connector call.
    async fn invoke(&self, operation: &ProvisioningOperation) -> ExecutorResult<Outcome> {
        let now = Utc::now();
        if operation.operation_type == OperationType::Delete && !operation.override_protection {
            if let Some(mut account) = self.accounts.get_account(operation.account_id).await? {
                if account.is_protected(now) {
                    // Renew the interval instead of deleting.
                    account.extend_protection(self.config.protection_grace, now);
                    self.accounts.upsert_account(&account).await?;
                    debug!(account_id = %account.id, "delete on protected account skipped");
                    return Ok(Outcome::Skipped(
                        "PROTECTED",
                        "account is protected; protection interval renewed".to_string(),
                    ));
                }
            }
        }

        let connector = self
            .connectors
            .connector(operation.system_id)
            .await
            .ok_or(ExecutorError::NoConnector(operation.system_id))?;
        let payload = self.payload(operation)?;
        let uid = Uid::from_value(&operation.uid);

        let result = match operation.operation_type {
            OperationType::Create => connector
                .create(&operation.object_class, &payload)
                .await
                .map(Some),
            OperationType::Update => connector
                .update(&operation.object_class, &uid, &payload)
                .await
                .map(Some),
            OperationType::Delete => connector
                .delete(&operation.object_class, &uid)
                .await
                .map(|()| None),
            OperationType::Password => connector
                .set_password(&operation.object_class, &uid, &payload)
                .await
                .map(|()| None),
        };
        match result {
            Ok(uid) => Ok(Outcome::Executed(uid)),
            Err(err) => Ok(Outcome::Failed(err)),
        }
    }

    fn payload(&self, operation: &ProvisioningOperation) -> ExecutorResult<ResolvedAttributes> {
        let attributes: AttributeSet = serde_json::from_value(operation.attributes.clone())?;
        let secrets: AttributeSet = match &operation.secrets {
            Some(value) => serde_json::from_value(value.clone())?,
            None => AttributeSet::new(),
        };
        Ok(ResolvedAttributes {
            attributes,
            secrets,
        })
    }

    /// Success path: reset breaker and backoff, record the learned uid,
    /// archive as executed, and let the loop advance to the next request.
    async fn handle_successful(
        &self,
        batch: &ProvisioningBatch,
        operation: &mut ProvisioningOperation,
        returned_uid: Option<Uid>,
    ) -> ExecutorResult<()> {
        self.breaker
            .record_success(batch.system_id, operation.operation_type);

        if batch.next_attempt.is_some() {
            let mut cleared = batch.clone();
            cleared.next_attempt = None;
            self.queue_store.update_batch(&cleared).await?;
        }

        match operation.operation_type {
            OperationType::Create => {
                // The target may have assigned a different identifier.
                if let Some(uid) = returned_uid {
                    if uid.value() != operation.uid {
                        if let Some(mut account) =
                            self.accounts.get_account(operation.account_id).await?
                        {
                            account.uid = uid.value().to_string();
                            account.updated_at = Utc::now();
                            self.accounts.upsert_account(&account).await?;
                        }
                    }
                }
            }
            OperationType::Delete => {
                self.accounts.delete_account(operation.account_id).await?;
            }
            _ => {}
        }

        operation.state = OperationState::Executed;
        operation.set_result("OK", "executed");
        self.queue_store.archive_operation(operation).await?;
        Ok(())
    }

    /// Failure path: classify, then either skip (validation), reschedule
    /// per the retry policy, or go terminal with notification.
    async fn handle_failed(
        &self,
        batch: &ProvisioningBatch,
        operation: &mut ProvisioningOperation,
        err: ConnectorError,
        break_config: Option<&BreakConfig>,
    ) -> ExecutorResult<FailureDisposition> {
        let class = err.classify();
        warn!(
            operation_id = %operation.id,
            error = %err,
            code = err.error_code(),
            "operation failed"
        );

        if let Some(cfg) = break_config {
            let transition = self.breaker.record_failure(
                batch.system_id,
                operation.operation_type,
                cfg,
                Utc::now(),
            );
            match transition {
                BreakerTransition::Warned => {
                    self.send_breaker_notice(NotificationTemplate::BreakerWarning, batch, cfg)
                        .await;
                }
                BreakerTransition::Opened => {
                    self.send_breaker_notice(NotificationTemplate::BreakerDisabled, batch, cfg)
                        .await;
                }
                BreakerTransition::None => {}
            }
        }

        if class == FailureClass::Validation {
            // Data problems do not consume retry budget; retrying the same
            // payload cannot change the answer.
            operation.state = OperationState::NotExecuted;
            operation.set_result(err.error_code(), err.to_string());
            self.queue_store.archive_operation(operation).await?;
            return Ok(FailureDisposition::Terminal);
        }

        operation.attempt += 1;
        match self.retry.next_attempt_in(operation.attempt) {
            Some(delay) => {
                operation.state = OperationState::Created;
                operation.set_result(err.error_code(), err.to_string());
                self.queue_store.update_operation(operation).await?;

                let mut rescheduled = batch.clone();
                rescheduled.next_attempt =
                    Some(Utc::now() + Duration::milliseconds(delay.as_millis() as i64));
                self.queue_store.update_batch(&rescheduled).await?;
                debug!(
                    operation_id = %operation.id,
                    attempt = operation.attempt,
                    delay_secs = delay.as_secs(),
                    "batch rescheduled"
                );
                Ok(FailureDisposition::Rescheduled)
            }
            None => {
                operation.state = OperationState::Exception;
                operation.set_result(err.error_code(), err.to_string());
                self.queue_store.archive_operation(operation).await?;

                let recipients = break_config
                    .map(|c| c.recipients.clone())
                    .unwrap_or_default();
                let context = json!({
                    "operation_id": operation.id,
                    "system_id": operation.system_id,
                    "account_id": operation.account_id,
                    "operation": operation.operation_type.as_str(),
                    "error": err.to_string(),
                });
                if let Err(notify_err) = self
                    .notifier
                    .notify(&recipients, NotificationTemplate::OperationFailed, &context)
                    .await
                {
                    warn!(error = %notify_err, "failure notification not delivered");
                }
                Ok(FailureDisposition::Terminal)
            }
        }
    }

    async fn send_breaker_notice(
        &self,
        template: NotificationTemplate,
        batch: &ProvisioningBatch,
        config: &BreakConfig,
    ) {
        let context = json!({
            "system_id": batch.system_id,
            "operation": config.operation_type.as_str(),
            "disable_threshold": config.disable_threshold,
            "window_secs": config.window_secs,
        });
        if let Err(err) = self
            .notifier
            .notify(&config.recipients, template, &context)
            .await
        {
            warn!(error = %err, "breaker notification not delivered");
        }
    }
}
