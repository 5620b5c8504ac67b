//! Unlinking accounts from registry entities.
//!
//! Removing the last link is what drives deprovisioning: an account no
//! entity owns has no reason to exist on the target system, so a delete is
//! queued for it. Protection is not checked here; the executor enforces it
//! when the delete reaches the connector, skipping the operation and
//! renewing the protection window instead.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use idbridge_connector::OperationType;

use crate::account::AccountStore;
use crate::queue::{EnqueueRequest, OperationQueue, ProvisioningOperation, QueueResult};

/// Removes entity-account links and queues the resulting deletes.
pub struct LinkService {
    accounts: Arc<dyn AccountStore>,
    queue: Arc<OperationQueue>,
}

impl LinkService {
    /// Create a link service over the given store and queue.
    pub fn new(accounts: Arc<dyn AccountStore>, queue: Arc<OperationQueue>) -> Self {
        Self { accounts, queue }
    }

    /// Remove the link between an entity and an account.
    ///
    /// When the removed link was the account's last, a delete operation is
    /// queued against the target system and returned. An account still
    /// linked to other entities is left alone.
    #[instrument(skip(self))]
    pub async fn unlink(
        &self,
        entity_id: Uuid,
        account_id: Uuid,
        object_class: &str,
    ) -> QueueResult<Option<ProvisioningOperation>> {
        self.accounts.remove_link(entity_id, account_id).await?;
        if !self.accounts.links_for_account(account_id).await?.is_empty() {
            debug!(%account_id, "account still linked, no delete queued");
            return Ok(None);
        }
        let Some(account) = self.accounts.get_account(account_id).await? else {
            return Ok(None);
        };
        let operation = self
            .queue
            .enqueue(
                &account,
                EnqueueRequest::new(OperationType::Delete, object_class),
            )
            .await?;
        debug!(%account_id, operation_id = %operation.id, "delete queued for orphaned account");
        Ok(Some(operation))
    }
}
