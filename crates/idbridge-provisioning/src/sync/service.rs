//! The synchronization reconciler.
//!
//! A run pulls changes from the connector, classifies each reported object
//! against registry state, and applies the configured action. Items run
//! under the stateful task runner with one staging unit per item: an item
//! failure discards only that item's changes and the run continues. Only a
//! connector that is unreachable, or fails mid-scan, is fatal to the run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use idbridge_connector::{OperationType, SyncEntry, Uid};

use crate::account::{Account, AccountStore, EntityAccountLink, EntityStore, RegistryEntity};
use crate::executor::ConnectorRegistry;
use crate::notify::{NotificationTemplate, Notifier};
use crate::queue::{EnqueueRequest, OperationQueue};
use crate::resolver::{to_resolved, AttributeResolver};
use crate::store::StoreError;
use crate::sync::config::{SyncActionConfig, SyncConfig, SyncConfigStore};
use crate::sync::log::{SyncItemLog, SyncItemOutcome, SyncLogStore, SyncRunLog};
use crate::sync::situation::{
    classify, LinkedAction, MissingAccountAction, MissingEntityAction, SyncSituation,
    UnlinkedAction,
};
use crate::task::{StatefulTask, TaskConfig, TaskError, TaskResult, TaskRunner, TaskState,
    TaskStateStore,
};

/// Error from the synchronization service.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unknown configuration id.
    #[error("sync configuration {0} not found")]
    ConfigNotFound(Uuid),

    /// The configuration is disabled.
    #[error("sync configuration {0} is disabled")]
    Disabled(Uuid),

    /// Another run of this configuration is active.
    #[error("sync configuration {0} already has a running synchronization")]
    AlreadyRunning(Uuid),

    /// No connector is registered for the system.
    #[error("no connector registered for system {0}")]
    NoConnector(Uuid),

    /// The task runner aborted the run.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Runs synchronizations for configured systems.
pub struct Synchronizer {
    accounts: Arc<dyn AccountStore>,
    entities: Arc<dyn EntityStore>,
    queue: Arc<OperationQueue>,
    logs: Arc<dyn SyncLogStore>,
    configs: Arc<dyn SyncConfigStore>,
    connectors: Arc<dyn ConnectorRegistry>,
    resolver: Arc<dyn AttributeResolver>,
    task_store: Arc<dyn TaskStateStore>,
    notifier: Arc<dyn Notifier>,
}

impl Synchronizer {
    /// Wire up a synchronizer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        entities: Arc<dyn EntityStore>,
        queue: Arc<OperationQueue>,
        logs: Arc<dyn SyncLogStore>,
        configs: Arc<dyn SyncConfigStore>,
        connectors: Arc<dyn ConnectorRegistry>,
        resolver: Arc<dyn AttributeResolver>,
        task_store: Arc<dyn TaskStateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            accounts,
            entities,
            queue,
            logs,
            configs,
            connectors,
            resolver,
            task_store,
            notifier,
        }
    }

    /// Whether a configuration has an active run.
    pub async fn is_running(&self, config_id: Uuid) -> SyncResult<bool> {
        Ok(self.logs.is_running(config_id).await?)
    }

    /// Execute one synchronization run for a configuration.
    ///
    /// Returns the finished run log. A connector-level failure does not
    /// return an error: the run log comes back with `fatal_error` set, so
    /// schedulers treat it like any other completed run.
    #[instrument(skip(self))]
    pub async fn run(&self, config_id: Uuid) -> SyncResult<SyncRunLog> {
        let config = self
            .configs
            .get_config(config_id)
            .await?
            .ok_or(SyncError::ConfigNotFound(config_id))?;
        if !config.enabled {
            return Err(SyncError::Disabled(config_id));
        }
        if self.logs.is_running(config_id).await? {
            return Err(SyncError::AlreadyRunning(config_id));
        }
        let connector = self
            .connectors
            .connector(config.system_id)
            .await
            .ok_or(SyncError::NoConnector(config.system_id))?;

        let run = SyncRunLog::started(config.id, config.system_id);
        self.logs.insert_run(&run).await?;
        info!(run_id = %run.id, system_id = %config.system_id, "synchronization started");

        // Unreachable connector fails the whole run before any item.
        if let Err(err) = connector.test_connection().await {
            warn!(run_id = %run.id, error = %err, "connector unreachable");
            return self.finish_fatal(run, err.to_string()).await;
        }

        let mut entries: Vec<SyncEntry> = Vec::new();
        let mut token = config.token.clone();
        loop {
            let page = match connector
                .sync(&config.object_class, token.as_deref(), config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "sync scan failed");
                    return self.finish_fatal(run, err.to_string()).await;
                }
            };
            entries.extend(page.entries);
            if page.next_token.is_some() {
                token = page.next_token;
            }
            if !page.has_more {
                break;
            }
        }

        if config.detect_deletions {
            match connector.list_uids(&config.object_class).await {
                Ok(uids) => {
                    let present: std::collections::HashSet<&str> =
                        uids.iter().map(Uid::value).collect();
                    for account in self.accounts.list_by_system(config.system_id).await? {
                        if account.entity_type == config.entity_type
                            && !present.contains(account.uid.as_str())
                        {
                            entries.push(SyncEntry::deleted(
                                Uid::from_value(&account.uid),
                                config.object_class.clone(),
                            ));
                        }
                    }
                }
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "deletion detection scan failed");
                    return self.finish_fatal(run, err.to_string()).await;
                }
            }
        }

        let actions = self
            .configs
            .global_actions()
            .await
            .map(|defaults| config.overrides.resolve(defaults))?;

        let task = SyncRunTask {
            sync: self,
            config: &config,
            actions,
            run_id: run.id,
            task_name: sync_task_name(config.id),
            entries,
        };
        let runner = TaskRunner::new(
            task,
            Arc::clone(&self.task_store),
            TaskConfig {
                continue_on_exception: true,
                require_new_transaction: true,
                delay_between_items: None,
            },
        );
        // Runner infrastructure errors (task state store failures) must
        // still close the run log, or the configuration would report a
        // phantom active run forever.
        let outcome = match runner.run().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "task runner aborted");
                self.finish_fatal(run, err.to_string()).await?;
                return Err(err.into());
            }
        };

        if outcome.state == TaskState::Executed {
            self.configs.save_token(config.id, token.as_deref()).await?;
            self.task_store
                .clear_processed(&sync_task_name(config.id))
                .await?;
        }

        let mut finished = self
            .logs
            .get_run(run.id)
            .await?
            .unwrap_or_else(|| run.clone());
        finished.running = false;
        finished.canceled = outcome.state == TaskState::Canceled;
        finished.ended_at = Some(Utc::now());
        self.logs.update_run(&finished).await?;
        info!(
            run_id = %finished.id,
            success = finished.success_count,
            warnings = finished.warning_count,
            errors = finished.error_count,
            canceled = finished.canceled,
            "synchronization finished"
        );
        Ok(finished)
    }

    async fn finish_fatal(&self, mut run: SyncRunLog, error: String) -> SyncResult<SyncRunLog> {
        run.running = false;
        run.fatal_error = Some(error.clone());
        run.ended_at = Some(Utc::now());
        self.logs.update_run(&run).await?;
        let context = serde_json::json!({
            "run_id": run.id,
            "config_id": run.config_id,
            "system_id": run.system_id,
            "error": error,
        });
        if let Err(err) = self
            .notifier
            .notify(&[], NotificationTemplate::SyncRunFailed, &context)
            .await
        {
            warn!(run_id = %run.id, error = %err, "failed to send sync failure notification");
        }
        Ok(run)
    }
}

fn sync_task_name(config_id: Uuid) -> String {
    format!("sync:{config_id}")
}

/// Staged mutation from one item, applied on commit.
enum StagedOp {
    UpsertAccount(Account),
    DeleteAccount(Uuid),
    InsertEntity(RegistryEntity),
    UpdateEntityAttrs(Uuid, idbridge_connector::AttributeSet),
    DeleteEntity(Uuid),
    AddLink(EntityAccountLink),
    Enqueue(Account, EnqueueRequest),
}

/// Per-item staging unit: mutations plus the log line to write with them.
struct SyncStaging {
    ops: Vec<StagedOp>,
    uid: String,
    situation: Option<SyncSituation>,
    action: &'static str,
    outcome: SyncItemOutcome,
    message: Option<String>,
}

impl SyncStaging {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            uid: String::new(),
            situation: None,
            action: "none",
            outcome: SyncItemOutcome::Success,
            message: None,
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.outcome = SyncItemOutcome::Warning;
        self.message = Some(message.into());
    }
}

struct SyncRunTask<'a> {
    sync: &'a Synchronizer,
    config: &'a SyncConfig,
    actions: SyncActionConfig,
    run_id: Uuid,
    task_name: String,
    entries: Vec<SyncEntry>,
}

impl SyncRunTask<'_> {
    async fn dispatch(&self, tx: &mut SyncStaging, entry: &SyncEntry) -> TaskResult<()> {
        let sync = self.sync;
        let uid_value = entry.uid.value().to_string();
        tx.uid = uid_value.clone();

        let account = sync
            .accounts
            .find_by_uid(self.config.system_id, &uid_value)
            .await
            .map_err(store_item_err)?;
        let linked_entity = match &account {
            Some(account) => {
                let links = sync
                    .accounts
                    .links_for_account(account.id)
                    .await
                    .map_err(store_item_err)?;
                match links.first() {
                    Some(link) => sync
                        .entities
                        .get_entity(link.entity_id)
                        .await
                        .map_err(store_item_err)?,
                    None => None,
                }
            }
            None => None,
        };

        let situation = classify(account.as_ref(), linked_entity.as_ref(), entry.delta_type);
        tx.situation = situation;
        let Some(situation) = situation else {
            tx.message = Some("delete of untracked object".to_string());
            return Ok(());
        };

        match situation {
            SyncSituation::Linked => {
                let (Some(account), Some(entity)) = (account, linked_entity) else {
                    return Err(TaskError::item("linked object lost its account mid-run"));
                };
                match self.actions.linked {
                    LinkedAction::Ignore => tx.action = "ignore",
                    LinkedAction::UpdateEntity => {
                        tx.action = "update_entity";
                        match &entry.attributes {
                            Some(attrs) => tx
                                .ops
                                .push(StagedOp::UpdateEntityAttrs(entity.id, attrs.clone())),
                            None => tx.warn("no attributes reported"),
                        }
                    }
                    LinkedAction::UpdateAccount => {
                        tx.action = "update_account";
                        let mapped = sync
                            .resolver
                            .resolve(&account, &entity)
                            .await
                            .map_err(|e| TaskError::item(e.to_string()))?;
                        let request = EnqueueRequest::new(
                            OperationType::Update,
                            self.config.object_class.clone(),
                        )
                        .with_entity(entity.id)
                        .with_attributes(to_resolved(mapped));
                        tx.ops.push(StagedOp::Enqueue(account, request));
                    }
                }
            }
            SyncSituation::Unlinked => {
                let Some(account) = account else {
                    return Err(TaskError::item("unlinked object lost its account mid-run"));
                };
                match self.actions.unlinked {
                    UnlinkedAction::Ignore => tx.action = "ignore",
                    UnlinkedAction::Link => {
                        tx.action = "link";
                        let value = entry
                            .attributes
                            .as_ref()
                            .and_then(|a| a.get_string(&self.config.correlation_attribute))
                            .unwrap_or(&uid_value)
                            .to_string();
                        let candidates: Vec<RegistryEntity> = sync
                            .entities
                            .find_by_attribute(&self.config.correlation_attribute, &value)
                            .await
                            .map_err(store_item_err)?
                            .into_iter()
                            .filter(|e| e.entity_type == self.config.entity_type)
                            .collect();
                        match candidates.len() {
                            1 => tx.ops.push(StagedOp::AddLink(EntityAccountLink::new(
                                candidates[0].id,
                                account.id,
                            ))),
                            0 => tx.warn(format!("no entity matches '{value}'")),
                            n => tx.warn(format!("{n} entities match '{value}'")),
                        }
                    }
                    UnlinkedAction::CreateEntity => {
                        tx.action = "create_entity";
                        let entity = RegistryEntity::new(
                            self.config.entity_type.clone(),
                            entry.attributes.clone().unwrap_or_default(),
                        );
                        tx.ops.push(StagedOp::AddLink(EntityAccountLink::new(
                            entity.id, account.id,
                        )));
                        tx.ops.push(StagedOp::InsertEntity(entity));
                    }
                    UnlinkedAction::Unlink => {
                        tx.action = "unlink";
                        tx.ops.push(StagedOp::DeleteAccount(account.id));
                    }
                }
            }
            SyncSituation::MissingEntity => match self.actions.missing_entity {
                MissingEntityAction::Ignore => tx.action = "ignore",
                MissingEntityAction::CreateEntityAndAccount => {
                    tx.action = "create_entity_and_account";
                    let entity = RegistryEntity::new(
                        self.config.entity_type.clone(),
                        entry.attributes.clone().unwrap_or_default(),
                    );
                    let account = Account::new(
                        self.config.system_id,
                        &uid_value,
                        self.config.entity_type.clone(),
                    );
                    tx.ops.push(StagedOp::AddLink(EntityAccountLink::new(
                        entity.id, account.id,
                    )));
                    tx.ops.push(StagedOp::InsertEntity(entity));
                    tx.ops.push(StagedOp::UpsertAccount(account));
                }
                MissingEntityAction::CreateAccountOnly => {
                    tx.action = "create_account_only";
                    tx.ops.push(StagedOp::UpsertAccount(Account::new(
                        self.config.system_id,
                        &uid_value,
                        self.config.entity_type.clone(),
                    )));
                }
            },
            SyncSituation::MissingAccount => {
                let Some(account) = account else {
                    return Err(TaskError::item("account record vanished mid-run"));
                };
                match self.actions.missing_account {
                    MissingAccountAction::Ignore => tx.action = "ignore",
                    MissingAccountAction::DeleteAccount => {
                        tx.action = "delete_account";
                        tx.ops.push(StagedOp::DeleteAccount(account.id));
                    }
                    MissingAccountAction::SetProtection => {
                        tx.action = "set_protection";
                        let mut protected = account;
                        protected.protect(Utc::now());
                        tx.ops.push(StagedOp::UpsertAccount(protected));
                    }
                    MissingAccountAction::DeleteEntity => {
                        tx.action = "delete_entity";
                        if let Some(entity) = linked_entity {
                            tx.ops.push(StagedOp::DeleteEntity(entity.id));
                        }
                        tx.ops.push(StagedOp::DeleteAccount(account.id));
                    }
                }
            }
        }
        Ok(())
    }
}

fn store_item_err(err: StoreError) -> TaskError {
    TaskError::item(err.to_string())
}

#[async_trait]
impl StatefulTask for SyncRunTask<'_> {
    type Item = SyncEntry;
    type Tx = SyncStaging;

    fn name(&self) -> &str {
        &self.task_name
    }

    async fn items(&self) -> TaskResult<Vec<SyncEntry>> {
        Ok(self.entries.clone())
    }

    fn item_key(&self, item: &SyncEntry) -> String {
        format!("{}:{}", item.uid.value(), item.delta_type)
    }

    async fn begin(&self) -> TaskResult<SyncStaging> {
        Ok(SyncStaging::new())
    }

    async fn process_item(&self, tx: &mut SyncStaging, item: &SyncEntry) -> TaskResult<()> {
        self.dispatch(tx, item).await
    }

    async fn commit(&self, tx: SyncStaging) -> TaskResult<()> {
        let sync = self.sync;
        for op in tx.ops {
            match op {
                StagedOp::UpsertAccount(account) => {
                    sync.accounts.upsert_account(&account).await?;
                }
                StagedOp::DeleteAccount(id) => sync.accounts.delete_account(id).await?,
                StagedOp::InsertEntity(entity) => sync.entities.insert_entity(&entity).await?,
                StagedOp::UpdateEntityAttrs(id, attrs) => {
                    sync.entities.update_attributes(id, &attrs).await?;
                }
                StagedOp::DeleteEntity(id) => sync.entities.delete_entity(id).await?,
                StagedOp::AddLink(link) => sync.accounts.add_link(&link).await?,
                StagedOp::Enqueue(account, request) => {
                    sync.queue
                        .enqueue(&account, request)
                        .await
                        .map_err(|e| TaskError::item(e.to_string()))?;
                }
            }
        }

        let mut item = SyncItemLog::new(self.run_id, tx.uid, tx.situation, tx.action, tx.outcome);
        if let Some(message) = tx.message {
            item = item.with_message(message);
        }
        sync.logs.append_item(&item).await?;
        if let Some(situation) = tx.situation {
            sync.logs
                .bump_action(self.run_id, situation, tx.action, tx.outcome)
                .await?;
        }
        match tx.outcome {
            SyncItemOutcome::Success => sync.logs.bump_counts(self.run_id, 1, 0, 0).await?,
            SyncItemOutcome::Warning => sync.logs.bump_counts(self.run_id, 0, 1, 0).await?,
            SyncItemOutcome::Error => sync.logs.bump_counts(self.run_id, 0, 0, 1).await?,
        }
        Ok(())
    }

    async fn rollback(&self, _tx: SyncStaging) -> TaskResult<()> {
        // Staged mutations were never applied; dropping them is the
        // rollback.
        Ok(())
    }

    async fn on_item_failed(&self, item: &SyncEntry, error: &TaskError) -> TaskResult<()> {
        let log = SyncItemLog::new(
            self.run_id,
            item.uid.value(),
            None,
            "error",
            SyncItemOutcome::Error,
        )
        .with_message(error.to_string());
        self.sync.logs.append_item(&log).await?;
        self.sync.logs.bump_counts(self.run_id, 0, 0, 1).await?;
        Ok(())
    }
}
