//! In-memory backend for tests and embedders without a database.
//!
//! One mutex over the whole state keeps multi-row operations (claims,
//! archival) atomic, matching the transactional behavior of the Postgres
//! backend closely enough for the guarantees the services rely on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use idbridge_connector::{AttributeSet, OperationType};

use crate::account::{Account, AccountStore, EntityAccountLink, EntityStore, RegistryEntity};
use crate::breaker::{BreakConfig, BreakConfigStore};
use crate::queue::{ProvisioningBatch, ProvisioningOperation, ProvisioningRequest, QueueStore};
use crate::store::{Page, StoreError, StoreResult};
use crate::sync::config::{SyncActionConfig, SyncConfig, SyncConfigStore};
use crate::sync::log::{SyncActionLog, SyncItemLog, SyncItemOutcome, SyncLogStore, SyncRunLog};
use crate::sync::situation::SyncSituation;
use crate::task::{TaskCounts, TaskRun, TaskState, TaskStateStore};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    links: Vec<EntityAccountLink>,
    entities: HashMap<Uuid, RegistryEntity>,
    batches: HashMap<Uuid, ProvisioningBatch>,
    operations: HashMap<Uuid, ProvisioningOperation>,
    requests: Vec<ProvisioningRequest>,
    archive: Vec<ProvisioningOperation>,
    break_configs: Vec<BreakConfig>,
    sync_configs: HashMap<Uuid, SyncConfig>,
    global_actions: SyncActionConfig,
    sync_runs: HashMap<Uuid, SyncRunLog>,
    sync_items: Vec<SyncItemLog>,
    sync_actions: Vec<SyncActionLog>,
    task_runs: HashMap<Uuid, TaskRun>,
    processed: HashMap<String, HashSet<String>>,
    task_items: Vec<(Uuid, String, bool, Option<String>)>,
}

/// All store traits over shared in-process state.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Archived operations in insertion order, for assertions.
    pub fn archived_operations(&self) -> Vec<ProvisioningOperation> {
        self.lock().archive.clone()
    }

    /// Item outcome rows recorded by task runs, for assertions.
    pub fn task_item_logs(&self, run_id: Uuid) -> Vec<(String, bool, Option<String>)> {
        self.lock()
            .task_items
            .iter()
            .filter(|(id, _, _, _)| *id == run_id)
            .map(|(_, key, ok, err)| (key.clone(), *ok, err.clone()))
            .collect()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn find_by_uid(&self, system_id: Uuid, uid: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .lock()
            .accounts
            .values()
            .find(|a| a.system_id == system_id && a.uid == uid)
            .cloned())
    }

    async fn list_by_system(&self, system_id: Uuid) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .lock()
            .accounts
            .values()
            .filter(|a| a.system_id == system_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        self.lock().accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn delete_account(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        state.accounts.remove(&id);
        state.links.retain(|l| l.account_id != id);
        Ok(())
    }

    async fn add_link(&self, link: &EntityAccountLink) -> StoreResult<()> {
        self.lock().links.push(link.clone());
        Ok(())
    }

    async fn remove_link(&self, entity_id: Uuid, account_id: Uuid) -> StoreResult<()> {
        self.lock()
            .links
            .retain(|l| !(l.entity_id == entity_id && l.account_id == account_id));
        Ok(())
    }

    async fn links_for_account(&self, account_id: Uuid) -> StoreResult<Vec<EntityAccountLink>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn links_for_entity(&self, entity_id: Uuid) -> StoreResult<Vec<EntityAccountLink>> {
        Ok(self
            .lock()
            .links
            .iter()
            .filter(|l| l.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<RegistryEntity>> {
        Ok(self.lock().entities.get(&id).cloned())
    }

    async fn insert_entity(&self, entity: &RegistryEntity) -> StoreResult<()> {
        self.lock().entities.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn update_attributes(&self, id: Uuid, attributes: &AttributeSet) -> StoreResult<()> {
        let mut state = self.lock();
        let entity = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("entity {id}")))?;
        entity.attributes = attributes.clone();
        entity.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_entity(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        state.entities.remove(&id);
        state.links.retain(|l| l.entity_id != id);
        Ok(())
    }

    async fn find_by_attribute(
        &self,
        name: &str,
        value: &str,
    ) -> StoreResult<Vec<RegistryEntity>> {
        Ok(self
            .lock()
            .entities
            .values()
            .filter(|e| e.attributes.get_string(name) == Some(value))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn open_batch_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<ProvisioningBatch>> {
        Ok(self
            .lock()
            .batches
            .values()
            .find(|b| b.account_id == account_id)
            .cloned())
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ProvisioningBatch>> {
        Ok(self.lock().batches.get(&id).cloned())
    }

    async fn insert_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()> {
        let mut state = self.lock();
        if state
            .batches
            .values()
            .any(|b| b.account_id == batch.account_id)
        {
            return Err(StoreError::Conflict(format!(
                "account {} already has an open batch",
                batch.account_id
            )));
        }
        state.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn update_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()> {
        self.lock().batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        state.batches.remove(&id);
        state.requests.retain(|r| r.batch_id != id);
        Ok(())
    }

    async fn due_batches(
        &self,
        now: DateTime<Utc>,
        page: Page,
    ) -> StoreResult<Vec<ProvisioningBatch>> {
        let mut due: Vec<ProvisioningBatch> = self
            .lock()
            .batches
            .values()
            .filter(|b| !b.in_execution && b.next_attempt.map(|t| t <= now).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.created_at);
        Ok(due
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn claim_batch(&self, batch_id: Uuid, instance_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(batch) = state.batches.get_mut(&batch_id) else {
            return Ok(false);
        };
        if batch.in_execution {
            return Ok(false);
        }
        batch.in_execution = true;
        batch.claimed_by = Some(instance_id);
        batch.claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn release_batch(&self, batch_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            batch.in_execution = false;
            batch.claimed_by = None;
            batch.claimed_at = None;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock();
        let mut released = 0;
        for batch in state.batches.values_mut() {
            if batch.in_execution && batch.claimed_at.map(|t| t < cutoff).unwrap_or(true) {
                batch.in_execution = false;
                batch.claimed_by = None;
                batch.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn insert_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        self.lock().operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn update_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        self.lock().operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> StoreResult<Option<ProvisioningOperation>> {
        Ok(self.lock().operations.get(&id).cloned())
    }

    async fn insert_request(&self, request: &ProvisioningRequest) -> StoreResult<()> {
        let mut state = self.lock();
        if state
            .requests
            .iter()
            .any(|r| r.batch_id == request.batch_id && r.seq == request.seq)
        {
            return Err(StoreError::Conflict(format!(
                "seq {} already taken in batch {}",
                request.seq, request.batch_id
            )));
        }
        state.requests.push(request.clone());
        Ok(())
    }

    async fn requests_for_batch(
        &self,
        batch_id: Uuid,
    ) -> StoreResult<Vec<(ProvisioningRequest, ProvisioningOperation)>> {
        let state = self.lock();
        let mut rows: Vec<(ProvisioningRequest, ProvisioningOperation)> = state
            .requests
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .filter_map(|r| {
                state
                    .operations
                    .get(&r.operation_id)
                    .map(|op| (r.clone(), op.clone()))
            })
            .collect();
        rows.sort_by_key(|(r, _)| r.seq);
        Ok(rows)
    }

    async fn max_seq(&self, batch_id: Uuid) -> StoreResult<Option<i64>> {
        Ok(self
            .lock()
            .requests
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .map(|r| r.seq)
            .max())
    }

    async fn archive_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        let mut state = self.lock();
        let mut archived = operation.clone();
        archived.secrets = None;
        state.archive.push(archived);
        state.operations.remove(&operation.id);
        state.requests.retain(|r| r.operation_id != operation.id);
        Ok(())
    }

    async fn archived_for_account(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        let state = self.lock();
        let mut rows: Vec<ProvisioningOperation> = state
            .archive
            .iter()
            .filter(|op| op.account_id == account_id)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }
}

#[async_trait]
impl BreakConfigStore for MemoryStore {
    async fn resolve(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
    ) -> StoreResult<Option<BreakConfig>> {
        let state = self.lock();
        let specific = state
            .break_configs
            .iter()
            .find(|c| c.system_id == Some(system_id) && c.operation_type == operation_type);
        if let Some(config) = specific {
            return Ok(Some(config.clone()));
        }
        Ok(state
            .break_configs
            .iter()
            .find(|c| c.system_id.is_none() && c.operation_type == operation_type)
            .cloned())
    }

    async fn upsert(&self, config: &BreakConfig) -> StoreResult<()> {
        let mut state = self.lock();
        state
            .break_configs
            .retain(|c| !(c.system_id == config.system_id && c.operation_type == config.operation_type));
        state.break_configs.push(config.clone());
        Ok(())
    }
}

#[async_trait]
impl SyncConfigStore for MemoryStore {
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<SyncConfig>> {
        Ok(self.lock().sync_configs.get(&id).cloned())
    }

    async fn upsert_config(&self, config: &SyncConfig) -> StoreResult<()> {
        self.lock().sync_configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn save_token(&self, id: Uuid, token: Option<&str>) -> StoreResult<()> {
        let mut state = self.lock();
        let config = state
            .sync_configs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("sync config {id}")))?;
        config.token = token.map(str::to_string);
        config.updated_at = Utc::now();
        Ok(())
    }

    async fn global_actions(&self) -> StoreResult<SyncActionConfig> {
        Ok(self.lock().global_actions)
    }

    async fn set_global_actions(&self, actions: SyncActionConfig) -> StoreResult<()> {
        self.lock().global_actions = actions;
        Ok(())
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn insert_run(&self, run: &SyncRunLog) -> StoreResult<()> {
        self.lock().sync_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &SyncRunLog) -> StoreResult<()> {
        self.lock().sync_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<SyncRunLog>> {
        Ok(self.lock().sync_runs.get(&id).cloned())
    }

    async fn is_running(&self, config_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .lock()
            .sync_runs
            .values()
            .any(|r| r.config_id == config_id && r.running))
    }

    async fn append_item(&self, item: &SyncItemLog) -> StoreResult<()> {
        self.lock().sync_items.push(item.clone());
        Ok(())
    }

    async fn bump_counts(
        &self,
        run_id: Uuid,
        success: u32,
        warning: u32,
        error: u32,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .sync_runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("sync run {run_id}")))?;
        run.success_count += success;
        run.warning_count += warning;
        run.error_count += error;
        Ok(())
    }

    async fn bump_action(
        &self,
        run_id: Uuid,
        situation: SyncSituation,
        action: &str,
        outcome: SyncItemOutcome,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let existing = state.sync_actions.iter_mut().find(|a| {
            a.run_id == run_id
                && a.situation == situation
                && a.action == action
                && a.outcome == outcome
        });
        match existing {
            Some(row) => row.count += 1,
            None => state.sync_actions.push(SyncActionLog {
                run_id,
                situation,
                action: action.to_string(),
                outcome,
                count: 1,
            }),
        }
        Ok(())
    }

    async fn items_for_run(&self, run_id: Uuid, page: Page) -> StoreResult<Vec<SyncItemLog>> {
        Ok(self
            .lock()
            .sync_items
            .iter()
            .filter(|i| i.run_id == run_id)
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn actions_for_run(&self, run_id: Uuid) -> StoreResult<Vec<SyncActionLog>> {
        Ok(self
            .lock()
            .sync_actions
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskStateStore for MemoryStore {
    async fn start_run(&self, run: &TaskRun) -> StoreResult<()> {
        let mut state = self.lock();
        if state
            .task_runs
            .values()
            .any(|r| r.task_name == run.task_name && r.state == TaskState::Running)
        {
            return Err(StoreError::Conflict(format!(
                "task '{}' already running",
                run.task_name
            )));
        }
        state.task_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        task_state: TaskState,
        counts: TaskCounts,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let run = state
            .task_runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("task run {run_id}")))?;
        run.state = task_state;
        run.counts = counts;
        run.ended_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<TaskRun>> {
        Ok(self.lock().task_runs.get(&run_id).cloned())
    }

    async fn is_running(&self, task_name: &str) -> StoreResult<bool> {
        Ok(self
            .lock()
            .task_runs
            .values()
            .any(|r| r.task_name == task_name && r.state == TaskState::Running))
    }

    async fn recover_stale_runs(&self, live_instance_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock();
        let mut recovered = 0;
        for run in state.task_runs.values_mut() {
            if run.state == TaskState::Running && run.instance_id != live_instance_id {
                run.state = TaskState::Canceled;
                run.ended_at = Some(Utc::now());
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn processed_keys(&self, task_name: &str) -> StoreResult<HashSet<String>> {
        Ok(self
            .lock()
            .processed
            .get(task_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_processed(&self, task_name: &str, key: &str) -> StoreResult<()> {
        self.lock()
            .processed
            .entry(task_name.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn clear_processed(&self, task_name: &str) -> StoreResult<()> {
        self.lock().processed.remove(task_name);
        Ok(())
    }

    async fn log_item(
        &self,
        run_id: Uuid,
        key: &str,
        success: bool,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.lock().task_items.push((
            run_id,
            key.to_string(),
            success,
            error.map(str::to_string),
        ));
        Ok(())
    }
}
