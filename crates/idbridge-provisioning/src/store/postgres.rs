//! Postgres backend.
//!
//! Enum columns are stored as text via `as_str`/`FromStr`; attribute
//! payloads as JSONB. Claims and run starts rely on row-level conditions
//! and partial unique indexes, so concurrent workers stay correct without
//! advisory locks.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use idbridge_connector::{AttributeSet, OperationType};

use crate::account::{Account, AccountStore, EntityAccountLink, EntityStore, RegistryEntity};
use crate::breaker::{BreakConfig, BreakConfigStore};
use crate::queue::{
    OperationState, ProvisioningBatch, ProvisioningOperation, ProvisioningRequest, QueueStore,
};
use crate::store::{Page, StoreError, StoreResult};
use crate::sync::config::{SyncActionConfig, SyncConfig, SyncConfigStore};
use crate::sync::log::{SyncActionLog, SyncItemLog, SyncItemOutcome, SyncLogStore, SyncRunLog};
use crate::sync::situation::SyncSituation;
use crate::task::{TaskCounts, TaskRun, TaskState, TaskStateStore};

/// All store traits over a Postgres pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

fn conflict(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(what.to_string())
        }
        _ => err.into(),
    }
}

fn json_attrs(row: &sqlx::postgres::PgRow, column: &str) -> AttributeSet {
    serde_json::from_value(row.get::<serde_json::Value, _>(column)).unwrap_or_default()
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> Account {
    Account {
        id: row.get("id"),
        system_id: row.get("system_id"),
        uid: row.get("uid"),
        entity_type: row.get("entity_type"),
        protected: row.get("protected"),
        protected_until: row.get("protected_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_link(row: &sqlx::postgres::PgRow) -> EntityAccountLink {
    EntityAccountLink {
        id: row.get("id"),
        entity_id: row.get("entity_id"),
        account_id: row.get("account_id"),
        created_at: row.get("created_at"),
    }
}

fn row_to_entity(row: &sqlx::postgres::PgRow) -> RegistryEntity {
    RegistryEntity {
        id: row.get("id"),
        entity_type: row.get("entity_type"),
        attributes: json_attrs(row, "attributes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_batch(row: &sqlx::postgres::PgRow) -> ProvisioningBatch {
    ProvisioningBatch {
        id: row.get("id"),
        account_id: row.get("account_id"),
        system_id: row.get("system_id"),
        next_attempt: row.get("next_attempt"),
        in_execution: row.get("in_execution"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
    }
}

fn row_to_operation(row: &sqlx::postgres::PgRow) -> ProvisioningOperation {
    ProvisioningOperation {
        id: row.get("id"),
        system_id: row.get("system_id"),
        account_id: row.get("account_id"),
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        operation_type: row
            .get::<String, _>("operation_type")
            .parse()
            .unwrap_or(OperationType::Update),
        object_class: row.get("object_class"),
        uid: row.get("uid"),
        attributes: row.get("attributes"),
        secrets: row.get("secrets"),
        state: row
            .get::<String, _>("state")
            .parse()
            .unwrap_or(OperationState::Created),
        attempt: row.get::<i32, _>("attempt") as u32,
        override_protection: row.get("override_protection"),
        result_message: row.get("result_message"),
        result_code: row.get("result_code"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> SyncRunLog {
    SyncRunLog {
        id: row.get("id"),
        config_id: row.get("config_id"),
        system_id: row.get("system_id"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        running: row.get("running"),
        success_count: row.get::<i32, _>("success_count") as u32,
        warning_count: row.get::<i32, _>("warning_count") as u32,
        error_count: row.get::<i32, _>("error_count") as u32,
        canceled: row.get("canceled"),
        fatal_error: row.get("fatal_error"),
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let row = sqlx::query(
            r"
            SELECT id, system_id, uid, entity_type, protected, protected_until,
                   created_at, updated_at
            FROM idb_accounts WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_account(&r)))
    }

    async fn find_by_uid(&self, system_id: Uuid, uid: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query(
            r"
            SELECT id, system_id, uid, entity_type, protected, protected_until,
                   created_at, updated_at
            FROM idb_accounts WHERE system_id = $1 AND uid = $2
            ",
        )
        .bind(system_id)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_account(&r)))
    }

    async fn list_by_system(&self, system_id: Uuid) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(
            r"
            SELECT id, system_id, uid, entity_type, protected, protected_until,
                   created_at, updated_at
            FROM idb_accounts WHERE system_id = $1
            ORDER BY created_at
            ",
        )
        .bind(system_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_account).collect())
    }

    async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_accounts (
                id, system_id, uid, entity_type, protected, protected_until,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                uid = EXCLUDED.uid,
                protected = EXCLUDED.protected,
                protected_until = EXCLUDED.protected_until,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(account.id)
        .bind(account.system_id)
        .bind(&account.uid)
        .bind(&account.entity_type)
        .bind(account.protected)
        .bind(account.protected_until)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_account(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM idb_entity_account_links WHERE account_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM idb_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_link(&self, link: &EntityAccountLink) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_entity_account_links (id, entity_id, account_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_id, account_id) DO NOTHING
            ",
        )
        .bind(link.id)
        .bind(link.entity_id)
        .bind(link.account_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_link(&self, entity_id: Uuid, account_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM idb_entity_account_links WHERE entity_id = $1 AND account_id = $2",
        )
        .bind(entity_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn links_for_account(&self, account_id: Uuid) -> StoreResult<Vec<EntityAccountLink>> {
        let rows = sqlx::query(
            r"
            SELECT id, entity_id, account_id, created_at
            FROM idb_entity_account_links WHERE account_id = $1
            ORDER BY created_at
            ",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn links_for_entity(&self, entity_id: Uuid) -> StoreResult<Vec<EntityAccountLink>> {
        let rows = sqlx::query(
            r"
            SELECT id, entity_id, account_id, created_at
            FROM idb_entity_account_links WHERE entity_id = $1
            ORDER BY created_at
            ",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_link).collect())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<RegistryEntity>> {
        let row = sqlx::query(
            r"
            SELECT id, entity_type, attributes, created_at, updated_at
            FROM idb_entities WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_entity(&r)))
    }

    async fn insert_entity(&self, entity: &RegistryEntity) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_entities (id, entity_type, attributes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(entity.id)
        .bind(&entity.entity_type)
        .bind(serde_json::to_value(&entity.attributes)?)
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attributes(&self, id: Uuid, attributes: &AttributeSet) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE idb_entities SET attributes = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(serde_json::to_value(attributes)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("entity {id}")));
        }
        Ok(())
    }

    async fn delete_entity(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM idb_entity_account_links WHERE entity_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM idb_entities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_attribute(
        &self,
        name: &str,
        value: &str,
    ) -> StoreResult<Vec<RegistryEntity>> {
        let rows = sqlx::query(
            r"
            SELECT id, entity_type, attributes, created_at, updated_at
            FROM idb_entities
            WHERE attributes ->> $1 = $2
            ORDER BY created_at
            ",
        )
        .bind(name)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_entity).collect())
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn open_batch_for_account(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<ProvisioningBatch>> {
        let row = sqlx::query(
            r"
            SELECT id, account_id, system_id, next_attempt, in_execution,
                   claimed_by, claimed_at, created_at
            FROM idb_provisioning_batches WHERE account_id = $1
            ",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_batch(&r)))
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ProvisioningBatch>> {
        let row = sqlx::query(
            r"
            SELECT id, account_id, system_id, next_attempt, in_execution,
                   claimed_by, claimed_at, created_at
            FROM idb_provisioning_batches WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_batch(&r)))
    }

    async fn insert_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_provisioning_batches (
                id, account_id, system_id, next_attempt, in_execution,
                claimed_by, claimed_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(batch.id)
        .bind(batch.account_id)
        .bind(batch.system_id)
        .bind(batch.next_attempt)
        .bind(batch.in_execution)
        .bind(batch.claimed_by)
        .bind(batch.claimed_at)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict(e, "account already has an open batch"))?;
        Ok(())
    }

    async fn update_batch(&self, batch: &ProvisioningBatch) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_provisioning_batches
            SET next_attempt = $2, in_execution = $3, claimed_by = $4, claimed_at = $5
            WHERE id = $1
            ",
        )
        .bind(batch.id)
        .bind(batch.next_attempt)
        .bind(batch.in_execution)
        .bind(batch.claimed_by)
        .bind(batch.claimed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_batch(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM idb_provisioning_requests WHERE batch_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM idb_provisioning_batches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn due_batches(
        &self,
        now: DateTime<Utc>,
        page: Page,
    ) -> StoreResult<Vec<ProvisioningBatch>> {
        let rows = sqlx::query(
            r"
            SELECT id, account_id, system_id, next_attempt, in_execution,
                   claimed_by, claimed_at, created_at
            FROM idb_provisioning_batches
            WHERE in_execution = FALSE
              AND (next_attempt IS NULL OR next_attempt <= $1)
            ORDER BY created_at
            OFFSET $2 LIMIT $3
            ",
        )
        .bind(now)
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_batch).collect())
    }

    async fn claim_batch(&self, batch_id: Uuid, instance_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE idb_provisioning_batches
            SET in_execution = TRUE, claimed_by = $2, claimed_at = NOW()
            WHERE id = $1 AND in_execution = FALSE
            ",
        )
        .bind(batch_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_batch(&self, batch_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_provisioning_batches
            SET in_execution = FALSE, claimed_by = NULL, claimed_at = NULL
            WHERE id = $1
            ",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r"
            UPDATE idb_provisioning_batches
            SET in_execution = FALSE, claimed_by = NULL, claimed_at = NULL
            WHERE in_execution = TRUE AND (claimed_at IS NULL OR claimed_at < $1)
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_provisioning_operations (
                id, system_id, account_id, entity_type, entity_id, operation_type,
                object_class, uid, attributes, secrets, state, attempt,
                override_protection, result_message, result_code, created_at, modified_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(operation.id)
        .bind(operation.system_id)
        .bind(operation.account_id)
        .bind(&operation.entity_type)
        .bind(operation.entity_id)
        .bind(operation.operation_type.as_str())
        .bind(&operation.object_class)
        .bind(&operation.uid)
        .bind(&operation.attributes)
        .bind(&operation.secrets)
        .bind(operation.state.as_str())
        .bind(operation.attempt as i32)
        .bind(operation.override_protection)
        .bind(&operation.result_message)
        .bind(&operation.result_code)
        .bind(operation.created_at)
        .bind(operation.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_provisioning_operations
            SET state = $2, attempt = $3, result_message = $4, result_code = $5,
                modified_at = $6
            WHERE id = $1
            ",
        )
        .bind(operation.id)
        .bind(operation.state.as_str())
        .bind(operation.attempt as i32)
        .bind(&operation.result_message)
        .bind(&operation.result_code)
        .bind(operation.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> StoreResult<Option<ProvisioningOperation>> {
        let row = sqlx::query(
            r"
            SELECT id, system_id, account_id, entity_type, entity_id, operation_type,
                   object_class, uid, attributes, secrets, state, attempt,
                   override_protection, result_message, result_code, created_at, modified_at
            FROM idb_provisioning_operations WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_operation(&r)))
    }

    async fn insert_request(&self, request: &ProvisioningRequest) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_provisioning_requests (id, batch_id, operation_id, seq, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(request.id)
        .bind(request.batch_id)
        .bind(request.operation_id)
        .bind(request.seq)
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict(e, "request seq already taken"))?;
        Ok(())
    }

    async fn requests_for_batch(
        &self,
        batch_id: Uuid,
    ) -> StoreResult<Vec<(ProvisioningRequest, ProvisioningOperation)>> {
        let rows = sqlx::query(
            r"
            SELECT r.id AS r_id, r.batch_id, r.operation_id, r.seq, r.created_at AS r_created_at,
                   o.id, o.system_id, o.account_id, o.entity_type, o.entity_id, o.operation_type,
                   o.object_class, o.uid, o.attributes, o.secrets, o.state, o.attempt,
                   o.override_protection, o.result_message, o.result_code, o.created_at,
                   o.modified_at
            FROM idb_provisioning_requests r
            JOIN idb_provisioning_operations o ON o.id = r.operation_id
            WHERE r.batch_id = $1
            ORDER BY r.seq
            ",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let request = ProvisioningRequest {
                    id: row.get("r_id"),
                    batch_id: row.get("batch_id"),
                    operation_id: row.get("operation_id"),
                    seq: row.get("seq"),
                    created_at: row.get("r_created_at"),
                };
                (request, row_to_operation(row))
            })
            .collect())
    }

    async fn max_seq(&self, batch_id: Uuid) -> StoreResult<Option<i64>> {
        let row =
            sqlx::query("SELECT MAX(seq) AS max_seq FROM idb_provisioning_requests WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get("max_seq"))
    }

    async fn archive_operation(&self, operation: &ProvisioningOperation) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            INSERT INTO idb_provisioning_archive (
                id, system_id, account_id, entity_type, entity_id, operation_type,
                object_class, uid, attributes, state, attempt, result_message,
                result_code, created_at, archived_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            ",
        )
        .bind(operation.id)
        .bind(operation.system_id)
        .bind(operation.account_id)
        .bind(&operation.entity_type)
        .bind(operation.entity_id)
        .bind(operation.operation_type.as_str())
        .bind(&operation.object_class)
        .bind(&operation.uid)
        .bind(&operation.attributes)
        .bind(operation.state.as_str())
        .bind(operation.attempt as i32)
        .bind(&operation.result_message)
        .bind(&operation.result_code)
        .bind(operation.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM idb_provisioning_requests WHERE operation_id = $1")
            .bind(operation.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM idb_provisioning_operations WHERE id = $1")
            .bind(operation.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn archived_for_account(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        let rows = sqlx::query(
            r"
            SELECT id, system_id, account_id, entity_type, entity_id, operation_type,
                   object_class, uid, attributes, NULL::jsonb AS secrets, state, attempt,
                   FALSE AS override_protection, result_message, result_code, created_at,
                   archived_at AS modified_at
            FROM idb_provisioning_archive
            WHERE account_id = $1
            ORDER BY archived_at DESC
            OFFSET $2 LIMIT $3
            ",
        )
        .bind(account_id)
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_operation).collect())
    }
}

#[async_trait]
impl BreakConfigStore for PgStore {
    async fn resolve(
        &self,
        system_id: Uuid,
        operation_type: OperationType,
    ) -> StoreResult<Option<BreakConfig>> {
        // Per-system first, global default second.
        let row = sqlx::query(
            r"
            SELECT system_id, operation_type, warning_threshold, disable_threshold,
                   window_secs, recipients, enabled
            FROM idb_break_configs
            WHERE operation_type = $2 AND (system_id = $1 OR system_id IS NULL)
            ORDER BY system_id NULLS LAST
            LIMIT 1
            ",
        )
        .bind(system_id)
        .bind(operation_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| BreakConfig {
            system_id: r.get("system_id"),
            operation_type: r
                .get::<String, _>("operation_type")
                .parse()
                .unwrap_or(operation_type),
            warning_threshold: r.get::<Option<i32>, _>("warning_threshold").map(|v| v as u32),
            disable_threshold: r.get::<i32, _>("disable_threshold") as u32,
            window_secs: r.get("window_secs"),
            recipients: r.get("recipients"),
            enabled: r.get("enabled"),
        }))
    }

    async fn upsert(&self, config: &BreakConfig) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_break_configs (
                system_id, operation_type, warning_threshold, disable_threshold,
                window_secs, recipients, enabled
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (system_id, operation_type) DO UPDATE SET
                warning_threshold = EXCLUDED.warning_threshold,
                disable_threshold = EXCLUDED.disable_threshold,
                window_secs = EXCLUDED.window_secs,
                recipients = EXCLUDED.recipients,
                enabled = EXCLUDED.enabled
            ",
        )
        .bind(config.system_id)
        .bind(config.operation_type.as_str())
        .bind(config.warning_threshold.map(|v| v as i32))
        .bind(config.disable_threshold as i32)
        .bind(config.window_secs)
        .bind(&config.recipients)
        .bind(config.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncConfigStore for PgStore {
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<SyncConfig>> {
        let row = sqlx::query(
            r"
            SELECT id, system_id, object_class, entity_type, enabled, overrides,
                   correlation_attribute, batch_size, token, detect_deletions, updated_at
            FROM idb_sync_configs WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> StoreResult<SyncConfig> {
            Ok(SyncConfig {
                id: r.get("id"),
                system_id: r.get("system_id"),
                object_class: r.get("object_class"),
                entity_type: r.get("entity_type"),
                enabled: r.get("enabled"),
                overrides: serde_json::from_value(r.get::<serde_json::Value, _>("overrides"))?,
                correlation_attribute: r.get("correlation_attribute"),
                batch_size: r.get::<i32, _>("batch_size") as u32,
                token: r.get("token"),
                detect_deletions: r.get("detect_deletions"),
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn upsert_config(&self, config: &SyncConfig) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_sync_configs (
                id, system_id, object_class, entity_type, enabled, overrides,
                correlation_attribute, batch_size, token, detect_deletions, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                overrides = EXCLUDED.overrides,
                correlation_attribute = EXCLUDED.correlation_attribute,
                batch_size = EXCLUDED.batch_size,
                token = EXCLUDED.token,
                detect_deletions = EXCLUDED.detect_deletions,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(config.id)
        .bind(config.system_id)
        .bind(&config.object_class)
        .bind(&config.entity_type)
        .bind(config.enabled)
        .bind(serde_json::to_value(config.overrides)?)
        .bind(&config.correlation_attribute)
        .bind(config.batch_size as i32)
        .bind(&config.token)
        .bind(config.detect_deletions)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_token(&self, id: Uuid, token: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE idb_sync_configs SET token = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("sync config {id}")));
        }
        Ok(())
    }

    async fn global_actions(&self) -> StoreResult<SyncActionConfig> {
        let row = sqlx::query("SELECT actions FROM idb_sync_global_actions WHERE singleton = TRUE")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(serde_json::from_value(
                r.get::<serde_json::Value, _>("actions"),
            )?),
            None => Ok(SyncActionConfig::default()),
        }
    }

    async fn set_global_actions(&self, actions: SyncActionConfig) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_sync_global_actions (singleton, actions)
            VALUES (TRUE, $1)
            ON CONFLICT (singleton) DO UPDATE SET actions = EXCLUDED.actions
            ",
        )
        .bind(serde_json::to_value(actions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncLogStore for PgStore {
    async fn insert_run(&self, run: &SyncRunLog) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_sync_runs (
                id, config_id, system_id, started_at, ended_at, running,
                success_count, warning_count, error_count, canceled, fatal_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(run.id)
        .bind(run.config_id)
        .bind(run.system_id)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.running)
        .bind(run.success_count as i32)
        .bind(run.warning_count as i32)
        .bind(run.error_count as i32)
        .bind(run.canceled)
        .bind(&run.fatal_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &SyncRunLog) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_sync_runs
            SET ended_at = $2, running = $3, canceled = $4, fatal_error = $5
            WHERE id = $1
            ",
        )
        .bind(run.id)
        .bind(run.ended_at)
        .bind(run.running)
        .bind(run.canceled)
        .bind(&run.fatal_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<SyncRunLog>> {
        let row = sqlx::query(
            r"
            SELECT id, config_id, system_id, started_at, ended_at, running,
                   success_count, warning_count, error_count, canceled, fatal_error
            FROM idb_sync_runs WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_run(&r)))
    }

    async fn is_running(&self, config_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM idb_sync_runs WHERE config_id = $1 AND running = TRUE",
        )
        .bind(config_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn append_item(&self, item: &SyncItemLog) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_sync_items (
                id, run_id, uid, situation, action, outcome, message, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(item.id)
        .bind(item.run_id)
        .bind(&item.uid)
        .bind(item.situation.map(|s| s.as_str()))
        .bind(&item.action)
        .bind(item.outcome.as_str())
        .bind(&item.message)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_counts(
        &self,
        run_id: Uuid,
        success: u32,
        warning: u32,
        error: u32,
    ) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_sync_runs
            SET success_count = success_count + $2,
                warning_count = warning_count + $3,
                error_count = error_count + $4
            WHERE id = $1
            ",
        )
        .bind(run_id)
        .bind(success as i32)
        .bind(warning as i32)
        .bind(error as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_action(
        &self,
        run_id: Uuid,
        situation: SyncSituation,
        action: &str,
        outcome: SyncItemOutcome,
    ) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_sync_actions (run_id, situation, action, outcome, count)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (run_id, situation, action, outcome)
            DO UPDATE SET count = idb_sync_actions.count + 1
            ",
        )
        .bind(run_id)
        .bind(situation.as_str())
        .bind(action)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn items_for_run(&self, run_id: Uuid, page: Page) -> StoreResult<Vec<SyncItemLog>> {
        let rows = sqlx::query(
            r"
            SELECT id, run_id, uid, situation, action, outcome, message, created_at
            FROM idb_sync_items WHERE run_id = $1
            ORDER BY created_at
            OFFSET $2 LIMIT $3
            ",
        )
        .bind(run_id)
        .bind(i64::from(page.offset))
        .bind(i64::from(page.limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| SyncItemLog {
                id: r.get("id"),
                run_id: r.get("run_id"),
                uid: r.get("uid"),
                situation: r
                    .get::<Option<String>, _>("situation")
                    .and_then(|s| s.parse().ok()),
                action: r.get("action"),
                outcome: r
                    .get::<String, _>("outcome")
                    .parse()
                    .unwrap_or(SyncItemOutcome::Error),
                message: r.get("message"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn actions_for_run(&self, run_id: Uuid) -> StoreResult<Vec<SyncActionLog>> {
        let rows = sqlx::query(
            r"
            SELECT run_id, situation, action, outcome, count
            FROM idb_sync_actions WHERE run_id = $1
            ",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let situation: SyncSituation =
                    r.get::<String, _>("situation").parse().ok()?;
                let outcome: SyncItemOutcome = r.get::<String, _>("outcome").parse().ok()?;
                Some(SyncActionLog {
                    run_id: r.get("run_id"),
                    situation,
                    action: r.get("action"),
                    outcome,
                    count: r.get::<i32, _>("count") as u32,
                })
            })
            .collect())
    }
}

#[async_trait]
impl TaskStateStore for PgStore {
    async fn start_run(&self, run: &TaskRun) -> StoreResult<()> {
        // A partial unique index on (task_name) WHERE state = 'running'
        // turns a concurrent start into a conflict.
        sqlx::query(
            r"
            INSERT INTO idb_task_runs (
                id, task_name, instance_id, state, succeeded, failed, skipped,
                started_at, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(run.id)
        .bind(&run.task_name)
        .bind(run.instance_id)
        .bind(run.state.as_str())
        .bind(run.counts.succeeded as i32)
        .bind(run.counts.failed as i32)
        .bind(run.counts.skipped as i32)
        .bind(run.started_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict(e, "task already has an active run"))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        state: TaskState,
        counts: TaskCounts,
    ) -> StoreResult<()> {
        sqlx::query(
            r"
            UPDATE idb_task_runs
            SET state = $2, succeeded = $3, failed = $4, skipped = $5, ended_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(run_id)
        .bind(state.as_str())
        .bind(counts.succeeded as i32)
        .bind(counts.failed as i32)
        .bind(counts.skipped as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<TaskRun>> {
        let row = sqlx::query(
            r"
            SELECT id, task_name, instance_id, state, succeeded, failed, skipped,
                   started_at, ended_at
            FROM idb_task_runs WHERE id = $1
            ",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| TaskRun {
            id: r.get("id"),
            task_name: r.get("task_name"),
            instance_id: r.get("instance_id"),
            state: r
                .get::<String, _>("state")
                .parse()
                .unwrap_or(TaskState::Exception),
            counts: TaskCounts {
                succeeded: r.get::<i32, _>("succeeded") as u32,
                failed: r.get::<i32, _>("failed") as u32,
                skipped: r.get::<i32, _>("skipped") as u32,
            },
            started_at: r.get("started_at"),
            ended_at: r.get("ended_at"),
        }))
    }

    async fn is_running(&self, task_name: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM idb_task_runs WHERE task_name = $1 AND state = 'running'",
        )
        .bind(task_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn recover_stale_runs(&self, live_instance_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r"
            UPDATE idb_task_runs
            SET state = 'canceled', ended_at = NOW()
            WHERE state = 'running' AND instance_id <> $1
            ",
        )
        .bind(live_instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn processed_keys(&self, task_name: &str) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query("SELECT item_key FROM idb_task_processed WHERE task_name = $1")
            .bind(task_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("item_key")).collect())
    }

    async fn mark_processed(&self, task_name: &str, key: &str) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_task_processed (task_name, item_key)
            VALUES ($1, $2)
            ON CONFLICT (task_name, item_key) DO NOTHING
            ",
        )
        .bind(task_name)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_processed(&self, task_name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM idb_task_processed WHERE task_name = $1")
            .bind(task_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log_item(
        &self,
        run_id: Uuid,
        key: &str,
        success: bool,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO idb_task_items (id, run_id, item_key, success, error, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ",
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(key)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
