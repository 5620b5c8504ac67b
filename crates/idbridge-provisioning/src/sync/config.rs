//! Synchronization configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreResult;
use crate::sync::situation::{
    LinkedAction, MissingAccountAction, MissingEntityAction, UnlinkedAction,
};

/// One action per situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActionConfig {
    /// Action for linked accounts.
    pub linked: LinkedAction,
    /// Action for unlinked accounts.
    pub unlinked: UnlinkedAction,
    /// Action for objects with no registry account.
    pub missing_entity: MissingEntityAction,
    /// Action for accounts gone from the target.
    pub missing_account: MissingAccountAction,
}

impl Default for SyncActionConfig {
    fn default() -> Self {
        Self {
            linked: LinkedAction::Ignore,
            unlinked: UnlinkedAction::Ignore,
            missing_entity: MissingEntityAction::Ignore,
            missing_account: MissingAccountAction::Ignore,
        }
    }
}

/// Per-configuration action overrides.
///
/// A set field wins over the global default for that situation; an unset
/// field falls through. Resolution always prefers the more specific side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActionOverrides {
    /// Override for linked accounts.
    pub linked: Option<LinkedAction>,
    /// Override for unlinked accounts.
    pub unlinked: Option<UnlinkedAction>,
    /// Override for objects with no registry account.
    pub missing_entity: Option<MissingEntityAction>,
    /// Override for accounts gone from the target.
    pub missing_account: Option<MissingAccountAction>,
}

impl SyncActionOverrides {
    /// Apply these overrides on top of a default set.
    pub fn resolve(&self, defaults: SyncActionConfig) -> SyncActionConfig {
        SyncActionConfig {
            linked: self.linked.unwrap_or(defaults.linked),
            unlinked: self.unlinked.unwrap_or(defaults.unlinked),
            missing_entity: self.missing_entity.unwrap_or(defaults.missing_entity),
            missing_account: self.missing_account.unwrap_or(defaults.missing_account),
        }
    }
}

/// Synchronization setup for one system and object class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Config id.
    pub id: Uuid,
    /// System being synchronized.
    pub system_id: Uuid,
    /// Object class to pull.
    pub object_class: String,
    /// Entity type created/updated by reconciliation.
    pub entity_type: String,
    /// Whether runs are allowed.
    pub enabled: bool,
    /// Per-situation action overrides for this config.
    pub overrides: SyncActionOverrides,
    /// Entity attribute matched against the reported uid when linking.
    pub correlation_attribute: String,
    /// Page size for connector sync calls.
    pub batch_size: u32,
    /// Resume token from the last completed run.
    pub token: Option<String>,
    /// Also detect deletions by listing all uids (full reconciliation).
    pub detect_deletions: bool,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SyncConfig {
    /// New enabled config with default actions.
    pub fn new(
        system_id: Uuid,
        object_class: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            system_id,
            object_class: object_class.into(),
            entity_type: entity_type.into(),
            enabled: true,
            overrides: SyncActionOverrides::default(),
            correlation_attribute: "uid".to_string(),
            batch_size: 100,
            token: None,
            detect_deletions: false,
            updated_at: Utc::now(),
        }
    }

    /// Set per-situation overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: SyncActionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Set the correlation attribute.
    #[must_use]
    pub fn with_correlation(mut self, attribute: impl Into<String>) -> Self {
        self.correlation_attribute = attribute.into();
        self
    }

    /// Enable deletion detection.
    #[must_use]
    pub fn detecting_deletions(mut self) -> Self {
        self.detect_deletions = true;
        self
    }
}

/// Storage for sync configurations and the global action defaults.
#[async_trait]
pub trait SyncConfigStore: Send + Sync {
    /// Fetch a config.
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<SyncConfig>>;

    /// Insert or replace a config.
    async fn upsert_config(&self, config: &SyncConfig) -> StoreResult<()>;

    /// Persist the resume token for a config.
    async fn save_token(&self, id: Uuid, token: Option<&str>) -> StoreResult<()>;

    /// Global per-situation action defaults.
    async fn global_actions(&self) -> StoreResult<SyncActionConfig>;

    /// Replace the global defaults.
    async fn set_global_actions(&self, actions: SyncActionConfig) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_beats_global_default() {
        let defaults = SyncActionConfig {
            linked: LinkedAction::UpdateEntity,
            ..SyncActionConfig::default()
        };
        let overrides = SyncActionOverrides {
            linked: Some(LinkedAction::UpdateAccount),
            ..SyncActionOverrides::default()
        };
        let resolved = overrides.resolve(defaults);
        assert_eq!(resolved.linked, LinkedAction::UpdateAccount);
        assert_eq!(resolved.unlinked, UnlinkedAction::Ignore);
    }

    #[test]
    fn test_unset_override_falls_through() {
        let defaults = SyncActionConfig {
            missing_account: MissingAccountAction::SetProtection,
            ..SyncActionConfig::default()
        };
        let resolved = SyncActionOverrides::default().resolve(defaults);
        assert_eq!(resolved.missing_account, MissingAccountAction::SetProtection);
    }
}
