//! Registry accounts, entities, and the links between them.
//!
//! An [`Account`] is the registry's record of an object on a connected
//! system. It carries no attribute data of its own; attributes live on the
//! linked [`RegistryEntity`] and are resolved per system at provisioning
//! time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use idbridge_connector::AttributeSet;

use crate::store::StoreResult;

/// Registry-side record of an object on a connected system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Account id.
    pub id: Uuid,
    /// System this account lives on.
    pub system_id: Uuid,
    /// Identifier of the object on the target system.
    pub uid: String,
    /// Entity type this account represents (e.g. "identity").
    pub entity_type: String,
    /// Whether the account is protected from deletion.
    pub protected: bool,
    /// When protection expires. None with `protected = true` means
    /// indefinite protection.
    pub protected_until: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new unprotected account.
    pub fn new(system_id: Uuid, uid: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            system_id,
            uid: uid.into(),
            entity_type: entity_type.into(),
            protected: false,
            protected_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the account is protected at the given instant.
    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        if !self.protected {
            return false;
        }
        match self.protected_until {
            Some(until) => until > now,
            None => true,
        }
    }

    /// Enable protection for the given grace interval from now.
    ///
    /// Called instead of deleting when a delete hits a protected account:
    /// the interval restarts, so repeated deletes keep pushing expiry out.
    pub fn extend_protection(&mut self, grace: Duration, now: DateTime<Utc>) {
        self.protected = true;
        self.protected_until = Some(now + grace);
        self.updated_at = now;
    }

    /// Enable indefinite protection.
    pub fn protect(&mut self, now: DateTime<Utc>) {
        self.protected = true;
        self.protected_until = None;
        self.updated_at = now;
    }
}

/// Link between a registry entity and an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAccountLink {
    /// Link id.
    pub id: Uuid,
    /// The registry entity.
    pub entity_id: Uuid,
    /// The account.
    pub account_id: Uuid,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl EntityAccountLink {
    /// Create a new link.
    pub fn new(entity_id: Uuid, account_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            account_id,
            created_at: Utc::now(),
        }
    }
}

/// An entity in the identity registry (the authoritative side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntity {
    /// Entity id.
    pub id: Uuid,
    /// Entity type (e.g. "identity", "group").
    pub entity_type: String,
    /// The entity's attributes.
    pub attributes: AttributeSet,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntity {
    /// Create a new entity.
    pub fn new(entity_type: impl Into<String>, attributes: AttributeSet) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            attributes,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage for accounts and entity-account links.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an account by id.
    async fn get_account(&self, id: Uuid) -> StoreResult<Option<Account>>;

    /// Find an account by system and target-system uid.
    async fn find_by_uid(&self, system_id: Uuid, uid: &str) -> StoreResult<Option<Account>>;

    /// All accounts on a system.
    async fn list_by_system(&self, system_id: Uuid) -> StoreResult<Vec<Account>>;

    /// Insert or update an account.
    async fn upsert_account(&self, account: &Account) -> StoreResult<()>;

    /// Delete an account and its links.
    async fn delete_account(&self, id: Uuid) -> StoreResult<()>;

    /// Insert a link.
    async fn add_link(&self, link: &EntityAccountLink) -> StoreResult<()>;

    /// Remove the link between an entity and an account.
    async fn remove_link(&self, entity_id: Uuid, account_id: Uuid) -> StoreResult<()>;

    /// Links pointing at an account.
    async fn links_for_account(&self, account_id: Uuid) -> StoreResult<Vec<EntityAccountLink>>;

    /// Links owned by an entity.
    async fn links_for_entity(&self, entity_id: Uuid) -> StoreResult<Vec<EntityAccountLink>>;
}

/// Storage for registry entities.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch an entity by id.
    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<RegistryEntity>>;

    /// Insert a new entity.
    async fn insert_entity(&self, entity: &RegistryEntity) -> StoreResult<()>;

    /// Replace an entity's attributes.
    async fn update_attributes(&self, id: Uuid, attributes: &AttributeSet) -> StoreResult<()>;

    /// Delete an entity.
    async fn delete_entity(&self, id: Uuid) -> StoreResult<()>;

    /// Entities whose named attribute equals the given string value.
    ///
    /// Used by correlation during synchronization link resolution.
    async fn find_by_attribute(&self, name: &str, value: &str)
        -> StoreResult<Vec<RegistryEntity>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_expiry() {
        let now = Utc::now();
        let mut account = Account::new(Uuid::new_v4(), "jdoe", "identity");
        assert!(!account.is_protected(now));

        account.extend_protection(Duration::days(30), now);
        assert!(account.is_protected(now));
        assert!(account.is_protected(now + Duration::days(29)));
        assert!(!account.is_protected(now + Duration::days(31)));
    }

    #[test]
    fn test_indefinite_protection() {
        let now = Utc::now();
        let mut account = Account::new(Uuid::new_v4(), "jdoe", "identity");
        account.protect(now);
        assert!(account.is_protected(now + Duration::days(365 * 10)));
    }

    #[test]
    fn test_repeated_delete_extends_protection() {
        let now = Utc::now();
        let mut account = Account::new(Uuid::new_v4(), "jdoe", "identity");
        account.extend_protection(Duration::days(7), now);
        let first_expiry = account.protected_until.unwrap();

        let later = now + Duration::days(3);
        account.extend_protection(Duration::days(7), later);
        assert!(account.protected_until.unwrap() > first_expiry);
    }
}
