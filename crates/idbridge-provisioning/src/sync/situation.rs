//! Reconciliation situations and their configurable actions.
//!
//! Classification is a pure function of registry state and the reported
//! delta. Dispatch is a static match over the typed action enums; there is
//! no dynamic handler registry to misconfigure.

use serde::{Deserialize, Serialize};

use idbridge_connector::SyncDeltaType;

use crate::account::{Account, RegistryEntity};

/// How a reported object relates to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSituation {
    /// Account exists and is linked to an entity.
    Linked,
    /// Account exists but is linked to no entity.
    Unlinked,
    /// The target system reports an object the registry has no account
    /// for.
    MissingEntity,
    /// A registry account's object is gone from the target system.
    MissingAccount,
}

impl SyncSituation {
    /// String form used in logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSituation::Linked => "linked",
            SyncSituation::Unlinked => "unlinked",
            SyncSituation::MissingEntity => "missing_entity",
            SyncSituation::MissingAccount => "missing_account",
        }
    }
}

impl std::fmt::Display for SyncSituation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncSituation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linked" => Ok(SyncSituation::Linked),
            "unlinked" => Ok(SyncSituation::Unlinked),
            "missing_entity" => Ok(SyncSituation::MissingEntity),
            "missing_account" => Ok(SyncSituation::MissingAccount),
            _ => Err(format!("unknown sync situation: {s}")),
        }
    }
}

/// Action when the account is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkedAction {
    /// Leave both sides alone.
    Ignore,
    /// Copy reported attributes onto the linked entity.
    UpdateEntity,
    /// Re-provision the account from the entity (fix drift on the target).
    UpdateAccount,
}

/// Action when the account exists but has no entity link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlinkedAction {
    /// Leave it alone.
    Ignore,
    /// Correlate to an existing entity and link.
    Link,
    /// Create a new entity from the reported attributes and link.
    CreateEntity,
    /// Remove the account record from the registry.
    Unlink,
}

/// Action when the target reports an object with no registry account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEntityAction {
    /// Leave it alone.
    Ignore,
    /// Create both an entity and a linked account.
    CreateEntityAndAccount,
    /// Track the object with an account record only, no entity.
    CreateAccountOnly,
}

/// Action when a registry account's object is gone from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAccountAction {
    /// Leave the registry record in place.
    Ignore,
    /// Remove the account record (and its links).
    DeleteAccount,
    /// Keep the account but mark it protected.
    SetProtection,
    /// Remove the linked entity along with the account.
    DeleteEntity,
}

/// Classify one reported object against registry state.
///
/// Returns None when there is nothing to reconcile: the target deleted an
/// object the registry never tracked.
pub fn classify(
    account: Option<&Account>,
    linked_entity: Option<&RegistryEntity>,
    delta: SyncDeltaType,
) -> Option<SyncSituation> {
    match (account, delta) {
        (Some(_), SyncDeltaType::Delete) => Some(SyncSituation::MissingAccount),
        (Some(_), _) => {
            if linked_entity.is_some() {
                Some(SyncSituation::Linked)
            } else {
                Some(SyncSituation::Unlinked)
            }
        }
        (None, SyncDeltaType::Delete) => None,
        (None, _) => Some(SyncSituation::MissingEntity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbridge_connector::AttributeSet;
    use uuid::Uuid;

    fn account() -> Account {
        Account::new(Uuid::new_v4(), "jdoe", "identity")
    }

    fn entity() -> RegistryEntity {
        RegistryEntity::new("identity", AttributeSet::new())
    }

    #[test]
    fn test_linked_when_account_and_entity() {
        let acc = account();
        let ent = entity();
        assert_eq!(
            classify(Some(&acc), Some(&ent), SyncDeltaType::Update),
            Some(SyncSituation::Linked)
        );
    }

    #[test]
    fn test_unlinked_when_account_without_entity() {
        let acc = account();
        assert_eq!(
            classify(Some(&acc), None, SyncDeltaType::Create),
            Some(SyncSituation::Unlinked)
        );
    }

    #[test]
    fn test_missing_entity_when_unknown_object() {
        assert_eq!(
            classify(None, None, SyncDeltaType::Create),
            Some(SyncSituation::MissingEntity)
        );
        assert_eq!(
            classify(None, None, SyncDeltaType::None),
            Some(SyncSituation::MissingEntity)
        );
    }

    #[test]
    fn test_missing_account_when_remote_deleted() {
        let acc = account();
        let ent = entity();
        assert_eq!(
            classify(Some(&acc), Some(&ent), SyncDeltaType::Delete),
            Some(SyncSituation::MissingAccount)
        );
    }

    #[test]
    fn test_nothing_to_do_for_untracked_delete() {
        assert_eq!(classify(None, None, SyncDeltaType::Delete), None);
    }
}
