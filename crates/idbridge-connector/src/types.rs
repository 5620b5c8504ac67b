//! Shared operation and synchronization types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::{AttributeSet, Uid};

/// Type of a provisioning operation against a target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a new object.
    Create,
    /// Update attributes of an existing object.
    Update,
    /// Delete an object.
    Delete,
    /// Set or change a password (guarded attributes only).
    Password,
}

impl OperationType {
    /// String form used in persisted state and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Password => "password",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "password" => Ok(OperationType::Password),
            _ => Err(format!("unknown operation type: {s}")),
        }
    }
}

/// Type of change reported by a connector during synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDeltaType {
    /// A new object appeared on the target system.
    Create,
    /// An existing object changed.
    Update,
    /// An object disappeared from the target system.
    Delete,
    /// No delta information; the record was seen during a full scan.
    None,
}

impl std::fmt::Display for SyncDeltaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDeltaType::Create => f.write_str("create"),
            SyncDeltaType::Update => f.write_str("update"),
            SyncDeltaType::Delete => f.write_str("delete"),
            SyncDeltaType::None => f.write_str("none"),
        }
    }
}

/// A single change reported by a connector sync scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    /// Identifier of the changed object on the target system.
    pub uid: Uid,
    /// Object class of the changed object.
    pub object_class: String,
    /// Type of change.
    pub delta_type: SyncDeltaType,
    /// Current attributes (absent for deletes).
    pub attributes: Option<AttributeSet>,
    /// Timestamp of the change, when the source system provides one.
    pub timestamp: Option<DateTime<Utc>>,
}

impl SyncEntry {
    /// Entry for a created object.
    pub fn created(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            object_class: object_class.into(),
            delta_type: SyncDeltaType::Create,
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// Entry for an updated object.
    pub fn updated(uid: Uid, object_class: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            uid,
            object_class: object_class.into(),
            delta_type: SyncDeltaType::Update,
            attributes: Some(attributes),
            timestamp: None,
        }
    }

    /// Entry for a deleted object.
    pub fn deleted(uid: Uid, object_class: impl Into<String>) -> Self {
        Self {
            uid,
            object_class: object_class.into(),
            delta_type: SyncDeltaType::Delete,
            attributes: None,
            timestamp: None,
        }
    }
}

/// One page of changes returned by [`crate::Connector::sync`].
///
/// The token is opaque to the core: an LDAP sync cookie, a change-table
/// sequence number, a timestamp, whatever the connector needs to resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPage {
    /// The changes in this page.
    pub entries: Vec<SyncEntry>,
    /// Token to pass to the next sync call. None when unchanged.
    pub next_token: Option<String>,
    /// Whether more changes are available right now.
    pub has_more: bool,
}

impl SyncPage {
    /// A page with no changes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A page with the given changes.
    pub fn with_entries(entries: Vec<SyncEntry>) -> Self {
        Self {
            entries,
            next_token: None,
            has_more: false,
        }
    }

    /// Set the resume token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }

    /// Indicate that more changes are available.
    #[must_use]
    pub fn with_more(mut self) -> Self {
        self.has_more = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_roundtrip() {
        for op in [
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete,
            OperationType::Password,
        ] {
            let parsed: OperationType = op.as_str().parse().unwrap();
            assert_eq!(op, parsed);
        }
    }

    #[test]
    fn test_sync_entry_constructors() {
        let entry = SyncEntry::deleted(Uid::from_value("u1"), "account");
        assert_eq!(entry.delta_type, SyncDeltaType::Delete);
        assert!(entry.attributes.is_none());

        let entry = SyncEntry::created(
            Uid::from_value("u2"),
            "account",
            AttributeSet::new().with("cn", "Jane"),
        );
        assert_eq!(entry.delta_type, SyncDeltaType::Create);
        assert!(entry.attributes.is_some());
    }

    #[test]
    fn test_sync_page_builder() {
        let page = SyncPage::with_entries(vec![SyncEntry::deleted(Uid::from_value("u1"), "account")])
            .with_token("tok-7")
            .with_more();

        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.next_token.as_deref(), Some("tok-7"));
        assert!(page.has_more);
    }
}
