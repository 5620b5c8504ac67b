//! The connector capability trait.

use async_trait::async_trait;

use crate::error::ConnectorResult;
use crate::operation::{AttributeSet, ResolvedAttributes, Uid};
use crate::types::SyncPage;

/// Capability a connected system exposes to the provisioning core.
///
/// The core treats this as opaque: it does not know whether the other side
/// is LDAP, a database, or a REST API. All identifying state (bind
/// credentials, base DNs, endpoints) lives inside the implementation.
///
/// Attribute payloads arrive as [`ResolvedAttributes`] with guarded values
/// already separated; implementations must not log the secret set.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable name for this connector instance, used in logs.
    fn display_name(&self) -> &str;

    /// Lightweight reachability check.
    ///
    /// Called at the start of a synchronization run; a failure here marks
    /// the whole run failed before any item is processed.
    async fn test_connection(&self) -> ConnectorResult<()>;

    /// Create a new object and return its identifier on the target system.
    async fn create(
        &self,
        object_class: &str,
        attributes: &ResolvedAttributes,
    ) -> ConnectorResult<Uid>;

    /// Update an existing object. Returns the (possibly renamed) identifier.
    async fn update(
        &self,
        object_class: &str,
        uid: &Uid,
        attributes: &ResolvedAttributes,
    ) -> ConnectorResult<Uid>;

    /// Delete an object from the target system.
    async fn delete(&self, object_class: &str, uid: &Uid) -> ConnectorResult<()>;

    /// Set a password. The secret travels in the guarded attribute set.
    async fn set_password(
        &self,
        object_class: &str,
        uid: &Uid,
        attributes: &ResolvedAttributes,
    ) -> ConnectorResult<()> {
        // Default: password change is an attribute update.
        self.update(object_class, uid, attributes).await.map(|_| ())
    }

    /// Read a single object, or None if it does not exist.
    async fn read(&self, object_class: &str, uid: &Uid) -> ConnectorResult<Option<AttributeSet>>;

    /// Fetch changes since the last sync token.
    ///
    /// With `last_token = None` the connector performs an initial scan,
    /// returning all current objects as create entries.
    async fn sync(
        &self,
        object_class: &str,
        last_token: Option<&str>,
        batch_size: u32,
    ) -> ConnectorResult<SyncPage>;

    /// List all identifiers currently present on the target system.
    ///
    /// Used by deletion-detection passes: a registry account whose uid is
    /// not in this list has disappeared from the remote side.
    async fn list_uids(&self, object_class: &str) -> ConnectorResult<Vec<Uid>>;
}
