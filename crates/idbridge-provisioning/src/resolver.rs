//! Attribute resolution seam.
//!
//! How entitlements map to attribute values is not this crate's concern;
//! the executor only needs an ordered, deduplicated attribute list for the
//! account it is about to provision. Embedders supply an
//! [`AttributeResolver`]; [`merge_attribute_lists`] implements the default
//! combination of mapping defaults with role-level overloads.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use idbridge_connector::{AttributeValue, ResolvedAttributes};

use crate::account::{Account, RegistryEntity};

/// Error during attribute resolution.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// No attribute mapping exists for the system/entity-type pair.
    #[error("no mapping for system {system_id} and entity type '{entity_type}'")]
    NoMapping {
        /// The system without a mapping.
        system_id: Uuid,
        /// The entity type without a mapping.
        entity_type: String,
    },

    /// A mapped value could not be produced.
    #[error("failed to resolve attribute '{attribute}': {message}")]
    ValueResolution {
        /// The attribute that failed.
        attribute: String,
        /// Why it failed.
        message: String,
    },
}

/// Result type for resolver operations.
pub type ResolverResult<T> = Result<T, ResolverError>;

/// How an overloading value combines with the default for the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The overload replaces the default value.
    Override,
    /// The overload merges with the default, deduplicating multi-values.
    Merge,
}

/// One attribute produced by resolution, ordered as the mapping orders it.
#[derive(Debug, Clone)]
pub struct MappedAttribute {
    /// Target attribute name.
    pub name: String,
    /// Resolved value.
    pub value: AttributeValue,
    /// Guarded values are routed to the secret set and never logged.
    pub guarded: bool,
    /// How an overload of this attribute combines with the default.
    pub merge: MergeStrategy,
}

impl MappedAttribute {
    /// A plain attribute with override semantics.
    pub fn plain(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            guarded: false,
            merge: MergeStrategy::Override,
        }
    }

    /// A guarded attribute (password, token).
    pub fn guarded(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            guarded: true,
            merge: MergeStrategy::Override,
        }
    }

    /// Use merge semantics when overloaded.
    #[must_use]
    pub fn merged(mut self) -> Self {
        self.merge = MergeStrategy::Merge;
        self
    }
}

/// Produces the attribute payload for provisioning an account.
#[async_trait]
pub trait AttributeResolver: Send + Sync {
    /// Resolve the full attribute list for the given account and its entity.
    async fn resolve(
        &self,
        account: &Account,
        entity: &RegistryEntity,
    ) -> ResolverResult<Vec<MappedAttribute>>;
}

/// Combine mapping defaults with role-level overloads.
///
/// Output order follows the defaults, with overloads that introduce new
/// names appended in their own order. An overload of an existing name
/// either replaces the default or merges with it per the overload's
/// strategy. Duplicate names inside either list collapse the same way.
pub fn merge_attribute_lists(
    defaults: Vec<MappedAttribute>,
    overloads: Vec<MappedAttribute>,
) -> Vec<MappedAttribute> {
    let mut merged: Vec<MappedAttribute> = Vec::with_capacity(defaults.len() + overloads.len());
    for attr in defaults.into_iter().chain(overloads) {
        match merged.iter_mut().find(|m| m.name == attr.name) {
            None => merged.push(attr),
            Some(existing) => match attr.merge {
                MergeStrategy::Override => {
                    existing.value = attr.value;
                    existing.guarded = attr.guarded;
                }
                MergeStrategy::Merge => {
                    let prior = std::mem::replace(&mut existing.value, AttributeValue::Null);
                    existing.value = prior.merge(attr.value);
                }
            },
        }
    }
    merged
}

/// Split a resolved list into plain and guarded attribute sets.
pub fn to_resolved(attributes: Vec<MappedAttribute>) -> ResolvedAttributes {
    let mut resolved = ResolvedAttributes::default();
    for attr in attributes {
        if attr.guarded {
            resolved.secrets.set(attr.name, attr.value);
        } else {
            resolved.attributes.set(attr.name, attr.value);
        }
    }
    resolved
}

/// Resolver that provisions entity attributes one-to-one.
///
/// Useful for tests and for systems whose schema mirrors the registry.
pub struct DirectResolver;

#[async_trait]
impl AttributeResolver for DirectResolver {
    async fn resolve(
        &self,
        _account: &Account,
        entity: &RegistryEntity,
    ) -> ResolverResult<Vec<MappedAttribute>> {
        Ok(entity
            .attributes
            .iter()
            .map(|(name, value)| MappedAttribute::plain(name.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_replaces_default() {
        let merged = merge_attribute_lists(
            vec![
                MappedAttribute::plain("cn", "John Doe"),
                MappedAttribute::plain("mail", "jdoe@example.com"),
            ],
            vec![MappedAttribute::plain("mail", "john@corp.example.com")],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "cn");
        assert_eq!(
            merged[1].value.as_string(),
            Some("john@corp.example.com")
        );
    }

    #[test]
    fn test_merge_strategy_dedups_multivalue() {
        let merged = merge_attribute_lists(
            vec![MappedAttribute::plain(
                "groups",
                AttributeValue::Array(vec!["users".into(), "staff".into()]),
            )],
            vec![MappedAttribute::plain(
                "groups",
                AttributeValue::Array(vec!["staff".into(), "admins".into()]),
            )
            .merged()],
        );

        assert_eq!(merged.len(), 1);
        let values = merged[0].value.as_strings();
        assert_eq!(values, vec!["users", "staff", "admins"]);
    }

    #[test]
    fn test_order_follows_defaults_then_overloads() {
        let merged = merge_attribute_lists(
            vec![
                MappedAttribute::plain("a", "1"),
                MappedAttribute::plain("b", "2"),
            ],
            vec![
                MappedAttribute::plain("c", "3"),
                MappedAttribute::plain("a", "9"),
            ],
        );

        let names: Vec<&str> = merged.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(merged[0].value.as_string(), Some("9"));
    }

    #[test]
    fn test_guarded_routed_to_secrets() {
        let resolved = to_resolved(vec![
            MappedAttribute::plain("cn", "John"),
            MappedAttribute::guarded("password", "hunter2"),
        ]);

        assert_eq!(resolved.attributes.get_string("cn"), Some("John"));
        assert!(!resolved.attributes.has("password"));
        assert_eq!(resolved.secrets.get_string("password"), Some("hunter2"));
    }
}
