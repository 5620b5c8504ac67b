//! Operation payload types: UIDs, attribute sets, and resolved attributes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for an object in a target system.
///
/// Different systems use different identifier schemes: LDAP uses a DN or
/// entryUUID, a database connector uses a primary key, a REST connector a
/// resource id. The identifying attribute name travels with the value so a
/// connector knows which attribute the value belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid {
    attribute_name: String,
    value: String,
}

impl Uid {
    /// Create a new UID with the given attribute name and value.
    pub fn new(attribute_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            value: value.into(),
        }
    }

    /// Create a UID using the default "uid" attribute name.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self::new("uid", value)
    }

    /// Get the attribute name.
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// Get the value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.attribute_name, self.value)
    }
}

/// A value for an attribute, single or multi-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value.
    Null,
    /// A single string value.
    String(String),
    /// A single integer value.
    Integer(i64),
    /// A single boolean value.
    Boolean(bool),
    /// Multiple values.
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Check if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().filter_map(|v| v.as_string()).collect(),
            _ => vec![],
        }
    }

    /// Get as an integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a boolean if this is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Merge another value into this one, deduplicating multi-values.
    pub fn merge(self, other: AttributeValue) -> AttributeValue {
        let mut values = match self {
            AttributeValue::Array(arr) => arr,
            v => vec![v],
        };
        match other {
            AttributeValue::Array(arr) => values.extend(arr),
            v => values.push(v),
        }
        values.retain(|v| !v.is_null());
        let mut deduped: Vec<AttributeValue> = Vec::with_capacity(values.len());
        for v in values {
            if !deduped.contains(&v) {
                deduped.push(v);
            }
        }
        match deduped.len() {
            0 => AttributeValue::Null,
            1 => deduped.into_iter().next().unwrap_or(AttributeValue::Null),
            _ => AttributeValue::Array(deduped),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

/// A set of attributes for create/update operations or read results.
///
/// Iteration order is the insertion-independent attribute-name order, which
/// keeps serialized operation contexts stable for the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    #[serde(flatten)]
    attributes: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Set an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Check if an attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Get the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// Resolved attributes ready to send to a connector.
///
/// Guarded values (passwords, tokens) are kept apart from plain attributes:
/// the plain set is what gets serialized into the operation archive and
/// logged, the secret set is stored separately and never appears in either.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedAttributes {
    /// Plain attributes, safe to persist and log.
    pub attributes: AttributeSet,
    /// Guarded attributes (e.g. password). Persisted separately, never logged.
    pub secrets: AttributeSet,
}

impl ResolvedAttributes {
    /// Create a resolved set with plain attributes only.
    pub fn plain(attributes: AttributeSet) -> Self {
        Self {
            attributes,
            secrets: AttributeSet::new(),
        }
    }

    /// Add a guarded attribute.
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.secrets.set(name, value);
        self
    }

    /// Check whether the set carries any guarded values.
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }
}
