//! Canonical identity of a resource.
//!
//! An [`Identity`] is a resource type plus a sorted set of key/value fields.
//! Fields are kept in a `BTreeMap`, so insertion order never matters.
//!
//! Equality and hashing look at the fields only. The resource type is
//! descriptive: two identities with different types and identical fields are
//! equal. Document events are deduplicated on this basis.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Immutable identifier for a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    resource_type: String,
    fields: BTreeMap<String, String>,
}

impl Identity {
    /// Build an identity from a type tag and any collection of field pairs.
    pub fn new<I, K, V>(resource_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            resource_type: resource_type.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Canonical key over the fields, e.g. `"account=7,id=42"`.
    pub fn canonical_key(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fields.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.resource_type, self.canonical_key())
    }
}
