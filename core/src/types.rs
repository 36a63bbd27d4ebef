//! Payload shapes of the search API.
//!
//! # Design
//! These types are defined independently from the mock-server crate; the
//! integration tests catch schema drift between the two. Everything that is
//! not needed for pagination or facets is kept as `serde_json::Value` so
//! records round-trip untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `links` object of a record or a listing page.
pub type Links = BTreeMap<String, String>;

/// A single hit in a listing, also the shape of a record fetched by URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRecord<M> {
    pub metadata: M,
    #[serde(default)]
    pub links: Links,
    #[serde(default)]
    pub revision: Option<u64>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Total hit count. Newer servers report `{value, relation}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TotalHits {
    Count(u64),
    Bounded { value: u64, relation: Relation },
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Count(n) => *n,
            TotalHits::Bounded { value, .. } => *value,
        }
    }
}

impl Default for TotalHits {
    fn default() -> Self {
        TotalHits::Count(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Eq,
    Gte,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hits<M> {
    #[serde(default = "Vec::new")]
    pub hits: Vec<CollectionRecord<M>>,
    #[serde(default)]
    pub total: TotalHits,
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionPage<M> {
    pub hits: Hits<M>,
    #[serde(default)]
    pub links: Links,
    #[serde(default)]
    pub aggregations: Value,
}

/// Body of the OPTIONS call on a collection endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CollectionHttpOptions {
    #[serde(default)]
    pub facets: Vec<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub filters: Value,
}

/// A facet definition: `label` and `order` plus whatever the server sent.
pub type FacetDefinition = serde_json::Map<String, Value>;

/// Facet definitions keyed by facet code.
pub type FacetDefinitions = BTreeMap<String, FacetDefinition>;

/// Facet values from a listing's `aggregations`, keyed by facet code.
pub type Facets = BTreeMap<String, Value>;

/// A single JSON-Patch operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "replace".to_string(),
            path: path.into(),
            value,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "add".to_string(),
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: "remove".to_string(),
            path: path.into(),
            value: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn total_accepts_plain_number() {
        let hits: Hits<Value> = serde_json::from_value(json!({"hits": [], "total": 35320})).unwrap();
        assert_eq!(hits.total.value(), 35320);
    }

    #[test]
    fn total_accepts_value_relation() {
        let hits: Hits<Value> =
            serde_json::from_value(json!({"hits": [], "total": {"value": 10000, "relation": "gte"}}))
                .unwrap();
        assert_eq!(
            hits.total,
            TotalHits::Bounded {
                value: 10000,
                relation: Relation::Gte
            }
        );
        assert_eq!(hits.total.value(), 10000);
    }

    #[test]
    fn record_tolerates_missing_optional_fields() {
        let record: CollectionRecord<Value> =
            serde_json::from_value(json!({"metadata": {"title": "x"}})).unwrap();
        assert_eq!(record.metadata["title"], "x");
        assert!(record.links.is_empty());
        assert!(record.id.is_none());
    }

    #[test]
    fn patch_remove_skips_value() {
        let op = serde_json::to_value(PatchOperation::remove("/metadata/title")).unwrap();
        assert_eq!(op, json!({"op": "remove", "path": "/metadata/title"}));
    }
}
