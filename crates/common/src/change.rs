//! Changefeed event types emitted by the backing store.
//!
//! The relay never interprets `data` beyond passing it through to the
//! matching subscribers; only `op` and the target list drive routing.

use crate::key::DocumentKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Merge operation carried by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Replace the document tree wholesale (initial snapshot, page 1).
    Set,
    /// Append new items into matching arrays, deduplicated by id.
    Append,
    /// Replace-by-id in a collection, or shallow-merge root fields.
    Upsert,
    /// Remove by id from a collection, or remove the root entity.
    Remove,
}

/// One document a change applies to, with the optional nested collection
/// location inside that document's tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTarget {
    /// Document function name.
    pub doc: String,
    /// Document instance id (0 for collection documents).
    pub doc_id: i64,
    /// Dotted path to a nested collection, if the change is scoped to one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection: Option<String>,
    /// Ids selecting intermediate array elements along `collection`.
    /// Invariant: one id per intermediate path segment.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_ids: Option<Vec<i64>>,
}

impl ChangeTarget {
    pub fn new(doc: impl Into<String>, doc_id: i64) -> Self {
        Self {
            doc: doc.into(),
            doc_id,
            collection: None,
            parent_ids: None,
        }
    }

    pub fn with_collection(mut self, path: impl Into<String>, parent_ids: Vec<i64>) -> Self {
        self.collection = Some(path.into());
        self.parent_ids = Some(parent_ids);
        self
    }

    /// The subscription key this target routes to.
    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.doc.clone(), self.doc_id)
    }
}

/// A change event from the backing store's feed.
///
/// One event may name several targets (e.g. a root-entity update plus a
/// collection-membership update); the relay delivers once per
/// (connection, target) pair, not once per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreChange {
    pub op: ChangeOp,
    pub targets: Vec<ChangeTarget>,
    pub data: Value,
}

impl StoreChange {
    pub fn new(op: ChangeOp, targets: Vec<ChangeTarget>, data: Value) -> Self {
        Self { op, targets, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_wire_names() {
        assert_eq!(serde_json::to_string(&ChangeOp::Set).unwrap(), "\"set\"");
        assert_eq!(
            serde_json::to_string(&ChangeOp::Upsert).unwrap(),
            "\"upsert\""
        );
    }

    #[test]
    fn test_target_key() {
        let target = ChangeTarget::new("thing", 3).with_collection("packages.allocations", vec![2]);
        assert_eq!(target.key(), DocumentKey::new("thing", 3));
        assert_eq!(target.parent_ids.as_deref(), Some(&[2][..]));
    }

    #[test]
    fn test_change_roundtrip() {
        let change = StoreChange::new(
            ChangeOp::Upsert,
            vec![ChangeTarget::new("thing", 1).with_collection("items", vec![])],
            json!({"id": 5, "title": "x"}),
        );
        let text = serde_json::to_string(&change).unwrap();
        let back: StoreChange = serde_json::from_str(&text).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_target_optional_fields_omitted() {
        let text = serde_json::to_string(&ChangeTarget::new("posts", 0)).unwrap();
        assert!(!text.contains("collection"));
        assert!(!text.contains("parent_ids"));
    }
}
