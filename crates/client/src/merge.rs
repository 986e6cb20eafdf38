//! Structural merge of change notifications into document trees.
//!
//! A document tree is an opaque `serde_json::Value`, rooted either at a
//! single named entity field (`{"thing": {...}}`) or directly at a
//! collection array (`{"posts": [...]}`). The merge engine applies one
//! notification at a time, producing the next tree; the owning signal is
//! then overwritten wholesale so reactive dependents observe the change.
//!
//! Path lookups that fail (missing array, missing parent id) abort the
//! operation silently: the event raced a removal that already happened
//! locally, which is expected and must not surface as an error.

use common::{ChangeOp, NotifyFrame};
use serde_json::Value;
use std::collections::HashSet;

/// Client-side state of one subscribed document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentState {
    /// No snapshot has arrived yet.
    Empty,
    /// A live tree.
    Ready(Value),
    /// The root entity was removed; dependents should navigate away
    /// rather than render stale data.
    Removed,
    /// The server pushed an error for this document (e.g. a failed
    /// initial load). Overwritten by the next successful snapshot.
    Failed(String),
}

impl DocumentState {
    pub fn value(&self) -> Option<&Value> {
        match self {
            DocumentState::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DocumentState::Ready(_))
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, DocumentState::Removed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DocumentState::Failed(_))
    }
}

/// Shape descriptor captured from the first `set` snapshot and carried
/// alongside the document signal, so merges never infer shape from the
/// current value.
#[derive(Debug, Clone, PartialEq)]
pub struct DocShape {
    /// Name of the tree's sole root field.
    pub root_key: String,
    /// Whether the root field is itself the collection array.
    pub root_is_collection: bool,
}

impl DocShape {
    /// Derive the shape from a snapshot payload: a single-key object
    /// whose value is either the entity object or the collection array.
    pub fn of(payload: &Value) -> Option<DocShape> {
        let obj = payload.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let (key, value) = obj.iter().next()?;
        Some(DocShape {
            root_key: key.clone(),
            root_is_collection: value.is_array(),
        })
    }
}

enum CollectionEdit<'a> {
    Upsert(&'a Value),
    Remove(&'a Value),
}

/// Apply one change notification to the current document state.
///
/// `shape` is (re)captured on `set` and consulted for every structural
/// merge afterwards.
pub fn merge(
    state: DocumentState,
    shape: &mut Option<DocShape>,
    event: &NotifyFrame,
) -> DocumentState {
    match event.op {
        ChangeOp::Set => {
            *shape = DocShape::of(&event.data);
            DocumentState::Ready(event.data.clone())
        }
        ChangeOp::Append => match state {
            DocumentState::Ready(tree) => {
                DocumentState::Ready(append_merge(tree, shape.as_ref(), &event.data))
            }
            // No tree yet: the first page is the snapshot.
            _ => {
                *shape = DocShape::of(&event.data);
                DocumentState::Ready(event.data.clone())
            }
        },
        ChangeOp::Upsert => match event.collection.as_deref() {
            None => upsert_root(state, shape.as_ref(), &event.data),
            Some(path) => edit_collection(
                state,
                shape.as_ref(),
                path,
                event.parent_ids.as_deref().unwrap_or(&[]),
                CollectionEdit::Upsert(&event.data),
            ),
        },
        ChangeOp::Remove => match event.collection.as_deref() {
            None => DocumentState::Removed,
            Some(path) => edit_collection(
                state,
                shape.as_ref(),
                path,
                event.parent_ids.as_deref().unwrap_or(&[]),
                CollectionEdit::Remove(&event.data),
            ),
        },
    }
}

/// Append-merge a page payload: for every array field present in both
/// containers, push only the items whose id is not already there.
/// Existing items are never replaced or removed.
fn append_merge(mut tree: Value, shape: Option<&DocShape>, payload: &Value) -> Value {
    // A bare-array payload targets the collection root directly.
    if let Some(items) = payload.as_array() {
        if let Some(shape) = shape {
            if shape.root_is_collection {
                if let Some(target) = tree.get_mut(&shape.root_key).and_then(Value::as_array_mut) {
                    append_dedup(target, items);
                }
            }
        }
        return tree;
    }

    match shape {
        Some(s) if !s.root_is_collection => {
            if let (Some(existing), Some(incoming)) =
                (tree.get_mut(&s.root_key), payload.get(&s.root_key))
            {
                merge_array_fields(existing, incoming);
            }
        }
        _ => merge_array_fields(&mut tree, payload),
    }
    tree
}

fn merge_array_fields(existing: &mut Value, incoming: &Value) {
    let (Some(existing), Some(incoming)) = (existing.as_object_mut(), incoming.as_object()) else {
        return;
    };
    for (field, value) in incoming {
        let Some(items) = value.as_array() else {
            continue;
        };
        if let Some(target) = existing.get_mut(field).and_then(Value::as_array_mut) {
            append_dedup(target, items);
        }
    }
}

fn append_dedup(target: &mut Vec<Value>, incoming: &[Value]) {
    let mut seen: HashSet<i64> = target.iter().filter_map(item_id).collect();
    for item in incoming {
        match item_id(item) {
            Some(id) => {
                if seen.insert(id) {
                    target.push(item.clone());
                }
            }
            // Items without an id cannot be deduplicated; append as-is.
            None => target.push(item.clone()),
        }
    }
}

/// Shallow-merge payload fields onto the root entity object. Arrays
/// present in the payload replace wholesale; nested-array changes are
/// routed through a collection path instead.
fn upsert_root(state: DocumentState, shape: Option<&DocShape>, payload: &Value) -> DocumentState {
    let DocumentState::Ready(mut tree) = state else {
        return state;
    };
    let Some(fields) = payload.as_object() else {
        return DocumentState::Ready(tree);
    };

    let target = match shape {
        Some(s) if !s.root_is_collection => {
            tree.get_mut(&s.root_key).and_then(Value::as_object_mut)
        }
        _ => tree.as_object_mut(),
    };
    if let Some(target) = target {
        for (field, value) in fields {
            target.insert(field.clone(), value.clone());
        }
    }

    DocumentState::Ready(tree)
}

/// Upsert into or remove from a nested collection located by a dotted
/// path plus parent ids.
fn edit_collection(
    state: DocumentState,
    shape: Option<&DocShape>,
    path: &str,
    parent_ids: &[i64],
    edit: CollectionEdit<'_>,
) -> DocumentState {
    let DocumentState::Ready(mut tree) = state else {
        return state;
    };
    apply_collection_edit(&mut tree, shape, path, parent_ids, edit);
    DocumentState::Ready(tree)
}

fn apply_collection_edit(
    tree: &mut Value,
    shape: Option<&DocShape>,
    path: &str,
    parent_ids: &[i64],
    edit: CollectionEdit<'_>,
) -> Option<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (first, rest) = segments.split_first()?;

    // When the first segment names the root key itself, traversal starts
    // at the document root (collection documents); otherwise it starts
    // inside the root entity.
    let mut container: &mut Value = match shape {
        Some(s) if *first != s.root_key => tree.get_mut(&s.root_key)?,
        _ => tree,
    };

    let mut segment = *first;
    for (i, next) in rest.iter().enumerate() {
        let items = container.get_mut(segment)?.as_array_mut()?;
        let parent = *parent_ids.get(i)?;
        container = items.iter_mut().find(|item| item_id(item) == Some(parent))?;
        segment = *next;
    }

    let items = container.get_mut(segment)?.as_array_mut()?;
    match edit {
        CollectionEdit::Upsert(data) => {
            let position = item_id(data)
                .and_then(|id| items.iter().position(|item| item_id(item) == Some(id)));
            match position {
                Some(index) => items[index] = data.clone(),
                None => items.push(data.clone()),
            }
        }
        CollectionEdit::Remove(data) => {
            if let Some(id) = item_id(data) {
                items.retain(|item| item_id(item) != Some(id));
            }
        }
    }
    Some(())
}

fn item_id(item: &Value) -> Option<i64> {
    item.get("id").and_then(Value::as_i64)
}
