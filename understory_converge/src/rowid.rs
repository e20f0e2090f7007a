// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stable row identity for list fields.
//!
//! Per-row state (validation errors, in-flight loads) is keyed by [`RowId`]
//! instead of by index, so that reordering, inserting or removing rows does
//! not move that state onto a different logical row.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::digest::canonical_key;
use crate::path::get_at;

/// Stable identifier of one list row, formatted `<instance>::r<n>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(Arc<str>);

impl RowId {
    /// Returns the id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Read access to row ids, by list path.
pub trait RowLookup {
    /// Returns the id of the row at `index` of `list`.
    fn row_id(&self, list: &str, index: usize) -> Option<&RowId>;

    /// Returns the current index of `id` in `list`.
    fn index_of(&self, list: &str, id: &RowId) -> Option<usize>;
}

#[derive(Clone, Debug, Default)]
struct ListRows {
    track_by: Option<String>,
    ids: Vec<RowId>,
    keys: Vec<String>,
}

/// Owns the row ids of every tracked list of one document instance.
///
/// Ids are allocated from a per-instance counter and never reused.
#[derive(Clone, Debug)]
pub struct RowIdStore {
    instance: String,
    next: u64,
    lists: HashMap<String, ListRows>,
}

impl RowIdStore {
    /// Creates an empty store for `instance`.
    ///
    /// Dots in the instance id are replaced so that a row id is always a
    /// single path segment.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into().replace('.', "_"),
            next: 0,
            lists: HashMap::new(),
        }
    }

    /// Starts tracking the list at concrete path `list`.
    pub fn track(&mut self, list: impl Into<String>, track_by: Option<String>) {
        self.lists.entry(list.into()).or_default().track_by = track_by;
    }

    /// Returns `true` if `list` is tracked.
    #[must_use]
    pub fn is_tracked(&self, list: &str) -> bool {
        self.lists.contains_key(list)
    }

    /// Current ids of `list`, in row order.
    #[must_use]
    pub fn ids(&self, list: &str) -> &[RowId] {
        self.lists.get(list).map(|l| l.ids.as_slice()).unwrap_or(&[])
    }

    /// Reconciles every tracked list against `state`.
    ///
    /// Returns the removed ids with their list path.
    pub fn reconcile_all(&mut self, state: &Value) -> Vec<(String, RowId)> {
        let mut names: Vec<String> = self.lists.keys().cloned().collect();
        names.sort();
        let mut removed = Vec::new();
        for name in names {
            let items = match get_at(state, &name) {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            };
            for id in self.reconcile(&name, items) {
                removed.push((name.clone(), id));
            }
        }
        removed
    }

    /// Reconciles one list against its current items and returns the ids
    /// that no longer belong to any row.
    ///
    /// Rows are matched by identity key first (the `track_by` field, or the
    /// whole item when there is none), in order. In a list without
    /// `track_by`, a row left unmatched reuses the unmatched id previously at
    /// its index, which keeps ids stable for in-place edits. A tracked row
    /// with a new key is a new logical row and always gets a fresh id.
    pub fn reconcile(&mut self, list: &str, items: &[Value]) -> Vec<RowId> {
        let Self {
            instance,
            next,
            lists,
        } = self;
        let rows = lists.entry(list.to_owned()).or_default();
        let keys: Vec<String> = items
            .iter()
            .map(|item| identity_key(item, rows.track_by.as_deref()))
            .collect();
        if keys == rows.keys && rows.ids.len() == items.len() {
            return Vec::new();
        }

        let mut consumed = vec![false; rows.ids.len()];
        let mut assigned: Vec<Option<RowId>> = vec![None; items.len()];
        {
            let mut buckets: HashMap<&str, VecDeque<usize>> = HashMap::new();
            for (index, key) in rows.keys.iter().enumerate() {
                buckets.entry(key.as_str()).or_default().push_back(index);
            }
            for (index, key) in keys.iter().enumerate() {
                if let Some(old) = buckets.get_mut(key.as_str()).and_then(VecDeque::pop_front) {
                    consumed[old] = true;
                    assigned[index] = Some(rows.ids[old].clone());
                }
            }
        }
        if rows.track_by.is_none() {
            for (index, slot) in assigned.iter_mut().enumerate() {
                if slot.is_none() && index < consumed.len() && !consumed[index] {
                    consumed[index] = true;
                    *slot = Some(rows.ids[index].clone());
                }
            }
        }
        let ids: Vec<RowId> = assigned
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    let id = RowId(Arc::from(format!("{instance}::r{next}")));
                    *next += 1;
                    id
                })
            })
            .collect();
        let removed: Vec<RowId> = rows
            .ids
            .iter()
            .zip(&consumed)
            .filter(|(_, used)| !**used)
            .map(|(id, _)| id.clone())
            .collect();
        if !removed.is_empty() {
            tracing::trace!(list, removed = removed.len(), "row ids released");
        }
        rows.ids = ids;
        rows.keys = keys;
        removed
    }
}

impl RowLookup for RowIdStore {
    fn row_id(&self, list: &str, index: usize) -> Option<&RowId> {
        self.lists.get(list)?.ids.get(index)
    }

    fn index_of(&self, list: &str, id: &RowId) -> Option<usize> {
        self.lists.get(list)?.ids.iter().position(|r| r == id)
    }
}

fn identity_key(item: &Value, track_by: Option<&str>) -> String {
    match track_by.and_then(|field| get_at(item, field)) {
        Some(key) if !key.is_null() => canonical_key(key),
        _ => canonical_key(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(store: &RowIdStore) -> Vec<String> {
        store
            .ids("items")
            .iter()
            .map(|id| id.as_str().to_owned())
            .collect()
    }

    #[test]
    fn ids_follow_tracked_keys_across_reorder() {
        let mut store = RowIdStore::new("doc");
        store.track("items", Some("id".to_owned()));
        let removed = store.reconcile("items", &[json!({"id": "a"}), json!({"id": "b"})]);
        assert!(removed.is_empty(), "first sight removes nothing");
        assert_eq!(rows(&store), vec!["doc::r0", "doc::r1"]);

        store.reconcile("items", &[json!({"id": "b"}), json!({"id": "a"})]);
        assert_eq!(rows(&store), vec!["doc::r1", "doc::r0"]);

        let removed = store.reconcile(
            "items",
            &[json!({"id": "c"}), json!({"id": "a"})],
        );
        assert_eq!(rows(&store), vec!["doc::r2", "doc::r0"]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_str(), "doc::r1");
    }

    #[test]
    fn replaced_tracked_row_gets_a_fresh_id() {
        let mut store = RowIdStore::new("doc");
        store.track("items", Some("id".to_owned()));
        store.reconcile("items", &[json!({"id": "a"}), json!({"id": "b"})]);
        let removed = store.reconcile("items", &[json!({"id": "a"}), json!({"id": "c"})]);
        assert_eq!(rows(&store), vec!["doc::r0", "doc::r2"]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].as_str(), "doc::r1", "b is released, not handed to c");
    }

    #[test]
    fn in_place_edits_keep_ids() {
        let mut store = RowIdStore::new("doc");
        store.track("items", None);
        store.reconcile("items", &[json!({"q": 1}), json!({"q": 2})]);
        let removed = store.reconcile("items", &[json!({"q": 1}), json!({"q": 5})]);
        assert!(removed.is_empty(), "edited row keeps its id");
        assert_eq!(rows(&store), vec!["doc::r0", "doc::r1"]);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut store = RowIdStore::new("doc");
        store.track("items", Some("id".to_owned()));
        store.reconcile("items", &[json!({"id": 1})]);
        store.reconcile("items", &[]);
        store.reconcile("items", &[json!({"id": 1})]);
        assert_eq!(rows(&store), vec!["doc::r1"]);
        assert_eq!(
            store.index_of("items", store.row_id("items", 0).unwrap()),
            Some(0)
        );
    }

    #[test]
    fn reconcile_all_reads_lists_from_state() {
        let mut store = RowIdStore::new("a.b");
        store.track("items", None);
        let state = json!({ "items": [1, 2, 3] });
        assert!(store.reconcile_all(&state).is_empty());
        assert_eq!(store.ids("items").len(), 3);
        assert!(store.ids("items")[0].as_str().starts_with("a_b::"));
        let removed = store.reconcile_all(&json!({}));
        assert_eq!(removed.len(), 3);
    }
}
