// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Copy-on-write working copy of a document.

use std::sync::Arc;

use serde_json::Value;

use crate::path::{get_at, is_root_path, remove_at, set_at};

/// A working copy of a committed snapshot.
///
/// Reads go to the snapshot until the first write, which clones it once.
/// [`Draft::finalize`] hands back an immutable snapshot; no mutable alias
/// outlives the draft.
#[derive(Clone, Debug)]
pub struct Draft {
    base: Arc<Value>,
    working: Option<Value>,
    writes: Vec<String>,
    replaced: bool,
    untracked: bool,
}

/// Write provenance collected by a [`Draft`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DraftChanges {
    /// Concrete paths written, in order.
    pub writes: Vec<String>,
    /// The whole value was replaced.
    pub replaced: bool,
    /// A closure mutated the value without reporting paths.
    pub untracked: bool,
}

impl Draft {
    /// Starts a draft over `base`.
    #[must_use]
    pub fn new(base: Arc<Value>) -> Self {
        Self {
            base,
            working: None,
            writes: Vec::new(),
            replaced: false,
            untracked: false,
        }
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &Value {
        self.working.as_ref().unwrap_or(&self.base)
    }

    /// The snapshot the draft started from.
    #[must_use]
    pub fn base(&self) -> &Arc<Value> {
        &self.base
    }

    /// Reads a concrete path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_at(self.value(), path)
    }

    /// Returns `true` once anything was written.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.working.is_some()
    }

    /// Writes `value` at a concrete path.
    ///
    /// A write whose array index lies past the end of its list is dropped
    /// and not recorded.
    pub fn set(&mut self, path: &str, value: Value) {
        if is_root_path(path) {
            self.replace(value);
            return;
        }
        if set_at(self.working_mut(), path, value) {
            self.writes.push(path.to_owned());
        } else {
            tracing::debug!(path, "write past the end of a list ignored");
        }
    }

    /// Removes the value at a concrete path.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        if is_root_path(path) {
            self.replaced = true;
        } else {
            self.writes.push(path.to_owned());
        }
        remove_at(self.working_mut(), path)
    }

    /// Replaces the whole value.
    pub fn replace(&mut self, value: Value) {
        self.working = Some(value);
        self.replaced = true;
    }

    /// Mutates the value through a closure. The written paths are unknown.
    pub fn update(&mut self, f: impl FnOnce(&mut Value)) {
        f(self.working_mut());
        self.untracked = true;
    }

    /// Takes the write provenance collected so far.
    pub fn take_changes(&mut self) -> DraftChanges {
        DraftChanges {
            writes: core::mem::take(&mut self.writes),
            replaced: core::mem::take(&mut self.replaced),
            untracked: core::mem::take(&mut self.untracked),
        }
    }

    /// Discards every write and returns to the base snapshot.
    pub fn rollback(&mut self) {
        self.working = None;
        self.writes.clear();
        self.replaced = false;
        self.untracked = false;
    }

    /// Produces the immutable result. Unmodified drafts return the base
    /// snapshot itself.
    #[must_use]
    pub fn finalize(self) -> Arc<Value> {
        match self.working {
            Some(value) => Arc::new(value),
            None => self.base,
        }
    }

    fn working_mut(&mut self) -> &mut Value {
        self.working.get_or_insert_with(|| (*self.base).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn copy_on_first_write() {
        let base = Arc::new(json!({ "a": 1 }));
        let draft = Draft::new(base.clone());
        assert!(!draft.is_modified());
        assert!(Arc::ptr_eq(&draft.finalize(), &base));

        let mut draft = Draft::new(base.clone());
        draft.set("b.c", json!(2));
        assert_eq!(draft.get("b.c"), Some(&json!(2)));
        assert_eq!(base.get("b"), None, "base is untouched");
        let changes = draft.take_changes();
        assert_eq!(changes.writes, vec!["b.c".to_owned()]);
        assert!(!changes.replaced);
        assert_eq!(*draft.finalize(), json!({ "a": 1, "b": { "c": 2 } }));
    }

    #[test]
    fn out_of_range_writes_are_not_recorded() {
        let base = Arc::new(json!({ "items": [1] }));
        let mut draft = Draft::new(base);
        draft.set("items.4", json!(5));
        draft.set("items.1", json!(2));
        assert_eq!(draft.get("items"), Some(&json!([1, 2])));
        assert_eq!(draft.take_changes().writes, vec!["items.1".to_owned()]);
    }

    #[test]
    fn provenance_flags() {
        let mut draft = Draft::new(Arc::new(json!({})));
        draft.set("$root", json!({ "x": 1 }));
        draft.update(|v| v["y"] = json!(2));
        let changes = draft.take_changes();
        assert!(changes.replaced);
        assert!(changes.untracked);
        assert_eq!(draft.take_changes(), DraftChanges::default());

        draft.rollback();
        assert_eq!(draft.value(), &json!({}));
    }
}
