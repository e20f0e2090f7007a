// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Turning changed paths into dirty roots.

use serde::Serialize;
use understory_dirty::DirtySet;

use crate::digest::Fnv1a;
use crate::draft::DraftChanges;
use crate::path::{FieldPath, is_root_path};
use crate::registry::{FieldPathRegistry, Resolution, RootId};

/// Why a dirty set fell back to "everything".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyAllReason {
    /// A changed path could not be parsed.
    UnknownWrite,
    /// The whole document was replaced.
    RootReplace,
    /// A changed path has no registered prefix.
    UnregisteredPath,
    /// A closure mutated the document without reporting paths.
    CustomMutation,
    /// First convergence of a new document.
    ColdStart,
}

/// The dirty roots of one transaction: a prefix-free set of registry ids, or
/// the `dirtyAll` wildcard with its reason.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyRoots {
    set: DirtySet<RootId>,
    reason: Option<DirtyAllReason>,
}

/// Plain-data summary of a dirty set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtySummary {
    /// Wildcard flag.
    pub dirty_all: bool,
    /// Wildcard reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DirtyAllReason>,
    /// Number of explicit roots.
    pub root_count: usize,
}

impl DirtyRoots {
    /// No dirty roots.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The wildcard.
    #[must_use]
    pub fn all(reason: DirtyAllReason) -> Self {
        Self {
            set: DirtySet::all(),
            reason: Some(reason),
        }
    }

    /// Explicit roots.
    #[must_use]
    pub fn from_roots(registry: &FieldPathRegistry, roots: impl IntoIterator<Item = RootId>) -> Self {
        let mut out = Self::empty();
        for root in roots {
            out.mark_root(registry, root);
        }
        out
    }

    /// Returns `true` for the wildcard.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.set.is_all()
    }

    /// Wildcard reason.
    #[must_use]
    pub fn reason(&self) -> Option<DirtyAllReason> {
        self.reason
    }

    /// Explicit roots, sorted (empty for the wildcard).
    #[must_use]
    pub fn roots(&self) -> &[RootId] {
        self.set.keys()
    }

    /// Returns `true` if nothing is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Switches to the wildcard. The first reason sticks.
    pub fn mark_all(&mut self, reason: DirtyAllReason) {
        self.set.mark_all();
        self.reason.get_or_insert(reason);
    }

    /// Marks a registered id, keeping the set prefix-free.
    pub fn mark_root(&mut self, registry: &FieldPathRegistry, root: RootId) {
        if self.set.is_all() || self.set.contains(root) {
            return;
        }
        if registry.ancestors(root).any(|a| self.set.contains(a)) {
            return;
        }
        self.set.retain(|other| !registry.is_prefix(root, other));
        self.set.mark(root);
    }

    /// Maps one changed concrete path through the registry.
    pub fn mark_path(&mut self, registry: &FieldPathRegistry, path: &str) {
        if self.set.is_all() {
            return;
        }
        if is_root_path(path) {
            self.mark_all(DirtyAllReason::RootReplace);
            return;
        }
        let Ok(normalized) = FieldPath::parse(path) else {
            self.mark_all(DirtyAllReason::UnknownWrite);
            return;
        };
        match registry.resolve(&normalized) {
            Resolution::Exact(id) | Resolution::Ancestor(id) => self.mark_root(registry, id),
            Resolution::Unknown => self.mark_all(DirtyAllReason::UnregisteredPath),
        }
    }

    /// Like [`DirtyRoots::mark_path`], but ignores unregistered paths.
    ///
    /// Used for engine-owned writes (such as the error subtree): no rule can
    /// observe a path without a registered prefix.
    pub fn mark_known_path(&mut self, registry: &FieldPathRegistry, path: &str) {
        if let Ok(normalized) = FieldPath::parse(path) {
            if normalized.is_root() {
                return;
            }
            match registry.resolve(&normalized) {
                Resolution::Exact(id) | Resolution::Ancestor(id) => self.mark_root(registry, id),
                Resolution::Unknown => {}
            }
        }
    }

    /// Folds draft write provenance into the set.
    pub fn absorb(&mut self, registry: &FieldPathRegistry, changes: &DraftChanges) {
        if changes.replaced {
            self.mark_all(DirtyAllReason::RootReplace);
        }
        if changes.untracked {
            self.mark_all(DirtyAllReason::CustomMutation);
        }
        for path in &changes.writes {
            self.mark_path(registry, path);
        }
    }

    /// Merges another dirty set into this one.
    pub fn union(&mut self, registry: &FieldPathRegistry, other: &Self) {
        if let Some(reason) = other.reason {
            self.mark_all(reason);
        }
        for &root in other.roots() {
            self.mark_root(registry, root);
        }
    }

    /// FNV-1a hash of the sorted roots (`0` for the wildcard).
    #[must_use]
    pub fn key_hash(&self) -> u64 {
        if self.is_all() {
            return 0;
        }
        let mut hasher = Fnv1a::new();
        for root in self.roots() {
            hasher.write_u32(root.as_u32());
        }
        hasher.finish()
    }

    /// Plain-data summary.
    #[must_use]
    pub fn summary(&self) -> DirtySummary {
        DirtySummary {
            dirty_all: self.is_all(),
            reason: self.reason,
            root_count: self.roots().len(),
        }
    }
}

/// Maps changed concrete paths to dirty roots.
///
/// Unparseable and unregistered paths, and root-level writes, degrade the
/// whole set to the wildcard.
#[must_use]
pub fn paths_to_dirty_set<S: AsRef<str>>(
    registry: &FieldPathRegistry,
    changed: impl IntoIterator<Item = S>,
) -> DirtyRoots {
    let mut roots = DirtyRoots::empty();
    for path in changed {
        roots.mark_path(registry, path.as_ref());
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FieldPathRegistry {
        let paths: Vec<FieldPath> = ["a", "b", "profile.name", "items.total"]
            .iter()
            .map(|p| FieldPath::parse(p).unwrap())
            .collect();
        FieldPathRegistry::from_paths(&paths)
    }

    fn id(registry: &FieldPathRegistry, path: &str) -> RootId {
        registry.id_of(&FieldPath::parse(path).unwrap()).unwrap()
    }

    #[test]
    fn maps_exact_and_ancestor_paths() {
        let registry = registry();
        let dirty = paths_to_dirty_set(&registry, ["a", "profile.name.first", "items.3.total"]);
        assert!(!dirty.is_all());
        let mut expected = vec![
            id(&registry, "a"),
            id(&registry, "profile.name"),
            id(&registry, "items.total"),
        ];
        expected.sort();
        assert_eq!(dirty.roots(), expected.as_slice());
    }

    #[test]
    fn roots_are_prefix_free() {
        let registry = registry();
        let dirty = paths_to_dirty_set(&registry, ["profile.name", "profile"]);
        assert_eq!(dirty.roots(), &[id(&registry, "profile")]);
        let dirty = paths_to_dirty_set(&registry, ["profile", "profile.name"]);
        assert_eq!(dirty.roots(), &[id(&registry, "profile")]);
    }

    #[test]
    fn unknown_and_root_paths_degrade() {
        let registry = registry();
        let dirty = paths_to_dirty_set(&registry, ["a", "nope"]);
        assert!(dirty.is_all());
        assert_eq!(dirty.reason(), Some(DirtyAllReason::UnregisteredPath));
        let dirty = paths_to_dirty_set(&registry, ["$root"]);
        assert_eq!(dirty.reason(), Some(DirtyAllReason::RootReplace));
        assert_eq!(dirty.summary().root_count, 0);
    }

    #[test]
    fn known_paths_ignore_unregistered_writes() {
        let registry = registry();
        let mut dirty = DirtyRoots::empty();
        dirty.mark_known_path(&registry, "errors.a");
        assert!(dirty.is_empty());
        dirty.mark_known_path(&registry, "b");
        assert_eq!(dirty.roots(), &[id(&registry, "b")]);
        assert_ne!(dirty.key_hash(), DirtyRoots::empty().key_hash());
    }
}
