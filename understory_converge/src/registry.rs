// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Field-path registry: stable integer ids for normalized paths.

use serde::{Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;
use understory_dirty::InternId;
use understory_dirty::intern::Interner;

use crate::path::FieldPath;

/// Maximum object depth walked when seeding the registry from a sample state.
const SHAPE_DEPTH_LIMIT: usize = 8;

/// Stable id of a registered field path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(InternId);

impl RootId {
    /// Returns this id as a table index.
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0.as_usize()
    }

    /// Returns the raw numeric id.
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0.as_u32()
    }
}

impl Serialize for RootId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// How a (normalized) changed path maps onto the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The path itself is registered.
    Exact(RootId),
    /// The path is not registered, but this ancestor is (the longest one).
    Ancestor(RootId),
    /// Neither the path nor any ancestor is registered.
    Unknown,
}

/// Maps normalized field paths to stable, dense [`RootId`]s.
///
/// Every registered path also registers all of its ancestors, so the
/// registered set is prefix-closed. The registry is built once and never
/// changes afterwards, which keeps ids stable for the lifetime of the program
/// that owns it.
#[derive(Debug, Clone)]
pub struct FieldPathRegistry {
    paths: Interner<FieldPath>,
    parent: Vec<Option<RootId>>,
    children: Vec<SmallVec<[RootId; 4]>>,
}

impl FieldPathRegistry {
    /// Builds a registry from declared paths (root paths are skipped).
    #[must_use]
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a FieldPath>) -> Self {
        let mut builder = RegistryBuilder::default();
        for path in paths {
            builder.register(path);
        }
        builder.finish()
    }

    /// Returns a builder for incremental registration.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the number of registered paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Returns the id of a registered path.
    #[must_use]
    pub fn id_of(&self, path: &FieldPath) -> Option<RootId> {
        self.paths.lookup(path).map(RootId)
    }

    /// Returns the path for an id.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this registry.
    #[must_use]
    pub fn path(&self, id: RootId) -> &FieldPath {
        self.paths
            .get(id.0)
            .expect("RootId from a different registry")
    }

    /// Resolves a changed path to the id that represents it.
    #[must_use]
    pub fn resolve(&self, path: &FieldPath) -> Resolution {
        if let Some(id) = self.id_of(path) {
            return Resolution::Exact(id);
        }
        let mut cursor = path.parent();
        while let Some(candidate) = cursor {
            if candidate.is_root() {
                break;
            }
            if let Some(id) = self.id_of(&candidate) {
                return Resolution::Ancestor(id);
            }
            cursor = candidate.parent();
        }
        Resolution::Unknown
    }

    /// Returns the registered parent of `id`, if it has one.
    #[must_use]
    pub fn parent(&self, id: RootId) -> Option<RootId> {
        self.parent.get(id.as_usize()).copied().flatten()
    }

    /// Iterates the registered ancestors of `id`, innermost first.
    pub fn ancestors(&self, id: RootId) -> impl Iterator<Item = RootId> + '_ {
        core::iter::successors(self.parent(id), |&p| self.parent(p))
    }

    /// Returns every registered descendant of `id` (excluding `id`).
    #[must_use]
    pub fn descendants(&self, id: RootId) -> Vec<RootId> {
        let mut out = Vec::new();
        let mut stack: Vec<RootId> = self.children(id).to_vec();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend_from_slice(self.children(next));
        }
        out
    }

    /// Returns the ids whose paths overlap `id`: itself, its ancestors and
    /// its descendants.
    #[must_use]
    pub fn overlapping(&self, id: RootId) -> Vec<RootId> {
        let mut out = vec![id];
        out.extend(self.ancestors(id));
        out.extend(self.descendants(id));
        out
    }

    /// Returns `true` if `ancestor` is `id` or one of its ancestors.
    #[must_use]
    pub fn is_prefix(&self, ancestor: RootId, id: RootId) -> bool {
        ancestor == id || self.ancestors(id).any(|a| a == ancestor)
    }

    /// Iterates `(id, path)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (RootId, &FieldPath)> + '_ {
        self.paths.iter().map(|(id, path)| (RootId(id), path))
    }

    fn children(&self, id: RootId) -> &[RootId] {
        self.children
            .get(id.as_usize())
            .map(SmallVec::as_slice)
            .unwrap_or(&[])
    }
}

/// Incremental builder for [`FieldPathRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    paths: Interner<FieldPath>,
}

impl RegistryBuilder {
    /// Registers `path` and all of its ancestors. The root is ignored.
    pub fn register(&mut self, path: &FieldPath) {
        if path.is_root() || self.paths.lookup(path).is_some() {
            return;
        }
        for ancestor in path.ancestors() {
            self.paths.intern(ancestor);
        }
        self.paths.intern(path.clone());
    }

    /// Registers the object-key shape of a sample value.
    ///
    /// Arrays contribute the union of their items' keys (indices are
    /// normalized away).
    pub fn register_shape(&mut self, value: &Value) {
        self.walk_shape(&FieldPath::root(), value, 0);
    }

    fn walk_shape(&mut self, at: &FieldPath, value: &Value, depth: usize) {
        if depth >= SHAPE_DEPTH_LIMIT {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let Ok(segment) = FieldPath::parse(key) else {
                        continue;
                    };
                    if segment.is_root() {
                        continue;
                    }
                    let path = at.join(&segment);
                    self.register(&path);
                    self.walk_shape(&path, child, depth + 1);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk_shape(at, item, depth + 1);
                }
            }
            _ => {}
        }
    }

    /// Finalizes the registry.
    #[must_use]
    pub fn finish(self) -> FieldPathRegistry {
        let len = self.paths.len();
        let mut parent = vec![None; len];
        let mut children: Vec<SmallVec<[RootId; 4]>> = vec![SmallVec::new(); len];
        for (id, path) in self.paths.iter() {
            let Some(parent_path) = path.parent() else {
                continue;
            };
            if parent_path.is_root() {
                continue;
            }
            if let Some(parent_id) = self.paths.lookup(&parent_path) {
                let child = RootId(id);
                let parent_id = RootId(parent_id);
                parent[child.as_usize()] = Some(parent_id);
                children[parent_id.as_usize()].push(child);
            }
        }
        FieldPathRegistry {
            paths: self.paths,
            parent,
            children,
        }
    }
}
