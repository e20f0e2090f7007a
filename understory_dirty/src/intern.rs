// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interning helper for non-`Copy` keys.
//!
//! The graph and set types in this crate are keyed by `K: Copy` so that hot
//! traversals never clone. Embedders with owned keys (field paths, compound
//! names) intern them once into a compact [`InternId`].
//!
//! Ids are handed out densely in first-seen order and are never reused, so an
//! id stays valid for the lifetime of the interner.
//!
//! ## Example
//!
//! ```rust
//! use understory_dirty::{intern::Interner, DirtyGraph, InternId};
//!
//! let mut ids = Interner::<&'static str>::new();
//! let a: InternId = ids.intern("a");
//! let b: InternId = ids.intern("b");
//!
//! let mut graph = DirtyGraph::<InternId>::new();
//! graph.add_dependency(b, a);
//!
//! assert_eq!(graph.topological_order().unwrap(), vec![a, b]);
//! assert_eq!(ids.lookup("b"), Some(b));
//! assert_eq!(ids.get(a), Some(&"a"));
//! ```

use alloc::vec::Vec;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};

use hashbrown::DefaultHashBuilder;
use hashbrown::HashMap;

/// A compact, interned identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct InternId(u32);

impl InternId {
    /// Returns this id as a `usize` index (for tables keyed by intern ids).
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw numeric id.
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Interns owned keys into compact [`InternId`] handles.
///
/// Keys are stored once in an internal table. Lookups use a hash-bucket index
/// (hash -> small list of candidate ids) to avoid storing duplicate key copies.
#[derive(Debug, Clone)]
pub struct Interner<K> {
    keys: Vec<K>,
    buckets: HashMap<u64, Vec<InternId>>,
    build_hasher: DefaultHashBuilder,
}

impl<K> Default for Interner<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Interner<K>
where
    K: Eq + Hash,
{
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            buckets: HashMap::new(),
            build_hasher: DefaultHashBuilder::default(),
        }
    }

    /// Returns the number of interned keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the interner contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the key for an interned id, if the id is in-range.
    #[must_use]
    pub fn get(&self, id: InternId) -> Option<&K> {
        self.keys.get(id.as_usize())
    }

    /// Returns the id of an already interned key without interning it.
    #[must_use]
    pub fn lookup<Q>(&self, key: &Q) -> Option<InternId>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.build_hasher.hash_one(key);
        self.buckets
            .get(&hash)?
            .iter()
            .copied()
            .find(|id| self.keys[id.as_usize()].borrow() == key)
    }

    /// Interns `key` and returns its [`InternId`].
    ///
    /// If an equal key was already interned, this returns the existing id and
    /// drops `key`.
    pub fn intern(&mut self, key: K) -> InternId {
        if let Some(id) = self.lookup(&key) {
            return id;
        }

        let hash = self.build_hasher.hash_one(&key);
        let id = InternId(
            u32::try_from(self.keys.len()).expect("too many interned keys for InternId (u32)"),
        );
        self.keys.push(key);
        self.buckets.entry(hash).or_default().push(id);
        id
    }

    /// Iterates `(id, key)` pairs in id order.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "every stored index fit in u32 when it was interned"
    )]
    pub fn iter(&self) -> impl Iterator<Item = (InternId, &K)> + '_ {
        self.keys
            .iter()
            .enumerate()
            .map(|(index, key)| (InternId(index as u32), key))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::String;
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn interns_duplicates_to_same_id() {
        let mut i = Interner::<String>::new();
        let a0 = i.intern(String::from("a"));
        let a1 = i.intern(String::from("a"));
        let b = i.intern(String::from("b"));

        assert_eq!(a0, a1, "equal keys share an id");
        assert_ne!(a0, b, "distinct keys get distinct ids");
        assert_eq!(i.get(a0).map(String::as_str), Some("a"));
        assert_eq!(i.len(), 2);
    }

    #[test]
    fn lookup_does_not_intern() {
        let mut i = Interner::<String>::new();
        let a = i.intern(String::from("a"));

        assert_eq!(i.lookup("a"), Some(a));
        assert_eq!(i.lookup("missing"), None);
        assert_eq!(i.len(), 1, "lookup must not grow the table");
    }

    #[test]
    fn iter_is_in_first_seen_order() {
        let mut i = Interner::<&'static str>::new();
        i.intern("z");
        i.intern("a");
        i.intern("z");

        let keys: Vec<_> = i.iter().map(|(_, k)| *k).collect();
        assert_eq!(keys, ["z", "a"]);
    }
}
