// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dirty set: accumulated dirty keys with a wildcard state.

use alloc::vec::Vec;

/// Accumulated dirty keys.
///
/// A `DirtySet` is either *finite* (an explicit, sorted, duplicate-free list
/// of keys) or *all* (the wildcard: every key must be treated as dirty). Once
/// the wildcard is set, further marks are absorbed.
///
/// # Example
///
/// ```
/// use understory_dirty::DirtySet;
///
/// let mut dirty = DirtySet::<u32>::new();
/// dirty.mark(3);
/// dirty.mark(1);
/// dirty.mark(3);
///
/// assert_eq!(dirty.keys(), &[1, 3]);
/// assert!(dirty.contains(1));
/// assert!(!dirty.contains(2));
///
/// dirty.mark_all();
/// assert!(dirty.is_all());
/// assert!(dirty.contains(2));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtySet<K> {
    keys: Vec<K>,
    all: bool,
}

impl<K> Default for DirtySet<K>
where
    K: Copy + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DirtySet<K>
where
    K: Copy + Ord,
{
    /// Creates an empty, finite dirty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            all: false,
        }
    }

    /// Creates a dirty set that already has the wildcard set.
    #[must_use]
    pub fn all() -> Self {
        Self {
            keys: Vec::new(),
            all: true,
        }
    }

    /// Creates a finite dirty set from `keys`.
    #[must_use]
    pub fn from_keys(keys: impl IntoIterator<Item = K>) -> Self {
        let mut set = Self::new();
        for key in keys {
            set.mark(key);
        }
        set
    }

    /// Marks `key` dirty.
    ///
    /// Returns `true` if the set changed.
    pub fn mark(&mut self, key: K) -> bool {
        if self.all {
            return false;
        }
        match self.keys.binary_search(&key) {
            Ok(_) => false,
            Err(pos) => {
                self.keys.insert(pos, key);
                true
            }
        }
    }

    /// Sets the wildcard: every key is dirty from now on.
    ///
    /// The explicit key list is dropped.
    pub fn mark_all(&mut self) {
        if !self.all {
            self.all = true;
            self.keys.clear();
        }
    }

    /// Keeps only the keys for which `keep` returns `true`.
    ///
    /// Has no effect on a wildcard set.
    pub fn retain(&mut self, mut keep: impl FnMut(K) -> bool) {
        self.keys.retain(|&k| keep(k));
    }

    /// Returns `true` if the wildcard is set.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.all
    }

    /// Returns `true` if `key` is dirty (always `true` for the wildcard).
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.all || self.keys.binary_search(&key).is_ok()
    }

    /// Returns the explicit keys in ascending order.
    ///
    /// Empty for the wildcard.
    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Returns the number of explicit keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if nothing is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all && self.keys.is_empty()
    }

    /// Clears all keys and the wildcard.
    pub fn clear(&mut self) {
        self.all = false;
        self.keys.clear();
    }
}
