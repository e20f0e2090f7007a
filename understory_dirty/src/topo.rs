// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deterministic topological ordering.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::hash::Hash;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::graph::{CycleError, DirtyGraph};

/// Indicates whether an ordering finished normally or stalled due to a cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TopoCompletion {
    /// All requested keys were yielded.
    Complete,
    /// Ordering stalled: some keys remained with non-zero in-degree (cycle).
    Stalled {
        /// Number of keys that could not be yielded.
        remaining: usize,
    },
}

/// Iterator that yields keys in dependency order.
///
/// Uses Kahn's algorithm restricted to a subset of the graph: a key is
/// yielded only after every dependency that is also in the subset. When
/// several keys are ready at once, the smallest (by `Ord`) comes first, so
/// the order is a pure function of the graph and the subset.
///
/// # Example
///
/// ```
/// use understory_dirty::{DirtyGraph, TopoOrder};
///
/// let mut graph = DirtyGraph::<u32>::new();
/// // 1 <- 3, 2 <- 3
/// graph.add_dependency(3, 1);
/// graph.add_dependency(3, 2);
///
/// let order: Vec<_> = TopoOrder::new(&graph, [3, 2, 1]).collect();
/// assert_eq!(order, vec![1, 2, 3]);
/// ```
#[derive(Debug)]
pub struct TopoOrder<'a, K>
where
    K: Copy + Eq + Hash + Ord,
{
    graph: &'a DirtyGraph<K>,
    /// Keys with zero in-degree, ready to yield (min-heap via `Reverse`).
    ready: BinaryHeap<Reverse<K>>,
    /// Remaining in-degree for each pending key (within the subset).
    in_degree: HashMap<K, usize>,
    stalled: bool,
}

impl<'a, K> TopoOrder<'a, K>
where
    K: Copy + Eq + Hash + Ord,
{
    /// Creates an ordering over `keys` (duplicates are ignored).
    pub fn new(graph: &'a DirtyGraph<K>, keys: impl IntoIterator<Item = K>) -> Self {
        let mut in_degree: HashMap<K, usize> = HashMap::new();
        let mut unique_keys = Vec::new();
        for key in keys {
            if let Entry::Vacant(e) = in_degree.entry(key) {
                e.insert(0);
                unique_keys.push(key);
            }
        }

        for &key in &unique_keys {
            let count = graph
                .dependencies(key)
                .filter(|dep| in_degree.contains_key(dep))
                .count();
            if let Some(deg) = in_degree.get_mut(&key) {
                *deg = count;
            }
        }

        let mut ready = BinaryHeap::with_capacity(unique_keys.len());
        for key in unique_keys {
            if in_degree.get(&key).is_some_and(|&deg| deg == 0) {
                ready.push(Reverse(key));
            }
        }

        Self {
            graph,
            ready,
            in_degree,
            stalled: false,
        }
    }

    /// Returns an upper bound on the remaining keys.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.in_degree.len()
    }

    /// Returns whether the ordering completed or stalled due to a cycle.
    ///
    /// This is only meaningful after the iterator has been exhausted.
    #[must_use]
    pub fn completion(&self) -> TopoCompletion {
        if self.stalled {
            TopoCompletion::Stalled {
                remaining: self.remaining(),
            }
        } else {
            TopoCompletion::Complete
        }
    }

    /// Collects all yielded keys and returns completion status.
    #[must_use]
    pub fn collect_with_completion(mut self) -> (Vec<K>, TopoCompletion) {
        let mut out = Vec::with_capacity(self.in_degree.len());
        out.extend(&mut self);
        let completion = self.completion();
        (out, completion)
    }
}

impl<K> Iterator for TopoOrder<'_, K>
where
    K: Copy + Eq + Hash + Ord,
{
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(Reverse(key)) = self.ready.pop() else {
            if !self.in_degree.is_empty() {
                self.stalled = true;
            }
            return None;
        };

        self.in_degree.remove(&key);

        for dependent in self.graph.dependents(key) {
            if let Some(deg) = self.in_degree.get_mut(&dependent) {
                *deg -= 1;
                if *deg == 0 {
                    self.ready.push(Reverse(dependent));
                }
            }
        }

        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.in_degree.len();
        (0, Some(remaining))
    }
}

impl<K> DirtyGraph<K>
where
    K: Copy + Eq + Hash + Ord,
{
    /// Returns every key in dependency order (dependencies first).
    ///
    /// Ties are broken by `Ord`. Fails with the first cycle found when the
    /// graph is not a DAG.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError`] describing one cycle if the graph has any.
    pub fn topological_order(&self) -> Result<Vec<K>, CycleError<K>> {
        let (order, completion) =
            TopoOrder::new(self, self.keys().iter().copied()).collect_with_completion();
        match completion {
            TopoCompletion::Complete => Ok(order),
            TopoCompletion::Stalled { .. } => Err(self.find_cycle().unwrap_or(CycleError {
                path: Vec::new(),
            })),
        }
    }
}
