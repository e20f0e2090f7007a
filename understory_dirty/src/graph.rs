// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dependency graph for dirty tracking.

use alloc::vec::Vec;
use core::fmt;
use core::hash::Hash;

use hashbrown::HashMap;
use hashbrown::HashSet;

use crate::scratch::TraversalScratch;

/// Error describing a dependency cycle.
///
/// `path` starts and ends with the same key, e.g. `[a, b, a]` for
/// "a depends on b, b depends on a".
#[derive(Clone, PartialEq, Eq)]
pub struct CycleError<K> {
    /// The keys on the cycle, in dependency order, closing on the first key.
    pub path: Vec<K>,
}

impl<K: fmt::Debug> fmt::Debug for CycleError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CycleError {{ path: {:?} }}", self.path)
    }
}

impl<K: fmt::Debug> fmt::Display for CycleError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dependency cycle: ")?;
        for (i, key) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{key:?}")?;
        }
        Ok(())
    }
}

impl<K: fmt::Debug> core::error::Error for CycleError<K> {}

/// Dependency graph: "A depends on B" edges.
///
/// `DirtyGraph` stores bidirectional dependency edges, allowing cheap queries
/// for both "what does A depend on?" and "what depends on A?". Keys are kept
/// in insertion order so that every traversal that has to pick between
/// equivalent candidates does so deterministically.
///
/// Edges are accepted as-is; call [`find_cycle`](Self::find_cycle) (or
/// [`topological_order`](Self::topological_order)) once the graph is complete
/// to reject cyclic inputs with a readable path.
///
/// # Example
///
/// ```
/// use understory_dirty::DirtyGraph;
///
/// let mut graph = DirtyGraph::<u32>::new();
///
/// // Node 2 depends on node 1, node 3 depends on node 2.
/// graph.add_dependency(2, 1);
/// graph.add_dependency(3, 2);
///
/// assert!(graph.dependencies(2).any(|k| k == 1));
/// assert!(graph.dependents(1).any(|k| k == 2));
///
/// // Reverse closure of node 1: itself plus everything downstream.
/// let mut closure = graph.reverse_closure([1]);
/// closure.sort();
/// assert_eq!(closure, vec![1, 2, 3]);
/// ```
///
/// # See Also
///
/// - [`topological_order`](Self::topological_order): Deterministic dependency order.
/// - [`DirtySet`](crate::DirtySet): Accumulated dirty keys.
#[derive(Debug, Clone)]
pub struct DirtyGraph<K>
where
    K: Copy + Eq + Hash,
{
    /// Keys in insertion order.
    order: Vec<K>,
    /// Forward edges: key -> keys that `key` depends on.
    forward: HashMap<K, Vec<K>>,
    /// Reverse edges: key -> keys that depend on `key`.
    reverse: HashMap<K, Vec<K>>,
}

impl<K> Default for DirtyGraph<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DirtyGraph<K>
where
    K: Copy + Eq + Hash,
{
    /// Creates a new empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Returns the number of keys in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if the graph has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns `true` if `key` was added as a node or as an edge endpoint.
    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.forward.contains_key(&key)
    }

    /// Adds `key` as a node without edges.
    ///
    /// Returns `true` if the key was not yet present.
    pub fn add_node(&mut self, key: K) -> bool {
        if self.forward.contains_key(&key) {
            return false;
        }
        self.order.push(key);
        self.forward.insert(key, Vec::new());
        self.reverse.insert(key, Vec::new());
        true
    }

    /// Adds a dependency: `from` depends on `to`.
    ///
    /// When `to` changes, `from` should be recomputed. Both endpoints are
    /// added as nodes if needed. Self-edges are stored; they surface as a
    /// one-key cycle from [`find_cycle`](Self::find_cycle).
    ///
    /// Returns `true` if the edge was newly added.
    pub fn add_dependency(&mut self, from: K, to: K) -> bool {
        self.add_node(from);
        self.add_node(to);

        let deps = self.forward.entry(from).or_default();
        if deps.contains(&to) {
            return false;
        }
        deps.push(to);
        self.reverse.entry(to).or_default().push(from);
        true
    }

    /// Returns an iterator over the direct dependencies of `key`.
    ///
    /// These are yielded in the order the edges were added.
    pub fn dependencies(&self, key: K) -> impl Iterator<Item = K> + '_ {
        self.forward
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Returns an iterator over the direct dependents of `key`.
    ///
    /// These are yielded in the order the edges were added.
    pub fn dependents(&self, key: K) -> impl Iterator<Item = K> + '_ {
        self.reverse
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Returns all keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.order
    }

    /// Returns the reverse closure of `roots`: the roots themselves plus every
    /// key that transitively depends on one of them.
    ///
    /// Keys that are not in the graph are still returned (they have no
    /// dependents). The result is in discovery order.
    #[must_use]
    pub fn reverse_closure(&self, roots: impl IntoIterator<Item = K>) -> Vec<K> {
        let mut scratch = TraversalScratch::new();
        let mut out = Vec::new();
        self.for_each_in_reverse_closure(roots, &mut scratch, |key| out.push(key));
        out
    }

    /// Calls `f` for each key in the reverse closure of `roots`, using
    /// reusable scratch buffers.
    ///
    /// Each key is visited at most once.
    ///
    /// # See Also
    ///
    /// - [`TraversalScratch`]: Reusable storage for this traversal.
    pub fn for_each_in_reverse_closure(
        &self,
        roots: impl IntoIterator<Item = K>,
        scratch: &mut TraversalScratch<K>,
        mut f: impl FnMut(K),
    ) {
        scratch.reset();
        for root in roots {
            if scratch.visited.insert(root) {
                f(root);
                scratch.stack.push(root);
            }
        }

        while let Some(next) = scratch.stack.pop() {
            for dependent in self.dependents(next) {
                if scratch.visited.insert(dependent) {
                    f(dependent);
                    scratch.stack.push(dependent);
                }
            }
        }
    }

    /// Returns the first dependency cycle, if any.
    ///
    /// The search walks keys in insertion order and follows dependency edges
    /// in insertion order, so the reported cycle is stable for a given
    /// sequence of `add_*` calls.
    #[must_use]
    pub fn find_cycle(&self) -> Option<CycleError<K>> {
        // 1 = on the current DFS path, 2 = fully explored.
        let mut state: HashMap<K, u8> = HashMap::with_capacity(self.order.len());
        let mut path: Vec<K> = Vec::new();
        let mut frames: Vec<(K, usize)> = Vec::new();

        for &start in &self.order {
            if state.contains_key(&start) {
                continue;
            }
            state.insert(start, 1);
            path.push(start);
            frames.push((start, 0));

            while let Some(frame) = frames.last_mut() {
                let (key, next_edge) = *frame;
                let deps = self.forward.get(&key).map(Vec::as_slice).unwrap_or(&[]);
                if next_edge >= deps.len() {
                    state.insert(key, 2);
                    path.pop();
                    frames.pop();
                    continue;
                }
                frame.1 += 1;

                let dep = deps[next_edge];
                match state.get(&dep) {
                    Some(1) => {
                        let begin = path.iter().position(|&k| k == dep).unwrap_or(0);
                        let mut cycle: Vec<K> = path[begin..].to_vec();
                        cycle.push(dep);
                        return Some(CycleError { path: cycle });
                    }
                    Some(_) => {}
                    None => {
                        state.insert(dep, 1);
                        path.push(dep);
                        frames.push((dep, 0));
                    }
                }
            }
        }
        None
    }

    /// Returns `true` if `key` transitively depends on itself.
    #[must_use]
    pub fn is_on_cycle(&self, key: K) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<K> = self.dependencies(key).collect();
        while let Some(current) = stack.pop() {
            if current == key {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.dependencies(current));
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::format;
    use alloc::vec;

    #[test]
    fn add_and_query_dependencies() {
        let mut graph = DirtyGraph::<u32>::new();

        assert!(graph.add_dependency(2, 1), "new edge");
        assert!(!graph.add_dependency(2, 1), "duplicate edge is ignored");
        graph.add_dependency(3, 2);

        assert!(graph.dependencies(2).any(|k| k == 1));
        assert!(graph.dependents(1).any(|k| k == 2));
        assert!(graph.dependents(2).any(|k| k == 3));
        assert_eq!(graph.keys(), &[2, 1, 3]);
    }

    #[test]
    fn reverse_closure_includes_roots_and_downstream_only() {
        let mut graph = DirtyGraph::<u32>::new();
        // 1 <- 2 <- 3, 4 <- 5
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 2);
        graph.add_dependency(5, 4);

        let mut closure = graph.reverse_closure([2]);
        closure.sort_unstable();
        assert_eq!(closure, vec![2, 3]);

        let mut closure = graph.reverse_closure([1, 4]);
        closure.sort_unstable();
        assert_eq!(closure, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reverse_closure_of_unknown_key_is_itself() {
        let graph = DirtyGraph::<u32>::new();
        assert_eq!(graph.reverse_closure([7]), vec![7]);
    }

    #[test]
    fn find_cycle_reports_closed_path() {
        let mut graph = DirtyGraph::<char>::new();
        graph.add_dependency('a', 'b');
        graph.add_dependency('b', 'a');

        let err = graph.find_cycle().expect("a <-> b is a cycle");
        assert_eq!(err.path, vec!['a', 'b', 'a']);
        assert_eq!(format!("{err}"), "dependency cycle: 'a' -> 'b' -> 'a'");
        assert!(graph.is_on_cycle('a'), "a reaches itself");
    }

    #[test]
    fn find_cycle_reports_self_edge() {
        let mut graph = DirtyGraph::<u32>::new();
        graph.add_dependency(1, 0);
        graph.add_dependency(2, 2);

        let err = graph.find_cycle().expect("self edge is a cycle");
        assert_eq!(err.path, vec![2, 2]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DirtyGraph::<u32>::new();
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 1);
        graph.add_dependency(4, 2);
        graph.add_dependency(4, 3);

        assert!(graph.find_cycle().is_none(), "diamond is acyclic");
        assert!(!graph.is_on_cycle(4), "4 does not reach itself");
    }
}
