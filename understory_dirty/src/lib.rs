// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Dirty: dependency-graph and dirty-set primitives.
//!
//! This crate provides the graph-level building blocks for incremental
//! evaluation, where a change to upstream data must reach every downstream
//! consumer and nothing else:
//!
//! - **Dependency graphs** ([`DirtyGraph`]): "A depends on B" edges with
//!   bidirectional traversal, reverse closures, and cycle detection that
//!   reports the offending path ([`CycleError`]).
//! - **Topological order** ([`TopoOrder`]): Kahn's algorithm with `Ord`
//!   tie-breaking, over the whole graph or any subset of it.
//! - **Dirty sets** ([`DirtySet`]): sorted dirty keys with a wildcard state
//!   for "everything changed".
//! - **Interning** ([`intern::Interner`]): compact ids for owned keys.
//! - **Scratch buffers** ([`TraversalScratch`]): reusable traversal state.
//!
//! ## Quick Start
//!
//! ```rust
//! use understory_dirty::{DirtyGraph, DirtySet, TopoOrder};
//!
//! let mut graph = DirtyGraph::<u32>::new();
//!
//! // 3 depends on 2, 2 depends on 1, 4 is unrelated.
//! graph.add_dependency(2, 1);
//! graph.add_dependency(3, 2);
//! graph.add_node(4);
//! assert!(graph.find_cycle().is_none());
//!
//! let mut dirty = DirtySet::new();
//! dirty.mark(1);
//!
//! // Everything downstream of the dirty keys, in dependency order.
//! let affected = graph.reverse_closure(dirty.keys().iter().copied());
//! let order: Vec<_> = TopoOrder::new(&graph, affected).collect();
//! assert_eq!(order, vec![1, 2, 3]);
//! ```
//!
//! ## `no_std` Support
//!
//! This crate is `no_std` and uses `alloc`. It does not depend on `std`.

#![no_std]

extern crate alloc;

mod graph;
pub mod intern;
mod scratch;
mod set;
mod topo;

pub use graph::{CycleError, DirtyGraph};
pub use intern::InternId;
pub use scratch::TraversalScratch;
pub use set::DirtySet;
pub use topo::{TopoCompletion, TopoOrder};
