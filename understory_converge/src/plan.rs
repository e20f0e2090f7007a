// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution plan: steps in dependency order plus the trigger index used to
//! find the minimal step set for a dirty set.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::assembly::Provenance;
use crate::path::FieldPath;
use crate::registry::RootId;
use crate::rule::{Computed, Source};

/// Position of a step in its plan. Lower ids run first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StepId(pub(crate) u32);

impl StepId {
    /// Returns this id as a table index.
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Kind of a step.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Derived value.
    Computed,
    /// Mirror of another field.
    Link,
    /// Resource snapshot.
    Source,
}

/// Where a step writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepScope {
    /// One field of the document.
    Field,
    /// One field of every row of a list.
    ListItem {
        /// Concrete path of the list.
        list: String,
    },
}

#[derive(Clone)]
pub(crate) enum StepRule {
    Computed(Computed),
    Link { from: String },
    Source(Source),
}

/// One executable unit of a plan.
#[derive(Clone)]
pub struct Step {
    pub(crate) id: StepId,
    pub(crate) label: String,
    pub(crate) declared: String,
    pub(crate) target: String,
    pub(crate) out: FieldPath,
    pub(crate) out_id: RootId,
    pub(crate) deps: Vec<String>,
    pub(crate) dep_ids: SmallVec<[RootId; 4]>,
    pub(crate) scope: StepScope,
    pub(crate) rule: StepRule,
    pub(crate) provenance: Provenance,
}

impl Step {
    /// Position in the plan.
    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Stable label such as `computed:total` or `source:items[].profile`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Declared path of the step's output.
    #[must_use]
    pub fn declared_path(&self) -> &str {
        &self.declared
    }

    /// Normalized output path.
    #[must_use]
    pub fn out(&self) -> &FieldPath {
        &self.out
    }

    /// Registry id of the output path.
    #[must_use]
    pub fn out_id(&self) -> RootId {
        self.out_id
    }

    /// Declared dependency paths (item-relative for list-item steps).
    #[must_use]
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    /// Scope of the step.
    #[must_use]
    pub fn scope(&self) -> &StepScope {
        &self.scope
    }

    /// Who declared the rule.
    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Kind of the step.
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self.rule {
            StepRule::Computed(_) => StepKind::Computed,
            StepRule::Link { .. } => StepKind::Link,
            StepRule::Source(_) => StepKind::Source,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("out", &self.out)
            .field("deps", &self.deps)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Steps in dependency order with a trigger index.
///
/// For every registered path id, the trigger index lists the steps that
/// must re-run when that path changes: steps with a dependency or an output
/// that overlaps the path (same path, ancestor or descendant).
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub(crate) steps: Vec<Step>,
    pub(crate) triggers: Vec<SmallVec<[StepId; 4]>>,
    pub(crate) digest: u64,
}

impl ExecutionPlan {
    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns one step.
    #[must_use]
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.as_usize()]
    }

    /// Digest of the plan's shape (labels and dependencies, in order).
    #[must_use]
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// Every step, in execution order.
    #[must_use]
    pub fn full(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id).collect()
    }

    /// Steps that re-run when `root` changes (directly, not transitively).
    #[must_use]
    pub fn triggered_by(&self, root: RootId) -> &[StepId] {
        self.triggers
            .get(root.as_usize())
            .map(SmallVec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns the minimal step set for `roots`, in execution order.
    ///
    /// This is the reverse closure of the roots over the trigger index: a
    /// triggered step's output is itself treated as changed.
    #[must_use]
    pub fn affected(&self, roots: &[RootId]) -> Vec<StepId> {
        let mut reached = vec![false; self.steps.len()];
        let mut seen_roots = vec![false; self.triggers.len()];
        let mut queue: Vec<RootId> = Vec::with_capacity(roots.len());
        for &root in roots {
            if let Some(seen) = seen_roots.get_mut(root.as_usize()) {
                if !*seen {
                    *seen = true;
                    queue.push(root);
                }
            }
        }
        while let Some(root) = queue.pop() {
            for &step in self.triggered_by(root) {
                if reached[step.as_usize()] {
                    continue;
                }
                reached[step.as_usize()] = true;
                let out = self.steps[step.as_usize()].out_id;
                if let Some(seen) = seen_roots.get_mut(out.as_usize()) {
                    if !*seen {
                        *seen = true;
                        queue.push(out);
                    }
                }
            }
        }
        reached
            .iter()
            .enumerate()
            .filter(|(_, hit)| **hit)
            .map(|(index, _)| self.steps[index].id)
            .collect()
    }

    /// Finds a step by its declared output path.
    #[must_use]
    pub fn find(&self, declared: &str) -> Option<StepId> {
        self.steps
            .iter()
            .find(|s| s.declared == declared)
            .map(|s| s.id)
    }
}
