// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Converge: incremental derived fields over a JSON document.
//!
//! A document module declares rules against field paths: computed fields,
//! links, asynchronously loaded sources, lists with per-row rules, and
//! validation checks. This crate compiles those rules into a [`Program`] and
//! keeps a document consistent with them after every change, running only
//! the steps a change can reach.
//!
//! - **Rules** ([`Rule`], [`RuleDecl`]): what each field is, and which paths
//!   it reads.
//! - **Assembly** ([`assemble`]): merging rule contributions from several
//!   providers, with conflict detection and provenance.
//! - **Programs** ([`Program`], [`ProgramBuilder`]): the dependency graph,
//!   the topologically ordered [`ExecutionPlan`], and the path registry
//!   ([`FieldPathRegistry`]) that turns written paths into dirty roots.
//! - **Convergence** ([`Converger`]): dirty-set scheduling with a plan
//!   cache ([`PlanCache`]), a wall-clock budget and a degrade policy.
//! - **Rows** ([`RowIdStore`]): stable row identity across reorders.
//! - **Validation** ([`ErrorStore`]): scoped checks projected into the
//!   `errors` subtree.
//! - **Sources** ([`LoadRequest`], [`SourceSettlement`]): key-gated
//!   resource snapshots.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use understory_converge::{
//!     ConvergeOptions, Converger, DirtyAllReason, DirtyRoots, Draft, Program, Rule, RuleDecl,
//!     paths_to_dirty_set,
//! };
//!
//! let program = Program::builder("person")
//!     .rule(RuleDecl::new(
//!         "isAdult",
//!         Rule::computed(["age"], |s| Ok(json!(s.read_i64("age").unwrap_or(0) >= 18))),
//!     ))
//!     .rule(RuleDecl::new(
//!         "greeting",
//!         Rule::computed(["name"], |s| {
//!             Ok(json!(format!("Hello, {}", s.read_str("name").unwrap_or("you"))))
//!         }),
//!     ))
//!     .build()
//!     .unwrap();
//!
//! // First pass derives everything.
//! let mut draft = Draft::new(Arc::new(json!({ "age": 12, "name": "Ada" })));
//! Converger::new(&program, ConvergeOptions::default())
//!     .run(&DirtyRoots::all(DirtyAllReason::ColdStart), &mut draft);
//! assert_eq!(draft.get("isAdult"), Some(&json!(false)));
//!
//! // Later passes only run what a change reaches.
//! draft.set("age", json!(30));
//! let dirty = paths_to_dirty_set(program.registry(), ["age"]);
//! let outcome = Converger::new(&program, ConvergeOptions::default()).run(&dirty, &mut draft);
//! assert_eq!(outcome.summary.step_stats.executed_steps, 1);
//! assert_eq!(outcome.summary.step_stats.skipped_steps, 1);
//! assert_eq!(draft.get("isAdult"), Some(&json!(true)));
//! ```

mod assembly;
mod budget;
mod build;
mod converge;
mod deps_trace;
mod diagnostics;
pub mod digest;
mod dirty;
mod draft;
pub mod path;
mod plan;
mod plan_cache;
mod registry;
mod rowid;
mod rule;
mod source;
mod validate;

pub use assembly::{
    AssembledDecl, AssembledRules, AssemblyError, ConflictKind, Contribution, OriginType,
    Provenance, RuleConflict, assemble,
};
pub use budget::{BudgetGovernor, DegradePolicy, DegradeReason};
pub use build::{
    BuildError, CheckId, CheckNode, CheckScope, DependencyGraph, GraphNode, ListConfig, NodeKind,
    Program, ProgramBuilder,
};
pub use converge::{
    ConvergeMode, ConvergeOptions, ConvergeOutcome, ConvergeSummary, Converger, DEFAULT_BUDGET,
    Degradation, ExecutedMode, OutcomeKind, StepStats, StepTiming, converge,
};
pub use deps_trace::{DepsDiff, DepsMismatch, TracingView, diff_deps};
pub use diagnostics::{Diagnostic, DiagnosticsLevel, DiagnosticsSink, MemorySink, TracingSink};
pub use dirty::{DirtyAllReason, DirtyRoots, DirtySummary, paths_to_dirty_set};
pub use draft::{Draft, DraftChanges};
pub use path::{FieldPath, PathError};
pub use plan::{ExecutionPlan, Step, StepId, StepKind, StepScope};
pub use plan_cache::{
    CacheDisableReason, CacheEvidence, DEFAULT_PLAN_CACHE_CAPACITY, MAX_CACHED_ROOTS, PlanCache,
};
pub use registry::{FieldPathRegistry, RegistryBuilder, Resolution, RootId};
pub use rowid::{RowId, RowIdStore, RowLookup};
pub use rule::{
    Check, CheckContext, CheckRule, ClaimKind, Computed, DeriveFn, EqualsFn, KeyFn, Link,
    ListRule, Rule, RuleDecl, RuleError, Source, SourceConcurrency, StateView, ValidateFn,
};
pub use source::{LoadRequest, ResourceSnapshot, SourceSettlement, SourceStatus, SourceTarget};
pub use validate::{
    ERRORS_KEY, ErrorStore, ValidateMode, ValidateRequest, ValidateTarget, ValidationReport,
    merge_outputs,
};
