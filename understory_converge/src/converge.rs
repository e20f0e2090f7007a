// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Running the plan against a draft.
//!
//! A convergence pass takes the dirty roots of a transaction, selects the
//! steps they can reach (or the whole plan), and runs them in plan order.
//! Each step writes only when its output actually changed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::{BudgetGovernor, DegradePolicy, DegradeReason};
use crate::build::Program;
use crate::deps_trace::{DepsMismatch, TracingView, diff_deps};
use crate::digest::key_hash;
use crate::dirty::{DirtyRoots, DirtySummary};
use crate::draft::Draft;
use crate::path::{get_at, join_concrete};
use crate::plan::{Step, StepId, StepKind, StepRule, StepScope};
use crate::plan_cache::{CacheEvidence, PlanCache};
use crate::registry::RootId;
use crate::rowid::RowLookup;
use crate::rule::{EqualsFn, RuleError, StateView};
use crate::source::{LoadRequest, ResourceSnapshot, SourceStatus, SourceTarget};

/// Default wall-clock budget of a pass.
pub const DEFAULT_BUDGET: Duration = Duration::from_millis(200);

/// Share of the plan (in tenths) at which `auto` runs everything.
const AUTO_FULL_TENTHS: usize = 9;

/// Requested scheduling mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeMode {
    /// Dirty unless the dirty set reaches nearly every step.
    #[default]
    Auto,
    /// Every step.
    Full,
    /// Only the steps reachable from the dirty roots.
    Dirty,
}

/// Mode a pass actually ran in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutedMode {
    /// Every step.
    Full,
    /// The reachable slice.
    Dirty,
}

/// Knobs of a pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvergeOptions {
    /// Scheduling mode.
    pub mode: ConvergeMode,
    /// Wall-clock budget; `None` or zero means unlimited.
    pub budget: Option<Duration>,
    /// What to do when the pass is cut short.
    pub degrade: DegradePolicy,
    /// Compare declared deps with actual reads (debug builds only).
    pub trace_deps: bool,
    /// Record per-step timings.
    pub collect_timings: bool,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            mode: ConvergeMode::Auto,
            budget: Some(DEFAULT_BUDGET),
            degrade: DegradePolicy::FullRecompute,
            trace_deps: false,
            collect_timings: false,
        }
    }
}

/// How a pass ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// At least one field changed or a load was requested.
    Converged,
    /// Nothing changed.
    Noop,
    /// The pass was cut short; see [`ConvergeOutcome::degraded`].
    Degraded,
}

/// Step counters of a pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStats {
    /// Steps in the plan.
    pub total_steps: usize,
    /// Steps run, changed or not.
    pub executed_steps: usize,
    /// `total_steps - executed_steps`.
    pub skipped_steps: usize,
    /// Steps whose output changed.
    pub changed_steps: usize,
    /// Steps selected before running.
    pub affected_steps: usize,
}

/// Time spent in one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTiming {
    /// Step label.
    pub step: String,
    /// Microseconds.
    pub duration_us: u64,
    /// Whether the output changed.
    pub changed: bool,
}

/// Plain-data summary of a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergeSummary {
    /// Requested mode.
    pub requested_mode: ConvergeMode,
    /// Executed mode.
    pub executed_mode: ExecutedMode,
    /// The dirty set the pass started from.
    pub dirty: DirtySummary,
    /// Step counters.
    pub step_stats: StepStats,
    /// Plan cache state, when a cache is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheEvidence>,
    /// Wall time in microseconds.
    pub duration_us: u64,
    /// Slowest steps, when timings are collected.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_steps: Vec<StepTiming>,
}

/// Details of a degraded pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    /// Why the pass was cut short.
    pub reason: DegradeReason,
    /// Policy applied.
    pub policy: DegradePolicy,
    /// Label of the step that was about to run or failed.
    pub step: String,
    /// Error text for runtime errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the full recompute produced a converged state.
    pub recovered: bool,
}

/// Result of a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergeOutcome {
    /// How the pass ended.
    pub kind: OutcomeKind,
    /// Counters and evidence.
    pub summary: ConvergeSummary,
    /// Present for degraded passes.
    pub degraded: Option<Degradation>,
    /// Registry ids of every output that changed, sorted.
    pub changed_roots: Vec<RootId>,
    /// Loads the host should start.
    pub load_requests: Vec<LoadRequest>,
    /// Steps whose declared deps disagree with their reads.
    pub deps_mismatches: Vec<DepsMismatch>,
}

impl ConvergeOutcome {
    /// Returns `true` unless the pass degraded without recovering.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.degraded.as_ref().is_none_or(|d| d.recovered)
    }
}

/// One convergence pass over a [`Program`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use understory_converge::{
///     ConvergeOptions, Converger, DirtyRoots, DirtyAllReason, Draft, Program, Rule, RuleDecl,
/// };
///
/// let program = Program::builder("cart")
///     .rule(RuleDecl::new(
///         "total",
///         Rule::computed(["price", "qty"], |s| {
///             Ok(json!(s.read_f64("price").unwrap_or(0.0) * s.read_f64("qty").unwrap_or(0.0)))
///         }),
///     ))
///     .build()
///     .unwrap();
///
/// let mut draft = Draft::new(Arc::new(json!({ "price": 2.0, "qty": 3.0 })));
/// let outcome = Converger::new(&program, ConvergeOptions::default())
///     .run(&DirtyRoots::all(DirtyAllReason::ColdStart), &mut draft);
/// assert_eq!(outcome.summary.step_stats.changed_steps, 1);
/// assert_eq!(draft.get("total"), Some(&json!(6.0)));
/// ```
pub struct Converger<'a> {
    program: &'a Program,
    options: ConvergeOptions,
    cache: Option<&'a mut PlanCache>,
    rows: Option<&'a dyn RowLookup>,
    traced: Option<&'a mut HashSet<StepId>>,
    forced: Vec<StepId>,
}

impl core::fmt::Debug for Converger<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Converger")
            .field("module_id", &self.program.module_id())
            .field("options", &self.options)
            .field("cache", &self.cache)
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Pass {
    executed: usize,
    changed: usize,
    changed_roots: Vec<RootId>,
    loads: Vec<LoadRequest>,
    undo: Vec<(String, Option<Value>)>,
    timings: Vec<StepTiming>,
    mismatches: Vec<DepsMismatch>,
}

impl Pass {
    fn write(&mut self, draft: &mut Draft, path: String, value: Value) {
        let previous = draft.get(&path).cloned();
        draft.set(&path, value);
        self.undo.push((path, previous));
    }

    /// Undoes every write; counters of work done are kept.
    fn rollback(&mut self, draft: &mut Draft) {
        for (path, previous) in self.undo.drain(..).rev() {
            match previous {
                Some(value) => draft.set(&path, value),
                None => {
                    draft.remove(&path);
                }
            }
        }
        self.changed = 0;
        self.changed_roots.clear();
        self.loads.clear();
    }
}

struct Interrupt {
    reason: DegradeReason,
    step: String,
    detail: Option<String>,
}

enum Eval {
    Unchanged,
    Write(Value),
    Load { key: Value, key_hash: String },
}

impl<'a> Converger<'a> {
    /// Prepares a pass.
    #[must_use]
    pub fn new(program: &'a Program, options: ConvergeOptions) -> Self {
        Self {
            program,
            options,
            cache: None,
            rows: None,
            traced: None,
            forced: Vec::new(),
        }
    }

    /// Memoizes dirty plans in `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: &'a mut PlanCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses `rows` to address row-level loads by stable id.
    #[must_use]
    pub fn with_rows(mut self, rows: &'a dyn RowLookup) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Shares the set of steps whose deps were already traced, so that each
    /// step is traced once per document.
    #[must_use]
    pub fn with_traced(mut self, traced: &'a mut HashSet<StepId>) -> Self {
        self.traced = Some(traced);
        self
    }

    /// Makes the given source steps request a load even if their key did
    /// not change.
    #[must_use]
    pub fn force_sources(mut self, steps: impl IntoIterator<Item = StepId>) -> Self {
        self.forced.extend(steps);
        self.forced.sort_unstable();
        self.forced.dedup();
        self
    }

    /// Runs the pass.
    pub fn run(mut self, dirty: &DirtyRoots, draft: &mut Draft) -> ConvergeOutcome {
        let started = Instant::now();
        let total = self.program.plan().len();
        let (mode, steps, cache) = self.select(dirty);

        let mut stats = StepStats {
            total_steps: total,
            affected_steps: steps.len(),
            ..StepStats::default()
        };
        let governor = BudgetGovernor::start(self.options.budget);
        let mut pass = Pass::default();
        let mut executed_mode = mode;
        let mut degraded = None;

        if let Err(interrupt) = self.execute(&steps, mode, governor, draft, &mut pass) {
            pass.rollback(draft);
            tracing::warn!(
                module_id = self.program.module_id(),
                reason = ?interrupt.reason,
                step = %interrupt.step,
                policy = ?self.options.degrade,
                "convergence degraded"
            );
            let mut degradation = Degradation {
                reason: interrupt.reason,
                policy: self.options.degrade,
                step: interrupt.step,
                detail: interrupt.detail,
                recovered: false,
            };
            let recompute = interrupt.reason == DegradeReason::BudgetExceeded
                && self.options.degrade == DegradePolicy::FullRecompute;
            if recompute {
                let full = self.program.plan().full();
                let mut retry = Pass::default();
                executed_mode = ExecutedMode::Full;
                match self.execute(
                    &full,
                    ExecutedMode::Full,
                    BudgetGovernor::unbounded(),
                    draft,
                    &mut retry,
                ) {
                    Ok(()) => degradation.recovered = true,
                    Err(second) => {
                        retry.rollback(draft);
                        degradation.reason = second.reason;
                        degradation.step = second.step;
                        degradation.detail = second.detail;
                    }
                }
                retry.mismatches.append(&mut pass.mismatches);
                pass = retry;
            }
            degraded = Some(degradation);
        }

        stats.executed_steps = pass.executed;
        stats.skipped_steps = total.saturating_sub(pass.executed);
        stats.changed_steps = pass.changed;
        let mut changed_roots = pass.changed_roots;
        changed_roots.sort_unstable();
        changed_roots.dedup();
        let mut top_steps = pass.timings;
        top_steps.sort_by(|a, b| b.duration_us.cmp(&a.duration_us));
        top_steps.truncate(3);

        let kind = if degraded.is_some() {
            OutcomeKind::Degraded
        } else if pass.changed == 0 && pass.loads.is_empty() {
            OutcomeKind::Noop
        } else {
            OutcomeKind::Converged
        };
        let summary = ConvergeSummary {
            requested_mode: self.options.mode,
            executed_mode,
            dirty: dirty.summary(),
            step_stats: stats,
            cache,
            duration_us: micros(started.elapsed()),
            top_steps,
        };
        tracing::debug!(
            module_id = self.program.module_id(),
            kind = ?kind,
            mode = ?executed_mode,
            executed = stats.executed_steps,
            changed = stats.changed_steps,
            "convergence finished"
        );
        ConvergeOutcome {
            kind,
            summary,
            degraded,
            changed_roots,
            load_requests: pass.loads,
            deps_mismatches: pass.mismatches,
        }
    }

    /// Picks the steps to run.
    fn select(&mut self, dirty: &DirtyRoots) -> (ExecutedMode, Vec<StepId>, Option<CacheEvidence>) {
        let plan = self.program.plan();
        let evidence = |cache: &Option<&mut PlanCache>, hit| cache.as_ref().map(|c| c.evidence(hit));

        if dirty.is_all() || self.options.mode == ConvergeMode::Full {
            let cache = evidence(&self.cache, false);
            return (ExecutedMode::Full, plan.full(), cache);
        }
        if dirty.is_empty() && self.forced.is_empty() {
            let cache = evidence(&self.cache, false);
            return (ExecutedMode::Dirty, Vec::new(), cache);
        }

        let roots = dirty.roots();
        let digest = self.program.digest();
        let mut hit = false;
        let mut steps = if self.forced.is_empty() {
            let cached = self.cache.as_mut().and_then(|c| c.get(digest, roots));
            match cached {
                Some(steps) => {
                    hit = true;
                    steps.to_vec()
                }
                None => {
                    let steps = plan.affected(roots);
                    if let Some(cache) = self.cache.as_mut() {
                        cache.insert(digest, roots, Arc::from(steps.as_slice()));
                    }
                    steps
                }
            }
        } else {
            let mut seeds = roots.to_vec();
            seeds.extend(self.forced.iter().map(|&id| plan.step(id).out_id()));
            let mut steps = plan.affected(&seeds);
            steps.extend(self.forced.iter().copied());
            steps.sort_unstable();
            steps.dedup();
            steps
        };
        let cache = evidence(&self.cache, hit);

        if self.options.mode == ConvergeMode::Auto
            && !steps.is_empty()
            && steps.len() * 10 >= plan.len() * AUTO_FULL_TENTHS
        {
            steps = plan.full();
            return (ExecutedMode::Full, steps, cache);
        }
        (ExecutedMode::Dirty, steps, cache)
    }

    fn execute(
        &mut self,
        steps: &[StepId],
        mode: ExecutedMode,
        governor: BudgetGovernor,
        draft: &mut Draft,
        pass: &mut Pass,
    ) -> Result<(), Interrupt> {
        let program = self.program;
        let plan = program.plan();
        for &id in steps {
            let step = plan.step(id);
            if governor.exceeded() {
                return Err(Interrupt {
                    reason: DegradeReason::BudgetExceeded,
                    step: step.label().to_owned(),
                    detail: None,
                });
            }
            let step_started = self.options.collect_timings.then(Instant::now);
            let changed = self
                .run_step(step, draft, pass)
                .map_err(|error| Interrupt {
                    reason: DegradeReason::RuntimeError,
                    step: step.label().to_owned(),
                    detail: Some(error.message().to_owned()),
                })?;
            pass.executed += 1;
            if changed {
                pass.changed += 1;
                pass.changed_roots.push(step.out_id());
                if mode == ExecutedMode::Dirty {
                    debug_assert!(
                        plan.triggered_by(step.out_id())
                            .iter()
                            .filter(|&&t| t > id)
                            .all(|t| steps.binary_search(t).is_ok()),
                        "dirty plan is not closed under `{}`",
                        step.label()
                    );
                }
            }
            if let Some(step_started) = step_started {
                pass.timings.push(StepTiming {
                    step: step.label().to_owned(),
                    duration_us: micros(step_started.elapsed()),
                    changed,
                });
            }
        }
        Ok(())
    }

    fn should_trace(&mut self, step: &Step) -> bool {
        if !cfg!(debug_assertions) || !self.options.trace_deps || step.kind() == StepKind::Link {
            return false;
        }
        match self.traced.as_mut() {
            Some(traced) => traced.insert(step.id()),
            None => true,
        }
    }

    /// Runs one step and reports whether any output changed.
    fn run_step(&mut self, step: &Step, draft: &mut Draft, pass: &mut Pass) -> Result<bool, RuleError> {
        let forced = self.forced.binary_search(&step.id()).is_ok();
        let mut reads = self.should_trace(step).then(Vec::new);
        let mut effects: Vec<(String, SourceTarget, Eval)> = Vec::new();
        {
            let state = draft.value();
            match step.scope() {
                StepScope::Field => {
                    let current = get_at(state, &step.target);
                    let eval = evaluate_step(step, state, current, forced, &mut reads)?;
                    let target = SourceTarget::Field {
                        path: step.target.clone(),
                    };
                    effects.push((step.target.clone(), target, eval));
                }
                StepScope::ListItem { list } => {
                    let items = match get_at(state, list) {
                        Some(Value::Array(items)) => items.as_slice(),
                        _ => &[],
                    };
                    for (index, item) in items.iter().enumerate() {
                        let current = get_at(item, &step.target);
                        let eval = evaluate_step(step, item, current, forced, &mut reads)?;
                        let row = join_concrete(list, &index.to_string());
                        let path = join_concrete(&row, &step.target);
                        let target = match self.rows.and_then(|r| r.row_id(list, index)) {
                            Some(row_id) => SourceTarget::Row {
                                list: list.clone(),
                                row_id: row_id.clone(),
                                field: step.target.clone(),
                            },
                            None => SourceTarget::Field { path: path.clone() },
                        };
                        effects.push((path, target, eval));
                    }
                }
            }
        }

        if let Some(reads) = reads.filter(|r| !r.is_empty()) {
            let diff = diff_deps(step.deps(), &reads);
            if diff.is_mismatch() {
                tracing::warn!(
                    step = step.label(),
                    missing = ?diff.missing,
                    unused = ?diff.unused,
                    "declared deps disagree with reads"
                );
                pass.mismatches.push(DepsMismatch {
                    kind: step.kind(),
                    step: step.label().to_owned(),
                    field_path: step.declared_path().to_owned(),
                    diff,
                });
            }
        }

        let mut changed = false;
        for (path, target, eval) in effects {
            match eval {
                Eval::Unchanged => {}
                Eval::Write(value) => {
                    pass.write(draft, path, value);
                    changed = true;
                }
                Eval::Load { key, key_hash } => {
                    pass.write(draft, path, ResourceSnapshot::loading(key_hash.clone()).to_value());
                    if let StepRule::Source(source) = &step.rule {
                        pass.loads.push(LoadRequest {
                            step: step.id(),
                            resource: source.resource.clone(),
                            field_path: step.declared_path().to_owned(),
                            target,
                            key,
                            key_hash,
                            concurrency: source.concurrency,
                        });
                    }
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

/// Runs a pass with default wiring (no cache, index-addressed rows).
pub fn converge(
    program: &Program,
    dirty: &DirtyRoots,
    draft: &mut Draft,
    options: ConvergeOptions,
) -> ConvergeOutcome {
    Converger::new(program, options).run(dirty, draft)
}

/// Evaluates one instance of a step, tracing the first traced instance.
fn evaluate_step(
    step: &Step,
    view: &dyn StateView,
    current: Option<&Value>,
    forced: bool,
    reads: &mut Option<Vec<String>>,
) -> Result<Eval, RuleError> {
    match reads {
        Some(reads) if reads.is_empty() => {
            let tracer = TracingView::new(view);
            let eval = evaluate(&step.rule, &tracer, current, forced);
            *reads = tracer.into_reads();
            eval
        }
        _ => evaluate(&step.rule, view, current, forced),
    }
}

fn evaluate(
    rule: &StepRule,
    view: &dyn StateView,
    current: Option<&Value>,
    forced: bool,
) -> Result<Eval, RuleError> {
    match rule {
        StepRule::Computed(computed) => {
            let next = (computed.derive)(view)?;
            Ok(write_if_changed(current, next, computed.equals.as_ref()))
        }
        StepRule::Link { from } => {
            let next = view.read(from).cloned().unwrap_or(Value::Null);
            Ok(write_if_changed(current, next, None))
        }
        StepRule::Source(source) => {
            let snapshot = current.and_then(ResourceSnapshot::from_value);
            match (source.key)(view)? {
                None => {
                    let idle = ResourceSnapshot::idle();
                    if snapshot.as_ref() == Some(&idle) {
                        Ok(Eval::Unchanged)
                    } else {
                        Ok(Eval::Write(idle.to_value()))
                    }
                }
                Some(key) => {
                    let hash = key_hash(&key);
                    let same = snapshot.is_some_and(|s| {
                        s.status != SourceStatus::Idle && s.key_hash.as_deref() == Some(hash.as_str())
                    });
                    if same && !forced {
                        Ok(Eval::Unchanged)
                    } else {
                        Ok(Eval::Load { key, key_hash: hash })
                    }
                }
            }
        }
    }
}

fn write_if_changed(current: Option<&Value>, next: Value, equals: Option<&EqualsFn>) -> Eval {
    let same = match current {
        Some(previous) => match equals {
            Some(equals) => equals(previous, &next),
            None => *previous == next,
        },
        None => next.is_null(),
    };
    if same { Eval::Unchanged } else { Eval::Write(next) }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dirty::{DirtyAllReason, paths_to_dirty_set};
    use crate::rule::{ListRule, Rule, RuleDecl, Source};

    fn program() -> Program {
        Program::builder("t")
            .rule(RuleDecl::new(
                "double",
                Rule::computed(["n"], |s| Ok(json!(s.read_i64("n").unwrap_or(0) * 2))),
            ))
            .rule(RuleDecl::new(
                "quad",
                Rule::computed(["double"], |s| Ok(json!(s.read_i64("double").unwrap_or(0) * 2))),
            ))
            .rule(RuleDecl::new("mirror", Rule::link("other")))
            .build()
            .unwrap()
    }

    fn cold(program: &Program, value: Value) -> Draft {
        let mut draft = Draft::new(Arc::new(value));
        converge(
            program,
            &DirtyRoots::all(DirtyAllReason::ColdStart),
            &mut draft,
            ConvergeOptions::default(),
        );
        draft
    }

    #[test]
    fn dirty_pass_runs_the_downstream_chain() {
        let program = program();
        let mut draft = cold(&program, json!({ "n": 1, "other": "x" }));
        assert_eq!(draft.get("quad"), Some(&json!(4)));

        draft.set("n", json!(5));
        let dirty = paths_to_dirty_set(program.registry(), ["n"]);
        let options = ConvergeOptions {
            mode: ConvergeMode::Dirty,
            ..ConvergeOptions::default()
        };
        let outcome = converge(&program, &dirty, &mut draft, options);
        assert_eq!(outcome.kind, OutcomeKind::Converged);
        assert_eq!(outcome.summary.executed_mode, ExecutedMode::Dirty);
        assert_eq!(outcome.summary.step_stats.executed_steps, 2);
        assert_eq!(outcome.summary.step_stats.skipped_steps, 1);
        assert_eq!(draft.get("quad"), Some(&json!(20)));
        assert_eq!(outcome.changed_roots.len(), 2);
    }

    #[test]
    fn auto_switches_to_full_when_nearly_everything_is_dirty() {
        let program = program();
        let mut draft = cold(&program, json!({ "n": 1, "other": "x" }));
        draft.set("n", json!(2));
        draft.set("other", json!("y"));
        let dirty = paths_to_dirty_set(program.registry(), ["n", "other"]);
        let outcome = converge(&program, &dirty, &mut draft, ConvergeOptions::default());
        assert_eq!(outcome.summary.executed_mode, ExecutedMode::Full);
        assert_eq!(outcome.summary.requested_mode, ConvergeMode::Auto);
        assert_eq!(draft.get("mirror"), Some(&json!("y")));
    }

    #[test]
    fn runtime_errors_roll_back() {
        let program = Program::builder("t")
            .rule(RuleDecl::new(
                "a",
                Rule::computed(["n"], |s| Ok(json!(s.read_i64("n").unwrap_or(0) + 1))),
            ))
            .rule(RuleDecl::new(
                "b",
                Rule::computed(["a"], |s| match s.read_i64("a") {
                    Some(a) if a > 10 => Err(RuleError::new("too big")),
                    other => Ok(json!(other)),
                }),
            ))
            .build()
            .unwrap();
        let mut draft = cold(&program, json!({ "n": 1 }));
        assert_eq!(draft.get("b"), Some(&json!(2)));

        draft.set("n", json!(20));
        let dirty = paths_to_dirty_set(program.registry(), ["n"]);
        let outcome = converge(&program, &dirty, &mut draft, ConvergeOptions::default());
        assert_eq!(outcome.kind, OutcomeKind::Degraded);
        let degraded = outcome.degraded.unwrap();
        assert_eq!(degraded.reason, DegradeReason::RuntimeError);
        assert_eq!(degraded.detail.as_deref(), Some("too big"));
        assert!(!degraded.recovered);
        assert_eq!(draft.get("a"), Some(&json!(2)), "partial writes undone");
        assert!(outcome.changed_roots.is_empty());
    }

    #[test]
    fn sources_request_loads_on_key_change() {
        let program = Program::builder("t")
            .rule(RuleDecl::new(
                "profile",
                Source::new("user", ["userId"], |s| Ok(s.read("userId").cloned())),
            ))
            .build()
            .unwrap();
        let mut draft = cold(&program, json!({}));
        assert_eq!(draft.get("profile"), Some(&json!({ "status": "idle" })));

        draft.set("userId", json!(7));
        let dirty = paths_to_dirty_set(program.registry(), ["userId"]);
        let outcome = converge(&program, &dirty, &mut draft, ConvergeOptions::default());
        assert_eq!(outcome.load_requests.len(), 1);
        let request = &outcome.load_requests[0];
        assert_eq!(request.key, json!(7));
        assert_eq!(draft.get("profile.status"), Some(&json!("loading")));

        let again = converge(&program, &dirty, &mut draft, ConvergeOptions::default());
        assert!(again.load_requests.is_empty(), "same key, no reload");

        let step = program.source_steps_at("profile")[0];
        let forced = Converger::new(&program, ConvergeOptions::default())
            .force_sources([step])
            .run(&DirtyRoots::empty(), &mut draft);
        assert_eq!(forced.load_requests.len(), 1);
    }

    #[test]
    fn list_item_steps_run_per_row() {
        let program = Program::builder("t")
            .rule(RuleDecl::new(
                "items",
                ListRule::new().item(
                    "total",
                    Rule::computed(["price", "qty"], |s| {
                        Ok(json!(s.read_i64("price").unwrap_or(0) * s.read_i64("qty").unwrap_or(0)))
                    }),
                ),
            ))
            .build()
            .unwrap();
        let draft = cold(
            &program,
            json!({ "items": [{ "price": 2, "qty": 3 }, { "price": 5, "qty": 1 }] }),
        );
        assert_eq!(draft.get("items.0.total"), Some(&json!(6)));
        assert_eq!(draft.get("items.1.total"), Some(&json!(5)));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn traces_undeclared_reads() {
        let program = Program::builder("t")
            .rule(RuleDecl::new(
                "sum",
                Rule::computed(["a"], |s| {
                    Ok(json!(s.read_i64("a").unwrap_or(0) + s.read_i64("b").unwrap_or(0)))
                }),
            ))
            .build()
            .unwrap();
        let mut draft = Draft::new(Arc::new(json!({ "a": 1, "b": 2 })));
        let mut traced = HashSet::new();
        let options = ConvergeOptions {
            trace_deps: true,
            ..ConvergeOptions::default()
        };
        let outcome = Converger::new(&program, options.clone())
            .with_traced(&mut traced)
            .run(&DirtyRoots::all(DirtyAllReason::ColdStart), &mut draft);
        assert_eq!(outcome.deps_mismatches.len(), 1);
        assert_eq!(outcome.deps_mismatches[0].diff.missing, vec!["b"]);

        draft.set("a", json!(5));
        let again = Converger::new(&program, options)
            .with_traced(&mut traced)
            .run(&DirtyRoots::all(DirtyAllReason::ColdStart), &mut draft);
        assert!(again.deps_mismatches.is_empty(), "each step is traced once");
    }
}
