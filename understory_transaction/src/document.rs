// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The synchronous single-writer commit pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use serde_json::Value;
use understory_converge::{
    CacheDisableReason, CheckNode, ConvergeOutcome, Converger, Diagnostic, DiagnosticsSink,
    DirtyAllReason, DirtyRoots, Draft, ErrorStore, LoadRequest, PlanCache, Program,
    ResourceSnapshot, RowIdStore, SourceSettlement, SourceStatus, StepId, ValidateMode,
    ValidationReport,
};

use crate::config::ResolvedConfig;
use crate::replay::{ReplayError, ReplayLog, ReplayMode};
use crate::txn::{
    CommitMeta, CommitMode, Mutation, Priority, Proposal, Txn, TxnDescriptor, TxnOrigin,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Why a commit was refused. Nothing is committed when this is returned.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxnError {
    /// The batch held no transaction.
    #[error("nothing to commit")]
    EmptyBatch,
    /// A refresh named a path with no source rule.
    #[error("no source rule at `{0}`")]
    UnknownSource(String),
    /// The replay log and the program drifted apart.
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// The runtime owning the document has stopped.
    #[error("document runtime has shut down")]
    Closed,
}

type Observer = Box<dyn FnMut(&Arc<Value>, &CommitMeta) + Send>;

/// Work a commit hands to the host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Effects {
    /// Loads to start.
    pub loads: Vec<LoadRequest>,
    /// Replayed loader results to commit as follow-up transactions.
    pub settlements: Vec<SourceSettlement>,
}

impl Effects {
    /// Returns `true` if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.settlements.is_empty()
    }
}

/// Result of one commit.
#[derive(Clone, Debug)]
pub struct Commit {
    /// What observers received.
    pub meta: CommitMeta,
    /// Transactions applied, in order.
    pub txns: Vec<TxnDescriptor>,
    /// The convergence pass.
    pub outcome: ConvergeOutcome,
    /// Validation passes (on-change first, then explicit requests).
    pub validation: Vec<ValidationReport>,
    /// The committed state.
    pub state: Arc<Value>,
}

/// Configures and starts a [`Document`].
pub struct DocumentBuilder {
    program: Arc<Program>,
    config: Option<ResolvedConfig>,
    instance: Option<String>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    replay: Option<(ReplayMode, ReplayLog)>,
}

impl core::fmt::Debug for DocumentBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DocumentBuilder")
            .field("module_id", &self.program.module_id())
            .field("config", &self.config)
            .field("instance", &self.instance)
            .field("sink", &self.sink.is_some())
            .field("replay", &self.replay.as_ref().map(|(mode, _)| mode))
            .finish()
    }
}

impl DocumentBuilder {
    /// Uses a resolved configuration instead of the builtin one.
    #[must_use]
    pub fn config(mut self, config: ResolvedConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Names the instance. Row ids and transaction ids are scoped by it.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Sends diagnostics to `sink`, filtered by the configured level.
    #[must_use]
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Records every external read into `log`.
    #[must_use]
    pub fn record(mut self, log: ReplayLog) -> Self {
        self.replay = Some((ReplayMode::Record, log));
        self
    }

    /// Answers every external read from `log`.
    #[must_use]
    pub fn replay(mut self, log: ReplayLog) -> Self {
        self.replay = Some((ReplayMode::Replay, log));
        self
    }

    /// Runs the cold-start convergence and returns the document at seq 0.
    ///
    /// # Errors
    ///
    /// Fails in replay mode if the log does not start with the cold-start
    /// loads.
    pub fn build(self, initial: Value) -> Result<Document, TxnError> {
        let program = self.program;
        let config = self
            .config
            .unwrap_or_else(|| ResolvedConfig::builtin(program.module_id()));
        let instance = self.instance.unwrap_or_else(|| {
            let n = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
            format!("{}#{n}", program.module_id())
        });
        let mut rows = RowIdStore::new(instance.clone());
        for list in program.lists() {
            rows.track(list.path.clone(), list.track_by.clone());
        }
        let (replay_mode, log) = match self.replay {
            Some((mode, log)) => (mode, Some(log)),
            None => (ReplayMode::Live, None),
        };
        let mut document = Document {
            cache: PlanCache::new(config.plan_cache.capacity),
            program,
            config,
            instance,
            state: Arc::new(initial),
            seq: 0,
            txn_counter: 0,
            rows,
            errors: ErrorStore::new(),
            traced: HashSet::new(),
            replay_mode,
            log,
            outstanding: Vec::new(),
            sink: self.sink,
            observers: Vec::new(),
            effects: Effects::default(),
            cache_reported: false,
        };
        document.cold_start()?;
        Ok(document)
    }
}

/// One document instance: a [`Program`] plus the state it keeps converged.
///
/// Commits are serialized by `&mut self`; every commit assigns the next
/// `seq`, and observers see each committed state exactly once.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use understory_converge::{Program, Rule, RuleDecl};
/// use understory_transaction::{Document, Txn};
///
/// let program = Program::builder("cart")
///     .rule(RuleDecl::new(
///         "total",
///         Rule::computed(["price", "qty"], |s| {
///             Ok(json!(s.read_i64("price").unwrap_or(0) * s.read_i64("qty").unwrap_or(0)))
///         }),
///     ))
///     .build()
///     .unwrap();
///
/// let mut doc = Document::builder(Arc::new(program))
///     .build(json!({ "price": 3, "qty": 1 }))
///     .unwrap();
/// assert_eq!(doc.state()["total"], json!(3));
///
/// let commit = doc.commit(vec![Txn::new().set("qty", json!(4))]).unwrap();
/// assert_eq!(commit.meta.seq, 1);
/// assert_eq!(doc.state()["total"], json!(12));
/// ```
pub struct Document {
    program: Arc<Program>,
    config: ResolvedConfig,
    instance: String,
    state: Arc<Value>,
    seq: u64,
    txn_counter: u64,
    cache: PlanCache,
    rows: RowIdStore,
    errors: ErrorStore,
    traced: HashSet<StepId>,
    replay_mode: ReplayMode,
    log: Option<ReplayLog>,
    outstanding: Vec<LoadRequest>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
    observers: Vec<Observer>,
    effects: Effects,
    cache_reported: bool,
}

impl core::fmt::Debug for Document {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Document")
            .field("module_id", &self.program.module_id())
            .field("instance", &self.instance)
            .field("seq", &self.seq)
            .field("replay_mode", &self.replay_mode)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl Document {
    /// Starts configuring a document over `program`.
    #[must_use]
    pub fn builder(program: Arc<Program>) -> DocumentBuilder {
        DocumentBuilder {
            program,
            config: None,
            instance: None,
            sink: None,
            replay: None,
        }
    }

    /// Committed state.
    #[must_use]
    pub fn state(&self) -> &Arc<Value> {
        &self.state
    }

    /// Sequence number of the committed state (0 after cold start).
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Instance id.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// The program.
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Row ids of the committed state.
    #[must_use]
    pub fn rows(&self) -> &RowIdStore {
        &self.rows
    }

    /// Validation results.
    #[must_use]
    pub fn errors(&self) -> &ErrorStore {
        &self.errors
    }

    /// Plan cache.
    #[must_use]
    pub fn plan_cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Replay mode.
    #[must_use]
    pub fn replay_mode(&self) -> ReplayMode {
        self.replay_mode
    }

    /// Calls `observer` after every commit.
    pub fn observe(&mut self, observer: impl FnMut(&Arc<Value>, &CommitMeta) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Takes the loads and replayed settlements produced so far.
    pub fn take_effects(&mut self) -> Effects {
        core::mem::take(&mut self.effects)
    }

    fn cold_start(&mut self) -> Result<(), TxnError> {
        let mut draft = Draft::new(Arc::clone(&self.state));
        self.rows.reconcile_all(draft.value());
        let outcome = self.converge(&DirtyRoots::all(DirtyAllReason::ColdStart), Vec::new(), &mut draft);
        self.issue_loads(&outcome.load_requests, 0)?;
        self.state = draft.finalize();
        self.report(0, &outcome, &[]);
        tracing::debug!(
            module_id = self.program.module_id(),
            instance = %self.instance,
            executed = outcome.summary.step_stats.executed_steps,
            loads = outcome.load_requests.len(),
            "document started"
        );
        Ok(())
    }

    /// Applies `txns` as one commit: mutations, convergence, validation,
    /// then publication under the next `seq`.
    ///
    /// # Errors
    ///
    /// Refuses empty batches and refreshes of unknown sources up front; in
    /// replay mode, fails on log drift. Nothing is committed on error.
    pub fn commit(&mut self, txns: Vec<Txn>) -> Result<Commit, TxnError> {
        if txns.is_empty() {
            return Err(TxnError::EmptyBatch);
        }
        for txn in &txns {
            for proposal in txn.proposals() {
                if let Proposal::RefreshSource { path, .. } = proposal {
                    if self.program.source_steps_at(path).is_empty() {
                        return Err(TxnError::UnknownSource(path.clone()));
                    }
                }
            }
        }
        let saved = (self.replay_mode == ReplayMode::Replay)
            .then(|| (self.rows.clone(), self.errors.clone(), self.txn_counter));
        let result = self.apply(txns);
        if let Err(err) = &result {
            tracing::warn!(
                module_id = self.program.module_id(),
                seq = self.seq + 1,
                error = %err,
                "transaction aborted"
            );
            if let Some((rows, errors, txn_counter)) = saved {
                self.rows = rows;
                self.errors = errors;
                self.txn_counter = txn_counter;
            }
        }
        result
    }

    fn apply(&mut self, txns: Vec<Txn>) -> Result<Commit, TxnError> {
        let program = Arc::clone(&self.program);
        let registry = program.registry();
        let seq = self.seq + 1;
        let count = txns.len();

        let mut draft = Draft::new(Arc::clone(&self.state));
        let mut descriptors = Vec::with_capacity(count);
        let mut requests = Vec::new();
        let mut forced = Vec::new();
        let mut removed = Vec::new();
        let mut rows_stale = false;
        let mut priority = Priority::Low;
        let mut origin = TxnOrigin::Action;

        for txn in txns {
            let (txn_origin, txn_priority, label, proposals) = txn.into_parts();
            self.txn_counter += 1;
            if txn_priority == Priority::Normal {
                priority = Priority::Normal;
            }
            origin = txn_origin;
            descriptors.push(TxnDescriptor {
                seq,
                id: format!("{}::t{}", self.instance, self.txn_counter),
                origin: txn_origin,
                label,
                priority: txn_priority,
                lane: txn_priority.lane(),
            });
            for proposal in proposals {
                match proposal {
                    Proposal::Mutate(mutation) => {
                        apply_mutation(&mut draft, mutation);
                        rows_stale = true;
                    }
                    Proposal::Validate { requests: more } => requests.extend(more),
                    Proposal::RefreshSource { path, force } => {
                        if force || needs_reload(&draft, &path) {
                            forced.extend(program.source_steps_at(&path));
                        }
                    }
                    Proposal::Settle(settlement) => {
                        if rows_stale {
                            removed.extend(self.rows.reconcile_all(draft.value()));
                            rows_stale = false;
                        }
                        self.settle(seq, &settlement, &mut draft);
                    }
                }
            }
        }

        let changes = draft.take_changes();
        let mut dirty = DirtyRoots::empty();
        dirty.absorb(registry, &changes);
        if rows_stale {
            removed.extend(self.rows.reconcile_all(draft.value()));
        }
        let cleared = self.errors.forget_rows(&program, &removed, &mut draft);
        if changes.replaced || changes.untracked {
            self.errors.reproject(&program, &mut draft);
        }
        draft.take_changes();
        for path in &cleared {
            dirty.mark_known_path(registry, path);
        }

        let outcome = self.converge(&dirty, forced, &mut draft);

        let mut validation = Vec::new();
        if self.config.converge.validate_on_change {
            let checks = if dirty.is_all() {
                program.checks().iter().map(CheckNode::id).collect()
            } else {
                let mut roots = dirty.roots().to_vec();
                roots.extend_from_slice(&outcome.changed_roots);
                roots.sort_unstable();
                roots.dedup();
                program.checks_downstream_of(&roots)
            };
            if !checks.is_empty() {
                validation.push(self.errors.validate_checks(
                    &program,
                    &self.rows,
                    &mut draft,
                    &checks,
                    ValidateMode::ValueChange,
                ));
            }
        }
        if !requests.is_empty() {
            validation.push(self.errors.validate(&program, &self.rows, &mut draft, &requests));
        }

        self.issue_loads(&outcome.load_requests, seq)?;

        let state = draft.finalize();
        self.state = Arc::clone(&state);
        self.seq = seq;
        let meta = CommitMeta {
            seq,
            txn_id: descriptors
                .last()
                .map(|d| d.id.clone())
                .unwrap_or_default(),
            commit_mode: if count > 1 {
                CommitMode::Coalesced { count }
            } else {
                CommitMode::Single
            },
            priority,
            origin,
        };
        for observer in &mut self.observers {
            observer(&state, &meta);
        }
        self.report(seq, &outcome, &validation);
        tracing::debug!(
            module_id = program.module_id(),
            seq,
            txn_id = %meta.txn_id,
            txns = count,
            executed = outcome.summary.step_stats.executed_steps,
            skipped = outcome.summary.step_stats.skipped_steps,
            changed = outcome.changed_roots.len(),
            loads = outcome.load_requests.len(),
            "transaction committed"
        );
        Ok(Commit {
            meta,
            txns: descriptors,
            outcome,
            validation,
            state,
        })
    }

    fn converge(&mut self, dirty: &DirtyRoots, forced: Vec<StepId>, draft: &mut Draft) -> ConvergeOutcome {
        let options = self.config.converge.options(self.config.diagnostics.level);
        let outcome = Converger::new(&self.program, options)
            .with_cache(&mut self.cache)
            .with_rows(&self.rows)
            .with_traced(&mut self.traced)
            .force_sources(forced)
            .run(dirty, draft);
        if let Some(degraded) = &outcome.degraded {
            tracing::warn!(
                module_id = self.program.module_id(),
                reason = ?degraded.reason,
                step = %degraded.step,
                recovered = degraded.recovered,
                "convergence degraded"
            );
        }
        outcome
    }

    fn settle(&mut self, seq: u64, settlement: &SourceSettlement, draft: &mut Draft) {
        let written = settlement.apply(draft, &self.rows);
        if self.replay_mode != ReplayMode::Record {
            return;
        }
        let Some(index) = self
            .outstanding
            .iter()
            .position(|r| r.target == settlement.target && r.key_hash == settlement.key_hash)
        else {
            return;
        };
        let request = self.outstanding.remove(index);
        if written.is_some() {
            if let Some(log) = &self.log {
                log.record_settled(seq, &request, settlement);
            }
        }
    }

    fn issue_loads(&mut self, requests: &[LoadRequest], seq: u64) -> Result<(), TxnError> {
        let Some(log) = self.log.clone() else {
            self.effects.loads.extend_from_slice(requests);
            return Ok(());
        };
        match self.replay_mode {
            ReplayMode::Live => self.effects.loads.extend_from_slice(requests),
            ReplayMode::Record => {
                for request in requests {
                    log.record_loading(seq, request);
                }
                self.outstanding.extend_from_slice(requests);
                self.effects.loads.extend_from_slice(requests);
            }
            ReplayMode::Replay => {
                let mark = log.cursor();
                let mut outstanding = self.outstanding.clone();
                let replayed = requests
                    .iter()
                    .try_for_each(|request| log.consume_loading(request))
                    .and_then(|()| {
                        outstanding.extend_from_slice(requests);
                        log.consume_settled(&mut outstanding)
                    });
                match replayed {
                    Ok(settlements) => {
                        self.outstanding = outstanding;
                        self.effects.settlements.extend(settlements);
                    }
                    Err(err) => {
                        log.rewind(mark);
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    fn report(&mut self, seq: u64, outcome: &ConvergeOutcome, validation: &[ValidationReport]) {
        if self.sink.is_none() {
            return;
        }
        let module_id = self.program.module_id().to_owned();
        let mut records = vec![Diagnostic::Converge {
            module_id: module_id.clone(),
            seq,
            summary: outcome.summary.clone(),
        }];
        if let Some(degraded) = &outcome.degraded {
            records.push(Diagnostic::Degraded {
                module_id: module_id.clone(),
                seq,
                reason: degraded.reason,
                step: degraded.step.clone(),
                recovered: degraded.recovered,
            });
        }
        records.extend(
            outcome
                .deps_mismatches
                .iter()
                .map(|mismatch| Diagnostic::DepsMismatch {
                    module_id: module_id.clone(),
                    mismatch: mismatch.clone(),
                }),
        );
        records.extend(validation.iter().map(|report| Diagnostic::Validation {
            module_id: module_id.clone(),
            seq,
            report: report.clone(),
        }));
        if !self.cache_reported {
            if let Some(CacheDisableReason::LowHitRate) = self.cache.evidence(false).disable_reason {
                self.cache_reported = true;
                records.push(Diagnostic::CacheDisabled {
                    module_id,
                    reason: CacheDisableReason::LowHitRate,
                });
            }
        }
        let level = self.config.diagnostics.level;
        if let Some(sink) = &self.sink {
            for record in records.iter().filter(|r| r.level() <= level) {
                sink.record(record);
            }
        }
    }
}

fn apply_mutation(draft: &mut Draft, mutation: Mutation) {
    match mutation {
        Mutation::Replace(value) => draft.replace(value),
        Mutation::Set { path, value } => draft.set(&path, value),
        Mutation::Patch(writes) => {
            for (path, value) in writes {
                draft.set(&path, value);
            }
        }
        Mutation::Remove { path } => {
            draft.remove(&path);
        }
        Mutation::Update(f) => draft.update(|value| f(value)),
    }
}

/// A plain refresh reloads a field source only when it is idle or failed;
/// row sources always reload.
fn needs_reload(draft: &Draft, path: &str) -> bool {
    draft
        .get(path)
        .and_then(ResourceSnapshot::from_value)
        .is_none_or(|s| matches!(s.status, SourceStatus::Idle | SourceStatus::Error))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;
    use understory_converge::{
        Check, DiagnosticsLevel, ListRule, MemorySink, OutcomeKind, Rule, RuleDecl, Source,
        ValidateRequest, ValidateTarget,
    };

    use super::*;
    use crate::config::ConfigLayers;

    fn person() -> Arc<Program> {
        Arc::new(
            Program::builder("person")
                .rule(RuleDecl::new(
                    "isAdult",
                    Rule::computed(["age"], |s| Ok(json!(s.read_i64("age").unwrap_or(0) >= 18))),
                ))
                .rule(RuleDecl::new(
                    "profile",
                    Source::new("user", ["userId"], |s| Ok(s.read("userId").cloned())),
                ))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let mut doc = Document::builder(person()).build(json!({ "age": 1 })).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        doc.observe(move |state, meta| sink.lock().push((meta.seq, state["isAdult"].clone())));

        doc.commit(vec![Txn::new().set("age", json!(20))]).unwrap();
        doc.commit(vec![Txn::new().set("age", json!(20))]).unwrap();
        let commit = doc
            .commit(vec![
                Txn::new().set("age", json!(3)),
                Txn::new().set("age", json!(30)).with_priority(Priority::Low),
            ])
            .unwrap();
        assert_eq!(commit.meta.commit_mode, CommitMode::Coalesced { count: 2 });
        assert_eq!(commit.meta.priority, Priority::Normal);
        assert_eq!(commit.txns[1].id, format!("{}::t4", doc.instance()));

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![(1, json!(true)), (2, json!(true)), (3, json!(true))]
        );
        assert_eq!(doc.seq(), 3);
    }

    #[test]
    fn empty_batch_and_unknown_source_are_refused() {
        let mut doc = Document::builder(person()).build(json!({})).unwrap();
        assert_eq!(doc.commit(Vec::new()).unwrap_err(), TxnError::EmptyBatch);
        let err = doc
            .commit(vec![Txn::new().refresh_source("nope", true)])
            .unwrap_err();
        assert_eq!(err, TxnError::UnknownSource("nope".into()));
        assert_eq!(doc.seq(), 0);
    }

    #[test]
    fn loads_become_effects_and_settle() {
        let mut doc = Document::builder(person()).build(json!({})).unwrap();
        assert!(doc.take_effects().is_empty(), "no key, no load");

        doc.commit(vec![Txn::new().set("userId", json!(7))]).unwrap();
        let effects = doc.take_effects();
        assert_eq!(effects.loads.len(), 1);
        assert_eq!(doc.state()["profile"]["status"], json!("loading"));

        let settlement =
            SourceSettlement::from_result(&effects.loads[0], Ok(json!({ "name": "Ada" })));
        doc.commit(vec![Txn::settle(settlement.clone())]).unwrap();
        assert_eq!(doc.state()["profile"]["status"], json!("success"));
        assert_eq!(doc.state()["profile"]["data"], json!({ "name": "Ada" }));

        // A plain refresh of a loaded source does nothing; a forced one reloads.
        doc.commit(vec![Txn::new().refresh_source("profile", false)]).unwrap();
        assert!(doc.take_effects().is_empty());
        doc.commit(vec![Txn::new().refresh_source("profile", true)]).unwrap();
        assert_eq!(doc.take_effects().loads.len(), 1);

        // The old result is stale once the key moved on.
        doc.commit(vec![Txn::new().set("userId", json!(8))]).unwrap();
        doc.commit(vec![Txn::settle(settlement)]).unwrap();
        assert_eq!(doc.state()["profile"]["status"], json!("loading"));
    }

    fn tagged_rows() -> Arc<Program> {
        Arc::new(
            Program::builder("rows")
                .rule(RuleDecl::new(
                    "items",
                    ListRule::new().track_by("id").list_check(Check::new().rule(
                        "unique",
                        ["tag"],
                        |items, _| {
                            let items = items.as_array()?;
                            let rows: Vec<Value> = items
                                .iter()
                                .enumerate()
                                .map(|(i, a)| {
                                    let dup = items.iter().enumerate().any(|(j, b)| {
                                        i != j && a.get("tag") == b.get("tag")
                                    });
                                    if dup { json!("duplicate") } else { Value::Null }
                                })
                                .collect();
                            rows.iter()
                                .any(|r| !r.is_null())
                                .then(|| json!({ "rows": rows }))
                        },
                    )),
                ))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn removed_rows_lose_their_errors() {
        let mut doc = Document::builder(tagged_rows())
            .build(json!({ "items": [
                { "id": "a", "tag": 1 },
                { "id": "b", "tag": 1 },
                { "id": "c", "tag": 2 }
            ] }))
            .unwrap();
        let commit = doc
            .commit(vec![Txn::new().validate([ValidateRequest::new(
                ValidateMode::Submit,
                ValidateTarget::Root,
            )])])
            .unwrap();
        assert_eq!(commit.meta.origin, TxnOrigin::Validate);
        assert_eq!(doc.errors().len(), 2);

        let b = doc.rows().ids("items")[1].clone();
        doc.commit(vec![Txn::new().set(
            "items",
            json!([{ "id": "a", "tag": 1 }, { "id": "c", "tag": 2 }]),
        )])
        .unwrap();
        assert!(doc.state()["errors"]["items"]["rows"].get(b.as_str()).is_none());
        assert!(doc.errors().is_empty(), "on-change validation cleared row a too");
    }

    #[test]
    fn removing_a_row_shifts_later_rows_up() {
        let mut doc = Document::builder(tagged_rows())
            .build(json!({ "items": [{ "id": "a", "tag": 1 }, { "id": "b", "tag": 2 }] }))
            .unwrap();
        let ids = doc.rows().ids("items").to_vec();
        doc.commit(vec![Txn::new().remove("items.0")]).unwrap();
        assert_eq!(doc.state()["items"], json!([{ "id": "b", "tag": 2 }]));
        assert_eq!(doc.rows().ids("items"), &ids[1..], "b keeps its id, a's is released");
    }

    #[test]
    fn writes_past_the_end_of_a_list_are_ignored() {
        let mut doc = Document::builder(tagged_rows())
            .build(json!({ "items": [{ "id": "a", "tag": 1 }] }))
            .unwrap();
        let before = doc.state().clone();
        doc.commit(vec![
            Txn::new()
                .set("items.18446744073709551615", json!({ "id": "x" }))
                .set("items.3.tag", json!(9)),
        ])
        .unwrap();
        assert_eq!(doc.state()["items"], before["items"]);
        assert_eq!(doc.rows().ids("items").len(), 1);
    }

    #[test]
    fn diagnostics_follow_the_level() {
        let layers = ConfigLayers::from_json(r#"{ "provider": { "diagnostics": "light" } }"#).unwrap();
        let sink = Arc::new(MemorySink::new());
        let mut doc = Document::builder(person())
            .config(layers.resolve("person"))
            .diagnostics(sink.clone())
            .build(json!({ "age": 1 }))
            .unwrap();
        doc.commit(vec![Txn::new().set("age", json!(40))]).unwrap();
        let records = sink.take();
        assert_eq!(records.len(), 2, "cold start and one commit");
        assert!(records.iter().all(|r| r.level() == DiagnosticsLevel::Light));
        let Diagnostic::Converge { seq, summary, .. } = &records[1] else {
            panic!("expected a converge record");
        };
        assert_eq!(*seq, 1);
        assert_eq!(summary.step_stats.executed_steps, 1);
    }

    #[test]
    fn runtime_errors_still_commit() {
        let program = Arc::new(
            Program::builder("fragile")
                .rule(RuleDecl::new(
                    "half",
                    Rule::computed(["n"], |s| match s.read_i64("n") {
                        Some(n) if n % 2 == 1 => Err(understory_converge::RuleError::new("odd")),
                        n => Ok(json!(n.unwrap_or(0) / 2)),
                    }),
                ))
                .build()
                .unwrap(),
        );
        let mut doc = Document::builder(program).build(json!({ "n": 4 })).unwrap();
        let commit = doc.commit(vec![Txn::new().set("n", json!(5))]).unwrap();
        assert_eq!(commit.outcome.kind, OutcomeKind::Degraded);
        assert_eq!(commit.meta.seq, 1);
        assert_eq!(doc.state()["n"], json!(5), "the mutation itself commits");
        assert_eq!(doc.state()["half"], json!(2));
    }
}
