// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Scoped validation.
//!
//! A request names a target (the root, a field, a list or one row). Only the
//! checks downstream of that target run. Results are kept in an
//! [`ErrorStore`] keyed by check and [`RowId`], and projected into the
//! document under `errors`:
//!
//! | check scope | projected path |
//! |---|---|
//! | root | `errors.$root` |
//! | field `a.b` | `errors.a.b` |
//! | row of `items` | `errors.items.rows.<rowId>` |
//! | list `items` | `errors.items.$list` (or per row, see below) |
//!
//! A list-scope rule may return `{ "rows": [...] }` with one entry per row
//! position; entries are attributed to the row ids at evaluation time.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::build::{CheckId, CheckNode, CheckScope, Program};
use crate::draft::Draft;
use crate::path::{FieldPath, ROOT_PATH, get_at, join_concrete};
use crate::registry::Resolution;
use crate::rowid::{RowId, RowLookup};
use crate::rule::{Check, CheckContext};

/// Top-level key of the error subtree.
pub const ERRORS_KEY: &str = "errors";

/// Why validation runs. When a batch mixes modes, the highest wins
/// (`submit` > `blur` > `value_change` > `manual`).
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ValidateMode {
    /// Explicit request.
    #[default]
    Manual,
    /// A value changed.
    ValueChange,
    /// A field lost focus.
    Blur,
    /// The document is being submitted.
    Submit,
}

/// What to validate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidateTarget {
    /// Every check, every row.
    Root,
    /// Checks downstream of one field.
    Field {
        /// Declared or concrete field path.
        path: String,
    },
    /// Every check of a list, all rows.
    List {
        /// List path.
        path: String,
    },
    /// One row of a list (optionally one field of it).
    Item {
        /// List path.
        path: String,
        /// Row index.
        index: usize,
        /// Item-relative field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

/// One validation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// Why.
    pub mode: ValidateMode,
    /// What.
    pub target: ValidateTarget,
}

impl ValidateRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(mode: ValidateMode, target: ValidateTarget) -> Self {
        Self { mode, target }
    }
}

/// What a validation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Effective mode.
    pub mode: ValidateMode,
    /// Checks evaluated.
    pub checks: usize,
    /// Row evaluations (row checks count once per row).
    pub rows: usize,
    /// Concrete error paths written or cleared.
    pub changed: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Rows {
    All,
    Only(BTreeSet<usize>),
}

impl Rows {
    fn merge(&mut self, other: Self) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (_, Self::All) => *self = Self::All,
            (Self::Only(mine), Self::Only(theirs)) => mine.extend(theirs),
        }
    }

    fn includes(&self, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(&index),
        }
    }
}

type ErrorKey = (CheckId, Option<RowId>);

/// Validation results, keyed by check and row.
///
/// The store is the source of truth; the `errors` subtree of the document is
/// a projection of it.
#[derive(Clone, Debug, Default)]
pub struct ErrorStore {
    entries: BTreeMap<ErrorKey, Value>,
}

impl ErrorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no check currently reports an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the error of `check` for `row` (or for the check's own scope).
    #[must_use]
    pub fn get(&self, check: CheckId, row: Option<&RowId>) -> Option<&Value> {
        self.entries.get(&(check, row.cloned()))
    }

    /// Runs the checks selected by `requests` and updates the projection.
    pub fn validate(
        &mut self,
        program: &Program,
        rows: &dyn RowLookup,
        draft: &mut Draft,
        requests: &[ValidateRequest],
    ) -> ValidationReport {
        let mode = requests
            .iter()
            .map(|r| r.mode)
            .max()
            .unwrap_or_default();
        let selection = select(program, requests);
        self.run(program, rows, draft, selection, mode)
    }

    /// Runs `checks` over all rows.
    pub fn validate_checks(
        &mut self,
        program: &Program,
        rows: &dyn RowLookup,
        draft: &mut Draft,
        checks: &[CheckId],
        mode: ValidateMode,
    ) -> ValidationReport {
        let selection = checks.iter().map(|&id| (id, Rows::All)).collect();
        self.run(program, rows, draft, selection, mode)
    }

    /// Drops every error owned by `removed` rows and clears their
    /// projection.
    ///
    /// Returns the error paths that were cleared.
    pub fn forget_rows(
        &mut self,
        program: &Program,
        removed: &[(String, RowId)],
        draft: &mut Draft,
    ) -> Vec<String> {
        if removed.is_empty() {
            return Vec::new();
        }
        let gone: BTreeSet<&RowId> = removed.iter().map(|(_, id)| id).collect();
        let mut touched = BTreeSet::new();
        self.entries.retain(|(check, row), _| match row {
            Some(row) if gone.contains(row) => {
                touched.insert(projection(program.check(*check), Some(row)));
                false
            }
            _ => true,
        });
        self.project(program, draft, &touched);
        touched.into_iter().collect()
    }

    /// Rewrites the projection of every stored error, for example after the
    /// document was replaced wholesale.
    pub fn reproject(&self, program: &Program, draft: &mut Draft) {
        let touched: BTreeSet<String> = self
            .entries
            .keys()
            .map(|(check, row)| projection(program.check(*check), row.as_ref()))
            .collect();
        self.project(program, draft, &touched);
    }

    fn run(
        &mut self,
        program: &Program,
        rows: &dyn RowLookup,
        draft: &mut Draft,
        selection: BTreeMap<CheckId, Rows>,
        mode: ValidateMode,
    ) -> ValidationReport {
        let mut report = ValidationReport {
            mode,
            ..ValidationReport::default()
        };
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for (id, wanted) in selection {
            let node = program.check(id);
            let (mut owned, fresh) =
                evaluate(node, rows, draft.value(), &wanted, mode, &mut report);
            if wanted == Rows::All {
                // Rows that disappeared lose their entries too.
                owned.extend(self.entries.keys().filter(|key| key.0 == id).cloned());
            }
            report.checks += 1;
            for key in owned {
                let next = fresh.get(&key);
                if self.entries.get(&key) == next {
                    continue;
                }
                touched.insert(projection(node, key.1.as_ref()));
                match next {
                    Some(value) => {
                        self.entries.insert(key, value.clone());
                    }
                    None => {
                        self.entries.remove(&key);
                    }
                }
            }
        }
        self.project(program, draft, &touched);
        report.changed = touched.into_iter().collect();
        tracing::trace!(
            checks = report.checks,
            rows = report.rows,
            changed = report.changed.len(),
            "validation pass"
        );
        report
    }

    fn project(&self, program: &Program, draft: &mut Draft, touched: &BTreeSet<String>) {
        for path in touched {
            let outputs: Vec<Value> = self
                .entries
                .iter()
                .filter(|((check, row), _)| projection(program.check(*check), row.as_ref()) == *path)
                .map(|(_, value)| value.clone())
                .collect();
            match merge_outputs(outputs) {
                Some(value) => {
                    if draft.get(path) != Some(&value) {
                        draft.set(path, value);
                    }
                }
                None => {
                    if draft.get(path).is_some() {
                        draft.remove(path);
                        prune_empty_parents(draft, path);
                    }
                }
            }
        }
    }
}

/// Evaluates one check and returns the keys it owns in this run plus the
/// fresh results.
fn evaluate(
    node: &CheckNode,
    rows: &dyn RowLookup,
    state: &Value,
    wanted: &Rows,
    mode: ValidateMode,
    report: &mut ValidationReport,
) -> (BTreeSet<ErrorKey>, BTreeMap<ErrorKey, Value>) {
    let id = node.id();
    let mut owned: BTreeSet<ErrorKey> = BTreeSet::new();
    let mut fresh: BTreeMap<ErrorKey, Value> = BTreeMap::new();
    let null = Value::Null;
    match node.scope() {
        CheckScope::Root | CheckScope::Field => {
            let input = get_at(state, node.target()).unwrap_or(&null);
            let ctx = CheckContext {
                state,
                path: node.target(),
                index: None,
                row_id: None,
                mode,
            };
            owned.insert((id, None));
            if let Some(out) = run_rules(node.check(), input, &ctx) {
                fresh.insert((id, None), out);
            }
            report.rows += 1;
        }
        CheckScope::ListItem { list } => {
            let items = match get_at(state, list) {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            };
            for (index, item) in items.iter().enumerate() {
                if !wanted.includes(index) {
                    continue;
                }
                let Some(row_id) = rows.row_id(list, index) else {
                    continue;
                };
                let path = join_concrete(list, &index.to_string());
                let ctx = CheckContext {
                    state,
                    path: &path,
                    index: Some(index),
                    row_id: Some(row_id),
                    mode,
                };
                let key = (id, Some(row_id.clone()));
                owned.insert(key.clone());
                if let Some(out) = run_rules(node.check(), item, &ctx) {
                    fresh.insert(key, out);
                }
                report.rows += 1;
            }
        }
        CheckScope::List { list } => {
            let input = get_at(state, list).unwrap_or(&null);
            owned.insert((id, None));
            let ctx = CheckContext {
                state,
                path: list,
                index: None,
                row_id: None,
                mode,
            };
            if let Some(out) = run_rules(node.check(), input, &ctx) {
                split_row_output(id, list, out, rows, &mut owned, &mut fresh);
            }
            report.rows += 1;
        }
    }
    (owned, fresh)
}

fn split_row_output(
    id: CheckId,
    list: &str,
    out: Value,
    rows: &dyn RowLookup,
    owned: &mut BTreeSet<ErrorKey>,
    fresh: &mut BTreeMap<ErrorKey, Value>,
) {
    let Value::Object(mut map) = out else {
        fresh.insert((id, None), out);
        return;
    };
    let Some(Value::Array(per_row)) = map.remove("rows") else {
        fresh.insert((id, None), Value::Object(map));
        return;
    };
    for (index, entry) in per_row.into_iter().enumerate() {
        if entry.is_null() {
            continue;
        }
        if let Some(row) = rows.row_id(list, index) {
            let key = (id, Some(row.clone()));
            owned.insert(key.clone());
            fresh.insert(key, entry);
        }
    }
    if !map.is_empty() {
        fresh.insert((id, None), Value::Object(map));
    }
}

fn run_rules(check: &Check, input: &Value, ctx: &CheckContext<'_>) -> Option<Value> {
    let outputs: Vec<Value> = check
        .rules
        .values()
        .filter_map(|rule| (rule.validate)(input, ctx))
        .filter(|out| !out.is_null())
        .collect();
    merge_outputs(outputs)
}

/// Merges rule outputs: nothing, the single output, a merged object when
/// every output is an object (repeated keys collect into arrays), or the
/// array of outputs.
#[must_use]
pub fn merge_outputs(outputs: Vec<Value>) -> Option<Value> {
    if outputs.len() <= 1 {
        return outputs.into_iter().next();
    }
    if !outputs.iter().all(Value::is_object) {
        return Some(Value::Array(outputs));
    }
    let mut merged = Map::new();
    for output in outputs {
        let Value::Object(map) = output else {
            continue;
        };
        for (key, incoming) in map {
            match merged.remove(&key) {
                None => {
                    merged.insert(key, incoming);
                }
                Some(Value::Array(mut existing)) => {
                    existing.push(incoming);
                    merged.insert(key, Value::Array(existing));
                }
                Some(existing) => {
                    merged.insert(key, Value::Array(vec![existing, incoming]));
                }
            }
        }
    }
    Some(Value::Object(merged))
}

/// Concrete `errors.*` path of a check result.
fn projection(node: &CheckNode, row: Option<&RowId>) -> String {
    match (node.scope(), row) {
        (CheckScope::Root, _) => format!("{ERRORS_KEY}.{ROOT_PATH}"),
        (CheckScope::Field, _) => format!("{ERRORS_KEY}.{}", node.target()),
        (CheckScope::ListItem { list } | CheckScope::List { list }, Some(row)) => {
            format!("{ERRORS_KEY}.{list}.rows.{row}")
        }
        (CheckScope::ListItem { list } | CheckScope::List { list }, None) => {
            format!("{ERRORS_KEY}.{list}.{ROOT_LIST_KEY}")
        }
    }
}

const ROOT_LIST_KEY: &str = "$list";

fn prune_empty_parents(draft: &mut Draft, path: &str) {
    let mut cursor = path;
    while let Some(pos) = cursor.rfind('.') {
        cursor = &cursor[..pos];
        if cursor == ERRORS_KEY {
            break;
        }
        match draft.get(cursor) {
            Some(Value::Object(map)) if map.is_empty() => {
                draft.remove(cursor);
            }
            _ => break,
        }
    }
}

fn select(program: &Program, requests: &[ValidateRequest]) -> BTreeMap<CheckId, Rows> {
    let mut selection: BTreeMap<CheckId, Rows> = BTreeMap::new();
    let mut add = |id: CheckId, rows: Rows| match selection.get_mut(&id) {
        Some(existing) => existing.merge(rows),
        None => {
            selection.insert(id, rows);
        }
    };
    for request in requests {
        match &request.target {
            ValidateTarget::Root => {
                for node in program.checks() {
                    add(node.id(), Rows::All);
                }
            }
            ValidateTarget::Field { path } => {
                for id in downstream(program, path) {
                    add(id, Rows::All);
                }
            }
            ValidateTarget::List { path } => {
                let list = normalized(path);
                for id in downstream(program, path) {
                    add(id, Rows::All);
                }
                for node in program.checks() {
                    if list_of(node) == Some(list.as_str()) {
                        add(node.id(), Rows::All);
                    }
                }
            }
            ValidateTarget::Item { path, index, field } => {
                let list = normalized(path);
                let focus = match field {
                    Some(field) => join_concrete(&list, field),
                    None => list.clone(),
                };
                let mut ids = downstream(program, &focus);
                ids.extend(
                    program
                        .checks()
                        .iter()
                        .filter(|node| list_of(node) == Some(list.as_str()))
                        .map(CheckNode::id),
                );
                for id in ids {
                    let rows = match program.check(id).scope() {
                        CheckScope::ListItem { list: owner } if *owner == list => {
                            Rows::Only(BTreeSet::from([*index]))
                        }
                        _ => Rows::All,
                    };
                    add(id, rows);
                }
            }
        }
    }
    selection
}

fn list_of(node: &CheckNode) -> Option<&str> {
    match node.scope() {
        CheckScope::ListItem { list } | CheckScope::List { list } => Some(list),
        CheckScope::Root | CheckScope::Field => None,
    }
}

fn normalized(path: &str) -> String {
    FieldPath::parse(path)
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default()
}

/// Checks downstream of a path, plus field checks anchored exactly there.
fn downstream(program: &Program, path: &str) -> Vec<CheckId> {
    let Ok(target) = FieldPath::parse(path) else {
        return Vec::new();
    };
    let registry = program.registry();
    let mut ids = match registry.resolve(&target) {
        Resolution::Exact(id) | Resolution::Ancestor(id) => program.checks_downstream_of(&[id]),
        Resolution::Unknown => Vec::new(),
    };
    ids.extend(
        program
            .checks()
            .iter()
            .filter(|node| *node.scope() == CheckScope::Field && node.target() == target.as_str())
            .map(CheckNode::id),
    );
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowid::RowIdStore;
    use crate::rule::{ListRule, RuleDecl};
    use serde_json::json;
    use std::sync::Arc;

    fn dup_program() -> Program {
        Program::builder("rows")
            .rule(RuleDecl::new(
                "items",
                ListRule::new().track_by("id").list_check(Check::new().rule(
                    "unique",
                    ["name"],
                    |value, _| {
                        let items = value.as_array()?;
                        let names: Vec<Option<&Value>> =
                            items.iter().map(|i| i.get("name")).collect();
                        let rows: Vec<Value> = names
                            .iter()
                            .map(|n| {
                                if names.iter().filter(|m| **m == *n).count() > 1 {
                                    json!("duplicate")
                                } else {
                                    Value::Null
                                }
                            })
                            .collect();
                        rows.iter()
                            .any(|r| !r.is_null())
                            .then(|| json!({ "rows": rows }))
                    },
                )),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn list_row_errors_follow_row_ids() {
        let program = dup_program();
        let mut store_rows = RowIdStore::new("doc");
        store_rows.track("items", Some("id".to_owned()));
        let mut errors = ErrorStore::new();
        let root = [ValidateRequest::new(ValidateMode::Submit, ValidateTarget::Root)];

        let state = json!({ "items": [
            { "id": "row-0", "name": "x" },
            { "id": "row-1", "name": "x" },
            { "id": "row-2", "name": "y" },
        ]});
        store_rows.reconcile_all(&state);
        let mut draft = Draft::new(Arc::new(state));
        let report = errors.validate(&program, &store_rows, &mut draft, &root);
        assert_eq!(report.mode, ValidateMode::Submit);
        assert_eq!(report.changed.len(), 2);
        assert!(draft.get("errors.items.rows.doc::r0").is_some());
        assert!(draft.get("errors.items.rows.doc::r1").is_some());

        // Swap rows 0 and 2: the errors stay with row-0 and row-1.
        draft.set(
            "items",
            json!([
                { "id": "row-2", "name": "y" },
                { "id": "row-1", "name": "x" },
                { "id": "row-0", "name": "x" },
            ]),
        );
        store_rows.reconcile_all(draft.value());
        let report = errors.validate(&program, &store_rows, &mut draft, &root);
        assert!(report.changed.is_empty(), "no error flaps on reorder");

        // Remove row-0: its error and row-1's duplicate error both clear.
        draft.set(
            "items",
            json!([
                { "id": "row-2", "name": "y" },
                { "id": "row-1", "name": "x" },
            ]),
        );
        let removed = store_rows.reconcile_all(draft.value());
        assert_eq!(removed.len(), 1);
        let cleared = errors.forget_rows(&program, &removed, &mut draft);
        assert_eq!(cleared, vec!["errors.items.rows.doc::r0".to_owned()]);
        assert!(draft.get("errors.items.rows.doc::r1").is_some());
        errors.validate(&program, &store_rows, &mut draft, &root);
        assert!(errors.is_empty());
        assert_eq!(draft.get("errors.items"), None, "no residue");
    }

    #[test]
    fn field_checks_write_and_clear() {
        let program = Program::builder("m")
            .rule(RuleDecl::new(
                "age",
                Check::new()
                    .rule("min", ["age"], |v, _| {
                        (v.as_i64().unwrap_or(0) < 18).then(|| json!({ "min": "too young" }))
                    })
                    .rule("max", ["age"], |v, _| {
                        (v.as_i64().unwrap_or(0) < 0).then(|| json!({ "min": "negative" }))
                    }),
            ))
            .build()
            .unwrap();
        let rows = RowIdStore::new("doc");
        let mut errors = ErrorStore::new();
        let mut draft = Draft::new(Arc::new(json!({ "age": -1 })));
        let field = [ValidateRequest::new(
            ValidateMode::Blur,
            ValidateTarget::Field {
                path: "age".to_owned(),
            },
        )];
        errors.validate(&program, &rows, &mut draft, &field);
        assert_eq!(
            draft.get("errors.age"),
            Some(&json!({ "min": ["negative", "too young"] }))
        );

        let again = errors.validate(&program, &rows, &mut draft, &field);
        assert!(again.changed.is_empty(), "idempotent");

        draft.set("age", json!(30));
        errors.validate(&program, &rows, &mut draft, &field);
        assert_eq!(draft.get("errors.age"), None);
    }

    #[test]
    fn item_target_binds_one_row() {
        let program = Program::builder("m")
            .rule(RuleDecl::new(
                "items",
                ListRule::new().item_check(Check::new().rule("qty", ["qty"], |v, _| {
                    (v.get("qty").and_then(Value::as_i64).unwrap_or(0) <= 0)
                        .then(|| json!("qty must be positive"))
                })),
            ))
            .build()
            .unwrap();
        let mut rows = RowIdStore::new("doc");
        rows.track("items", None);
        let state = json!({ "items": [{ "qty": 0 }, { "qty": 0 }] });
        rows.reconcile_all(&state);
        let mut draft = Draft::new(Arc::new(state));
        let mut errors = ErrorStore::new();
        let report = errors.validate(
            &program,
            &rows,
            &mut draft,
            &[ValidateRequest::new(
                ValidateMode::ValueChange,
                ValidateTarget::Item {
                    path: "items".to_owned(),
                    index: 1,
                    field: Some("qty".to_owned()),
                },
            )],
        );
        assert_eq!(report.rows, 1);
        assert_eq!(errors.len(), 1);
        assert!(draft.get("errors.items.rows.doc::r1").is_some());
        assert!(draft.get("errors.items.rows.doc::r0").is_none());
    }

    #[test]
    fn merge_rules() {
        assert_eq!(merge_outputs(vec![]), None);
        assert_eq!(merge_outputs(vec![json!("a")]), Some(json!("a")));
        assert_eq!(
            merge_outputs(vec![json!("a"), json!({ "b": 1 })]),
            Some(json!(["a", { "b": 1 }]))
        );
        assert_eq!(
            merge_outputs(vec![json!({ "a": 1 }), json!({ "b": 2 })]),
            Some(json!({ "a": 1, "b": 2 }))
        );
    }
}
