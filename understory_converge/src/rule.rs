// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rule declarations: how derived fields, links, sources and checks are
//! described before they are assembled into a program.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::{LIST_MARKER, get_at, join_concrete};
use crate::rowid::RowId;
use crate::validate::ValidateMode;

/// Read-only access to (a scope of) the document.
///
/// Rule functions receive a `&dyn StateView`; there is no way to write
/// through it. Paths are concrete and relative to the view's scope (the whole
/// document for field rules, one row for list-item rules).
pub trait StateView {
    /// Reads the value at `path`.
    fn read(&self, path: &str) -> Option<&Value>;

    /// Reads a number.
    fn read_f64(&self, path: &str) -> Option<f64> {
        self.read(path).and_then(Value::as_f64)
    }

    /// Reads an integer.
    fn read_i64(&self, path: &str) -> Option<i64> {
        self.read(path).and_then(Value::as_i64)
    }

    /// Reads a string.
    fn read_str(&self, path: &str) -> Option<&str> {
        self.read(path).and_then(Value::as_str)
    }

    /// Reads a boolean.
    fn read_bool(&self, path: &str) -> Option<bool> {
        self.read(path).and_then(Value::as_bool)
    }
}

impl StateView for Value {
    fn read(&self, path: &str) -> Option<&Value> {
        get_at(self, path)
    }
}

/// Error raised by a rule function.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RuleError {
    message: String,
}

impl RuleError {
    /// Creates an error with a human-readable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Derivation function of a computed field.
pub type DeriveFn = Arc<dyn Fn(&dyn StateView) -> Result<Value, RuleError> + Send + Sync>;
/// Custom equality used to decide whether a derived value changed.
pub type EqualsFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;
/// Key function of a source; `None` means "no key, stay idle".
pub type KeyFn = Arc<dyn Fn(&dyn StateView) -> Result<Option<Value>, RuleError> + Send + Sync>;
/// Validation function; `None` means "no error".
pub type ValidateFn = Arc<dyn Fn(&Value, &CheckContext<'_>) -> Option<Value> + Send + Sync>;

/// Context handed to validation functions.
#[derive(Debug)]
pub struct CheckContext<'a> {
    /// The whole document.
    pub state: &'a Value,
    /// Concrete path of the validated value (`""` for the root).
    pub path: &'a str,
    /// Row index for list-item checks.
    pub index: Option<usize>,
    /// Stable row id for list-item checks.
    pub row_id: Option<&'a RowId>,
    /// Why validation runs.
    pub mode: ValidateMode,
}

/// A field whose value is a pure function of other fields.
#[derive(Clone)]
pub struct Computed {
    /// Declared dependency paths.
    pub deps: Vec<String>,
    /// The derivation.
    pub derive: DeriveFn,
    /// Optional custom equality (defaults to `==`).
    pub equals: Option<EqualsFn>,
}

impl Computed {
    /// Creates a computed rule.
    pub fn new<D, S, F>(deps: D, derive: F) -> Self
    where
        D: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&dyn StateView) -> Result<Value, RuleError> + Send + Sync + 'static,
    {
        Self {
            deps: deps.into_iter().map(Into::into).collect(),
            derive: Arc::new(derive),
            equals: None,
        }
    }

    /// Uses `equals` instead of `==` to detect changes.
    #[must_use]
    pub fn with_equals(
        mut self,
        equals: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.equals = Some(Arc::new(equals));
        self
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("deps", &self.deps)
            .field("derive", &"<fn>")
            .field("equals", &self.equals.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A field that mirrors another field.
#[derive(Clone, Debug)]
pub struct Link {
    /// Path copied from.
    pub from: String,
}

/// How overlapping loads for the same source target are handled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConcurrency {
    /// A newer request cancels the in-flight one.
    #[default]
    Switch,
    /// Keep the in-flight load; run only the latest request after it.
    ExhaustTrailing,
}

/// A field holding a resource snapshot loaded asynchronously.
#[derive(Clone)]
pub struct Source {
    /// Declared dependency paths (inputs of the key function).
    pub deps: Vec<String>,
    /// Resource id used to find the loader.
    pub resource: String,
    /// Computes the request key from the state.
    pub key: KeyFn,
    /// Overlap policy for in-flight loads.
    pub concurrency: SourceConcurrency,
}

impl Source {
    /// Creates a source rule.
    pub fn new<D, S, F>(resource: impl Into<String>, deps: D, key: F) -> Self
    where
        D: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&dyn StateView) -> Result<Option<Value>, RuleError> + Send + Sync + 'static,
    {
        Self {
            deps: deps.into_iter().map(Into::into).collect(),
            resource: resource.into(),
            key: Arc::new(key),
            concurrency: SourceConcurrency::default(),
        }
    }

    /// Sets the concurrency mode.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: SourceConcurrency) -> Self {
        self.concurrency = concurrency;
        self
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("deps", &self.deps)
            .field("resource", &self.resource)
            .field("key", &"<fn>")
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// One named validation rule.
#[derive(Clone)]
pub struct CheckRule {
    /// Declared dependency paths.
    pub deps: Vec<String>,
    /// The validation.
    pub validate: ValidateFn,
}

impl fmt::Debug for CheckRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRule")
            .field("deps", &self.deps)
            .field("validate", &"<fn>")
            .finish()
    }
}

/// A set of named validation rules anchored at one field.
///
/// Rules run in name order and their outputs are merged.
#[derive(Clone, Debug, Default)]
pub struct Check {
    /// Rules by name.
    pub rules: BTreeMap<String, CheckRule>,
}

impl Check {
    /// Creates an empty check.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named rule.
    #[must_use]
    pub fn rule<D, S, F>(mut self, name: impl Into<String>, deps: D, validate: F) -> Self
    where
        D: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value, &CheckContext<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        self.rules.insert(
            name.into(),
            CheckRule {
                deps: deps.into_iter().map(Into::into).collect(),
                validate: Arc::new(validate),
            },
        );
        self
    }

    /// Returns the union of all rules' deps, sorted and deduplicated.
    #[must_use]
    pub fn deps(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .rules
            .values()
            .flat_map(|r| r.deps.iter().cloned())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }
}

/// Per-row rules and checks for an array field.
#[derive(Clone, Debug, Default)]
pub struct ListRule {
    /// Item field used as the row identity key.
    pub track_by: Option<String>,
    /// Writers evaluated once per row, keyed by item-relative path.
    pub item: Vec<(String, Rule)>,
    /// Check run once per row (deps are item-relative).
    pub item_check: Option<Check>,
    /// Check run over the whole array (deps are item-relative).
    pub list_check: Option<Check>,
}

impl ListRule {
    /// Creates an empty list rule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks row identity by the given item field.
    #[must_use]
    pub fn track_by(mut self, field: impl Into<String>) -> Self {
        self.track_by = Some(field.into());
        self
    }

    /// Adds a per-row writer at an item-relative path.
    #[must_use]
    pub fn item(mut self, path: impl Into<String>, rule: impl Into<Rule>) -> Self {
        self.item.push((path.into(), rule.into()));
        self
    }

    /// Sets the per-row check.
    #[must_use]
    pub fn item_check(mut self, check: Check) -> Self {
        self.item_check = Some(check);
        self
    }

    /// Sets the list-scope check.
    #[must_use]
    pub fn list_check(mut self, check: Check) -> Self {
        self.list_check = Some(check);
        self
    }
}

/// A rule attached to a field path.
#[derive(Clone, Debug)]
pub enum Rule {
    /// Derived value.
    Computed(Computed),
    /// Mirror of another field.
    Link(Link),
    /// Asynchronously loaded resource snapshot.
    Source(Source),
    /// Per-row rules for an array.
    List(ListRule),
    /// Check-only node (field or root validation anchor).
    Node(Check),
}

impl Rule {
    /// Shorthand for a computed rule.
    pub fn computed<D, S, F>(deps: D, derive: F) -> Self
    where
        D: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&dyn StateView) -> Result<Value, RuleError> + Send + Sync + 'static,
    {
        Self::Computed(Computed::new(deps, derive))
    }

    /// Shorthand for a link rule.
    pub fn link(from: impl Into<String>) -> Self {
        Self::Link(Link { from: from.into() })
    }

    /// Shorthand for a check-only node.
    #[must_use]
    pub fn check(check: Check) -> Self {
        Self::Node(check)
    }

    /// Short name of the rule kind, used in step labels.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Computed(_) => "computed",
            Self::Link(_) => "link",
            Self::Source(_) => "source",
            Self::List(_) => "list",
            Self::Node(_) => "check",
        }
    }
}

impl From<Computed> for Rule {
    fn from(rule: Computed) -> Self {
        Self::Computed(rule)
    }
}

impl From<Link> for Rule {
    fn from(rule: Link) -> Self {
        Self::Link(rule)
    }
}

impl From<Source> for Rule {
    fn from(rule: Source) -> Self {
        Self::Source(rule)
    }
}

impl From<ListRule> for Rule {
    fn from(rule: ListRule) -> Self {
        Self::List(rule)
    }
}

impl From<Check> for Rule {
    fn from(check: Check) -> Self {
        Self::Node(check)
    }
}

/// Which slot of a path a declaration occupies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Writes the field's value.
    Writer,
    /// Validates the field.
    Check,
}

/// A rule attached to a declared path, plus assembly metadata.
#[derive(Clone, Debug)]
pub struct RuleDecl {
    /// Declared path (`$root`, `a.b`, `items[].total`, ...).
    pub path: String,
    /// The rule.
    pub rule: Rule,
    /// Paths that must also carry a declaration.
    pub requires: Vec<String>,
    /// Paths that must not carry a declaration.
    pub excludes: Vec<String>,
}

impl RuleDecl {
    /// Attaches `rule` to `path`.
    pub fn new(path: impl Into<String>, rule: impl Into<Rule>) -> Self {
        Self {
            path: path.into(),
            rule: rule.into(),
            requires: Vec::new(),
            excludes: Vec::new(),
        }
    }

    /// Adds required declarations.
    #[must_use]
    pub fn requires<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.requires.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Adds excluded declarations.
    #[must_use]
    pub fn excludes<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.excludes.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Returns the `(declared path, slot)` pairs this declaration occupies.
    ///
    /// A list declaration claims the list itself, each per-row writer, and
    /// the anchors of its checks (`items` for the list scope, `items[]` for
    /// rows).
    #[must_use]
    pub fn claims(&self) -> Vec<(String, ClaimKind)> {
        match &self.rule {
            Rule::Computed(_) | Rule::Link(_) | Rule::Source(_) => {
                vec![(self.path.clone(), ClaimKind::Writer)]
            }
            Rule::Node(_) => vec![(self.path.clone(), ClaimKind::Check)],
            Rule::List(list) => {
                let row = format!("{}{LIST_MARKER}", self.path);
                let mut out = vec![(self.path.clone(), ClaimKind::Writer)];
                out.extend(
                    list.item
                        .iter()
                        .map(|(rel, _)| (join_concrete(&row, rel), ClaimKind::Writer)),
                );
                if list.item_check.is_some() {
                    out.push((row, ClaimKind::Check));
                }
                if list.list_check.is_some() {
                    out.push((self.path.clone(), ClaimKind::Check));
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_is_a_state_view() {
        let doc = json!({ "a": { "b": 2 }, "s": "x", "f": true });
        let view: &dyn StateView = &doc;
        assert_eq!(view.read_i64("a.b"), Some(2));
        assert_eq!(view.read_f64("a.b"), Some(2.0));
        assert_eq!(view.read_str("s"), Some("x"));
        assert_eq!(view.read_bool("f"), Some(true));
        assert_eq!(view.read("missing"), None);
    }

    #[test]
    fn list_claims_cover_rows_and_checks() {
        let decl = RuleDecl::new(
            "items",
            ListRule::new()
                .item("total", Rule::link("price"))
                .item_check(Check::new().rule("r", ["qty"], |_, _| None))
                .list_check(Check::new().rule("dup", ["sku"], |_, _| None)),
        );
        assert_eq!(
            decl.claims(),
            vec![
                ("items".to_owned(), ClaimKind::Writer),
                ("items[].total".to_owned(), ClaimKind::Writer),
                ("items[]".to_owned(), ClaimKind::Check),
                ("items".to_owned(), ClaimKind::Check),
            ]
        );
    }

    #[test]
    fn check_deps_are_merged() {
        let check = Check::new()
            .rule("b", ["y", "x"], |_, _| None)
            .rule("a", ["x"], |_, _| None);
        assert_eq!(check.deps(), vec!["x".to_owned(), "y".to_owned()]);
        let names: Vec<_> = check.rules.keys().cloned().collect();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }
}
