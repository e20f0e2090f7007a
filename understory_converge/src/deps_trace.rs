// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Checking declared dependencies against observed reads.

use core::cell::RefCell;

use serde::Serialize;
use serde_json::Value;

use crate::path::FieldPath;
use crate::plan::StepKind;
use crate::rule::StateView;

/// A [`StateView`] that records every path read through it.
pub struct TracingView<'a> {
    inner: &'a dyn StateView,
    reads: RefCell<Vec<String>>,
}

impl core::fmt::Debug for TracingView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TracingView")
            .field("reads", &self.reads.borrow())
            .finish_non_exhaustive()
    }
}

impl<'a> TracingView<'a> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: &'a dyn StateView) -> Self {
        Self {
            inner,
            reads: RefCell::new(Vec::new()),
        }
    }

    /// The recorded reads, in order.
    #[must_use]
    pub fn into_reads(self) -> Vec<String> {
        self.reads.into_inner()
    }
}

impl StateView for TracingView<'_> {
    fn read(&self, path: &str) -> Option<&Value> {
        self.reads.borrow_mut().push(path.to_owned());
        self.inner.read(path)
    }
}

/// Difference between declared and observed dependencies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsDiff {
    /// Normalized reads, sorted and deduplicated.
    pub reads: Vec<String>,
    /// Normalized declared deps.
    pub declared: Vec<String>,
    /// Reads not covered by any declared dep.
    pub missing: Vec<String>,
    /// Declared deps that no read touched.
    pub unused: Vec<String>,
}

impl DepsDiff {
    /// Returns `true` if declared and observed deps disagree.
    #[must_use]
    pub fn is_mismatch(&self) -> bool {
        !self.missing.is_empty() || !self.unused.is_empty()
    }
}

/// A step whose declared deps disagree with what it read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsMismatch {
    /// Step kind.
    pub kind: StepKind,
    /// Step label.
    pub step: String,
    /// Declared output path.
    pub field_path: String,
    /// The disagreement.
    pub diff: DepsDiff,
}

/// Compares declared deps with observed reads.
///
/// A read is covered when a declared dep equals it or is one of its
/// ancestors. A declared dep is used when some read overlaps it. Paths that
/// do not parse are compared verbatim.
#[must_use]
pub fn diff_deps<D: AsRef<str>, R: AsRef<str>>(declared: &[D], reads: &[R]) -> DepsDiff {
    let declared = normalize(declared);
    let reads = normalize(reads);
    let missing = reads
        .iter()
        .filter(|read| !declared.iter().any(|dep| dep.is_prefix_of(read)))
        .map(|p| p.as_str().to_owned())
        .collect();
    let unused = declared
        .iter()
        .filter(|dep| !reads.iter().any(|read| dep.overlaps(read)))
        .map(|p| p.as_str().to_owned())
        .collect();
    DepsDiff {
        reads: reads.iter().map(|p| p.as_str().to_owned()).collect(),
        declared: declared.iter().map(|p| p.as_str().to_owned()).collect(),
        missing,
        unused,
    }
}

fn normalize<S: AsRef<str>>(paths: &[S]) -> Vec<FieldPath> {
    let mut out: Vec<FieldPath> = paths
        .iter()
        .filter_map(|p| FieldPath::parse(p.as_ref()).ok())
        .collect();
    out.sort();
    out.dedup();
    out
}
