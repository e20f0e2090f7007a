// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Merging rule contributions from several origins into one rule set.
//!
//! A module contributes its own declarations; reusable logic units may add
//! more. Assembly collects every conflict (not just the first) so that a
//! misconfigured module fails once with the complete picture.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::rule::{ClaimKind, RuleDecl};

/// Kind of contributor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    /// The module's own declarations.
    Module,
    /// A reusable logic unit mounted on the module.
    LogicUnit,
}

/// Where a declaration came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Contributor kind.
    pub origin_type: OriginType,
    /// Contributor id.
    pub origin_id: String,
    /// Human-readable label.
    pub origin_label: String,
}

impl Provenance {
    /// Provenance of a module's own declarations.
    pub fn module(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            origin_type: OriginType::Module,
            origin_label: format!("module:{id}"),
            origin_id: id,
        }
    }

    /// Provenance of a logic unit.
    pub fn logic_unit(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            origin_type: OriginType::LogicUnit,
            origin_id: id.into(),
            origin_label: label.into(),
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin_label)
    }
}

/// Declarations from one contributor.
#[derive(Clone, Debug)]
pub struct Contribution {
    /// Who contributed.
    pub provenance: Provenance,
    /// What was contributed.
    pub decls: Vec<RuleDecl>,
}

/// Kind of assembly conflict.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two declarations claim the same slot of the same path.
    DuplicateRule,
    /// A declaration requires a path nobody declares.
    MissingRequires,
    /// A declaration excludes a path that is declared.
    ExcludesViolation,
}

/// One assembly conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConflict {
    /// What went wrong.
    pub kind: ConflictKind,
    /// Declared path the conflict is about.
    pub path: String,
    /// Slot involved, for duplicates.
    pub slot: Option<ClaimKind>,
    /// Every contributor involved, sorted.
    pub sources: Vec<Provenance>,
    /// Required paths with no declaration.
    pub missing: Vec<String>,
    /// Excluded paths that are declared.
    pub present: Vec<String>,
}

impl fmt::Display for RuleConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<&str> = self
            .sources
            .iter()
            .map(|p| p.origin_label.as_str())
            .collect();
        match self.kind {
            ConflictKind::DuplicateRule => write!(
                f,
                "duplicate rule at `{}` ({:?}) from [{}]",
                self.path,
                self.slot.unwrap_or(ClaimKind::Writer),
                sources.join(", ")
            ),
            ConflictKind::MissingRequires => write!(
                f,
                "`{}` requires missing [{}] (from [{}])",
                self.path,
                self.missing.join(", "),
                sources.join(", ")
            ),
            ConflictKind::ExcludesViolation => write!(
                f,
                "`{}` excludes present [{}] (from [{}])",
                self.path,
                self.present.join(", "),
                sources.join(", ")
            ),
        }
    }
}

/// Assembly failed; every conflict is listed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyError {
    /// Module being assembled.
    pub module_id: String,
    /// Sorted conflicts.
    pub conflicts: Vec<RuleConflict>,
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule assembly for module `{}` failed with {} conflict(s)",
            self.module_id,
            self.conflicts.len()
        )?;
        for conflict in &self.conflicts {
            write!(f, "\n  - {conflict}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AssemblyError {}

/// A declaration together with its origin.
#[derive(Clone, Debug)]
pub struct AssembledDecl {
    /// The declaration.
    pub decl: RuleDecl,
    /// Its contributor.
    pub provenance: Provenance,
}

/// The conflict-free, deterministically ordered result of assembly.
#[derive(Clone, Debug)]
pub struct AssembledRules {
    module_id: String,
    entries: Vec<AssembledDecl>,
}

impl AssembledRules {
    /// Module id.
    #[must_use]
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Declarations sorted by path (then kind, then provenance).
    #[must_use]
    pub fn entries(&self) -> &[AssembledDecl] {
        &self.entries
    }

    /// Returns the provenance of the declaration that claims `path`.
    #[must_use]
    pub fn provenance_of(&self, path: &str) -> Option<&Provenance> {
        self.entries
            .iter()
            .find(|e| e.decl.claims().iter().any(|(p, _)| p == path))
            .map(|e| &e.provenance)
    }
}

/// Merges contributions and reports every conflict.
///
/// The output order does not depend on the order of `contributions`.
///
/// # Errors
///
/// Returns [`AssemblyError`] with all duplicate, missing-requires and
/// excludes conflicts, sorted by kind then path.
pub fn assemble(
    module_id: &str,
    contributions: impl IntoIterator<Item = Contribution>,
) -> Result<AssembledRules, AssemblyError> {
    let mut entries: Vec<AssembledDecl> = contributions
        .into_iter()
        .flat_map(|c| {
            let provenance = c.provenance;
            c.decls.into_iter().map(move |decl| AssembledDecl {
                decl,
                provenance: provenance.clone(),
            })
        })
        .collect();

    let mut claims: BTreeMap<(String, ClaimKind), Vec<Provenance>> = BTreeMap::new();
    for entry in &entries {
        for claim in entry.decl.claims() {
            claims
                .entry(claim)
                .or_default()
                .push(entry.provenance.clone());
        }
    }
    let is_declared = |path: &str| claims.keys().any(|(p, _)| p == path);

    let mut conflicts = Vec::new();
    for ((path, slot), sources) in &claims {
        if sources.len() > 1 {
            let mut sources = sources.clone();
            sources.sort();
            conflicts.push(RuleConflict {
                kind: ConflictKind::DuplicateRule,
                path: path.clone(),
                slot: Some(*slot),
                sources,
                missing: Vec::new(),
                present: Vec::new(),
            });
        }
    }
    for entry in &entries {
        let missing: Vec<String> = entry
            .decl
            .requires
            .iter()
            .filter(|r| !is_declared(r))
            .cloned()
            .collect();
        if !missing.is_empty() {
            conflicts.push(RuleConflict {
                kind: ConflictKind::MissingRequires,
                path: entry.decl.path.clone(),
                slot: None,
                sources: vec![entry.provenance.clone()],
                missing,
                present: Vec::new(),
            });
        }
        let present: Vec<String> = entry
            .decl
            .excludes
            .iter()
            .filter(|x| is_declared(x))
            .cloned()
            .collect();
        if !present.is_empty() {
            conflicts.push(RuleConflict {
                kind: ConflictKind::ExcludesViolation,
                path: entry.decl.path.clone(),
                slot: None,
                sources: vec![entry.provenance.clone()],
                missing: Vec::new(),
                present,
            });
        }
    }

    if !conflicts.is_empty() {
        conflicts.sort_by(|a, b| {
            (a.kind, &a.path, &a.sources).cmp(&(b.kind, &b.path, &b.sources))
        });
        return Err(AssemblyError {
            module_id: module_id.to_owned(),
            conflicts,
        });
    }

    entries.sort_by(|a, b| {
        (a.decl.path.as_str(), a.decl.rule.kind_name(), &a.provenance).cmp(&(
            b.decl.path.as_str(),
            b.decl.rule.kind_name(),
            &b.provenance,
        ))
    });
    Ok(AssembledRules {
        module_id: module_id.to_owned(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Check, Rule};
    use serde_json::json;

    fn computed(deps: &[&str]) -> Rule {
        let deps: Vec<String> = deps.iter().map(|d| (*d).to_owned()).collect();
        Rule::computed(deps, |_| Ok(json!(null)))
    }

    #[test]
    fn reports_all_conflicts_sorted() {
        let module = Contribution {
            provenance: Provenance::module("m"),
            decls: vec![
                RuleDecl::new("total", computed(&["a"])),
                RuleDecl::new("summary", computed(&["total"])).requires(["audit"]),
            ],
        };
        let unit = Contribution {
            provenance: Provenance::logic_unit("u1", "pricing"),
            decls: vec![
                RuleDecl::new("total", computed(&["b"])),
                RuleDecl::new("discount", computed(&["a"])).excludes(["total"]),
            ],
        };

        let err = assemble("m", [unit, module]).unwrap_err();
        let kinds: Vec<_> = err.conflicts.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConflictKind::DuplicateRule,
                ConflictKind::MissingRequires,
                ConflictKind::ExcludesViolation,
            ]
        );

        let dup = &err.conflicts[0];
        assert_eq!(dup.path, "total");
        assert_eq!(dup.sources.len(), 2, "both contributors are listed");
        assert_eq!(dup.sources[0].origin_type, OriginType::Module);

        assert_eq!(err.conflicts[1].missing, vec!["audit".to_owned()]);
        assert_eq!(err.conflicts[2].present, vec!["total".to_owned()]);

        let text = err.to_string();
        assert!(text.contains("3 conflict(s)"), "{text}");
        assert!(text.contains("pricing"), "{text}");
    }

    #[test]
    fn writer_and_check_on_same_path_do_not_conflict() {
        let module = Contribution {
            provenance: Provenance::module("m"),
            decls: vec![
                RuleDecl::new("age", computed(&["birthYear"])),
                RuleDecl::new("age", Check::new().rule("range", ["age"], |_, _| None)),
            ],
        };
        let rules = assemble("m", [module]).unwrap();
        assert_eq!(rules.entries().len(), 2);
        // "check" sorts before "computed".
        assert_eq!(rules.entries()[0].decl.rule.kind_name(), "check");
    }

    #[test]
    fn output_order_ignores_contribution_order() {
        let a = || Contribution {
            provenance: Provenance::module("m"),
            decls: vec![RuleDecl::new("b", computed(&["x"]))],
        };
        let b = || Contribution {
            provenance: Provenance::logic_unit("u", "unit"),
            decls: vec![RuleDecl::new("a", computed(&["x"]))],
        };
        let one = assemble("m", [a(), b()]).unwrap();
        let two = assemble("m", [b(), a()]).unwrap();
        let paths = |r: &AssembledRules| {
            r.entries()
                .iter()
                .map(|e| e.decl.path.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(paths(&one), paths(&two));
        assert_eq!(paths(&one), vec!["a".to_owned(), "b".to_owned()]);
    }
}
