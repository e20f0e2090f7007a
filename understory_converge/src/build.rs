// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compiling assembled rules into a dependency graph, an execution plan and
//! a field-path registry.
//!
//! Build happens once per program. Everything that can be wrong with a rule
//! set (duplicate declarations, missing requirements, exclusions, cycles,
//! malformed paths) is reported here, before any document exists.

use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use understory_dirty::DirtyGraph;

use crate::assembly::{AssembledDecl, AssemblyError, Contribution, Provenance, assemble};
use crate::digest::Fnv1a;
use crate::path::{
    FieldPath, LIST_MARKER, PathError, ROOT_PATH, is_root_path, list_marker_count,
    split_list_item,
};
use crate::plan::{ExecutionPlan, Step, StepId, StepRule, StepScope};
use crate::registry::{FieldPathRegistry, RootId};
use crate::rule::{Check, Rule, RuleDecl};

/// Error returned by [`ProgramBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Contributions conflict.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    /// A declared path is malformed.
    #[error(transparent)]
    Path(#[from] PathError),
    /// The dependency graph has a cycle; `path` starts and ends on the same
    /// node.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle {
        /// Node keys along the cycle.
        path: Vec<String>,
    },
    /// A path uses more than one list marker.
    #[error("nested list paths are not supported: `{path}`")]
    NestedList {
        /// The offending path.
        path: String,
    },
    /// A rule is attached somewhere it cannot live.
    #[error("invalid rule at `{path}`: {reason}")]
    InvalidRule {
        /// Declared path.
        path: String,
        /// What is wrong.
        reason: &'static str,
    },
}

/// Kind of a dependency-graph node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A plain field that is only read.
    Input,
    /// Derived value.
    Computed,
    /// Mirror of another field.
    Link,
    /// Resource snapshot.
    Source,
    /// Array field with per-row rules.
    List,
    /// Check anchor.
    Check,
}

/// One node of the dependency graph.
#[derive(Clone, Debug)]
pub struct GraphNode {
    /// Declared key (`age`, `items[].total`, `$root`, ...).
    pub key: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Normalized path of the node.
    pub path: FieldPath,
}

/// Rule dependency graph.
///
/// Edges point from a node to the nodes it depends on. A field that carries
/// both a writer and a check has two nodes with the same key.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    edges: DirtyGraph<u32>,
}

impl DependencyGraph {
    /// All nodes in creation order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Keys of the nodes that `key` depends on.
    #[must_use]
    pub fn dependencies_of(&self, key: &str) -> Vec<&str> {
        self.neighbors(key, |g, n| g.edges.dependencies(n).collect())
    }

    /// Keys of the nodes that depend on `key`.
    #[must_use]
    pub fn dependents_of(&self, key: &str) -> Vec<&str> {
        self.neighbors(key, |g, n| g.edges.dependents(n).collect())
    }

    /// Returns the keys of every node downstream of `target`, including the
    /// nodes that represent `target` itself.
    ///
    /// `target` is a declared path; it matches every non-check node whose
    /// path overlaps it. The root matches everything.
    #[must_use]
    pub fn reverse_closure(&self, target: &str) -> Vec<String> {
        let Ok(target) = FieldPath::parse(target) else {
            return Vec::new();
        };
        let seeds = self.nodes.iter().enumerate().filter(|(_, node)| {
            target.is_root() || (node.kind != NodeKind::Check && node.path.overlaps(&target))
        });
        let mut reached = self.edges.reverse_closure(seeds.map(|(index, _)| index_u32(index)));
        reached.sort_unstable();
        let mut keys: Vec<String> = Vec::with_capacity(reached.len());
        for index in reached {
            let key = &self.nodes[index as usize].key;
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    fn neighbors(&self, key: &str, f: impl Fn(&Self, u32) -> Vec<u32>) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.key != key {
                continue;
            }
            for n in f(self, index_u32(index)) {
                let other = self.nodes[n as usize].key.as_str();
                if !out.contains(&other) {
                    out.push(other);
                }
            }
        }
        out
    }

    fn add(&mut self, key: String, kind: NodeKind, path: FieldPath) -> u32 {
        let index = index_u32(self.nodes.len());
        self.nodes.push(GraphNode { key, kind, path });
        self.edges.add_node(index);
        index
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "node counts are bounded by the number of declared paths"
)]
fn index_u32(index: usize) -> u32 {
    index as u32
}

/// Position of a check node in its program.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CheckId(pub(crate) u32);

impl CheckId {
    /// Returns this id as a table index.
    #[inline]
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// What a check validates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckScope {
    /// The whole document (`$root`).
    Root,
    /// One field.
    Field,
    /// Every row of a list, one at a time.
    ListItem {
        /// Concrete list path.
        list: String,
    },
    /// A list as a whole.
    List {
        /// Concrete list path.
        list: String,
    },
}

/// A compiled check.
#[derive(Clone, Debug)]
pub struct CheckNode {
    pub(crate) id: CheckId,
    pub(crate) anchor: String,
    pub(crate) target: String,
    pub(crate) scope: CheckScope,
    pub(crate) check: Check,
    pub(crate) deps: Vec<FieldPath>,
    pub(crate) provenance: Provenance,
}

impl CheckNode {
    /// Position in the program.
    #[must_use]
    pub fn id(&self) -> CheckId {
        self.id
    }

    /// Declared anchor (`$root`, `age`, `items[]`, `items`).
    #[must_use]
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// Concrete path of the validated value (`""` for the root, the list
    /// path for row and list checks).
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Scope.
    #[must_use]
    pub fn scope(&self) -> &CheckScope {
        &self.scope
    }

    /// The check rules.
    #[must_use]
    pub fn check(&self) -> &Check {
        &self.check
    }

    /// Normalized absolute dependency paths, including the anchor.
    #[must_use]
    pub fn deps(&self) -> &[FieldPath] {
        &self.deps
    }

    /// Who declared the check.
    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

/// A list field with per-row rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListConfig {
    /// Concrete list path.
    pub path: String,
    /// Row identity field.
    pub track_by: Option<String>,
}

/// A compiled, immutable rule program.
///
/// Shared by every document instance built from the same rules.
#[derive(Clone, Debug)]
pub struct Program {
    module_id: String,
    graph: DependencyGraph,
    plan: ExecutionPlan,
    checks: Vec<CheckNode>,
    check_triggers: Vec<SmallVec<[CheckId; 2]>>,
    root_checks: Vec<CheckId>,
    lists: Vec<ListConfig>,
    registry: FieldPathRegistry,
}

impl Program {
    /// Starts building a program for `module_id`.
    pub fn builder(module_id: impl Into<String>) -> ProgramBuilder {
        ProgramBuilder::new(module_id)
    }

    /// Module id.
    #[must_use]
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Dependency graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Full execution plan.
    #[must_use]
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Field-path registry.
    #[must_use]
    pub fn registry(&self) -> &FieldPathRegistry {
        &self.registry
    }

    /// Compiled checks.
    #[must_use]
    pub fn checks(&self) -> &[CheckNode] {
        &self.checks
    }

    /// Lists with per-row rules or checks.
    #[must_use]
    pub fn lists(&self) -> &[ListConfig] {
        &self.lists
    }

    /// Graph-shape digest; namespaces plan-cache keys.
    #[must_use]
    pub fn digest(&self) -> u64 {
        self.plan.digest()
    }

    /// Checks to re-run when any of `roots` changed.
    ///
    /// Checks that depend on the root (`$root` deps) are always included
    /// when `roots` is not empty.
    #[must_use]
    pub fn checks_triggered_by(&self, roots: &[RootId]) -> Vec<CheckId> {
        if roots.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<CheckId> = self.root_checks.clone();
        for root in roots {
            if let Some(ids) = self.check_triggers.get(root.as_usize()) {
                out.extend_from_slice(ids);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Checks downstream of `roots`: those triggered by the roots themselves
    /// or by the output of any step in their reverse closure.
    #[must_use]
    pub fn checks_downstream_of(&self, roots: &[RootId]) -> Vec<CheckId> {
        let mut all: Vec<RootId> = roots.to_vec();
        all.extend(
            self.plan
                .affected(roots)
                .into_iter()
                .map(|id| self.plan.step(id).out_id()),
        );
        self.checks_triggered_by(&all)
    }

    /// Looks up a compiled check.
    #[must_use]
    pub fn check(&self, id: CheckId) -> &CheckNode {
        &self.checks[id.as_usize()]
    }

    /// Source steps whose declared output matches `path`.
    ///
    /// `path` may be declared (`items[].profile`) or normalized
    /// (`items.profile`).
    #[must_use]
    pub fn source_steps_at(&self, path: &str) -> Vec<StepId> {
        let Ok(wanted) = FieldPath::parse(path) else {
            return Vec::new();
        };
        self.plan
            .steps()
            .iter()
            .filter(|s| matches!(s.rule, StepRule::Source(_)) && s.out == wanted)
            .map(Step::id)
            .collect()
    }
}

/// Collects contributions and compiles them into a [`Program`].
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use understory_converge::{Program, Rule, RuleDecl};
///
/// let program = Program::builder("signup")
///     .rule(RuleDecl::new(
///         "isAdult",
///         Rule::computed(["age"], |s| Ok(json!(s.read_i64("age").unwrap_or(0) >= 18))),
///     ))
///     .build()
///     .unwrap();
/// assert_eq!(program.plan().len(), 1);
/// assert_eq!(program.graph().reverse_closure("age"), vec!["isAdult", "age"]);
/// ```
#[derive(Debug)]
pub struct ProgramBuilder {
    module_id: String,
    module_decls: Vec<RuleDecl>,
    contributions: Vec<Contribution>,
    shape: Option<Value>,
}

impl ProgramBuilder {
    /// Creates an empty builder.
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            module_decls: Vec::new(),
            contributions: Vec::new(),
            shape: None,
        }
    }

    /// Adds a declaration owned by the module itself.
    #[must_use]
    pub fn rule(mut self, decl: RuleDecl) -> Self {
        self.module_decls.push(decl);
        self
    }

    /// Adds several module declarations.
    #[must_use]
    pub fn rules(mut self, decls: impl IntoIterator<Item = RuleDecl>) -> Self {
        self.module_decls.extend(decls);
        self
    }

    /// Adds declarations from another contributor (typically a logic unit).
    #[must_use]
    pub fn contribute(mut self, provenance: Provenance, decls: Vec<RuleDecl>) -> Self {
        self.contributions.push(Contribution { provenance, decls });
        self
    }

    /// Seeds the registry with the object-key shape of a sample state so that
    /// writes to fields no rule mentions stay trackable.
    #[must_use]
    pub fn shape(mut self, sample: Value) -> Self {
        self.shape = Some(sample);
        self
    }

    /// Assembles, validates and compiles the program.
    ///
    /// # Errors
    ///
    /// See [`BuildError`].
    pub fn build(self) -> Result<Program, BuildError> {
        let Self {
            module_id,
            module_decls,
            mut contributions,
            shape,
        } = self;
        if !module_decls.is_empty() {
            contributions.push(Contribution {
                provenance: Provenance::module(module_id.as_str()),
                decls: module_decls,
            });
        }
        let assembled = assemble(&module_id, contributions)?;
        let mut lowered = Lowered::default();
        for entry in assembled.entries() {
            lowered.lower(entry)?;
        }
        let program = lowered.compile(module_id, shape.as_ref())?;
        tracing::debug!(
            module_id = program.module_id(),
            steps = program.plan().len(),
            checks = program.checks().len(),
            paths = program.registry().len(),
            digest = program.digest(),
            "program built"
        );
        Ok(program)
    }
}

struct WriterDraft {
    declared: String,
    target: String,
    out: FieldPath,
    deps_declared: Vec<String>,
    deps: Vec<FieldPath>,
    scope: StepScope,
    rule: StepRule,
    kind: NodeKind,
    provenance: Provenance,
}

struct CheckDraft {
    anchor: String,
    target: String,
    scope: CheckScope,
    check: Check,
    deps: Vec<FieldPath>,
    provenance: Provenance,
}

#[derive(Default)]
struct Lowered {
    writers: Vec<WriterDraft>,
    checks: Vec<CheckDraft>,
    lists: Vec<ListConfig>,
}

impl Lowered {
    fn lower(&mut self, entry: &AssembledDecl) -> Result<(), BuildError> {
        let decl = &entry.decl;
        let provenance = &entry.provenance;
        match &decl.rule {
            Rule::List(list) => {
                if list_marker_count(&decl.path) > 0 {
                    return Err(BuildError::NestedList {
                        path: decl.path.clone(),
                    });
                }
                let list_path = concrete(&decl.path)?;
                if list_path.is_empty() {
                    return Err(invalid(&decl.path, "the root cannot be a list"));
                }
                for (rel, rule) in &list.item {
                    let declared = format!("{}{LIST_MARKER}.{rel}", decl.path);
                    if list_marker_count(rel) > 0 {
                        return Err(BuildError::NestedList { path: declared });
                    }
                    self.writer(&declared, rule, Some(&list_path), provenance)?;
                }
                if let Some(check) = &list.item_check {
                    self.check(
                        format!("{}{LIST_MARKER}", decl.path),
                        CheckScope::ListItem {
                            list: list_path.clone(),
                        },
                        check,
                        provenance,
                    )?;
                }
                if let Some(check) = &list.list_check {
                    self.check(
                        decl.path.clone(),
                        CheckScope::List {
                            list: list_path.clone(),
                        },
                        check,
                        provenance,
                    )?;
                }
                self.lists.push(ListConfig {
                    path: list_path,
                    track_by: list.track_by.clone(),
                });
                Ok(())
            }
            Rule::Node(check) => match list_marker_count(&decl.path) {
                0 if is_root_path(&decl.path) => {
                    self.check(ROOT_PATH.to_owned(), CheckScope::Root, check, provenance)
                }
                0 => self.check(decl.path.clone(), CheckScope::Field, check, provenance),
                1 => match split_list_item(&decl.path) {
                    Some((list, "")) => {
                        let list = concrete(list)?;
                        self.check(
                            decl.path.clone(),
                            CheckScope::ListItem { list },
                            check,
                            provenance,
                        )
                    }
                    _ => Err(invalid(&decl.path, "row checks anchor at `list[]`")),
                },
                _ => Err(BuildError::NestedList {
                    path: decl.path.clone(),
                }),
            },
            rule => match list_marker_count(&decl.path) {
                0 => self.writer(&decl.path, rule, None, provenance),
                1 => {
                    let list = split_list_item(&decl.path)
                        .map(|(list, _)| list)
                        .unwrap_or_default();
                    let list = concrete(list)?;
                    self.writer(&decl.path, rule, Some(&list), provenance)
                }
                _ => Err(BuildError::NestedList {
                    path: decl.path.clone(),
                }),
            },
        }
    }

    fn writer(
        &mut self,
        declared: &str,
        rule: &Rule,
        list: Option<&str>,
        provenance: &Provenance,
    ) -> Result<(), BuildError> {
        if is_root_path(declared) {
            return Err(invalid(declared, "the root cannot be derived"));
        }
        let out = FieldPath::parse(declared)?;
        let target = match list {
            Some(_) => split_list_item(declared)
                .map(|(_, rel)| rel.to_owned())
                .unwrap_or_default(),
            None => out.as_str().to_owned(),
        };
        if target.is_empty() {
            return Err(invalid(declared, "a row writer needs a field"));
        }
        let (kind, step_rule, deps_declared) = match rule {
            Rule::Computed(computed) => (
                NodeKind::Computed,
                StepRule::Computed(computed.clone()),
                computed.deps.clone(),
            ),
            Rule::Link(link) => (
                NodeKind::Link,
                StepRule::Link {
                    from: FieldPath::parse(&link.from)?.as_str().to_owned(),
                },
                vec![link.from.clone()],
            ),
            Rule::Source(source) => (
                NodeKind::Source,
                StepRule::Source(source.clone()),
                source.deps.clone(),
            ),
            Rule::List(_) | Rule::Node(_) => {
                return Err(invalid(
                    declared,
                    "list rows only support computed, link and source rules",
                ));
            }
        };
        let deps = resolve_deps(&deps_declared, list)?;
        if deps.iter().any(FieldPath::is_root) {
            return Err(invalid(declared, "a writer cannot depend on the root"));
        }
        self.writers.push(WriterDraft {
            declared: declared.to_owned(),
            target,
            out,
            deps_declared,
            deps,
            scope: match list {
                Some(list) => StepScope::ListItem {
                    list: list.to_owned(),
                },
                None => StepScope::Field,
            },
            rule: step_rule,
            kind,
            provenance: provenance.clone(),
        });
        Ok(())
    }

    fn check(
        &mut self,
        anchor: String,
        scope: CheckScope,
        check: &Check,
        provenance: &Provenance,
    ) -> Result<(), BuildError> {
        let (list, target) = match &scope {
            CheckScope::Root => (None, String::new()),
            CheckScope::Field => (None, concrete(&anchor)?),
            CheckScope::ListItem { list } | CheckScope::List { list } => {
                (Some(list.as_str()), list.clone())
            }
        };
        let mut deps = resolve_deps(&check.deps(), list)?;
        if !target.is_empty() {
            deps.push(FieldPath::parse(&target)?);
        }
        deps.sort();
        deps.dedup();
        self.checks.push(CheckDraft {
            anchor,
            target,
            scope,
            check: check.clone(),
            deps,
            provenance: provenance.clone(),
        });
        Ok(())
    }

    fn compile(self, module_id: String, shape: Option<&Value>) -> Result<Program, BuildError> {
        let Self {
            writers,
            checks,
            lists,
        } = self;

        let mut graph = DependencyGraph::default();
        for writer in &writers {
            graph.add(writer.declared.clone(), writer.kind, writer.out.clone());
        }
        for list in &lists {
            graph.add(list.path.clone(), NodeKind::List, FieldPath::parse(&list.path)?);
        }
        let check_base = graph.nodes.len();
        for check in &checks {
            graph.add(check.anchor.clone(), NodeKind::Check, path_of(&check.target)?);
        }

        let mut consumers: Vec<(u32, &[FieldPath])> = writers
            .iter()
            .enumerate()
            .map(|(index, w)| (index_u32(index), w.deps.as_slice()))
            .collect();
        consumers.extend(
            checks
                .iter()
                .enumerate()
                .map(|(index, c)| (index_u32(check_base + index), c.deps.as_slice())),
        );
        for (from, deps) in consumers {
            for dep in deps {
                let mut exact = false;
                for (index, writer) in writers.iter().enumerate() {
                    if writer.out.overlaps(dep) {
                        exact |= writer.out == *dep;
                        graph.edges.add_dependency(from, index_u32(index));
                    }
                }
                if exact || dep.is_root() {
                    continue;
                }
                let input = graph
                    .nodes
                    .iter()
                    .position(|node| {
                        matches!(node.kind, NodeKind::Input | NodeKind::List) && node.path == *dep
                    })
                    .map(index_u32);
                let input = match input {
                    Some(input) => input,
                    None => graph.add(dep.as_str().to_owned(), NodeKind::Input, dep.clone()),
                };
                graph.edges.add_dependency(from, input);
            }
        }

        if let Some(cycle) = graph.edges.find_cycle() {
            return Err(BuildError::Cycle {
                path: cycle
                    .path
                    .iter()
                    .map(|&n| graph.nodes[n as usize].key.clone())
                    .collect(),
            });
        }
        let order: Vec<u32> = graph
            .edges
            .topological_order()
            .map_err(|cycle| BuildError::Cycle {
                path: cycle
                    .path
                    .iter()
                    .map(|&n| graph.nodes[n as usize].key.clone())
                    .collect(),
            })?;

        let mut registry = FieldPathRegistry::builder();
        for writer in &writers {
            registry.register(&writer.out);
            for dep in &writer.deps {
                registry.register(dep);
            }
        }
        for check in &checks {
            for dep in &check.deps {
                registry.register(dep);
            }
        }
        if let Some(shape) = shape {
            registry.register_shape(shape);
        }
        let registry = registry.finish();
        let id_of = |path: &FieldPath| -> Option<RootId> { registry.id_of(path) };

        let mut writers: Vec<Option<WriterDraft>> = writers.into_iter().map(Some).collect();
        let mut steps: Vec<Step> = Vec::with_capacity(writers.len());
        for node in order {
            let Some(draft) = writers.get_mut(node as usize).and_then(Option::take) else {
                continue;
            };
            let id = StepId(index_u32(steps.len()));
            let out_id = id_of(&draft.out).expect("writer outputs are registered");
            let dep_ids: SmallVec<[RootId; 4]> = draft.deps.iter().filter_map(id_of).collect();
            steps.push(Step {
                id,
                label: format!("{}:{}", kind_label(draft.kind), draft.declared),
                declared: draft.declared,
                target: draft.target,
                out: draft.out,
                out_id,
                deps: draft.deps_declared,
                dep_ids,
                scope: draft.scope,
                rule: draft.rule,
                provenance: draft.provenance,
            });
        }

        let mut triggers: Vec<SmallVec<[StepId; 4]>> = vec![SmallVec::new(); registry.len()];
        let mut digest = Fnv1a::new();
        for step in &steps {
            let mut touched: Vec<RootId> = Vec::new();
            for &id in step.dep_ids.iter().chain([&step.out_id]) {
                touched.extend(registry.overlapping(id));
            }
            touched.sort_unstable();
            touched.dedup();
            for id in touched {
                triggers[id.as_usize()].push(step.id);
            }
            digest.write_str(&step.label);
            for dep in &step.deps {
                digest.write_str(dep);
            }
            digest.write(b";");
        }

        let mut check_triggers: Vec<SmallVec<[CheckId; 2]>> =
            vec![SmallVec::new(); registry.len()];
        let mut root_checks = Vec::new();
        let checks: Vec<CheckNode> = checks
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let id = CheckId(index_u32(index));
                let mut touched: Vec<RootId> = Vec::new();
                for dep in &draft.deps {
                    if dep.is_root() {
                        root_checks.push(id);
                        continue;
                    }
                    if let Some(dep_id) = id_of(dep) {
                        touched.extend(registry.overlapping(dep_id));
                    }
                }
                touched.sort_unstable();
                touched.dedup();
                for root in touched {
                    check_triggers[root.as_usize()].push(id);
                }
                digest.write_str(&draft.anchor);
                for name in draft.check.rules.keys() {
                    digest.write_str(name);
                }
                CheckNode {
                    id,
                    anchor: draft.anchor,
                    target: draft.target,
                    scope: draft.scope,
                    check: draft.check,
                    deps: draft.deps,
                    provenance: draft.provenance,
                }
            })
            .collect();
        root_checks.dedup();

        Ok(Program {
            module_id,
            graph,
            plan: ExecutionPlan {
                steps,
                triggers,
                digest: digest.finish(),
            },
            checks,
            check_triggers,
            root_checks,
            lists,
            registry,
        })
    }
}

fn kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Computed => "computed",
        NodeKind::Link => "link",
        NodeKind::Source => "source",
        NodeKind::List => "list",
        NodeKind::Check => "check",
        NodeKind::Input => "input",
    }
}

fn invalid(path: &str, reason: &'static str) -> BuildError {
    BuildError::InvalidRule {
        path: path.to_owned(),
        reason,
    }
}

/// Normalized text of a declared path without list markers.
fn concrete(declared: &str) -> Result<String, BuildError> {
    Ok(FieldPath::parse(declared)?.as_str().to_owned())
}

fn path_of(target: &str) -> Result<FieldPath, BuildError> {
    Ok(FieldPath::parse(target)?)
}

fn resolve_deps(deps: &[String], list: Option<&str>) -> Result<Vec<FieldPath>, BuildError> {
    let base = match list {
        Some(list) => FieldPath::parse(list)?,
        None => FieldPath::root(),
    };
    deps.iter()
        .map(|dep| {
            if list_marker_count(dep) > 1 {
                return Err(BuildError::NestedList { path: dep.clone() });
            }
            Ok(base.join(&FieldPath::parse(dep)?))
        })
        .collect()
}
