//! Chain assembly.
//!
//! A chain takes a loaded [`Config`], expands every node's `tasks:` selectors
//! against the registry, binds parameters, links input-task references into a
//! DAG and exposes the assembled tasks for evaluation. Everything that can go
//! wrong structurally goes wrong here, before any task runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use regex::Regex;

use crate::config::{Config, ConfigNode, ConfigValue};
use crate::error::{ChainError, EvalError};
use crate::execute::LogLevel;
use crate::param::ParameterSet;
use crate::task::{InputEntry, InputRef, TaskInstance, TaskSpec};

/// A DAG of task instances assembled from one config tree.
pub struct Chain {
    name: String,
    tasks: BTreeMap<String, Arc<TaskInstance>>,
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl Chain {
    pub(crate) fn build(config: &Config, parameter_mode: bool) -> Result<Self, ChainError> {
        if !parameter_mode && config.context_name().is_some() {
            tracing::warn!(
                config = config.name(),
                "using a context without parameter mode can break persistence"
            );
        }

        let tasks = create_tasks(config, parameter_mode)?;
        link_inputs(&tasks)?;
        let (graph, indices) = build_graph(&tasks)?;

        let chain = Self {
            name: config.name().to_string(),
            tasks,
            graph,
            indices,
        };
        chain.init_objects(config);
        Ok(chain)
    }

    /// Name of the chain, taken from its root config.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All tasks, keyed by full name.
    pub fn tasks(&self) -> &BTreeMap<String, Arc<TaskInstance>> {
        &self.tasks
    }

    /// Look a task up by name: full, or shortened as long as it stays
    /// unambiguous (`preprocessing:vectors`, `vectors`).
    pub fn get(&self, name: &str) -> Result<&Arc<TaskInstance>, ChainError> {
        let fullname = find_full_name(
            name,
            self.tasks.keys().map(String::as_str),
            NamespaceMode::Scoped,
        )?;
        Ok(&self.tasks[&fullname])
    }

    /// Whether `task` transitively depends on `dependency`.
    pub fn is_dependent_on(&self, task: &str, dependency: &str) -> Result<bool, ChainError> {
        let task = self.get(task)?.fullname().to_string();
        let dependency = self.get(dependency)?.fullname().to_string();
        let start = self.indices[&dependency];
        let goal = self.indices[&task];
        Ok(petgraph::algo::has_path_connecting(
            &self.graph,
            start,
            goal,
            None,
        ))
    }

    /// Every task downstream of the given one.
    pub fn dependent_tasks(
        &self,
        task: &str,
        include_self: bool,
    ) -> Result<Vec<Arc<TaskInstance>>, ChainError> {
        self.reachable(task, include_self, Direction::Outgoing)
    }

    /// Every task the given one transitively requires.
    pub fn required_tasks(
        &self,
        task: &str,
        include_self: bool,
    ) -> Result<Vec<Arc<TaskInstance>>, ChainError> {
        self.reachable(task, include_self, Direction::Incoming)
    }

    fn reachable(
        &self,
        task: &str,
        include_self: bool,
        direction: Direction,
    ) -> Result<Vec<Arc<TaskInstance>>, ChainError> {
        let start = self.indices[self.get(task)?.fullname()];
        let reversed;
        let graph: &DiGraph<String, ()> = match direction {
            Direction::Outgoing => &self.graph,
            Direction::Incoming => {
                reversed = reverse_graph(&self.graph);
                &reversed
            }
        };

        let mut found = Vec::new();
        let mut bfs = Bfs::new(graph, start);
        while let Some(index) = bfs.next(graph) {
            if index == start && !include_self {
                continue;
            }
            found.push(self.tasks[&graph[index]].clone());
        }
        Ok(found)
    }

    /// Force recomputation of the given tasks and everything downstream of
    /// them.
    ///
    /// With `recompute` every forced task is evaluated immediately, in
    /// topological order. With `delete_data` the persisted artifacts are
    /// removed as well, which is the safe variant when task logic changed.
    pub fn force<'a>(
        &self,
        tasks: impl IntoIterator<Item = &'a str>,
        recompute: bool,
        delete_data: bool,
    ) -> Result<(), ChainError> {
        let mut forced = BTreeSet::new();
        for task in tasks {
            for instance in self.dependent_tasks(task, true)? {
                forced.insert(instance.fullname().to_string());
            }
        }

        for name in &forced {
            self.tasks[name].force_mark(delete_data)?;
        }

        if recompute {
            for name in self.topological_order() {
                if forced.contains(&name) {
                    self.tasks[&name].value()?;
                }
            }
        }
        Ok(())
    }

    /// Full names in an order where every task follows its inputs.
    pub fn topological_order(&self) -> Vec<String> {
        // The graph is acyclic by construction, toposort cannot fail here.
        petgraph::algo::toposort(&self.graph, None)
            .expect("assembled chain is acyclic")
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect()
    }

    /// One summary row per task, the tabular view of the chain.
    pub fn summary(&self) -> Vec<TaskRow> {
        self.tasks
            .values()
            .map(|task| {
                let handler = task.handler().ok();
                let data_path = handler.as_ref().and_then(|h| h.data_path());
                let computed = match (&data_path, &handler) {
                    (Some(_), Some(handler)) => Some(handler.is_finished()),
                    _ => None,
                };
                TaskRow {
                    name: task.spec().name().to_string(),
                    group: task.group().to_string(),
                    namespace: task.namespace().map(str::to_string),
                    fullname: task.fullname().to_string(),
                    computed,
                    data_path,
                    parameters: task.params().names().map(str::to_string).collect(),
                    input_tasks: task
                        .input_entries()
                        .iter()
                        .flat_map(|entry| entry.resolved.iter().map(|(name, _)| name.clone()))
                        .collect(),
                    config: task.config().fullname(),
                }
            })
            .collect()
    }

    /// Place human-readable symlinks next to every computed artifact. The
    /// link name comes from the `name` argument, the config's
    /// `human_readable_data_name`, or the config name, in that order.
    pub fn create_readable_filenames(
        &self,
        groups: Option<&[&str]>,
        name: Option<&str>,
        keep_existing: bool,
    ) -> Result<Vec<Utf8PathBuf>, EvalError> {
        let mut created = Vec::new();
        for task in self.tasks.values() {
            if let Some(groups) = groups {
                if !groups.contains(&task.group()) {
                    continue;
                }
            }
            let handler = task.handler()?;
            if !handler.is_finished() {
                continue;
            }
            let Some(data_path) = handler.data_path() else {
                continue;
            };

            let link_name = name
                .map(str::to_string)
                .or_else(|| {
                    task.config()
                        .human_readable_data_name()
                        .map(str::to_string)
                })
                .unwrap_or_else(|| task.config().name().to_string());
            let link = match data_path.extension() {
                Some(ext) => task.dir().join(format!("{link_name}.{ext}")),
                None => task.dir().join(link_name),
            };

            if link.as_std_path().symlink_metadata().is_ok() {
                if keep_existing {
                    continue;
                }
                std::fs::remove_file(&link).map_err(|source| {
                    EvalError::Data(crate::error::DataError::Io {
                        path: link.clone(),
                        source,
                    })
                })?;
            }
            symlink(&data_path, &link)?;
            created.push(link);
        }
        Ok(created)
    }

    /// Adjust the console mirror of task run logs. Affects every chain in
    /// the process.
    pub fn set_log_level(level: LogLevel) {
        crate::execute::set_log_level(level);
    }

    fn init_objects(&self, config: &Config) {
        for node in config.nodes() {
            for key in node.parameter_keys() {
                if let Some(ConfigValue::Object(object)) = node.get(key) {
                    object.init_chain(self);
                }
            }
        }
    }

    /// Refresh every input link against the current task map. Used after a
    /// multichain replaced instances with shared ones.
    pub(crate) fn relink(&self, skip: &BTreeSet<String>) {
        for (name, task) in &self.tasks {
            if skip.contains(name) {
                continue;
            }
            let mut entries = task.inputs.write().unwrap();
            for entry in entries.iter_mut() {
                for (fullname, weak) in entry.resolved.iter_mut() {
                    if let Some(current) = self.tasks.get(fullname) {
                        *weak = Arc::downgrade(current);
                    }
                }
            }
        }
    }

    pub(crate) fn replace_task(&mut self, name: &str, instance: Arc<TaskInstance>) {
        self.tasks.insert(name.to_string(), instance);
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.summary();
        let name_width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0);
        let full_width = rows.iter().map(|r| r.fullname.len()).max().unwrap_or(0);
        for row in rows {
            writeln!(
                f,
                "{:<name_width$}  {:<full_width$}  {}",
                row.name, row.fullname, row.config,
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<chain for config '{}'>", self.name)
    }
}

/// One row of [`Chain::summary`].
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub name: String,
    pub group: String,
    pub namespace: Option<String>,
    pub fullname: String,
    /// `None` when the task does not persist at all.
    pub computed: Option<bool>,
    pub data_path: Option<Utf8PathBuf>,
    pub parameters: Vec<String>,
    pub input_tasks: Vec<String>,
    pub config: String,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn create_tasks(
    config: &Config,
    parameter_mode: bool,
) -> Result<BTreeMap<String, Arc<TaskInstance>>, ChainError> {
    let registry = config.registry();
    let mut tasks: BTreeMap<String, Arc<TaskInstance>> = BTreeMap::new();

    for node in config.nodes() {
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        for selector in node.selectors("excluded_tasks")? {
            for spec in registry.select(&node.fullname(), &selector)? {
                excluded.insert(spec.key().to_string());
            }
        }

        let mut selected: Vec<Arc<TaskSpec>> = Vec::new();
        for selector in node.selectors("tasks")? {
            for spec in registry.select(&node.fullname(), &selector)? {
                if excluded.contains(spec.key()) {
                    continue;
                }
                if !selected.iter().any(|s| s.key() == spec.key()) {
                    selected.push(spec);
                }
            }
        }

        for spec in selected {
            let params = ParameterSet::bind(&qualified_slug(&spec, node), spec.params(), node)?;
            let instance = Arc::new(TaskInstance::new(
                spec,
                node.clone(),
                config.base_dir().to_path_buf(),
                params,
                parameter_mode,
                config.context_name().map(str::to_string),
            ));
            let fullname = instance.fullname().to_string();

            if let Some(existing) = tasks.get(&fullname) {
                if existing.config().repr_name() != node.repr_name() {
                    return Err(ChainError::TaskNameConflict {
                        name: fullname,
                        first: existing.config().fullname(),
                        second: node.fullname(),
                    });
                }
                continue;
            }
            tasks.insert(fullname, instance);
        }
    }

    Ok(tasks)
}

fn qualified_slug(spec: &TaskSpec, node: &ConfigNode) -> String {
    match node.namespace() {
        Some(ns) => format!("{ns}::{}", spec.slugname()),
        None => spec.slugname(),
    }
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

fn link_inputs(tasks: &BTreeMap<String, Arc<TaskInstance>>) -> Result<(), ChainError> {
    let names: Vec<&str> = tasks.keys().map(String::as_str).collect();

    for task in tasks.values() {
        let mut entries: Vec<InputEntry> = Vec::new();

        for input in task.spec().inputs() {
            let declared = input
                .declared_name()
                .trim_start_matches("~~")
                .to_string();
            if entries.iter().any(|entry| entry.declared == declared) {
                return Err(ChainError::DuplicateInput {
                    task: task.fullname().to_string(),
                    name: declared,
                });
            }

            let resolved = match input.reference() {
                InputRef::Name(reference) => {
                    match resolve_name_ref(task, reference, &names) {
                        Ok(fullname) => {
                            let target = &tasks[&fullname];
                            vec![(fullname, Arc::downgrade(target))]
                        }
                        Err(ChainError::TaskNotFound(_)) if input.default().is_some() => {
                            Vec::new()
                        }
                        Err(ChainError::TaskNotFound(_)) => {
                            return Err(ChainError::UnknownReference {
                                task: task.fullname().to_string(),
                                reference: reference.clone(),
                            })
                        }
                        Err(other) => return Err(other),
                    }
                }
                InputRef::Regex(pattern) => {
                    let regex =
                        Regex::new(pattern).map_err(|source| ChainError::BadInputRegex {
                            task: task.fullname().to_string(),
                            pattern: pattern.clone(),
                            source,
                        })?;
                    tasks
                        .iter()
                        .filter(|(name, _)| regex.is_match(name))
                        .map(|(name, target)| (name.clone(), Arc::downgrade(target)))
                        .collect()
                }
            };

            entries.push(InputEntry {
                declared,
                resolved,
                as_object: input.is_object(),
                default: input.default().cloned(),
            });
        }

        *task.inputs.write().unwrap() = entries;
    }
    Ok(())
}

/// Resolve a plain name reference from the perspective of `task`. The task's
/// namespace is prepended unless the reference already carries it or opts out
/// with a `~~` prefix.
fn resolve_name_ref(
    task: &TaskInstance,
    reference: &str,
    names: &[&str],
) -> Result<String, ChainError> {
    if let Some(unscoped) = reference.strip_prefix("~~") {
        return find_full_name(unscoped, names.iter().copied(), NamespaceMode::Scoped);
    }

    let scoped = match task.namespace() {
        Some(ns) if !reference.starts_with(&format!("{ns}::")) => format!("{ns}::{reference}"),
        _ => reference.to_string(),
    };
    find_full_name(&scoped, names.iter().copied(), NamespaceMode::Exact)
}

// ---------------------------------------------------------------------------
// Name search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NamespaceMode {
    /// The query's namespace must match exactly, an empty query namespace
    /// matches only tasks without one. Used for input references, which are
    /// already namespace-qualified.
    Exact,
    /// The query's namespace must match when present, a bare query matches
    /// across namespaces. Used for user-facing lookup.
    Scoped,
    /// Namespaces are not compared at all.
    Ignore,
}

fn split_namespace(name: &str) -> (&str, &str) {
    match name.rfind("::") {
        Some(at) => (&name[..at], &name[at + 2..]),
        None => ("", name),
    }
}

fn name_matches(query: &str, fullname: &str, mode: NamespaceMode) -> bool {
    let (query_ns, query_name) = split_namespace(query);
    let (full_ns, full_name) = split_namespace(fullname);

    let check_ns = match mode {
        NamespaceMode::Exact => true,
        NamespaceMode::Scoped => !query_ns.is_empty(),
        NamespaceMode::Ignore => false,
    };
    if check_ns && query_ns != full_ns {
        return false;
    }

    if query_name == full_name {
        return true;
    }
    // A group-less query still matches `group:name` on the name alone.
    if full_name.contains(':') && !query_name.contains(':') {
        return full_name.rsplit(':').next() == Some(query_name);
    }
    false
}

/// Find the unique full name matching a query. When several names match and
/// one of them is a suffix of all others, it wins, otherwise the query is
/// ambiguous.
pub(crate) fn find_full_name<'a>(
    query: &str,
    names: impl Iterator<Item = &'a str>,
    mode: NamespaceMode,
) -> Result<String, ChainError> {
    let matching: Vec<&str> = names
        .filter(|name| name_matches(query, name, mode))
        .collect();

    match matching.len() {
        0 => Err(ChainError::TaskNotFound(query.to_string())),
        1 => Ok(matching[0].to_string()),
        _ => {
            for candidate in &matching {
                if matching.iter().all(|name| name.ends_with(candidate)) {
                    return Ok(candidate.to_string());
                }
            }
            Err(ChainError::AmbiguousReference {
                name: query.to_string(),
                candidates: matching.iter().map(|s| s.to_string()).collect(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

fn build_graph(
    tasks: &BTreeMap<String, Arc<TaskInstance>>,
) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>), ChainError> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for name in tasks.keys() {
        let index = graph.add_node(name.clone());
        indices.insert(name.clone(), index);
    }
    for (name, task) in tasks {
        for entry in task.input_entries().iter() {
            for (input_name, _) in &entry.resolved {
                graph.add_edge(indices[input_name], indices[name], ());
            }
        }
    }

    petgraph::algo::toposort(&graph, None)
        .map_err(|cycle| ChainError::Cycle(graph[cycle.node_id()].clone()))?;

    Ok((graph, indices))
}

fn reverse_graph(graph: &DiGraph<String, ()>) -> DiGraph<String, ()> {
    let mut reversed = DiGraph::new();
    let mut map = HashMap::new();
    for index in graph.node_indices() {
        map.insert(index, reversed.add_node(graph[index].clone()));
    }
    for edge in graph.raw_edges() {
        reversed.add_edge(map[&edge.target()], map[&edge.source()], ());
    }
    reversed
}

#[cfg(unix)]
fn symlink(target: &camino::Utf8Path, link: &camino::Utf8Path) -> Result<(), EvalError> {
    let relative = target
        .file_name()
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| target.to_path_buf());
    std::os::unix::fs::symlink(&relative, link).map_err(|source| {
        EvalError::Data(crate::error::DataError::Io {
            path: link.to_path_buf(),
            source,
        })
    })
}

#[cfg(not(unix))]
fn symlink(_target: &camino::Utf8Path, _link: &camino::Utf8Path) -> Result<(), EvalError> {
    Err(EvalError::Data(crate::error::DataError::SymlinkUnsupported))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches_plain() {
        assert!(name_matches("y", "a:b:y", NamespaceMode::Scoped));
        assert!(name_matches("a:b:y", "a:b:y", NamespaceMode::Scoped));
        assert!(!name_matches("b:y", "a:b:y", NamespaceMode::Scoped));
        assert!(!name_matches("x", "a:b:y", NamespaceMode::Scoped));
    }

    #[test]
    fn test_name_matches_namespaces() {
        assert!(name_matches("train::y", "train::g:y", NamespaceMode::Scoped));
        assert!(!name_matches("train::y", "test::g:y", NamespaceMode::Scoped));
        // A bare query crosses namespaces only in scoped and ignore modes.
        assert!(name_matches("y", "train::g:y", NamespaceMode::Scoped));
        assert!(!name_matches("y", "train::g:y", NamespaceMode::Exact));
        assert!(name_matches("y", "train::g:y", NamespaceMode::Ignore));
    }

    #[test]
    fn test_find_full_name_suffix_priority() {
        // `g:y` is a suffix of every match, so the shortest name wins.
        let names = ["g:y", "train::g:y"];
        let found = find_full_name("y", names.into_iter(), NamespaceMode::Ignore).unwrap();
        assert_eq!(found, "g:y");
    }

    #[test]
    fn test_find_full_name_ambiguous() {
        let names = ["train::g:y", "test::g:y"];
        let err = find_full_name("y", names.into_iter(), NamespaceMode::Scoped).unwrap_err();
        assert!(matches!(err, ChainError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_find_full_name_missing() {
        let names = ["a:b"];
        let err = find_full_name("c", names.into_iter(), NamespaceMode::Scoped).unwrap_err();
        assert!(matches!(err, ChainError::TaskNotFound(_)));
    }
}
