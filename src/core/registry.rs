//! Named task registry with composition-time cycle detection.
//!
//! Pipelines are declared by name: a composite lists the names of the tasks
//! it runs, possibly before those are defined. Every definition adds edges to
//! a dependency graph (composite -> referenced task); a definition whose edges
//! would close a loop is rejected on the spot, so a registry can never hold a
//! cyclic pipeline and [`Registry::resolve`] always terminates.

use std::collections::HashMap;

use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::Direction;

use crate::core::task::{Task, TaskKind};
use crate::error::{Error, Result};
use crate::glog_debug;

/// Composition expression over task names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compose {
    /// A task defined elsewhere in the registry.
    Ref(String),
    Series(Vec<Compose>),
    Parallel(Vec<Compose>),
}

impl Compose {
    pub fn task(name: impl Into<String>) -> Self {
        Self::Ref(name.into())
    }

    pub fn series<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Compose>,
    {
        Self::Series(items.into_iter().collect())
    }

    pub fn parallel<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Compose>,
    {
        Self::Parallel(items.into_iter().collect())
    }

    /// Every task name referenced by the expression, in order.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            Compose::Ref(name) => refs.push(name),
            Compose::Series(items) | Compose::Parallel(items) => {
                items.iter().for_each(|item| item.collect_refs(refs))
            }
        }
    }

    fn has_empty_composite(&self) -> bool {
        match self {
            Compose::Ref(_) => false,
            Compose::Series(items) | Compose::Parallel(items) => {
                items.is_empty() || items.iter().any(Compose::has_empty_composite)
            }
        }
    }

    fn kind(&self) -> Option<TaskKind> {
        match self {
            Compose::Ref(_) => None,
            Compose::Series(_) => Some(TaskKind::Series),
            Compose::Parallel(_) => Some(TaskKind::Parallel),
        }
    }
}

impl From<&str> for Compose {
    fn from(name: &str) -> Self {
        Self::task(name)
    }
}

#[derive(Clone)]
enum Definition {
    Task(Task),
    Composed(Compose),
}

/// Registry of named tasks.
pub struct Registry {
    /// Dependency graph: composite -> referenced task.
    graph: DiGraph<String, ()>,
    /// Index mapping from task name to NodeIndex.
    index: HashMap<String, NodeIndex>,
    definitions: HashMap<String, Definition>,
    /// Names in registration order.
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            definitions: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a prebuilt task under `name`.
    ///
    /// The task is a closed value and references no registry names, so it
    /// cannot introduce a cycle.
    pub fn register(&mut self, name: &str, task: Task) -> Result<()> {
        self.ensure_undefined(name)?;
        self.node(name);
        self.insert(name, Definition::Task(task));
        Ok(())
    }

    /// Define `name` as a series of named tasks.
    pub fn series(&mut self, name: &str, children: &[&str]) -> Result<()> {
        self.compose(
            name,
            Compose::series(children.iter().map(|c| Compose::task(*c))),
        )
    }

    /// Define `name` as a parallel group of named tasks.
    pub fn parallel(&mut self, name: &str, children: &[&str]) -> Result<()> {
        self.compose(
            name,
            Compose::parallel(children.iter().map(|c| Compose::task(*c))),
        )
    }

    /// Define `name` from a composition expression.
    ///
    /// # Errors
    /// - `DuplicateTask` if `name` is already defined
    /// - `EmptyComposite` if any series/parallel in the expression is empty
    /// - `Cycle` if the definition would make `name` reachable from itself
    pub fn compose(&mut self, name: &str, expr: Compose) -> Result<()> {
        self.ensure_undefined(name)?;
        if expr.has_empty_composite() {
            return Err(Error::EmptyComposite(name.to_string()));
        }

        let from = self.node(name);
        let mut added: Vec<EdgeIndex> = Vec::new();
        for child in expr.references() {
            let to = self.node(child);
            if self.graph.find_edge(from, to).is_none() {
                added.push(self.graph.add_edge(from, to, ()));
            }
        }

        if is_cyclic_directed(&self.graph) {
            let via = expr
                .references()
                .into_iter()
                .find(|child| {
                    self.index
                        .get(*child)
                        .map(|&c| has_path_connecting(&self.graph, c, from, None))
                        .unwrap_or(false)
                })
                .unwrap_or(name)
                .to_string();

            // Newest edges sit at the end of the edge list; removing them
            // newest-first keeps the remaining indices valid.
            for edge in added.into_iter().rev() {
                self.graph.remove_edge(edge);
            }
            return Err(Error::Cycle {
                task: name.to_string(),
                via,
            });
        }

        self.insert(name, Definition::Composed(expr));
        Ok(())
    }

    fn ensure_undefined(&self, name: &str) -> Result<()> {
        if self.definitions.contains_key(name) {
            return Err(Error::DuplicateTask(name.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, definition: Definition) {
        glog_debug!("Registry: defined `{}`", name);
        self.definitions.insert(name.to_string(), definition);
        self.order.push(name.to_string());
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }

    /// Check if a task is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Defined names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Kind of the task defined under `name`.
    pub fn kind_of(&self, name: &str) -> Option<TaskKind> {
        match self.definitions.get(name)? {
            Definition::Task(task) => Some(task.kind()),
            Definition::Composed(expr) => expr.kind(),
        }
    }

    /// Names directly referenced by `name`'s definition.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        match self.index.get(name) {
            Some(&index) => {
                let mut deps: Vec<&str> = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
                    .collect();
                deps.sort_unstable();
                deps
            }
            None => Vec::new(),
        }
    }

    /// Names referenced somewhere but never defined.
    pub fn undefined(&self) -> Vec<&str> {
        let mut missing: Vec<&str> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_some()
            })
            .filter_map(|n| self.graph.node_weight(n))
            .filter(|name| !self.definitions.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        missing.sort_unstable();
        missing
    }

    /// Check that every reference is defined and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.undefined().first() {
            return Err(Error::UnknownTask(name.to_string()));
        }
        toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .cloned()
                .unwrap_or_default();
            Error::Cycle {
                task: name.clone(),
                via: name,
            }
        })?;
        Ok(())
    }

    /// Build the task tree for `name`.
    ///
    /// Definitions referenced more than once resolve to the same task value.
    pub fn resolve(&self, name: &str) -> Result<Task> {
        let mut cache = HashMap::new();
        self.resolve_cached(name, &mut cache)
    }

    /// Render the resolved tree for `name`.
    pub fn describe(&self, name: &str) -> Result<String> {
        Ok(self.resolve(name)?.describe())
    }

    fn resolve_cached(&self, name: &str, cache: &mut HashMap<String, Task>) -> Result<Task> {
        if let Some(task) = cache.get(name) {
            return Ok(task.clone());
        }

        let task = match self.definitions.get(name) {
            Some(Definition::Task(task)) if task.name() == Some(name) => task.clone(),
            Some(Definition::Task(task)) => task.clone().named(name),
            Some(Definition::Composed(expr)) => self.build(expr, cache)?.named(name),
            None => return Err(Error::UnknownTask(name.to_string())),
        };

        cache.insert(name.to_string(), task.clone());
        Ok(task)
    }

    fn build(&self, expr: &Compose, cache: &mut HashMap<String, Task>) -> Result<Task> {
        match expr {
            Compose::Ref(name) => self.resolve_cached(name, cache),
            Compose::Series(items) => Ok(Task::series(
                items
                    .iter()
                    .map(|item| self.build(item, cache))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Compose::Parallel(items) => Ok(Task::parallel(
                items
                    .iter()
                    .map(|item| self.build(item, cache))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.len())
            .field("references", &self.graph.edge_count())
            .finish()
    }
}
