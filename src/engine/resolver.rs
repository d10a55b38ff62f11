//! Expansion of templates into a graph of concrete tasks.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use tracing::{debug, trace};

use crate::config::ResolveLimits;
use crate::context::ExecutionContext;
use crate::core::Hash32;
use crate::error::{DispatchError, GraphError, IdentityError};
use crate::task::Task;
use crate::template::{LinkKind, TaskTemplate};

/// An acyclic graph over tasks. Edges point from a requirement to the task
/// requiring it, and from a task to the tasks following it.
#[derive(Clone, Default)]
pub struct ResolvedGraph {
    pub(crate) graph: Graph<Task, ()>,
    pub(crate) index: HashMap<Hash32, NodeIndex>,
    pub(crate) roots: Vec<NodeIndex>,
    pub(crate) order: Vec<NodeIndex>,
}

impl ResolvedGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, task: &Task) -> bool {
        self.index.contains_key(&task.hash())
    }

    /// Resolved roots, in the order they were given. No-op roots are absent,
    /// their requirements stand in for them.
    pub fn roots(&self) -> impl Iterator<Item = &Task> {
        self.roots.iter().map(|&i| &self.graph[i])
    }

    /// Every task, each after all tasks it requires or follows.
    pub fn order(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().map(|&i| &self.graph[i])
    }

    /// Direct predecessors of `task`, the tasks that must complete before it.
    pub fn predecessors(&self, task: &Task) -> Vec<&Task> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Direct successors of `task`.
    pub fn successors(&self, task: &Task) -> Vec<&Task> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: &Task, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.index.get(&task.hash()) else {
            return Vec::new();
        };

        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found.into_iter().map(|i| &self.graph[i]).collect()
    }
}

impl std::fmt::Debug for ResolvedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.order()).finish()
    }
}

/// Walks required and followed-by links of tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskGraphResolver {
    limits: ResolveLimits,
    post_tasks: bool,
}

impl TaskGraphResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: ResolveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Also expand followed-by links. Off by default.
    pub fn with_post_tasks(mut self, value: bool) -> Self {
        self.post_tasks = value;
        self
    }

    /// The tasks `template` directly requires in `context`, in link order.
    pub fn pre_tasks(
        &self,
        template: &TaskTemplate,
        context: &ExecutionContext,
    ) -> Result<Vec<Task>, IdentityError> {
        linked(template, context, LinkKind::Pre)
    }

    /// The tasks directly following `template` in `context`, in link order.
    pub fn post_tasks(
        &self,
        template: &TaskTemplate,
        context: &ExecutionContext,
    ) -> Result<Vec<Task>, IdentityError> {
        linked(template, context, LinkKind::Post)
    }

    /// Resolves a single root, `template` instantiated in `context`.
    pub fn resolve_context(
        &self,
        template: &TaskTemplate,
        context: &ExecutionContext,
    ) -> Result<ResolvedGraph, DispatchError> {
        self.resolve(&[template.task(context)?])
    }

    /// Expands `roots` and everything they require into a [`ResolvedGraph`].
    ///
    /// Nothing is returned on error, resolution either succeeds as a whole or
    /// fails as a whole.
    pub fn resolve(&self, roots: &[Task]) -> Result<ResolvedGraph, DispatchError> {
        let mut expansion = Expansion {
            resolver: self,
            graph: Graph::new(),
            index: HashMap::new(),
            active: HashSet::new(),
            active_no_ops: Vec::new(),
            spliced: HashMap::new(),
        };

        let mut resolved_roots = Vec::new();
        for root in roots {
            for node in expansion.expand(root, 0)? {
                if !resolved_roots.contains(&node) {
                    resolved_roots.push(node);
                }
            }
        }

        let order = topological_order(&expansion.graph)?;

        debug!(
            roots = roots.len(),
            tasks = expansion.graph.node_count(),
            "resolved task graph"
        );

        Ok(ResolvedGraph {
            graph: expansion.graph,
            index: expansion.index,
            roots: resolved_roots,
            order,
        })
    }
}

fn linked(
    template: &TaskTemplate,
    context: &ExecutionContext,
    kind: LinkKind,
) -> Result<Vec<Task>, IdentityError> {
    let mut tasks = Vec::new();

    for (other, remap) in template.links(kind) {
        match remap {
            Some(remap) => {
                for ctx in remap(context) {
                    tasks.push(Task::new(&other, &ctx)?);
                }
            }
            None => tasks.push(Task::new(&other, context)?),
        }
    }

    Ok(tasks)
}

struct Expansion<'a> {
    resolver: &'a TaskGraphResolver,
    graph: Graph<Task, ()>,
    index: HashMap<Hash32, NodeIndex>,
    /// Identities on the path currently being expanded.
    active: HashSet<Hash32>,
    /// No-ops all share one identity, so their path entries are keyed on the
    /// template and the full context instead.
    active_no_ops: Vec<(TaskTemplate, ExecutionContext)>,
    /// Nodes standing in for each no-op expanded so far.
    spliced: HashMap<(TaskTemplate, ExecutionContext), Vec<NodeIndex>>,
}

impl Expansion<'_> {
    /// Fails once the distinct tasks seen, spliced no-ops included, reach the
    /// task limit.
    fn check_task_limit(&self) -> Result<(), GraphError> {
        let limit = self.resolver.limits.max_tasks;
        if self.graph.node_count() + self.spliced.len() >= limit {
            return Err(GraphError::TooManyTasks { limit });
        }
        Ok(())
    }

    /// Expands `task` and returns the nodes a requirer of `task` has to wait
    /// for: the task's own node, or for a no-op, the nodes of whatever the
    /// no-op requires.
    fn expand(&mut self, task: &Task, depth: usize) -> Result<Vec<NodeIndex>, DispatchError> {
        let limits = self.resolver.limits;

        if depth > limits.max_depth {
            return Err(GraphError::DepthExceeded {
                task: task.to_string(),
                limit: limits.max_depth,
            }
            .into());
        }

        if task.is_no_op() {
            return self.expand_no_op(task, depth);
        }

        if let Some(&node) = self.index.get(&task.hash()) {
            if self.active.contains(&task.hash()) {
                return Err(GraphError::Cycle {
                    task: task.to_string(),
                }
                .into());
            }
            trace!(task = %task, "reusing resolved task");
            return Ok(vec![node]);
        }

        self.check_task_limit()?;

        let node = self.graph.add_node(task.clone());
        self.index.insert(task.hash(), node);
        self.active.insert(task.hash());

        for requirement in self.resolver.pre_tasks(task.template(), task.context())? {
            for dependency in self.expand(&requirement, depth + 1)? {
                self.graph.update_edge(dependency, node, ());
            }
        }

        self.active.remove(&task.hash());

        if self.resolver.post_tasks {
            self.expand_followers(task, &[node], depth)?;
        }

        Ok(vec![node])
    }

    fn expand_no_op(&mut self, task: &Task, depth: usize) -> Result<Vec<NodeIndex>, DispatchError> {
        let key = (task.template().clone(), task.context().clone());

        if self.active_no_ops.contains(&key) {
            return Err(GraphError::Cycle {
                task: task.to_string(),
            }
            .into());
        }

        if let Some(nodes) = self.spliced.get(&key) {
            trace!(task = %task, "reusing spliced no-op");
            return Ok(nodes.clone());
        }

        self.check_task_limit()?;
        self.active_no_ops.push(key.clone());

        let mut nodes = Vec::new();
        for requirement in self.resolver.pre_tasks(task.template(), task.context())? {
            for node in self.expand(&requirement, depth + 1)? {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }

        self.active_no_ops.pop();
        self.spliced.insert(key, nodes.clone());

        if self.resolver.post_tasks {
            self.expand_followers(task, &nodes, depth)?;
        }

        Ok(nodes)
    }

    /// Followers of `task` run after every node in `after`.
    fn expand_followers(
        &mut self,
        task: &Task,
        after: &[NodeIndex],
        depth: usize,
    ) -> Result<(), DispatchError> {
        for follower in self.resolver.post_tasks(task.template(), task.context())? {
            for node in self.expand(&follower, depth + 1)? {
                for &before in after {
                    if before != node {
                        self.graph.update_edge(before, node, ());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Kahn's algorithm, always picking the lowest ready index so the order
/// follows the order in which tasks were discovered.
pub(crate) fn topological_order<N, E>(graph: &Graph<N, E>) -> Result<Vec<NodeIndex>, GraphError>
where
    N: std::fmt::Display,
{
    let mut counts: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| counts[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            counts[next.index()] -= 1;
            if counts[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < graph.node_count() {
        let stuck = graph
            .node_indices()
            .find(|i| counts[i.index()] > 0)
            .map(|i| graph[i].to_string())
            .unwrap_or_default();
        return Err(GraphError::Cycle { task: stuck });
    }

    Ok(order)
}
