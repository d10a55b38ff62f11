//! Task templates and the immutable graph they live in.
//!
//! A template is the context-independent description of a unit of work: its
//! payload, the context variables its identity depends on, and its links to
//! other templates. Templates are created through a
//! [`Blueprint`](crate::Blueprint), which freezes into a [`TaskGraph`].

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::Direction;
use petgraph::graph::{EdgeIndex, Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::core::{ArcStr, Hash32};
use crate::error::{DispatchError, IdentityError, PayloadError};
use crate::task::Task;

pub(crate) type RunFn = Arc<dyn Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type RunSequenceFn =
    Arc<dyn Fn(&[ExecutionContext]) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type RemapFn = Arc<dyn Fn(&ExecutionContext) -> Vec<ExecutionContext> + Send + Sync>;

static GRAPH_ID: AtomicU64 = AtomicU64::new(0);

/// Token referring to a template inside a [`Blueprint`](crate::Blueprint) and
/// the [`TaskGraph`] it is frozen into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub(crate) NodeIndex);

impl TemplateId {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Source must complete before the target.
    Pre,
    /// Target runs after the source.
    Post,
}

pub(crate) struct Link {
    pub kind: LinkKind,
    pub remap: Option<RemapFn>,
}

pub(crate) struct TemplateNode {
    pub name: ArcStr,
    pub kind: ArcStr,
    pub fingerprint: Option<Hash32>,
    pub seed: Hash32,
    pub is_no_op: bool,
    pub requires_sequence_execution: bool,
    pub variables: BTreeSet<ArcStr>,
    pub run: Option<RunFn>,
    pub run_sequence: Option<RunSequenceFn>,
}

pub(crate) struct GraphInner {
    pub id: u64,
    pub graph: Graph<TemplateNode, Link>,
}

/// The frozen template graph.
///
/// Cheap to clone. Every [`TaskTemplate`] keeps the graph alive, so tasks can
/// outlive the value returned by [`Blueprint::finish`](crate::Blueprint::finish).
#[derive(Clone)]
pub struct TaskGraph {
    pub(crate) inner: Arc<GraphInner>,
}

impl TaskGraph {
    pub(crate) fn new(mut graph: Graph<TemplateNode, Link>) -> Self {
        let id = GRAPH_ID.fetch_add(1, Ordering::Relaxed);

        for index in graph.node_indices() {
            let node = &mut graph[index];
            node.seed = seed(id, index, &node.kind, node.fingerprint);
        }

        Self {
            inner: Arc::new(GraphInner { id, graph }),
        }
    }

    /// Handle for the template behind `id`.
    ///
    /// # Panics
    /// If `id` was issued by a different blueprint and is out of range here.
    pub fn template(&self, id: TemplateId) -> TaskTemplate {
        assert!(
            id.0.index() < self.inner.graph.node_count(),
            "template id {} doesn't belong to this graph",
            id.0.index()
        );

        TaskTemplate {
            graph: self.clone(),
            index: id.0,
        }
    }

    pub fn templates(&self) -> impl Iterator<Item = TaskTemplate> + '_ {
        self.inner.graph.node_indices().map(|index| TaskTemplate {
            graph: self.clone(),
            index,
        })
    }

    /// Identity of `template` evaluated in `context`.
    pub fn hash(&self, id: TemplateId, context: &ExecutionContext) -> Result<Hash32, IdentityError> {
        self.template(id).hash(context)
    }

    pub fn len(&self) -> usize {
        self.inner.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.graph.node_count() == 0
    }
}

/// Seeds the identity of every task of a template: kind first, so different
/// kinds never collide, then either the declared fingerprint or the identity
/// of this very template instance.
fn seed(graph: u64, index: NodeIndex, kind: &str, fingerprint: Option<Hash32>) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(kind.len() as u64).to_le_bytes());
    hasher.update(kind.as_bytes());

    match fingerprint {
        Some(fingerprint) => {
            hasher.update(b"fingerprint");
            hasher.update(fingerprint.as_bytes());
        }
        None => {
            hasher.update(b"instance");
            hasher.update(&graph.to_le_bytes());
            hasher.update(&(index.index() as u64).to_le_bytes());
        }
    }

    hasher.finalize().into()
}

/// A template inside a [`TaskGraph`].
#[derive(Clone)]
pub struct TaskTemplate {
    pub(crate) graph: TaskGraph,
    pub(crate) index: NodeIndex,
}

impl TaskTemplate {
    pub(crate) fn node(&self) -> &TemplateNode {
        &self.graph.inner.graph[self.index]
    }

    pub fn id(&self) -> TemplateId {
        TemplateId(self.index)
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn name(&self) -> &str {
        &self.node().name
    }

    /// Explicit kind identifier, standing in for the concrete type of the node.
    pub fn kind(&self) -> &str {
        &self.node().kind
    }

    pub fn is_no_op(&self) -> bool {
        self.node().is_no_op
    }

    pub fn requires_sequence_execution(&self) -> bool {
        self.node().requires_sequence_execution
    }

    /// Context variables the identity of this template depends on, sorted.
    pub fn context_variables_used(&self) -> impl Iterator<Item = &str> {
        self.node().variables.iter().map(|name| name.as_ref())
    }

    pub(crate) fn seed(&self) -> Hash32 {
        self.node().seed
    }

    /// Instantiates the template in `context`.
    pub fn task(&self, context: &ExecutionContext) -> Result<Task, IdentityError> {
        Task::new(self, context)
    }

    pub fn hash(&self, context: &ExecutionContext) -> Result<Hash32, IdentityError> {
        Ok(self.task(context)?.hash())
    }

    /// Linked templates of the given kind, in the order they were linked.
    pub(crate) fn links(&self, kind: LinkKind) -> Vec<(TaskTemplate, Option<RemapFn>)> {
        let graph = &self.graph.inner.graph;

        // Pre links point at us from the requirement, post links point away
        // from us to the follower.
        let direction = match kind {
            LinkKind::Pre => Direction::Incoming,
            LinkKind::Post => Direction::Outgoing,
        };

        let mut edges: Vec<(EdgeIndex, NodeIndex, Option<RemapFn>)> = graph
            .edges_directed(self.index, direction)
            .filter(|edge| edge.weight().kind == kind)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (edge.id(), other, edge.weight().remap.clone())
            })
            .collect();

        edges.sort_by_key(|(id, _, _)| *id);

        edges
            .into_iter()
            .map(|(_, index, remap)| {
                let template = TaskTemplate {
                    graph: self.graph.clone(),
                    index,
                };
                (template, remap)
            })
            .collect()
    }

    /// Calls the payload for `contexts` as one invocation unit.
    ///
    /// Sequence templates receive the whole slice at once, everything else is
    /// called once per context. No-ops do nothing.
    pub(crate) fn invoke(&self, contexts: &[ExecutionContext]) -> anyhow::Result<()> {
        let node = self.node();

        if node.is_no_op {
            return Ok(());
        }

        match (&node.run, &node.run_sequence) {
            (_, Some(run_sequence)) if node.requires_sequence_execution => run_sequence(contexts),
            (Some(run), _) => contexts.iter().try_for_each(|ctx| run(ctx)),
            (None, Some(run_sequence)) => contexts
                .iter()
                .try_for_each(|ctx| run_sequence(std::slice::from_ref(ctx))),
            (None, None) => Ok(()),
        }
    }

    /// Executes the template directly for a sequence of contexts, bypassing
    /// any dispatcher bookkeeping.
    ///
    /// Contexts collapsing to the same task identity are only passed once.
    /// With [`requires_sequence_execution`](Self::requires_sequence_execution)
    /// the payload then runs once with the whole sequence, otherwise once per
    /// remaining context.
    pub fn execute_sequence(
        &self,
        contexts: impl IntoIterator<Item = ExecutionContext>,
    ) -> Result<(), DispatchError> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        for context in contexts {
            let task = self.task(&context)?;
            if seen.insert(task.hash()) {
                tasks.push(task);
            }
        }

        if tasks.is_empty() {
            return Ok(());
        }

        let contexts: Vec<ExecutionContext> = tasks.iter().map(|t| t.context().clone()).collect();

        if self.requires_sequence_execution() {
            debug!(template = self.name(), len = contexts.len(), "executing sequence");
            return self.invoke(&contexts).map_err(|error| {
                PayloadError {
                    task: tasks[0].clone(),
                    batch: tasks.clone(),
                    committed: Vec::new(),
                    not_attempted: Vec::new(),
                    error,
                }
                .into()
            });
        }

        for (i, task) in tasks.iter().enumerate() {
            if let Err(error) = self.invoke(std::slice::from_ref(task.context())) {
                return Err(PayloadError {
                    task: task.clone(),
                    batch: vec![task.clone()],
                    committed: tasks[..i].to_vec(),
                    not_attempted: tasks[i + 1..].to_vec(),
                    error,
                }
                .into());
            }
        }

        Ok(())
    }
}

impl PartialEq for TaskTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.graph.inner.id == other.graph.inner.id && self.index == other.index
    }
}

impl Eq for TaskTemplate {}

impl std::hash::Hash for TaskTemplate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.graph.inner.id.hash(state);
        self.index.hash(state);
    }
}

impl Debug for TaskTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("no_op", &self.is_no_op())
            .field("sequence", &self.requires_sequence_execution())
            .finish()
    }
}
