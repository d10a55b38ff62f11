//! Execution of task graphs with identity-based deduplication.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use petgraph::graph::{Graph, NodeIndex};
use tracing::{debug, info_span};

use crate::config::DispatchConfig;
use crate::context::ExecutionContext;
use crate::core::Hash32;
use crate::engine::resolver::{ResolvedGraph, TaskGraphResolver, topological_order};
use crate::engine::runner::{self, Batch, Cancel, Claims, ExecutionReport, Plan};
use crate::error::{DispatchError, GraphError};
use crate::task::Task;
use crate::template::TaskTemplate;

/// Cloneable handle for cancelling dispatches from another thread.
///
/// Cancellation is cooperative: payloads already running finish normally,
/// but no new invocation is started while the token is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the token so later dispatches run again.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Cancel for CancelToken {
    fn is_cancelled(&self) -> bool {
        CancelToken::is_cancelled(self)
    }
}

/// Runs tasks, each distinct identity at most once over the dispatcher's
/// lifetime.
///
/// Every dispatch resolves its roots into a graph, drops whatever was
/// committed by an earlier dispatch and runs the rest, dependencies first.
/// The dispatcher can be shared between threads; concurrent dispatches never
/// invoke the same identity twice.
///
/// A payload may dispatch more work on the dispatcher running it. Dispatching
/// a graph that contains the payload's own identity fails with a
/// [`PayloadError`](crate::PayloadError) instead of waiting on itself.
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use taskdispatch::{Blueprint, Dispatcher, ExecutionContext};
///
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = runs.clone();
///
/// let mut config = Blueprint::new();
/// let cache = config.template("cache").run(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
/// let graph = config.finish();
///
/// let dispatcher = Dispatcher::default();
/// let contexts = (1..=10).map(|f| ExecutionContext::new().with_frame(f));
/// dispatcher.execute_sequence(&graph.template(cache), contexts).unwrap();
///
/// // the template doesn't use the frame, so all ten contexts are one task
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// ```
#[derive(Debug, Default)]
pub struct Dispatcher {
    config: DispatchConfig,
    claims: Claims,
    cancel: CancelToken,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            claims: Claims::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether `task` has run to completion on this dispatcher.
    pub fn is_committed(&self, task: &Task) -> bool {
        self.claims.contains(task.hash())
    }

    /// Number of distinct identities committed so far.
    pub fn committed_len(&self) -> usize {
        self.claims.len()
    }

    /// Forgets every committed identity, starting a new run.
    pub fn reset(&self) {
        self.claims.clear();
    }

    /// The resolver used for every dispatch, configured from
    /// [`DispatchConfig`].
    pub fn resolver(&self) -> TaskGraphResolver {
        TaskGraphResolver::new()
            .with_limits(self.config.limits)
            .with_post_tasks(self.config.post_tasks)
    }

    /// Runs `roots` and everything they require, each identity once.
    pub fn execute(&self, roots: &[Task]) -> Result<ExecutionReport, DispatchError> {
        let span = info_span!("execute", roots = roots.len());
        let _enter = span.enter();

        let resolved = self.resolver().resolve(roots)?;
        self.run(&resolved, &[])
    }

    /// Runs `template` in a single `context`.
    pub fn execute_context(
        &self,
        template: &TaskTemplate,
        context: &ExecutionContext,
    ) -> Result<ExecutionReport, DispatchError> {
        self.execute(&[template.task(context)?])
    }

    /// Runs `template` for every context in `contexts`.
    ///
    /// A template requiring sequence execution has the remaining contexts
    /// (distinct, not yet committed) handed to its payload in a single call,
    /// after the union of all their requirements has run. Any other template
    /// runs once per distinct identity.
    pub fn execute_sequence(
        &self,
        template: &TaskTemplate,
        contexts: impl IntoIterator<Item = ExecutionContext>,
    ) -> Result<ExecutionReport, DispatchError> {
        let mut seen = HashSet::new();
        let mut roots = Vec::new();

        for context in contexts {
            let task = template.task(&context)?;
            if seen.insert(task.hash()) {
                roots.push(task);
            }
        }

        let span = info_span!("execute_sequence", template = template.name(), len = roots.len());
        let _enter = span.enter();

        let resolved = self.resolver().resolve(&roots)?;

        if template.requires_sequence_execution() && !template.is_no_op() {
            self.run(&resolved, &roots)
        } else {
            self.run(&resolved, &[])
        }
    }

    fn run(&self, resolved: &ResolvedGraph, sequence: &[Task]) -> Result<ExecutionReport, DispatchError> {
        let (plan, skipped) = plan(resolved, sequence, &self.claims)?;

        let mut report = if plan.node_count() == 0 {
            ExecutionReport::empty()
        } else if self.config.parallel {
            runner::run_parallel(&plan, &self.claims, &self.cancel, self.config.progress)?
        } else {
            runner::run_serial(&plan, &self.claims, &self.cancel, self.config.progress)?
        };

        report.skipped.splice(0..0, skipped);
        Ok(report)
    }
}

/// Groups the resolved tasks into invocation batches, dropping the ones
/// already committed.
///
/// The tasks in `sequence` form one batch together. Everything else is a
/// batch of its own.
fn plan(
    resolved: &ResolvedGraph,
    sequence: &[Task],
    claims: &Claims,
) -> Result<(Plan, Vec<Task>), GraphError> {
    let merge: HashSet<Hash32> = sequence.iter().map(Task::hash).collect();

    let mut graph: Plan = Graph::new();
    let mut batches: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut merged: Option<NodeIndex> = None;
    let mut skipped = Vec::new();

    for task in resolved.order() {
        let index = resolved.index[&task.hash()];

        if claims.contains(task.hash()) {
            debug!(task = %task, "skipping committed task");
            skipped.push(task.clone());
            continue;
        }

        let batch = if merge.contains(&task.hash()) {
            *merged.get_or_insert_with(|| {
                let tasks = sequence
                    .iter()
                    .filter(|t| !claims.contains(t.hash()))
                    .cloned()
                    .collect();
                graph.add_node(Batch {
                    template: task.template().clone(),
                    tasks,
                })
            })
        } else {
            graph.add_node(Batch::single(task))
        };

        batches.insert(index, batch);
    }

    for edge in resolved.graph.raw_edges() {
        let (Some(&source), Some(&target)) =
            (batches.get(&edge.source()), batches.get(&edge.target()))
        else {
            continue;
        };

        if source != target {
            graph.update_edge(source, target, ());
        }
    }

    // Merging can close a loop through tasks outside the sequence.
    topological_order(&graph)?;

    Ok((graph, skipped))
}
