use std::any::type_name;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

use petgraph::Graph;

use crate::context::ExecutionContext;
use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::template::{Link, LinkKind, TaskGraph, TemplateId, TemplateNode};

/// The blueprint of a task graph.
///
/// `Blueprint` is used to declare task templates and wire them together with
/// required (pre) and followed-by (post) links. Once configured, freeze it
/// into a [`TaskGraph`] with [`finish`](Self::finish).
///
/// # Example
///
/// ```rust
/// use taskdispatch::{Blueprint, Dispatcher, ExecutionContext};
///
/// let mut config = Blueprint::new();
///
/// let render = config
///     .template("render")
///     .uses("frame")
///     .run(|ctx| {
///         println!("rendering frame {:?}", ctx.frame());
///         Ok(())
///     });
///
/// let publish = config.template("publish").run(|_| Ok(()));
/// config.require(publish, render);
///
/// let graph = config.finish();
/// let dispatcher = Dispatcher::default();
/// let report = dispatcher
///     .execute_context(&graph.template(publish), &ExecutionContext::new())
///     .unwrap();
///
/// assert_eq!(report.committed.len(), 2);
/// ```
pub struct Blueprint {
    pub(crate) graph: Graph<TemplateNode, Link>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
        }
    }

    pub fn finish(self) -> TaskGraph {
        TaskGraph::new(self.graph)
    }

    /// The entry point for declaring a template.
    pub fn template(&mut self, name: impl Into<Cow<'static, str>>) -> TemplateDef<'_> {
        TemplateDef {
            blueprint: self,
            name: name.into(),
            kind: None,
            fingerprint: None,
            variables: BTreeSet::new(),
            requires_sequence_execution: false,
            run_sequence: None,
        }
    }

    /// `dependent` requires `dependency`, evaluated in the same context.
    pub fn require(&mut self, dependent: TemplateId, dependency: TemplateId) {
        self.link(dependency, dependent, LinkKind::Pre, None);
    }

    /// `dependent` requires `dependency` once for every context returned by
    /// `remap`. Returning nothing drops the requirement for that context.
    pub fn require_mapped<F>(&mut self, dependent: TemplateId, dependency: TemplateId, remap: F)
    where
        F: Fn(&ExecutionContext) -> Vec<ExecutionContext> + Send + Sync + 'static,
    {
        self.link(dependency, dependent, LinkKind::Pre, Some(Arc::new(remap)));
    }

    /// `follower` runs after `task`, evaluated in the same context.
    pub fn follow(&mut self, task: TemplateId, follower: TemplateId) {
        self.link(task, follower, LinkKind::Post, None);
    }

    pub fn follow_mapped<F>(&mut self, task: TemplateId, follower: TemplateId, remap: F)
    where
        F: Fn(&ExecutionContext) -> Vec<ExecutionContext> + Send + Sync + 'static,
    {
        self.link(task, follower, LinkKind::Post, Some(Arc::new(remap)));
    }

    fn link(
        &mut self,
        source: TemplateId,
        target: TemplateId,
        kind: LinkKind,
        remap: Option<crate::template::RemapFn>,
    ) {
        self.graph.add_edge(source.0, target.0, Link { kind, remap });
    }

    fn add_template(&mut self, node: TemplateNode) -> TemplateId {
        TemplateId(self.graph.add_node(node))
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };
            let label = match self.graph[edge].kind {
                LinkKind::Pre => "requires",
                LinkKind::Post => "then",
            };
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                label,
                target.index()
            )?;
        }

        Ok(())
    }
}

/// Builder for a single template, returned by [`Blueprint::template`].
pub struct TemplateDef<'a> {
    blueprint: &'a mut Blueprint,
    name: Cow<'static, str>,
    kind: Option<Cow<'static, str>>,
    fingerprint: Option<Hash32>,
    variables: BTreeSet<ArcStr>,
    requires_sequence_execution: bool,
    run_sequence: Option<crate::template::RunSequenceFn>,
}

impl<'a> TemplateDef<'a> {
    /// Kind identifier mixed into every task identity. Defaults to the type
    /// name of the payload closure.
    pub fn kind(mut self, kind: impl Into<Cow<'static, str>>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Declares the template's settings as its identity.
    ///
    /// By default every template instance has an identity of its own. Two
    /// templates of the same kind with equal fingerprints produce equal tasks
    /// in contexts agreeing on the used variables, so only declare this when
    /// the payload is fully determined by kind and fingerprint.
    pub fn fingerprint(mut self, settings: impl Hash) -> Self {
        let mut hasher = Blake3Hasher::default();
        settings.hash(&mut hasher);
        self.fingerprint = Some(hasher.into());
        self
    }

    /// Declares a context variable the payload reads.
    pub fn uses(mut self, variable: impl AsRef<str>) -> Self {
        self.variables.insert(variable.as_ref().into());
        self
    }

    pub fn uses_all<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.variables
            .extend(variables.into_iter().map(|v| ArcStr::from(v.as_ref())));
        self
    }

    pub fn requires_sequence_execution(mut self, value: bool) -> Self {
        self.requires_sequence_execution = value;
        self
    }

    /// Payload used for batched calls when sequence execution is required.
    pub fn sequence<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[ExecutionContext]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.run_sequence = Some(Arc::new(callback));
        self
    }

    /// Finishes the template with a per-context payload.
    pub fn run<F>(self, callback: F) -> TemplateId
    where
        F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = self.kind.clone().unwrap_or(type_name::<F>().into());
        self.finish(kind, false, Some(Arc::new(callback)))
    }

    /// Finishes the template with a payload that always receives the whole
    /// sequence of contexts.
    pub fn run_sequence<F>(mut self, callback: F) -> TemplateId
    where
        F: Fn(&[ExecutionContext]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = self.kind.clone().unwrap_or(type_name::<F>().into());
        self.run_sequence = Some(Arc::new(callback));
        self.requires_sequence_execution = true;
        self.finish(kind, false, None)
    }

    /// Finishes the template as a no-op, which only groups its links.
    pub fn no_op(self) -> TemplateId {
        let kind = self.kind.clone().unwrap_or("no-op".into());
        self.finish(kind, true, None)
    }

    fn finish(
        self,
        kind: Cow<'static, str>,
        is_no_op: bool,
        run: Option<crate::template::RunFn>,
    ) -> TemplateId {
        self.blueprint.add_template(TemplateNode {
            name: ArcStr::from(self.name.as_ref()),
            kind: ArcStr::from(kind.as_ref()),
            fingerprint: self.fingerprint,
            seed: Hash32::default(),
            is_no_op,
            requires_sequence_execution: self.requires_sequence_execution,
            variables: self.variables,
            run,
            run_sequence: self.run_sequence,
        })
    }
}
