use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::context::ExecutionContext;
use crate::core::{Blake3Hasher, Hash32};
use crate::error::IdentityError;
use crate::template::TaskTemplate;

/// A template resolved against a context: the unit the dispatcher reasons
/// about.
///
/// Two tasks are equal when their identities are equal. The identity is
/// computed once, from the template's kind and fingerprint and the values of
/// exactly the variables the template declares as used:
///
/// * all no-op tasks share one identity, whatever their template or context,
/// * a template that uses no variables has one identity across all contexts,
/// * tasks of different templates never share an identity unless the
///   templates were given the same kind and fingerprint.
#[derive(Clone)]
pub struct Task {
    template: TaskTemplate,
    context: ExecutionContext,
    hash: Hash32,
}

impl Task {
    pub fn new(template: &TaskTemplate, context: &ExecutionContext) -> Result<Self, IdentityError> {
        let hash = identity(template, context)?;

        Ok(Self {
            template: template.clone(),
            context: context.clone(),
            hash,
        })
    }

    pub fn template(&self) -> &TaskTemplate {
        &self.template
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn is_no_op(&self) -> bool {
        self.template.is_no_op()
    }

    /// Runs the payload for this task alone, without any deduplication.
    pub fn execute(&self) -> anyhow::Result<()> {
        self.template.invoke(std::slice::from_ref(&self.context))
    }
}

fn identity(template: &TaskTemplate, context: &ExecutionContext) -> Result<Hash32, IdentityError> {
    if template.is_no_op() {
        return Ok(Hash32::NO_OP);
    }

    let mut hasher = Blake3Hasher::default();
    template.seed().hash(&mut hasher);

    for name in template.context_variables_used() {
        let value = context
            .get(name)
            .ok_or_else(|| IdentityError::MissingVariable {
                template: template.name().to_string(),
                variable: name.to_string(),
            })?;

        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }

    Ok(hasher.into())
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Task", 4)?;
        state.serialize_field("template", self.template.name())?;
        state.serialize_field("kind", self.template.kind())?;
        state.serialize_field("hash", &self.hash)?;
        state.serialize_field("context", &self.context)?;
        state.end()
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("template", &self.template.name())
            .field("context", &self.context)
            .field("hash", &self.hash.short())
            .finish()
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.context.frame() {
            Some(frame) => write!(f, "{}@{}", self.template.name(), frame),
            None => f.write_str(self.template.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use super::*;
    use crate::Blueprint;
    use crate::context::FRAME;

    fn frame(f: impl Into<crate::Value>) -> ExecutionContext {
        ExecutionContext::new().with_frame(f)
    }

    #[test]
    fn test_insensitive_template_hashes_alike() {
        let mut bp = Blueprint::new();
        let id = bp.template("log").run(|_| Ok(()));
        let graph = bp.finish();
        let t = graph.template(id);

        let h1 = t.hash(&frame(1)).unwrap();
        assert_eq!(h1, t.hash(&frame(2)).unwrap());
        assert_eq!(h1, t.hash(&frame(3.0)).unwrap());
    }

    #[test]
    fn test_frame_sensitive_template() {
        let mut bp = Blueprint::new();
        let a = bp.template("a").uses(FRAME).run(|_| Ok(()));
        let b = bp.template("b").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();
        let (a, b) = (graph.template(a), graph.template(b));

        assert_ne!(a.hash(&frame(1)).unwrap(), a.hash(&frame(2)).unwrap());
        assert_eq!(a.hash(&frame(3)).unwrap(), a.hash(&frame(3.0)).unwrap());
        // Separate instances never share identity without a fingerprint.
        assert_ne!(a.hash(&frame(1)).unwrap(), b.hash(&frame(1)).unwrap());
    }

    #[test]
    fn test_fingerprint_shares_identity_and_kind_separates() {
        let mut bp = Blueprint::new();
        let n2 = bp
            .template("n2")
            .kind("logging")
            .fingerprint("####")
            .uses(FRAME)
            .run(|_| Ok(()));
        let n3 = bp
            .template("n3")
            .kind("logging")
            .fingerprint("####")
            .uses(FRAME)
            .run(|_| Ok(()));
        let n4 = bp
            .template("n4")
            .kind("my-logging")
            .fingerprint("####")
            .uses(FRAME)
            .run(|_| Ok(()));
        let graph = bp.finish();
        let (n2, n3, n4) = (graph.template(n2), graph.template(n3), graph.template(n4));

        for f in [1.0, 2.0, 3.0] {
            let ctx = frame(f);
            assert_eq!(n2.hash(&ctx).unwrap(), n3.hash(&ctx).unwrap());
            assert_ne!(n3.hash(&ctx).unwrap(), n4.hash(&ctx).unwrap());
        }
    }

    #[test]
    fn test_missing_variable() {
        let mut bp = Blueprint::new();
        let id = bp.template("writer").uses("shot").run(|_| Ok(()));
        let graph = bp.finish();

        let err = graph.template(id).task(&frame(1)).unwrap_err();
        assert_eq!(
            err,
            IdentityError::MissingVariable {
                template: "writer".into(),
                variable: "shot".into()
            }
        );
    }

    #[test]
    fn test_no_ops_collapse() {
        let mut bp = Blueprint::new();
        let n1 = bp.template("n1").uses(FRAME).no_op();
        let n2 = bp.template("n2").no_op();
        let graph = bp.finish();

        let c1 = ExecutionContext::empty();
        let c2 = ExecutionContext::new().with("a", 2);

        let t1 = graph.template(n1).task(&c1).unwrap();
        let t2 = graph.template(n1).task(&c1).unwrap();
        let t3 = graph.template(n1).task(&c2).unwrap();
        let t4 = graph.template(n2).task(&c2).unwrap();
        let t5 = graph.template(n2).task(&c1).unwrap();

        let set: HashSet<Task> = [&t1, &t2, &t3, &t4, &t4, &t4, &t1, &t2, &t4, &t3, &t2]
            .into_iter()
            .cloned()
            .collect();

        assert_eq!(set.len(), 1);
        assert!(set.contains(&t5));
    }

    #[test]
    fn test_frame_sensitive_set() {
        let mut bp = Blueprint::new();
        let my = bp.template("my").kind("logging").fingerprint("####").uses(FRAME).run(|_| Ok(()));
        let my2 = bp.template("my2").kind("logging").fingerprint("####").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();
        let (my, my2) = (graph.template(my), graph.template(my2));

        let c = frame(1);
        let c2 = frame(2);

        let t1 = my.task(&c).unwrap();
        let t2 = my.task(&c).unwrap();
        let t3 = my.task(&c2).unwrap();
        let t4 = my2.task(&c2).unwrap();
        let t5 = my2.task(&c).unwrap();

        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_eq!(t3, t4);
        assert_eq!(t1, t5);

        let set: HashSet<Task> = [&t1, &t2, &t3, &t4, &t4, &t4, &t1, &t2, &t4, &t3, &t2]
            .into_iter()
            .cloned()
            .collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&t5));
    }

    #[test]
    fn test_captured_context_is_a_copy() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();

        let mut ctx = frame(1);
        let task = graph.template(id).task(&ctx).unwrap();
        ctx.set(FRAME, 99);

        assert_eq!(task.context().frame(), Some(1.0));
        assert_eq!(task, graph.template(id).task(&frame(1)).unwrap());
    }

    #[test]
    fn test_accessors_reconstruct_task() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();

        let task = graph.template(id).task(&frame(4)).unwrap();
        let copy = Task::new(task.template(), task.context()).unwrap();
        assert_eq!(task, copy);
        assert_eq!(task.to_string(), "w@4");
    }

    #[test]
    fn test_execute_runs_every_time() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let mut bp = Blueprint::new();
        let id = bp.template("log").run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let graph = bp.finish();

        let task = graph.template(id).task(&frame(1)).unwrap();
        task.execute().unwrap();
        task.execute().unwrap();
        graph.template(id).task(&frame(2)).unwrap().execute().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn prop_equality_follows_used_variables(
            f1 in -1000i64..1000,
            f2 in -1000i64..1000,
            shot1 in "[a-c]",
            shot2 in "[a-c]",
        ) {
            let mut bp = Blueprint::new();
            let by_frame = bp.template("by_frame").uses(FRAME).run(|_| Ok(()));
            let by_nothing = bp.template("by_nothing").run(|_| Ok(()));
            let graph = bp.finish();

            let c1 = frame(f1).with("shot", shot1.as_str());
            let c2 = frame(f2 as f64).with("shot", shot2.as_str());

            let t1 = graph.template(by_frame).task(&c1).unwrap();
            let t2 = graph.template(by_frame).task(&c2).unwrap();
            prop_assert_eq!(t1 == t2, f1 == f2);
            prop_assert_eq!(t1 == t2, t1.hash() == t2.hash());

            let u1 = graph.template(by_nothing).task(&c1).unwrap();
            let u2 = graph.template(by_nothing).task(&c2).unwrap();
            prop_assert_eq!(u1, u2);
        }

        #[test]
        fn prop_set_dedup_ignores_order_and_multiplicity(
            picks in proptest::collection::vec(0usize..4, 1..32),
        ) {
            let mut bp = Blueprint::new();
            let id = bp.template("w").uses(FRAME).run(|_| Ok(()));
            let graph = bp.finish();
            let t = graph.template(id);

            // t1 == t2 and t3 == t4, but t1 != t3.
            let tasks = [
                t.task(&frame(1)).unwrap(),
                t.task(&frame(1.0)).unwrap(),
                t.task(&frame(2)).unwrap(),
                t.task(&frame(2).with("unused", true)).unwrap(),
            ];

            let set: HashSet<Task> = picks.iter().map(|&i| tasks[i].clone()).collect();
            let expected: HashSet<usize> = picks.iter().map(|&i| i / 2).collect();
            prop_assert_eq!(set.len(), expected.len());
        }
    }
}
