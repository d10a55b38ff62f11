mod diagnostics;

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use tracing::{Level, Span, debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::ExecutionContext;
use crate::core::Hash32;
use crate::error::PayloadError;
use crate::task::Task;
use crate::template::TaskTemplate;

pub use diagnostics::{BatchExecution, DispatchStatus, ExecutionReport};

static STYLE_DISPATCH: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

static DISPATCH_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Dispatches whose payloads are on this thread's stack right now.
    static INVOKING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Held by the dispatch with this id.
    Running(u64),
    Committed,
}

/// Identities claimed over the lifetime of a dispatcher.
///
/// Claiming is an atomic check-and-insert, so an identity is handed out to
/// exactly one invocation however many dispatches race for it. Claiming an
/// identity another dispatch is still running blocks until that invocation
/// commits or releases it, unless that invocation is the caller itself.
#[derive(Debug, Default)]
pub(crate) struct Claims {
    map: Mutex<HashMap<Hash32, Claim>>,
    changed: Condvar,
}

impl Claims {
    /// Whether `hash` ran to completion.
    pub fn contains(&self, hash: Hash32) -> bool {
        self.lock().get(&hash) == Some(&Claim::Committed)
    }

    pub fn len(&self) -> usize {
        self.lock().values().filter(|&&c| c == Claim::Committed).count()
    }

    /// Forgets committed identities. Running ones stay claimed.
    pub fn clear(&self) {
        self.lock().retain(|_, claim| matches!(claim, Claim::Running(_)));
    }

    /// Splits `tasks` into the ones claimed now for dispatch `owner` and the
    /// ones already committed.
    ///
    /// Fails with the offending task when one of them is held by a payload
    /// further up the calling thread's stack, which would never release it.
    pub fn claim(&self, tasks: &[Task], owner: u64) -> Result<(Vec<Task>, Vec<Task>), Task> {
        let mut map = self.lock();

        loop {
            let held = tasks.iter().find_map(|task| match map.get(&task.hash()) {
                Some(&Claim::Running(holder)) => Some((task, holder)),
                _ => None,
            });

            let Some((task, holder)) = held else {
                break;
            };

            if INVOKING.with_borrow(|stack| stack.contains(&holder)) {
                return Err(task.clone());
            }

            map = self.changed.wait(map).unwrap_or_else(PoisonError::into_inner);
        }

        Ok(tasks.iter().cloned().partition(|task| match map.entry(task.hash()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Claim::Running(owner));
                true
            }
        }))
    }

    pub fn commit(&self, tasks: &[Task]) {
        let mut map = self.lock();
        for task in tasks {
            map.insert(task.hash(), Claim::Committed);
        }
        self.changed.notify_all();
    }

    pub fn release(&self, tasks: &[Task]) {
        let mut map = self.lock();
        for task in tasks {
            map.remove(&task.hash());
        }
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Hash32, Claim>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One payload invocation unit.
pub(crate) struct Batch {
    pub template: TaskTemplate,
    pub tasks: Vec<Task>,
}

impl Batch {
    pub fn single(task: &Task) -> Self {
        Self {
            template: task.template().clone(),
            tasks: vec![task.clone()],
        }
    }
}

impl Display for Batch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.tasks.as_slice() {
            [task] => write!(f, "{task}"),
            tasks => write!(f, "{}[{}]", self.template.name(), tasks.len()),
        }
    }
}

/// Batches with edges from each batch to the batches waiting for it.
pub(crate) type Plan = Graph<Batch, ()>;

/// Cooperative cancellation, checked before every invocation.
pub(crate) trait Cancel: Sync {
    fn is_cancelled(&self) -> bool;
}

struct Finished {
    index: NodeIndex,
    claimed: Vec<Task>,
    result: anyhow::Result<()>,
    start: Instant,
    duration: Duration,
}

type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Done,
}

/// Dependency-count scheduler shared by the serial and the parallel runner.
///
/// Batches are started as soon as all the batches before them are done. The
/// lowest ready index goes first, which makes serial dispatch deterministic.
struct Scheduler<'a, C: Cancel> {
    id: u64,
    plan: &'a Plan,
    claims: &'a Claims,
    cancel: &'a C,
    span: Span,
    origin: Instant,
    sender: Sender<Finished>,
    counts: Vec<usize>,
    states: Vec<State>,
    ready: BinaryHeap<Reverse<NodeIndex>>,
    report: ExecutionReport,
    failure: Option<PayloadError>,
}

impl<'a, C: Cancel> Scheduler<'a, C> {
    fn new(
        plan: &'a Plan,
        claims: &'a Claims,
        cancel: &'a C,
        span: Span,
        sender: Sender<Finished>,
    ) -> Self {
        let counts: Vec<usize> = plan
            .node_indices()
            .map(|i| plan.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let ready = plan
            .node_indices()
            .filter(|i| counts[i.index()] == 0)
            .map(Reverse)
            .collect();

        Self {
            id: DISPATCH_ID.fetch_add(1, Ordering::Relaxed),
            plan,
            claims,
            cancel,
            span,
            origin: Instant::now(),
            sender,
            counts,
            states: vec![State::Pending; plan.node_count()],
            ready,
            report: ExecutionReport::empty(),
            failure: None,
        }
    }

    fn halted(&self) -> bool {
        self.failure.is_some() || self.cancel.is_cancelled()
    }

    /// Starts every ready batch through `spawn`, then waits for one to
    /// finish. Returns once nothing is running and nothing more can start.
    fn drive(&mut self, receiver: Receiver<Finished>, spawn: impl Fn(Job<'a>)) {
        let mut in_flight = 0;

        loop {
            while !self.halted() {
                let Some(Reverse(index)) = self.ready.pop() else {
                    break;
                };

                let plan = self.plan;
                let batch = &plan[index];
                let (claimed, taken) = match self.claims.claim(&batch.tasks, self.id) {
                    Ok(split) => split,
                    Err(task) => {
                        warn!(batch = %batch, "task is already running further up this thread");
                        self.states[index.index()] = State::Done;
                        self.failure = Some(PayloadError {
                            error: anyhow::anyhow!(
                                "Task '{task}' was dispatched again from inside its own invocation"
                            ),
                            task,
                            batch: batch.tasks.clone(),
                            committed: Vec::new(),
                            not_attempted: Vec::new(),
                        });
                        break;
                    }
                };
                for task in &taken {
                    debug!(task = %task, "skipping committed task");
                }
                self.report.skipped.extend(taken);

                if claimed.is_empty() {
                    self.complete(index);
                    continue;
                }

                self.states[index.index()] = State::Running;
                in_flight += 1;
                spawn(self.job(index, claimed));
            }

            if in_flight == 0 {
                break;
            }

            let Ok(finished) = receiver.recv() else {
                break;
            };
            in_flight -= 1;
            self.finish(finished);
        }
    }

    fn job(&self, index: NodeIndex, claimed: Vec<Task>) -> Job<'a> {
        let id = self.id;
        let plan: &'a Plan = self.plan;
        let claims: &'a Claims = self.claims;
        let sender = self.sender.clone();
        let parent = self.span.clone();

        Box::new(move || {
            let batch = &plan[index];

            let span = tracing::span!(parent: &parent, Level::INFO, "task", name = %batch);
            span.pb_set_style(&STYLE_TASK);
            span.pb_set_message(&format!("Running {batch}"));
            let _enter = span.enter();

            INVOKING.with_borrow_mut(|stack| stack.push(id));
            let start = Instant::now();
            let result = invoke(&batch.template, &claimed);
            let duration = start.elapsed();
            INVOKING.with_borrow_mut(|stack| stack.pop());

            match &result {
                Ok(()) => claims.commit(&claimed),
                Err(_) => claims.release(&claimed),
            }

            let _ = sender.send(Finished {
                index,
                claimed,
                result,
                start,
                duration,
            });
        })
    }

    fn finish(&mut self, finished: Finished) {
        let Finished {
            index,
            claimed,
            result,
            start,
            duration,
        } = finished;

        match result {
            Ok(()) => {
                self.span.pb_inc(claimed.len() as u64);
                self.report.batches.push(BatchExecution {
                    tasks: claimed.clone(),
                    start: start.duration_since(self.origin),
                    duration,
                });
                self.report.committed.extend(claimed);
                self.complete(index);
            }
            Err(error) => {
                self.states[index.index()] = State::Done;

                if self.failure.is_some() {
                    warn!(batch = %self.plan[index], "{error:#}");
                    return;
                }

                warn!(batch = %self.plan[index], "payload failed");
                self.failure = Some(PayloadError {
                    task: claimed[0].clone(),
                    batch: claimed,
                    committed: Vec::new(),
                    not_attempted: Vec::new(),
                    error,
                });
            }
        }
    }

    fn complete(&mut self, index: NodeIndex) {
        self.states[index.index()] = State::Done;

        for next in self.plan.neighbors_directed(index, Direction::Outgoing) {
            let count = &mut self.counts[next.index()];
            *count -= 1;
            if *count == 0 {
                self.ready.push(Reverse(next));
            }
        }
    }

    fn into_result(self) -> Result<ExecutionReport, PayloadError> {
        let mut report = self.report;
        report.elapsed = self.origin.elapsed();

        let unstarted: Vec<Task> = self
            .plan
            .node_indices()
            .filter(|i| self.states[i.index()] == State::Pending)
            .flat_map(|i| self.plan[i].tasks.iter().cloned())
            .collect();

        if let Some(mut failure) = self.failure {
            failure.committed = report.committed;
            failure.not_attempted = unstarted;
            return Err(failure);
        }

        if !unstarted.is_empty() {
            report.status = DispatchStatus::Cancelled;
            report.abandoned = unstarted;
        }

        Ok(report)
    }
}

/// Runs the plan on the calling thread, one batch after another.
pub(crate) fn run_serial<C: Cancel>(
    plan: &Plan,
    claims: &Claims,
    cancel: &C,
    progress: bool,
) -> Result<ExecutionReport, PayloadError> {
    let span = dispatch_span(plan, progress);
    let _enter = span.enter();

    let (sender, receiver) = channel();
    let mut scheduler = Scheduler::new(plan, claims, cancel, span.clone(), sender);
    scheduler.drive(receiver, |job| job());

    conclude(scheduler)
}

/// Runs the plan on the rayon thread pool. The calling thread only
/// schedules. Each ready batch is spawned as soon as its dependency count
/// drops to zero.
pub(crate) fn run_parallel<C: Cancel>(
    plan: &Plan,
    claims: &Claims,
    cancel: &C,
    progress: bool,
) -> Result<ExecutionReport, PayloadError> {
    let span = dispatch_span(plan, progress);
    let _enter = span.enter();

    let (sender, receiver) = channel();
    let mut scheduler = Scheduler::new(plan, claims, cancel, span.clone(), sender);

    // The scheduler blocks while waiting for results, so it stays on the
    // calling thread and only the batches go to the pool.
    rayon::in_place_scope(|s| {
        scheduler.drive(receiver, |job| s.spawn(move |_| job()));
    });

    conclude(scheduler)
}

fn dispatch_span(plan: &Plan, progress: bool) -> Span {
    let total: usize = plan.node_weights().map(|batch| batch.tasks.len()).sum();

    let span = tracing::span!(Level::INFO, "dispatch", tasks = total);
    if progress {
        span.pb_set_length(total as u64);
        span.pb_set_style(&STYLE_DISPATCH);
        span.pb_set_message("Dispatching tasks...");
    }
    span
}

fn conclude<C: Cancel>(scheduler: Scheduler<'_, C>) -> Result<ExecutionReport, PayloadError> {
    let result = scheduler.into_result();

    match &result {
        Ok(report) if report.is_cancelled() => {
            warn!(abandoned = report.abandoned.len(), "Dispatch cancelled")
        }
        Ok(report) => info!(
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            "Dispatch complete!"
        ),
        Err(err) => warn!(
            committed = err.committed.len(),
            not_attempted = err.not_attempted.len(),
            "Dispatch halted by a failing task"
        ),
    }

    result
}

/// Calls the payload, turning panics into errors.
fn invoke(template: &TaskTemplate, tasks: &[Task]) -> anyhow::Result<()> {
    let contexts: Vec<ExecutionContext> = tasks.iter().map(|t| t.context().clone()).collect();

    // The payload only sees cloned contexts and shared immutable templates.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| template.invoke(&contexts))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::Blueprint;
    use crate::context::FRAME;

    struct Never;

    impl Cancel for Never {
        fn is_cancelled(&self) -> bool {
            false
        }
    }

    impl Cancel for AtomicBool {
        fn is_cancelled(&self) -> bool {
            self.load(Ordering::SeqCst)
        }
    }

    fn tasks(template: &TaskTemplate, frames: &[i64]) -> Vec<Task> {
        frames
            .iter()
            .map(|&f| template.task(&ExecutionContext::new().with_frame(f)).unwrap())
            .collect()
    }

    #[test]
    fn test_claims_are_exclusive() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();
        let all = tasks(&graph.template(id), &[1, 2, 3]);

        let claims = Claims::default();
        let (claimed, taken) = claims.claim(&all[..2], 0).unwrap();
        assert_eq!((claimed.len(), taken.len()), (2, 0));
        assert!(!claims.contains(all[0].hash()));
        claims.commit(&claimed);

        let (claimed, taken) = claims.claim(&all, 0).unwrap();
        assert_eq!(claimed, vec![all[2].clone()]);
        assert_eq!(taken.len(), 2);
        claims.commit(&claimed);

        claims.release(&all[..1]);
        assert!(!claims.contains(all[0].hash()));
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn test_claim_waits_for_running_identity() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").run(|_| Ok(()));
        let graph = bp.finish();
        let all = tasks(&graph.template(id), &[1]);

        let claims = Claims::default();
        let (claimed, _) = claims.claim(&all, 0).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                claims.commit(&claimed);
            });

            let (claimed, taken) = claims.claim(&all, 1).unwrap();
            assert!(claimed.is_empty());
            assert_eq!(taken, all);
        });
    }

    #[test]
    fn test_claim_held_up_the_stack_fails() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").run(|_| Ok(()));
        let graph = bp.finish();
        let all = tasks(&graph.template(id), &[1]);

        let claims = Claims::default();
        claims.claim(&all, 7).unwrap();

        INVOKING.with_borrow_mut(|stack| stack.push(7));
        let held = claims.claim(&all, 8);
        INVOKING.with_borrow_mut(|stack| stack.pop());

        assert_eq!(held.unwrap_err(), all[0]);
    }

    #[test]
    fn test_panics_become_errors() {
        let mut bp = Blueprint::new();
        let id = bp.template("boom").run(|_| panic!("kaboom"));
        let graph = bp.finish();
        let task = graph.template(id).task(&ExecutionContext::new()).unwrap();

        let err = invoke(task.template(), &[task.clone()]).unwrap_err();
        assert_eq!(err.to_string(), "Task panicked: kaboom");
    }

    #[test]
    fn test_serial_runs_in_index_order() {
        let log = std::sync::Arc::new(Mutex::new(Vec::new()));

        let mut bp = Blueprint::new();
        let sink = log.clone();
        let id = bp
            .template("w")
            .uses(FRAME)
            .run(move |ctx| {
                sink.lock().unwrap().push(ctx.frame().unwrap_or_default() as i64);
                Ok(())
            });
        let graph = bp.finish();

        let mut plan = Plan::new();
        let batches: Vec<NodeIndex> = tasks(&graph.template(id), &[1, 2, 3])
            .iter()
            .map(|t| plan.add_node(Batch::single(t)))
            .collect();
        // 3 before 1
        plan.add_edge(batches[2], batches[0], ());

        let report = run_serial(&plan, &Claims::default(), &Never, false).unwrap();
        assert_eq!(*log.lock().unwrap(), [2, 3, 1]);
        assert_eq!(report.batches.len(), 3);
        assert_eq!(report.status, DispatchStatus::Completed);
    }

    #[test]
    fn test_cancelled_before_start_abandons_everything() {
        let mut bp = Blueprint::new();
        let id = bp.template("w").uses(FRAME).run(|_| Ok(()));
        let graph = bp.finish();

        let mut plan = Plan::new();
        for task in tasks(&graph.template(id), &[1, 2]) {
            plan.add_node(Batch::single(&task));
        }

        let report = run_parallel(&plan, &Claims::default(), &AtomicBool::new(true), false).unwrap();
        assert!(report.is_cancelled());
        assert!(report.committed.is_empty());
        assert_eq!(report.abandoned.len(), 2);
    }
}
