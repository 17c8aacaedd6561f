use super::config::Executor;
use super::error::EngineError;
use super::progress::{Progress, ProgressReporter};
use super::shared_error::ErrorChannel;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::trace;

type Work = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(usize);

struct Node {
    label: String,
    work: Option<Work>,
    successors: Vec<usize>,
    predecessors: usize,
}

/// A directed acyclic graph of work items, built once and then launched.
///
/// A node runs once all of its predecessors have finished. Work closures
/// own whatever they need and are dropped right after they run.
#[derive(Default)]
pub(crate) struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn emplace<F>(&mut self, label: impl Into<String>, work: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(label.into(), Some(Box::new(work)))
    }

    /// A node without work, used to join or sequence groups of tasks.
    pub fn barrier(&mut self, label: impl Into<String>) -> TaskId {
        self.push(label.into(), None)
    }

    fn push(&mut self, label: String, work: Option<Work>) -> TaskId {
        self.nodes.push(Node {
            label,
            work,
            successors: Vec::new(),
            predecessors: 0,
        });
        TaskId(self.nodes.len() - 1)
    }

    /// `from` must finish before `to` starts.
    pub fn precede(&mut self, from: TaskId, to: TaskId) {
        self.nodes[from.0].successors.push(to.0);
        self.nodes[to.0].predecessors += 1;
    }

    pub fn precede_all(&mut self, from: TaskId, to: &[TaskId]) {
        for &t in to {
            self.precede(from, t);
        }
    }

    /// Kahn ordering over the whole graph; any node left unvisited sits on a
    /// cycle.
    pub fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.predecessors).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = ready.pop_front() {
            visited += 1;
            for &s in &self.nodes[i].successors {
                pending[s] -= 1;
                if pending[s] == 0 {
                    ready.push_back(s);
                }
            }
        }
        if visited == self.nodes.len() {
            Ok(())
        } else {
            let stuck = pending
                .iter()
                .position(|&p| p > 0)
                .map(|i| self.nodes[i].label.clone())
                .unwrap_or_default();
            Err(EngineError::Consistency(format!(
                "task graph has a cycle through '{stuck}'"
            )))
        }
    }

    /// Starts every node without predecessors on `executor` and returns a
    /// handle that completes when the last node has run.
    ///
    /// Progress is reported as one step per node that carries work.
    pub fn launch(
        self,
        executor: &Executor,
        errors: ErrorChannel,
        reporter: ProgressReporter,
    ) -> Completion {
        let signal = Arc::new(Signal::default());
        let total_steps = self.nodes.iter().filter(|n| n.work.is_some()).count() as u64;
        reporter.report(Progress::TaskStart { total_steps });
        if self.nodes.is_empty() {
            reporter.report(Progress::TaskFinish);
            signal.finish();
            return Completion { signal };
        }

        let roots: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].predecessors == 0)
            .collect();
        let run = Arc::new(Run {
            remaining: AtomicUsize::new(self.nodes.len()),
            nodes: self
                .nodes
                .into_iter()
                .map(|n| RunNode {
                    label: n.label,
                    work: Mutex::new(n.work),
                    successors: n.successors,
                    pending: AtomicUsize::new(n.predecessors),
                })
                .collect(),
            executor: executor.clone(),
            errors,
            reporter,
            signal: signal.clone(),
        });
        for index in roots {
            let run = run.clone();
            executor.spawn(move || execute(run, index));
        }
        Completion { signal }
    }
}

struct RunNode {
    label: String,
    work: Mutex<Option<Work>>,
    successors: Vec<usize>,
    pending: AtomicUsize,
}

struct Run {
    nodes: Vec<RunNode>,
    remaining: AtomicUsize,
    executor: Executor,
    errors: ErrorChannel,
    reporter: ProgressReporter,
    signal: Arc<Signal>,
}

fn execute(run: Arc<Run>, index: usize) {
    let node = &run.nodes[index];
    let work = node
        .work
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(work) = work {
        trace!(task = %node.label, "Running work item.");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            run.errors.set(EngineError::Panicked {
                task: node.label.clone(),
                message: panic_message(payload.as_ref()),
            });
        }
        run.reporter.report(Progress::TaskIncrement);
    }

    for &successor in &node.successors {
        if run.nodes[successor].pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let next = run.clone();
            run.executor.spawn(move || execute(next, successor));
        }
    }

    if run.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        run.reporter.report(Progress::TaskFinish);
        run.signal.finish();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Default)]
struct Signal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn finish(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }
}

/// Completion handle of a launched graph.
#[derive(Clone)]
pub(crate) struct Completion {
    signal: Arc<Signal>,
}

impl Completion {
    pub fn wait(&self) {
        let mut done = self.signal.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .signal
                .cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.signal.done.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(threads: usize) -> Executor {
        Executor::new(threads).unwrap()
    }

    fn run(graph: TaskGraph, threads: usize) -> ErrorChannel {
        let errors = ErrorChannel::new();
        graph
            .launch(&executor(threads), errors.clone(), ProgressReporter::new())
            .wait();
        errors
    }

    #[test]
    fn successors_run_after_all_predecessors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let log = log.clone();
            ids.push(graph.emplace(name, move || log.lock().unwrap().push(name)));
        }
        graph.precede(ids[0], ids[2]);
        graph.precede(ids[1], ids[2]);
        graph.precede(ids[2], ids[3]);

        assert!(run(graph, 4).rethrow_if_set().is_ok());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[2], "c");
        assert_eq!(log[3], "d");
    }

    #[test]
    fn barriers_sequence_groups() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut graph = TaskGraph::new();
        let start = graph.barrier("start");
        let join = graph.barrier("join");
        let mut first = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            first.push(graph.emplace("inc", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        graph.precede_all(start, &first);
        for &t in &first {
            graph.precede(t, join);
        }
        let seen = Arc::new(AtomicUsize::new(0));
        let (c, s) = (counter.clone(), seen.clone());
        let last = graph.emplace("read", move || {
            s.store(c.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        graph.precede(join, last);

        run(graph, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn panics_are_captured_and_the_graph_still_completes() {
        let mut graph = TaskGraph::new();
        let boom = graph.emplace("boom", || panic!("kernel exploded"));
        let after = Arc::new(AtomicUsize::new(0));
        let a = after.clone();
        let next = graph.emplace("next", move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        graph.precede(boom, next);

        let errors = run(graph, 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(
            errors.rethrow_if_set(),
            Err(EngineError::Panicked {
                task: "boom".into(),
                message: "kernel exploded".into(),
            })
        );
    }

    #[test]
    fn cycles_are_detected() {
        let mut graph = TaskGraph::new();
        let a = graph.barrier("a");
        let b = graph.barrier("b");
        let c = graph.barrier("c");
        graph.precede(a, b);
        assert!(graph.check_acyclic().is_ok());
        graph.precede(b, c);
        graph.precede(c, b);
        assert!(matches!(
            graph.check_acyclic(),
            Err(EngineError::Consistency(_))
        ));
    }

    #[test]
    fn progress_counts_work_nodes_only() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = ProgressReporter::with_callback(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        let mut graph = TaskGraph::new();
        let start = graph.barrier("start");
        let work = graph.emplace("work", || {});
        graph.precede(start, work);
        graph
            .launch(&executor(1), ErrorChannel::new(), reporter)
            .wait();

        let events = events.lock().unwrap();
        assert!(matches!(events[0], Progress::TaskStart { total_steps: 1 }));
        assert!(matches!(events[1], Progress::TaskIncrement));
        assert!(matches!(events[2], Progress::TaskFinish));
    }

    #[test]
    fn empty_graph_completes_immediately() {
        let completion = TaskGraph::new().launch(
            &executor(1),
            ErrorChannel::new(),
            ProgressReporter::new(),
        );
        assert!(completion.is_done());
        completion.wait();
    }
}
