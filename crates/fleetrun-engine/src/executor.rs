//! Runs a [`TaskGraph`] on a [`WorkerPool`].
//!
//! Only the future returned by [`DependencyExecutor::execute`] touches the
//! graph. Work orders report back over a completion channel; the executor
//! consumes that channel, updates task status and submits tasks whose
//! dependencies are now all done. A task that fails takes every task that
//! transitively depends on it down with it; unrelated branches keep running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::graph::{GraphError, TaskGraph, TaskNode, TaskStatus};
use crate::pool::{WorkFuture, WorkOrder, WorkerPool};

/// Reason recorded on tasks that never started because of cancellation.
const CANCELLED: &str = "cancelled";

/// Outcome of a successful run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Tasks finished by this run, in completion order.
    pub completed: Vec<String>,
    /// Tasks with no registered work, marked done without running.
    pub unregistered: Vec<String>,
    pub elapsed: Duration,
}

/// Errors from [`DependencyExecutor::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(
        "some tasks failed: {} failed, {} skipped (failed: {})",
        failed.len(),
        skipped.len(),
        failed.join(", ")
    )]
    TasksFailed {
        /// Tasks whose own work failed.
        failed: Vec<String>,
        /// Tasks never started because a dependency failed or the run was
        /// cancelled.
        skipped: Vec<String>,
    },
}

struct Completion {
    id: String,
    outcome: Result<(), String>,
}

/// Posts a completion exactly once, even if the task panics.
struct CompletionGuard {
    id: Option<String>,
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionGuard {
    fn finish(mut self, outcome: Result<(), String>) {
        if let Some(id) = self.id.take() {
            let _ = self.tx.send(Completion { id, outcome });
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.tx.send(Completion {
                id,
                outcome: Err("task panicked or was dropped before completing".to_string()),
            });
        }
    }
}

/// Couples one graph with one pool for a single run.
pub struct DependencyExecutor<'a> {
    graph: &'a mut TaskGraph,
    pool: &'a WorkerPool,
    tasks: HashMap<String, WorkOrder>,
    cancel: Option<CancellationToken>,
}

/// Bookkeeping owned by the coordinator for the duration of one run.
#[derive(Default)]
struct RunState {
    remaining: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    ready: Vec<String>,
    in_flight: usize,
    report: ExecutionReport,
    failed: Vec<String>,
    skipped: Vec<String>,
}

impl<'a> DependencyExecutor<'a> {
    pub fn new(graph: &'a mut TaskGraph, pool: &'a WorkerPool) -> Self {
        Self {
            graph,
            pool,
            tasks: HashMap::new(),
            cancel: None,
        }
    }

    /// Stop submitting new tasks once `token` is cancelled. Running tasks
    /// finish; tasks that never started are marked failed.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bind the work for task `id`. The closure receives the worker id.
    pub fn register_task<F, Fut>(&mut self, id: impl Into<String>, task: F)
    where
        F: FnOnce(usize) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let order: WorkOrder =
            Box::new(move |worker_id| -> WorkFuture { Box::pin(task(worker_id)) });
        self.tasks.insert(id.into(), order);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Run every task once its dependencies are done.
    ///
    /// The graph is validated first; nothing runs if it has unknown
    /// dependencies or a cycle. Tasks already marked done count as satisfied
    /// and are not run again.
    pub async fn execute(mut self) -> Result<ExecutionReport, ExecutorError> {
        self.graph.validate()?;
        let started = Instant::now();
        let mut state = self.prepare();
        info!(
            tasks = state.remaining.len(),
            ready = state.ready.len(),
            workers = self.pool.size(),
            "Starting dependency execution"
        );

        self.pool.start();
        let (tx, mut rx) = mpsc::unbounded_channel();

        loop {
            self.dispatch_ready(&mut state, &tx);
            if state.in_flight == 0 {
                break;
            }
            let Some(completion) = rx.recv().await else {
                break;
            };
            state.in_flight -= 1;
            self.complete(&mut state, completion);
        }

        // Anything still pending never became ready: the run was cancelled.
        let stranded: Vec<String> = self
            .graph
            .nodes()
            .filter(|n| n.status == TaskStatus::Pending)
            .map(|n| n.id.clone())
            .collect();
        for id in stranded {
            self.graph
                .set_status(&id, TaskStatus::Failed, Some(CANCELLED.to_string()));
            state.skipped.push(id);
        }

        state.report.elapsed = started.elapsed();
        if state.failed.is_empty() && state.skipped.is_empty() {
            info!(
                completed = state.report.completed.len(),
                elapsed_ms = state.report.elapsed.as_millis(),
                "Dependency execution finished"
            );
            Ok(state.report)
        } else {
            warn!(
                failed = state.failed.len(),
                skipped = state.skipped.len(),
                "Dependency execution finished with failures"
            );
            Err(ExecutorError::TasksFailed {
                failed: state.failed,
                skipped: state.skipped,
            })
        }
    }

    /// Reset unfinished tasks and compute outstanding dependency counts.
    fn prepare(&mut self) -> RunState {
        let mut state = RunState::default();
        let open: Vec<(String, Vec<String>)> = self
            .graph
            .nodes()
            .filter(|n| n.status != TaskStatus::Done)
            .map(|n| (n.id.clone(), n.dependencies.clone()))
            .collect();

        for (id, deps) in open {
            self.graph.set_status(&id, TaskStatus::Pending, None);
            let mut outstanding = 0;
            for dep in deps {
                let done = self
                    .graph
                    .node(&dep)
                    .is_some_and(|d| d.status == TaskStatus::Done);
                if !done {
                    outstanding += 1;
                    state.dependents.entry(dep).or_default().push(id.clone());
                }
            }
            if outstanding == 0 {
                state.ready.push(id.clone());
            }
            state.remaining.insert(id, outstanding);
        }
        state
    }

    /// Submit every ready task, highest priority first.
    fn dispatch_ready(&mut self, state: &mut RunState, tx: &mpsc::UnboundedSender<Completion>) {
        while !state.ready.is_empty() {
            let mut batch = std::mem::take(&mut state.ready);
            batch.sort_by(|a, b| {
                let rank = |id: &str| self.graph.node(id).map_or(1, TaskNode::rank);
                rank(b).cmp(&rank(a)).then_with(|| a.cmp(b))
            });

            for id in batch {
                if self.is_cancelled() {
                    debug!(task_id = %id, "Run cancelled, not starting task");
                    self.graph
                        .set_status(&id, TaskStatus::Failed, Some(CANCELLED.to_string()));
                    state.skipped.push(id);
                    continue;
                }

                let Some(order) = self.tasks.remove(&id) else {
                    warn!(task_id = %id, "No work registered for task, marking done");
                    state.report.unregistered.push(id.clone());
                    self.complete(
                        state,
                        Completion {
                            id,
                            outcome: Ok(()),
                        },
                    );
                    continue;
                };

                self.graph.set_status(&id, TaskStatus::Running, None);
                debug!(task_id = %id, "Submitting task");
                let guard = CompletionGuard {
                    id: Some(id.clone()),
                    tx: tx.clone(),
                };
                let submitted = self.pool.submit(move |worker_id| async move {
                    let result = order(worker_id).await;
                    guard.finish(result.as_ref().map(|_| ()).map_err(|e| format!("{e:#}")));
                    result
                });
                // A rejected order is dropped with its guard, which reports
                // the failure, so it still counts as in flight.
                if let Err(e) = submitted {
                    warn!(task_id = %id, error = %e, "Failed to submit task");
                }
                state.in_flight += 1;
            }
        }
    }

    fn complete(&mut self, state: &mut RunState, completion: Completion) {
        let Completion { id, outcome } = completion;
        match outcome {
            Ok(()) => {
                debug!(task_id = %id, "Task done");
                self.graph.set_status(&id, TaskStatus::Done, None);
                state.report.completed.push(id.clone());
                for dependent in state.dependents.get(&id).cloned().unwrap_or_default() {
                    if let Some(outstanding) = state.remaining.get_mut(&dependent) {
                        *outstanding = outstanding.saturating_sub(1);
                        let pending = self
                            .graph
                            .node(&dependent)
                            .is_some_and(|n| n.status == TaskStatus::Pending);
                        if *outstanding == 0 && pending {
                            state.ready.push(dependent);
                        }
                    }
                }
            }
            Err(message) => {
                warn!(task_id = %id, error = %message, "Task failed");
                self.graph
                    .set_status(&id, TaskStatus::Failed, Some(message));
                state.failed.push(id.clone());
                self.cascade_failure(state, &id);
            }
        }
    }

    /// Mark every pending transitive dependent of `failed_id` as failed.
    fn cascade_failure(&mut self, state: &mut RunState, failed_id: &str) {
        let mut queue: VecDeque<(String, String)> = state
            .dependents
            .get(failed_id)
            .into_iter()
            .flatten()
            .map(|d| (d.clone(), failed_id.to_string()))
            .collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some((id, cause)) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let pending = self
                .graph
                .node(&id)
                .is_some_and(|n| n.status == TaskStatus::Pending);
            if !pending {
                continue;
            }
            self.graph.set_status(
                &id,
                TaskStatus::Failed,
                Some(format!("dependency '{cause}' failed")),
            );
            info!(task_id = %id, cause = %cause, "Skipping task after dependency failure");
            state.skipped.push(id.clone());
            for next in state.dependents.get(&id).into_iter().flatten() {
                queue.push_back((next.clone(), id.clone()));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for (id, deps) in edges {
            g.add_node(*id, *id, deps).unwrap();
        }
        g
    }

    /// Register a task that records its start after checking its
    /// dependencies already finished.
    fn register_recording(
        executor: &mut DependencyExecutor<'_>,
        id: &str,
        deps: &[&str],
        finished: &Log,
        violations: &Log,
    ) {
        let id_owned = id.to_string();
        let deps: Vec<String> = deps.iter().map(|d| (*d).to_string()).collect();
        let finished = Arc::clone(finished);
        let violations = Arc::clone(violations);
        executor.register_task(id, move |_| async move {
            {
                let done = finished.lock().unwrap();
                for dep in &deps {
                    if !done.contains(dep) {
                        violations.lock().unwrap().push(format!("{id_owned} before {dep}"));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            finished.lock().unwrap().push(id_owned);
            Ok(())
        });
    }

    #[tokio::test]
    async fn never_runs_task_before_dependencies() {
        let edges: &[(&str, &[&str])] = &[
            ("fetch", &[]),
            ("build", &["fetch"]),
            ("lint", &["fetch"]),
            ("test", &["build"]),
            ("release", &["test", "lint"]),
        ];
        let mut g = graph(edges);
        let pool = WorkerPool::new(3);
        let finished: Log = Arc::default();
        let violations: Log = Arc::default();

        let mut executor = DependencyExecutor::new(&mut g, &pool);
        for (id, deps) in edges {
            register_recording(&mut executor, id, deps, &finished, &violations);
        }
        let report = executor.execute().await.unwrap();
        pool.stop().await;

        assert!(violations.lock().unwrap().is_empty(), "{violations:?}");
        assert_eq!(report.completed.len(), 5);
        assert_eq!(report.completed.last().map(String::as_str), Some("release"));
        assert!(g.nodes().all(|n| n.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_independent_branches() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let pool = WorkerPool::new(2);
        let ran: Log = Arc::default();

        let mut executor = DependencyExecutor::new(&mut g, &pool);
        executor.register_task("a", |_| async { Err(anyhow::anyhow!("compile error")) });
        for id in ["b", "c", "d"] {
            let ran = Arc::clone(&ran);
            executor.register_task(id, move |_| async move {
                ran.lock().unwrap().push(id.to_string());
                Ok(())
            });
        }
        let err = executor.execute().await.unwrap_err();
        pool.stop().await;

        match err {
            ExecutorError::TasksFailed { failed, skipped } => {
                assert_eq!(failed, vec!["a"]);
                assert_eq!(skipped, vec!["b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*ran.lock().unwrap(), vec!["d"]);
        assert_eq!(g.node("a").unwrap().error.as_deref(), Some("compile error"));
        assert_eq!(
            g.node("b").unwrap().error.as_deref(),
            Some("dependency 'a' failed")
        );
        assert_eq!(
            g.node("c").unwrap().error.as_deref(),
            Some("dependency 'b' failed")
        );
        assert_eq!(g.node("d").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn panicking_task_is_reported_failed() {
        fn explode() -> anyhow::Result<()> {
            panic!("task blew up")
        }

        let mut g = graph(&[("a", &[]), ("b", &["a"])]);
        let pool = WorkerPool::new(1);
        let mut executor = DependencyExecutor::new(&mut g, &pool);
        executor.register_task("a", |_| async { explode() });
        executor.register_task("b", |_| async { Ok(()) });

        let err = executor.execute().await.unwrap_err();
        pool.stop().await;
        assert!(matches!(err, ExecutorError::TasksFailed { .. }));
        assert_eq!(g.node("a").unwrap().status, TaskStatus::Failed);
        assert_eq!(g.node("b").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_anything_runs() {
        let mut g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let pool = WorkerPool::new(1);
        let ran: Log = Arc::default();
        let mut executor = DependencyExecutor::new(&mut g, &pool);
        let log = Arc::clone(&ran);
        executor.register_task("c", move |_| async move {
            log.lock().unwrap().push("c".to_string());
            Ok(())
        });

        let err = executor.execute().await.unwrap_err();
        pool.stop().await;
        assert!(matches!(err, ExecutorError::Graph(GraphError::Cycle { .. })));
        assert!(ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let mut g = graph(&[("a", &["ghost"])]);
        let pool = WorkerPool::new(1);
        let err = DependencyExecutor::new(&mut g, &pool)
            .execute()
            .await
            .unwrap_err();
        pool.stop().await;
        assert!(matches!(
            err,
            ExecutorError::Graph(GraphError::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_tasks_complete_immediately() {
        let mut g = graph(&[("a", &[]), ("b", &["a"])]);
        let pool = WorkerPool::new(1);
        let mut executor = DependencyExecutor::new(&mut g, &pool);
        executor.register_task("b", |_| async { Ok(()) });

        let report = executor.execute().await.unwrap();
        pool.stop().await;
        assert_eq!(report.unregistered, vec!["a"]);
        assert_eq!(report.completed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn done_tasks_are_not_rerun() {
        let mut g = graph(&[("a", &[]), ("b", &["a"])]);
        g.set_status("a", TaskStatus::Done, None);
        let pool = WorkerPool::new(1);
        let ran: Log = Arc::default();

        let mut executor = DependencyExecutor::new(&mut g, &pool);
        for id in ["a", "b"] {
            let ran = Arc::clone(&ran);
            executor.register_task(id, move |_| async move {
                ran.lock().unwrap().push(id.to_string());
                Ok(())
            });
        }
        executor.execute().await.unwrap();
        pool.stop().await;
        assert_eq!(*ran.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn ready_tasks_are_submitted_by_priority() {
        let mut g = TaskGraph::new();
        g.add_node_with_priority("low", "l", &[], "Low").unwrap();
        g.add_node_with_priority("high-b", "h", &[], "High").unwrap();
        g.add_node_with_priority("mvp", "m", &[], "MVP").unwrap();
        g.add_node_with_priority("high-a", "h", &[], "Production").unwrap();
        let pool = WorkerPool::new(1);
        let ran: Log = Arc::default();

        let mut executor = DependencyExecutor::new(&mut g, &pool);
        for id in ["low", "high-b", "mvp", "high-a"] {
            let ran = Arc::clone(&ran);
            executor.register_task(id, move |_| async move {
                ran.lock().unwrap().push(id.to_string());
                Ok(())
            });
        }
        executor.execute().await.unwrap();
        pool.stop().await;
        assert_eq!(*ran.lock().unwrap(), vec!["high-a", "high-b", "mvp", "low"]);
    }

    #[tokio::test]
    async fn cancellation_stops_new_submissions() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();
        let ran: Log = Arc::default();

        let mut executor =
            DependencyExecutor::new(&mut g, &pool).with_cancellation(token.clone());
        let log = Arc::clone(&ran);
        executor.register_task("a", move |_| async move {
            log.lock().unwrap().push("a".to_string());
            token.cancel();
            Ok(())
        });
        for id in ["b", "c"] {
            let ran = Arc::clone(&ran);
            executor.register_task(id, move |_| async move {
                ran.lock().unwrap().push(id.to_string());
                Ok(())
            });
        }

        let err = executor.execute().await.unwrap_err();
        pool.stop().await;
        assert_eq!(*ran.lock().unwrap(), vec!["a"]);
        match err {
            ExecutorError::TasksFailed { failed, mut skipped } => {
                assert!(failed.is_empty());
                skipped.sort();
                assert_eq!(skipped, vec!["b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(g.node("c").unwrap().error.as_deref(), Some(CANCELLED));
    }
}
