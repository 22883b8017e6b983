// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An executor running task graphs on a pool of worker threads.

use super::graph::{NodeId, ReleaseOnDrop, TaskGraph};
use super::sync::{Completion, Status};
use super::worker::{pin_current_thread, StopToken, Worker, WorkerThread};
use crate::macros::{log_debug, log_error, log_warn};
use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{Scope, ThreadId};

/// Number of threads to spawn in an executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building an executor will panic.
    Always,
}

/// How [`Executor::wait()`] waits for the tasks of a run to complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Poll the number of remaining tasks, backing off by yielding the
    /// thread. This reacts fastest to short graphs.
    #[default]
    Spin,
    /// Sleep on a condition variable until the last task completes. This
    /// doesn't burn CPU while waiting for long-running graphs.
    Block,
}

/// A builder for [`Executor`].
#[derive(Clone, Debug)]
pub struct ExecutorBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Strategy to wait for a run to complete.
    pub wait_strategy: WaitStrategy,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
            wait_strategy: WaitStrategy::Spin,
        }
    }
}

impl ExecutorBuilder {
    /// Spawns an executor whose worker threads live in the given scope.
    ///
    /// ```
    /// # use forkgraph::{CpuPinningPolicy, ExecutorBuilder, TaskGraph, ThreadCount, WaitStrategy};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let sum = AtomicU64::new(0);
    /// let mut graph = TaskGraph::new();
    /// for i in 1..=10 {
    ///     let sum = &sum;
    ///     graph.emplace(move || {
    ///         sum.fetch_add(i, Ordering::Relaxed);
    ///     });
    /// }
    ///
    /// let builder = ExecutorBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     wait_strategy: WaitStrategy::Block,
    /// };
    /// std::thread::scope(|scope| {
    ///     let mut executor = builder.build(scope);
    ///     executor.run(&graph);
    ///     executor.wait();
    /// });
    /// assert_eq!(sum.load(Ordering::Relaxed), 5 * 11);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the number of threads exceeds the available parallelism, or
    /// if CPU pinning is required but fails.
    pub fn build<'scope, 'env>(&self, scope: &'scope Scope<'scope, 'env>) -> Executor<'scope> {
        let num_threads = match self.num_threads {
            ThreadCount::AvailableParallelism => max_thread_count(),
            ThreadCount::Count(count) => count.get(),
        };
        Executor::spawn(scope, num_threads, self.cpu_pinning, self.wait_strategy)
    }
}

/// Upper bound on the number of worker threads of an executor.
fn max_thread_count() -> usize {
    std::thread::available_parallelism()
        .expect("Getting the available parallelism failed")
        .get()
}

/// A task that panicked during a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskPanic {
    /// The node whose task panicked.
    pub node: NodeId,
    /// The panic message, if it was a string.
    pub message: String,
}

impl TaskPanic {
    fn new(node: NodeId, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self { node, message }
    }
}

/// Error returned by [`Executor::try_wait()`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Some tasks panicked. Once a task has panicked, the tasks that were not
    /// started yet are skipped.
    #[error("{} task(s) panicked!", .0.len())]
    TasksPanicked(Vec<TaskPanic>),
}

impl RunError {
    /// The tasks that panicked, in the order the panics were caught.
    pub fn panics(&self) -> &[TaskPanic] {
        match self {
            RunError::TasksPanicked(panics) => panics,
        }
    }
}

/// Tasks that are ready to run in the current round.
///
/// Entries are only ever appended during a run, and claimed by advancing the
/// cursor, so a claimed entry is never handed out twice.
struct RunnablePool<'scope> {
    /// The graph being run.
    graph: Option<&'scope TaskGraph<'scope>>,
    /// Tasks that are ready (or were ready and have been claimed).
    ready: Vec<NodeId>,
    /// Index of the next unclaimed entry in `ready`.
    cursor: usize,
}

impl RunnablePool<'_> {
    fn has_pending(&self) -> bool {
        self.cursor < self.ready.len()
    }
}

/// State shared between the main thread and the worker threads.
pub struct Shared<'scope> {
    pool: Status<RunnablePool<'scope>>,
    completion: Completion,
    /// Whether a task panicked in the current run.
    poisoned: AtomicBool,
    panics: Mutex<Vec<TaskPanic>>,
}

impl<'scope> Shared<'scope> {
    fn new(wait_strategy: WaitStrategy) -> Self {
        Self {
            pool: Status::new(RunnablePool {
                graph: None,
                ready: Vec::new(),
                cursor: 0,
            }),
            completion: Completion::new(wait_strategy),
            poisoned: AtomicBool::new(false),
            panics: Mutex::new(Vec::new()),
        }
    }

    /// Claims the next ready task, if any.
    pub fn fetch_task(&self) -> Option<(&'scope TaskGraph<'scope>, NodeId)> {
        let mut pool = self.pool.lock();
        if !pool.has_pending() {
            return None;
        }
        let id = pool.ready[pool.cursor];
        pool.cursor += 1;
        pool.graph.map(|graph| (graph, id))
    }

    /// Appends a task that became ready, and wakes up an idle worker.
    pub fn insert_task(&self, id: NodeId) {
        self.pool.lock().ready.push(id);
        self.pool.wake_one();
    }

    /// Blocks until a task may be ready or the worker must stop.
    pub fn wait_for_task(&self, token: &StopToken) {
        drop(
            self.pool
                .wait_while(|pool| !pool.has_pending() && !token.stop_requested()),
        );
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }

    pub fn record_panic(&self, id: NodeId, payload: Box<dyn Any + Send>) {
        self.poisoned.store(true, Ordering::Relaxed);
        self.panics
            .lock()
            .unwrap()
            .push(TaskPanic::new(id, payload));
    }
}

/// An executor running [`TaskGraph`]s on a fixed pool of worker threads.
///
/// Worker threads are spawned in a [`std::thread::Scope`], which guarantees
/// that they don't outlive the graphs and the data that tasks borrow. A graph
/// is handed to the executor with [`run()`](Self::run), which returns
/// immediately, and [`wait()`](Self::wait) blocks until all its tasks have
/// completed. The same executor can then run another graph.
pub struct Executor<'scope> {
    /// Handles to all the worker threads in the pool.
    workers: Vec<WorkerThread<'scope>>,
    shared: Arc<Shared<'scope>>,
    /// The graph of the pending run, if any.
    current: Option<&'scope TaskGraph<'scope>>,
}

impl<'scope> Executor<'scope> {
    /// Spawns an executor with the given number of worker threads, without
    /// CPU pinning and with [`WaitStrategy::Spin`].
    ///
    /// # Panics
    ///
    /// Panics if `thread_count` is zero or exceeds the available parallelism.
    pub fn new<'env>(scope: &'scope Scope<'scope, 'env>, thread_count: usize) -> Self {
        Self::spawn(
            scope,
            thread_count,
            CpuPinningPolicy::No,
            WaitStrategy::Spin,
        )
    }

    fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        num_threads: usize,
        cpu_pinning: CpuPinningPolicy,
        wait_strategy: WaitStrategy,
    ) -> Self {
        let max = max_thread_count();
        if num_threads == 0 || num_threads > max {
            log_error!("[main thread] Invalid thread count {num_threads}");
            panic!("thread count must be in range [1, {max}]!");
        }

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let shared = Arc::new(Shared::new(wait_strategy));
        let (report, pinned) = mpsc::channel();
        let workers = (0..num_threads)
            .map(|index| {
                let worker = Worker::new(index, shared.clone());
                let report = report.clone();
                WorkerThread::start(scope, index, move |token| {
                    let pinning = pin_current_thread(index, cpu_pinning);
                    let pinned = pinning.is_ok();
                    // The receiver is alive until all the workers have reported.
                    let _ = report.send(pinning);
                    drop(report);
                    if pinned {
                        worker.run(token);
                    }
                })
            })
            .collect();
        drop(report);
        log_debug!("[main thread] Spawned {num_threads} threads");

        let executor = Self {
            workers,
            shared,
            current: None,
        };

        // Dropping the executor on failure stops and joins the other threads.
        for pinning in pinned.iter() {
            if let Err(e) = pinning {
                log_error!("[main thread] {e}");
                panic!("{e}");
            }
        }

        executor
    }

    /// Returns the number of worker threads in this executor.
    pub fn num_threads(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.workers.len()).expect("an executor has at least one thread")
    }

    /// Returns the identifiers of the worker threads.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.workers.iter().map(WorkerThread::id).collect()
    }

    /// Returns true if a run was started and not waited for yet.
    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Starts running the given graph, and returns immediately.
    ///
    /// The graph is compiled, and its start nodes are handed to the worker
    /// threads. Call [`wait()`](Self::wait) to wait for all the tasks to
    /// complete, before running another graph.
    ///
    /// # Panics
    ///
    /// Panics if a previous run hasn't been waited for, if the graph is being
    /// run by another executor, or if the graph has no start node (which
    /// includes an empty graph).
    pub fn run(&mut self, graph: &'scope TaskGraph<'scope>) {
        if self.current.is_some() {
            log_error!("[main thread] Attempted to run a graph before waiting for the previous run");
            panic!("the previous run must be waited for before running another graph!");
        }
        if !graph.try_acquire() {
            log_error!("[main thread] Attempted to run a graph that is already running");
            panic!("this task graph is already being run by another executor!");
        }

        let schedule = {
            // Keep the graph acquired for the run, unless compiling panics.
            let release = ReleaseOnDrop(graph);
            let schedule = graph.arm();
            std::mem::forget(release);
            schedule
        };

        self.shared.completion.start(schedule.len());
        {
            let mut pool = self.shared.pool.lock();
            pool.graph = Some(graph);
            pool.ready.reserve(schedule.len());
            pool.ready.extend_from_slice(schedule.start_nodes());
        }
        self.shared.pool.wake_all();
        self.current = Some(graph);

        log_debug!(
            "[main thread] Started a run of {} task(s), {} ready",
            schedule.len(),
            schedule.start_count()
        );
    }

    /// Waits until all the tasks of the current run have completed, and
    /// resets the executor for the next run. Returns immediately if no run is
    /// pending.
    ///
    /// # Panics
    ///
    /// Panics if any task panicked during the run. The executor remains usable
    /// afterwards.
    pub fn wait(&mut self) {
        if let Err(e) = self.try_wait() {
            log_error!("[main thread] {e}");
            panic!("{e}");
        }
    }

    /// Waits until all the tasks of the current run have completed, and
    /// resets the executor for the next run. Returns an error describing the
    /// tasks that panicked, if any.
    pub fn try_wait(&mut self) -> Result<(), RunError> {
        let Some(graph) = self.current.take() else {
            return Ok(());
        };

        log_debug!("[main thread] Waiting for the run to complete");
        self.shared.completion.wait();

        {
            let mut pool = self.shared.pool.lock();
            pool.ready.clear();
            pool.cursor = 0;
            pool.graph = None;
        }
        graph.release();
        log_debug!("[main thread] The run is complete");

        let panics = std::mem::take(&mut *self.shared.panics.lock().unwrap());
        self.shared.poisoned.store(false, Ordering::Relaxed);
        if panics.is_empty() {
            Ok(())
        } else {
            Err(RunError::TasksPanicked(panics))
        }
    }
}

impl Drop for Executor<'_> {
    /// Stops and joins all the threads in the pool.
    fn drop(&mut self) {
        if self.current.is_some() && self.shared.completion.remaining() != 0 {
            log_warn!(
                "[main thread] Dropping the executor with {} unfinished task(s), which are abandoned",
                self.shared.completion.remaining()
            );
        }

        log_debug!("[main thread] Notifying threads to stop...");
        for worker in &self.workers {
            if worker.is_running() {
                worker.request_stop();
            }
        }
        self.shared.pool.wake_all();

        log_debug!("[main thread] Joining threads in the pool...");
        for worker in self.workers.drain(..) {
            let _index = worker.index();
            let result = worker.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_index} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_index} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");

        if let Some(graph) = self.current.take() {
            graph.release();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::AtomicUsize;

    /// Clamps a thread count to what the machine supports.
    fn threads(count: usize) -> usize {
        count.min(max_thread_count())
    }

    fn builder(num_threads: usize, wait_strategy: WaitStrategy) -> ExecutorBuilder {
        ExecutorBuilder {
            num_threads: ThreadCount::try_from(threads(num_threads)).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
            wait_strategy,
        }
    }

    macro_rules! expand_tests {
        ( $wait_strategy:expr, ) => {};
        ( $wait_strategy:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::core::executor::test::$case($wait_strategy);
            }

            expand_tests!($wait_strategy, $($others)*);
        };
        ( $wait_strategy:expr, $case:ident => fail($msg:expr), $( $others:tt )* ) => {
            #[test]
            #[should_panic(expected = $msg)]
            fn $case() {
                $crate::core::executor::test::$case($wait_strategy);
            }

            expand_tests!($wait_strategy, $($others)*);
        };
    }

    macro_rules! wait_strategy_tests {
        ( $mod:ident, $wait_strategy:expr ) => {
            mod $mod {
                use super::*;

                expand_tests!(
                    $wait_strategy,
                    test_flat_graph,
                    test_chain,
                    test_diamond,
                    test_random_dags,
                    test_two_graphs,
                    test_same_graph_twice,
                    test_wide_fan_out,
                    test_task_panic_is_reported,
                    test_panic_skips_successors,
                    test_task_panic => fail("1 task(s) panicked!"),
                );
            }
        };
    }

    wait_strategy_tests!(spin, WaitStrategy::Spin);
    wait_strategy_tests!(block, WaitStrategy::Block);

    fn test_flat_graph(wait_strategy: WaitStrategy) {
        const NUM_TASKS: usize = 1000;
        let counts = (0..NUM_TASKS)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>();

        let mut graph = TaskGraph::with_capacity(NUM_TASKS);
        for count in &counts {
            graph.emplace(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        for num_threads in [1, 2, 4, 8] {
            std::thread::scope(|scope| {
                let mut executor = builder(num_threads, wait_strategy).build(scope);
                executor.run(&graph);
                assert!(executor.is_running());
                executor.wait();
                assert!(!executor.is_running());
            });
        }

        for count in &counts {
            assert_eq!(count.load(Ordering::Relaxed), 4);
        }
    }

    fn test_chain(wait_strategy: WaitStrategy) {
        for num_threads in [1, 2, 3, 4] {
            let log = Mutex::new(Vec::new());
            let mut graph = TaskGraph::new();
            // Emplace the nodes in reverse order, so that slot order doesn't match the
            // execution order.
            let c = graph.emplace(|| log.lock().unwrap().push('C'));
            let b = graph.emplace(|| log.lock().unwrap().push('B'));
            let a = graph.emplace(|| log.lock().unwrap().push('A'));
            graph.precede(a, [b]).precede(b, [c]);

            std::thread::scope(|scope| {
                let mut executor = builder(num_threads, wait_strategy).build(scope);
                executor.run(&graph);
                executor.wait();
            });

            drop(graph);
            assert_eq!(log.into_inner().unwrap(), vec!['A', 'B', 'C']);
        }
    }

    fn test_diamond(wait_strategy: WaitStrategy) {
        for num_threads in [1, 2, 4] {
            let log = Mutex::new(Vec::new());
            let mut graph = TaskGraph::new();
            let a = graph.emplace(|| log.lock().unwrap().push('A'));
            let b = graph.emplace(|| log.lock().unwrap().push('B'));
            let c = graph.emplace(|| log.lock().unwrap().push('C'));
            let d = graph.emplace(|| log.lock().unwrap().push('D'));
            graph.precede(a, [b, c]).succeed(d, [b, c]);

            std::thread::scope(|scope| {
                let mut executor = builder(num_threads, wait_strategy).build(scope);
                executor.run(&graph);
                executor.wait();
            });

            drop(graph);
            let log = log.into_inner().unwrap();
            assert_eq!(log.len(), 4);
            assert_eq!(log[0], 'A');
            assert_eq!(log[3], 'D');
            assert!(log[1..3].contains(&'B'));
            assert!(log[1..3].contains(&'C'));
        }
    }

    fn test_random_dags(wait_strategy: WaitStrategy) {
        const NUM_NODES: usize = 200;
        let mut rng = ChaCha12Rng::seed_from_u64(42);

        for round in 0..10 {
            let ticket = AtomicUsize::new(0);
            // Position of each node in the execution order, plus one.
            let positions = (0..NUM_NODES)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>();
            let runs = (0..NUM_NODES)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>();

            let mut graph = TaskGraph::with_capacity(NUM_NODES);
            let ids = (0..NUM_NODES)
                .map(|i| {
                    let (ticket, position, run) = (&ticket, &positions[i], &runs[i]);
                    graph.emplace(move || {
                        run.fetch_add(1, Ordering::Relaxed);
                        position.store(ticket.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                    })
                })
                .collect::<Vec<_>>();

            // Edges only go from lower to higher indices, so the graph is acyclic.
            let mut edges = Vec::new();
            for j in 1..NUM_NODES {
                for i in 0..j {
                    if rng.random_bool(0.02) {
                        edges.push((i, j));
                        graph.precede(ids[i], [ids[j]]);
                    }
                }
            }

            std::thread::scope(|scope| {
                let mut executor = builder(1 + round % 8, wait_strategy).build(scope);
                executor.run(&graph);
                executor.wait();
            });

            for run in &runs {
                assert_eq!(run.load(Ordering::Relaxed), 1);
            }
            for (i, j) in edges {
                let before = positions[i].load(Ordering::SeqCst);
                let after = positions[j].load(Ordering::SeqCst);
                assert!(
                    before < after,
                    "node {i} ran at position {before}, after its successor {j} at {after}"
                );
            }
        }
    }

    fn test_two_graphs(wait_strategy: WaitStrategy) {
        let first = AtomicUsize::new(0);
        let second = AtomicUsize::new(0);

        let mut graph1 = TaskGraph::new();
        for _ in 0..100 {
            graph1.emplace(|| {
                first.fetch_add(1, Ordering::Relaxed);
            });
        }
        let mut graph2 = TaskGraph::new();
        let root = graph2.emplace(|| {
            second.fetch_add(1, Ordering::Relaxed);
        });
        for _ in 0..50 {
            let leaf = graph2.emplace(|| {
                second.fetch_add(1, Ordering::Relaxed);
            });
            graph2.precede(root, [leaf]);
        }

        std::thread::scope(|scope| {
            let mut executor = builder(4, wait_strategy).build(scope);
            executor.run(&graph1);
            executor.wait();
            assert_eq!(first.load(Ordering::Relaxed), 100);

            executor.run(&graph2);
            executor.wait();
            assert_eq!(second.load(Ordering::Relaxed), 51);
        });
    }

    fn test_same_graph_twice(wait_strategy: WaitStrategy) {
        let counter = AtomicUsize::new(0);
        let mut graph = TaskGraph::new();
        let mut previous = graph.emplace(|| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        for _ in 0..20 {
            let next = graph.emplace(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            graph.precede(previous, [next]);
            previous = next;
        }

        std::thread::scope(|scope| {
            let mut executor = builder(3, wait_strategy).build(scope);
            for round in 1..=3 {
                executor.run(&graph);
                executor.wait();
                assert_eq!(counter.load(Ordering::Relaxed), 21 * round);
            }
        });
    }

    fn test_wide_fan_out(wait_strategy: WaitStrategy) {
        const WIDTH: usize = 500;
        let done = AtomicUsize::new(0);
        let seen = AtomicUsize::new(0);

        let mut graph = TaskGraph::new();
        let root = graph.emplace(|| ());
        let sink = graph.emplace(|| {
            seen.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        for _ in 0..WIDTH {
            let middle = graph.emplace(|| {
                done.fetch_add(1, Ordering::SeqCst);
            });
            graph.precede(root, [middle]).precede(middle, [sink]);
        }

        std::thread::scope(|scope| {
            let mut executor = builder(8, wait_strategy).build(scope);
            executor.run(&graph);
            executor.wait();
        });

        assert_eq!(seen.load(Ordering::SeqCst), WIDTH);
    }

    fn test_task_panic_is_reported(wait_strategy: WaitStrategy) {
        let counter = AtomicUsize::new(0);
        let mut bad = TaskGraph::new();
        let boom = bad.emplace(|| panic!("boom"));

        let mut good = TaskGraph::new();
        for _ in 0..10 {
            good.emplace(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        std::thread::scope(|scope| {
            let mut executor = builder(2, wait_strategy).build(scope);
            executor.run(&bad);
            let error = executor.try_wait().unwrap_err();
            assert_eq!(error.to_string(), "1 task(s) panicked!");
            assert_eq!(
                error.panics(),
                &[TaskPanic {
                    node: boom,
                    message: "boom".to_string(),
                }]
            );

            // The executor is still usable.
            executor.run(&good);
            assert!(executor.try_wait().is_ok());
        });
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    fn test_panic_skips_successors(wait_strategy: WaitStrategy) {
        let after = AtomicUsize::new(0);
        let mut graph = TaskGraph::new();
        let first = graph.emplace(|| panic!("first task failed: {}", 42));
        let second = graph.emplace(|| {
            after.fetch_add(1, Ordering::Relaxed);
        });
        let third = graph.emplace(|| {
            after.fetch_add(1, Ordering::Relaxed);
        });
        graph.precede(first, [second]).precede(second, [third]);

        std::thread::scope(|scope| {
            let mut executor = builder(2, wait_strategy).build(scope);
            executor.run(&graph);
            let error = executor.try_wait().unwrap_err();
            assert_eq!(error.panics().len(), 1);
            assert_eq!(error.panics()[0].message, "first task failed: 42");
        });
        assert_eq!(after.load(Ordering::Relaxed), 0);
    }

    fn test_task_panic(wait_strategy: WaitStrategy) {
        let mut graph = TaskGraph::new();
        for i in 0..10 {
            graph.emplace(move || {
                if i == 3 {
                    panic!("arithmetic panic");
                }
            });
        }

        std::thread::scope(|scope| {
            // A single thread, so that no other task starts after the panic.
            let mut executor = builder(1, wait_strategy).build(scope);
            executor.run(&graph);
            executor.wait();
        });
    }

    #[test]
    fn test_num_threads() {
        std::thread::scope(|scope| {
            let executor = ExecutorBuilder::default().build(scope);
            assert_eq!(executor.num_threads().get(), max_thread_count());
            assert_eq!(executor.thread_ids().len(), max_thread_count());

            let executor = Executor::new(scope, threads(2));
            assert_eq!(executor.num_threads().get(), threads(2));
            assert!(!executor
                .thread_ids()
                .contains(&std::thread::current().id()));
        });
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    #[should_panic(expected = "thread count must be in range [1, ")]
    fn test_zero_threads() {
        std::thread::scope(|scope| {
            Executor::new(scope, 0);
        });
    }

    #[test]
    #[should_panic(expected = "thread count must be in range [1, ")]
    fn test_too_many_threads() {
        std::thread::scope(|scope| {
            Executor::new(scope, max_thread_count() + 1);
        });
    }

    #[test]
    #[should_panic(expected = "task graph must have at least one start node!")]
    fn test_no_start_node() {
        let mut graph = TaskGraph::new();
        let a = graph.emplace(|| ());
        let b = graph.emplace(|| ());
        graph.precede(a, [b]).precede(b, [a]);

        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, 1);
            executor.run(&graph);
            executor.wait();
        });
    }

    #[test]
    fn test_no_start_node_releases_graph() {
        let mut graph = TaskGraph::new();
        let a = graph.emplace(|| ());
        let b = graph.emplace(|| ());
        graph.precede(a, [b]).precede(b, [a]);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            std::thread::scope(|scope| {
                let mut executor = Executor::new(scope, 1);
                executor.run(&graph);
            });
        }));
        assert!(result.is_err());
        assert!(graph.try_acquire());
    }

    #[test]
    #[should_panic(expected = "task graph must have at least one start node!")]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, 1);
            executor.run(&graph);
            executor.wait();
        });
    }

    #[test]
    fn test_empty_graph_leaves_executor_idle() {
        let graph = TaskGraph::new();
        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, 1);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| executor.run(&graph)));
            assert!(result.is_err());
            assert!(!executor.is_running());
            // Waiting without a pending run returns immediately.
            executor.wait();
        });
        assert!(graph.try_acquire());
    }

    #[test]
    #[should_panic(expected = "the previous run must be waited for before running another graph!")]
    fn test_run_without_wait() {
        let mut graph = TaskGraph::new();
        graph.emplace(|| ());
        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, 1);
            executor.run(&graph);
            executor.run(&graph);
        });
    }

    #[test]
    #[should_panic(expected = "this task graph is already being run by another executor!")]
    fn test_graph_shared_by_two_executors() {
        let mut graph = TaskGraph::new();
        graph.emplace(|| ());
        std::thread::scope(|scope| {
            let mut first = Executor::new(scope, 1);
            let mut second = Executor::new(scope, 1);
            first.run(&graph);
            second.run(&graph);
        });
    }

    #[test]
    fn test_drop_without_wait() {
        let counter = AtomicUsize::new(0);
        let mut graph = TaskGraph::new();
        for _ in 0..100 {
            graph.emplace(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, threads(2));
            executor.run(&graph);
        });
        // Some tasks may have been abandoned, but none ran twice.
        assert!(counter.load(Ordering::Relaxed) <= 100);
        assert!(graph.try_acquire());
    }

    #[test]
    fn test_drop_lets_running_task_finish() {
        let started = AtomicBool::new(false);
        let dropping = AtomicBool::new(false);
        let finished = AtomicBool::new(false);
        let successor_runs = AtomicUsize::new(0);

        let mut graph = TaskGraph::new();
        let first = graph.emplace(|| {
            started.store(true, Ordering::SeqCst);
            while !dropping.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            // Leave time for the executor to request the stop.
            std::thread::sleep(std::time::Duration::from_millis(200));
            finished.store(true, Ordering::SeqCst);
        });
        let second = graph.emplace(|| {
            successor_runs.fetch_add(1, Ordering::SeqCst);
        });
        graph.precede(first, [second]);

        std::thread::scope(|scope| {
            let mut executor = Executor::new(scope, 1);
            executor.run(&graph);
            while !started.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            dropping.store(true, Ordering::SeqCst);
            drop(executor);

            // Dropping joined the worker, after the running task completed.
            assert!(finished.load(Ordering::SeqCst));
        });

        assert_eq!(successor_runs.load(Ordering::SeqCst), 0);
        assert!(graph.try_acquire());
    }

    #[test]
    fn test_cpu_pinning_if_supported() {
        let counter = AtomicUsize::new(0);
        let mut graph = TaskGraph::new();
        for _ in 0..10 {
            graph.emplace(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        std::thread::scope(|scope| {
            let mut executor = ExecutorBuilder {
                num_threads: ThreadCount::AvailableParallelism,
                cpu_pinning: CpuPinningPolicy::IfSupported,
                wait_strategy: WaitStrategy::Spin,
            }
            .build(scope);
            executor.run(&graph);
            executor.wait();
        });
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_cpu_pinning_always_not_supported() {
        std::thread::scope(|scope| {
            ExecutorBuilder {
                num_threads: ThreadCount::AvailableParallelism,
                cpu_pinning: CpuPinningPolicy::Always,
                wait_strategy: WaitStrategy::Spin,
            }
            .build(scope);
        });
    }
}
