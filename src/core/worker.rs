// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker threads, and the loop that they run to execute task graphs.

use super::executor::{CpuPinningPolicy, Shared};
use super::graph::{NodeId, TaskGraph};
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::Backoff;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle, ThreadId};

/// Lifecycle of a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// The thread hasn't been started yet.
    Idle,
    /// The thread is running its body.
    Running,
    /// The thread has been asked to stop, but hasn't observed it yet.
    StopRequested,
    /// The body of the thread has returned (or panicked).
    Stopped,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::Idle,
            1 => ThreadState::Running,
            2 => ThreadState::StopRequested,
            _ => ThreadState::Stopped,
        }
    }
}

/// Atomic cell holding a [`ThreadState`], shared between a [`WorkerThread`]
/// and the thread it runs.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ThreadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ThreadState {
        ThreadState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ThreadState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`, returning false if the current state wasn't
    /// `from`.
    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Token passed to the body of a [`WorkerThread`], to observe stop requests.
pub struct StopToken {
    state: Arc<StateCell>,
}

impl StopToken {
    /// Returns true once the thread has been asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.state.load() == ThreadState::StopRequested
    }
}

/// Sets the state of a thread to [`ThreadState::Stopped`] when dropped,
/// including when the body of the thread panics.
struct StoppedOnExit<'a>(&'a StateCell);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.store(ThreadState::Stopped);
    }
}

/// A scoped OS thread that can be asked to stop cooperatively.
///
/// Stopping never interrupts the body: the body observes the request through
/// its [`StopToken`] whenever it chooses to check it.
pub struct WorkerThread<'scope> {
    /// Index of the worker in its pool.
    index: usize,
    handle: ScopedJoinHandle<'scope, ()>,
    state: Arc<StateCell>,
}

impl<'scope> WorkerThread<'scope> {
    /// Spawns a thread in the given scope, running `body`.
    pub fn start<'env, F>(scope: &'scope Scope<'scope, 'env>, index: usize, body: F) -> Self
    where
        F: FnOnce(&StopToken) + Send + 'scope,
    {
        let state = Arc::new(StateCell::new(ThreadState::Idle));
        let token = StopToken {
            state: state.clone(),
        };
        state.transition(ThreadState::Idle, ThreadState::Running);

        let handle = std::thread::Builder::new()
            .name(format!("forkgraph-worker-{index}"))
            .spawn_scoped(scope, move || {
                let _stopped = StoppedOnExit(&token.state);
                body(&token);
            })
            .unwrap_or_else(|e| {
                log_error!("[main thread] Failed to spawn worker thread #{index}: {e}");
                panic!("Failed to spawn worker thread #{index}: {e}");
            });

        Self {
            index,
            handle,
            state,
        }
    }

    /// Asks the thread to stop. The thread stops at the next point where its
    /// body checks the [`StopToken`].
    pub fn request_stop(&self) {
        if !self
            .state
            .transition(ThreadState::Running, ThreadState::StopRequested)
        {
            log_debug!(
                "[main thread] Thread {} is already {:?}",
                self.index,
                self.state.load()
            );
        }
    }

    /// Returns true if the body of the thread hasn't returned yet.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Running | ThreadState::StopRequested
        )
    }

    /// Current state of the thread.
    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    /// Identifier of the underlying OS thread.
    pub fn id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Index of the worker in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for the thread to finish, returning an error if its body
    /// panicked.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

/// Pins the current thread to the CPU of the given index, according to the
/// policy. Only the [`CpuPinningPolicy::Always`] policy reports failures.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    let pin = || -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(id)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => Ok(()),
        CpuPinningPolicy::IfSupported => {
            match pin() {
                Ok(()) => log_debug!("Pinned thread #{id} to CPU #{id}"),
                Err(_e) => log_warn!("Failed to set CPU affinity for thread #{id}: {_e}"),
            }
            Ok(())
        }
        CpuPinningPolicy::Always => match pin() {
            Ok(()) => {
                log_debug!("Pinned thread #{id} to CPU #{id}");
                Ok(())
            }
            Err(e) => Err(format!("Failed to set CPU affinity for thread #{id}: {e}")),
        },
    }
}

/// CPU pinning isn't implemented on this platform. The executor reports it
/// before spawning any thread.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    Ok(())
}

/// Context owned by a worker thread: fetches ready tasks from the runnable
/// pool, runs them and schedules the successors that become ready.
pub struct Worker<'scope> {
    /// Index of the worker in its pool.
    #[cfg(feature = "log")]
    index: usize,
    shared: Arc<Shared<'scope>>,
}

impl<'scope> Worker<'scope> {
    pub fn new(_index: usize, shared: Arc<Shared<'scope>>) -> Self {
        Self {
            #[cfg(feature = "log")]
            index: _index,
            shared,
        }
    }

    /// Main function run by this thread.
    pub fn run(&self, token: &StopToken) {
        log_debug!("[thread {}] Started", self.index);
        let backoff = Backoff::new();
        loop {
            if token.stop_requested() {
                log_debug!("[thread {}] Received stop request", self.index);
                break;
            }
            match self.shared.fetch_task() {
                Some((graph, id)) => {
                    self.execute(graph, id);
                    backoff.reset();
                }
                None if backoff.is_completed() => {
                    self.shared.wait_for_task(token);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }
    }

    /// Runs the given task, then releases its successors.
    fn execute(&self, graph: &TaskGraph<'_>, id: NodeId) {
        let Some(node) = graph.node(id) else {
            log_error!("[thread {}] Task {id:?} isn't in the graph", self.index);
            self.shared.completion().finish_one();
            return;
        };

        if self.shared.is_poisoned() {
            log_trace!(
                "[thread {}] Skipping task {id:?} after a panic",
                self.index
            );
        } else {
            log_trace!("[thread {}] Running task {id:?}", self.index);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| node.invoke())) {
                log_error!("[thread {}] Task {id:?} panicked", self.index);
                self.shared.record_panic(id, payload);
            }
        }

        for &successor in node.successors() {
            match graph.node(successor) {
                Some(next) => {
                    if next.release_one() {
                        log_trace!(
                            "[thread {}] Task {successor:?} is ready after {id:?}",
                            self.index
                        );
                        self.shared.insert_task(successor);
                    }
                }
                None => log_error!(
                    "[thread {}] Successor {successor:?} of {id:?} isn't in the graph",
                    self.index
                ),
            }
        }

        let _remaining = self.shared.completion().finish_one();
        log_trace!(
            "[thread {}] Finished task {id:?}, {_remaining} remaining",
            self.index
        );
    }
}
