// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use super::executor::WaitStrategy;
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status, without notifying anyone.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Sets the status to the given value and notifies all waiting threads.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Notifies one waiting thread that the status has changed.
    ///
    /// The change must have been made while holding the lock.
    pub fn wake_one(&self) {
        self.condvar.notify_one();
    }

    /// Notifies all waiting threads that something they wait for may have
    /// changed.
    ///
    /// Taking the lock first guarantees that a thread that evaluated its
    /// predicate before the change is already waiting, and therefore gets
    /// notified.
    pub fn wake_all(&self) {
        drop(self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// Completion barrier of a run: counts the tasks that remain to finish, and
/// lets the main thread wait until there are none.
pub struct Completion {
    /// Number of tasks that haven't finished yet in the current run.
    remaining: CachePadded<AtomicUsize>,
    /// Whether the current run is complete. Only used with
    /// [`WaitStrategy::Block`].
    done: Status<bool>,
    strategy: WaitStrategy,
}

impl Completion {
    /// Creates a barrier with no pending task.
    pub fn new(strategy: WaitStrategy) -> Self {
        Self {
            remaining: CachePadded::new(AtomicUsize::new(0)),
            done: Status::new(true),
            strategy,
        }
    }

    /// Starts a run of the given number of tasks.
    ///
    /// Must not be called while worker threads may still call
    /// [`finish_one()`](Self::finish_one) for a previous run.
    pub fn start(&self, count: usize) {
        *self.done.lock() = count == 0;
        self.remaining.store(count, Ordering::Release);
    }

    /// Marks one task as finished, waking up the main thread if it was the
    /// last one. Returns the number of tasks that remain.
    pub fn finish_one(&self) -> usize {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "finished more tasks than were started");
        if previous == 1 {
            if let WaitStrategy::Block = self.strategy {
                self.done.notify_all(true);
            }
        }
        previous - 1
    }

    /// Number of tasks that haven't finished yet.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Waits until all the tasks of the current run have finished.
    pub fn wait(&self) {
        match self.strategy {
            WaitStrategy::Spin => {
                let backoff = Backoff::new();
                while self.remaining.load(Ordering::Acquire) != 0 {
                    backoff.snooze();
                }
            }
            WaitStrategy::Block => {
                let _guard = self.done.wait_while(|done| !*done);
            }
        }
    }
}
