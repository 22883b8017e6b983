// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Running a function over every item of a collection, on a flat task graph.

use crate::core::{ExecutorBuilder, TaskGraph};
use crate::macros::log_debug;

/// Whether [`for_each()`] runs items in parallel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParallelStrategy {
    /// Call the function on every item concurrently, on a pool of worker
    /// threads.
    #[default]
    Parallel,
    /// Call the function on each item in turn, on the calling thread. No
    /// thread is spawned.
    Sequential,
}

/// Calls `f` on every item, in parallel on a pool sized to the available
/// parallelism, or sequentially.
///
/// ```
/// # use forkgraph::parallel::{for_each, ParallelStrategy};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// let input = (1..=100).collect::<Vec<u64>>();
/// let sum = AtomicU64::new(0);
/// for_each(ParallelStrategy::Parallel, &input, |x| {
///     sum.fetch_add(*x, Ordering::Relaxed);
/// });
/// assert_eq!(sum.into_inner(), 5050);
/// ```
///
/// # Panics
///
/// In parallel mode, panics after all items have been processed or skipped if
/// `f` panicked on some of them.
pub fn for_each<I, F>(strategy: ParallelStrategy, items: I, f: F)
where
    I: IntoIterator,
    I::Item: Clone + Send + Sync,
    F: Fn(I::Item) + Sync,
{
    for_each_with(strategy, &ExecutorBuilder::default(), items, f)
}

/// Same as [`for_each()`], running parallel mode on an executor built by
/// `builder`. The builder is ignored in sequential mode.
///
/// ```
/// # use forkgraph::parallel::{for_each_with, ParallelStrategy};
/// # use forkgraph::{CpuPinningPolicy, ExecutorBuilder, ThreadCount, WaitStrategy};
/// # use std::sync::Mutex;
/// let builder = ExecutorBuilder {
///     num_threads: ThreadCount::try_from(1).unwrap(),
///     cpu_pinning: CpuPinningPolicy::No,
///     wait_strategy: WaitStrategy::Block,
/// };
/// let words = Mutex::new(Vec::new());
/// for_each_with(ParallelStrategy::Parallel, &builder, ["fork", "join"], |word| {
///     words.lock().unwrap().push(word.len());
/// });
/// assert_eq!(words.into_inner().unwrap(), vec![4, 4]);
/// ```
pub fn for_each_with<I, F>(strategy: ParallelStrategy, builder: &ExecutorBuilder, items: I, f: F)
where
    I: IntoIterator,
    I::Item: Clone + Send + Sync,
    F: Fn(I::Item) + Sync,
{
    match strategy {
        ParallelStrategy::Sequential => items.into_iter().for_each(f),
        ParallelStrategy::Parallel => {
            let items = items.into_iter();
            let mut graph = TaskGraph::with_capacity(items.size_hint().0);
            let f = &f;
            for item in items {
                graph.emplace(move || f(item.clone()));
            }
            if graph.is_empty() {
                return;
            }

            log_debug!("[main thread] Running {} item(s) in parallel", graph.len());
            std::thread::scope(|scope| {
                let mut executor = builder.build(scope);
                executor.run(&graph);
                executor.wait();
            });
        }
    }
}
