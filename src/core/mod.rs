// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: type-erased tasks, task graphs, worker threads and
//! synchronization primitives.

mod callable;
mod executor;
mod graph;
mod sync;
mod worker;

pub use callable::{Callable, Invoke, SMALL_CALLABLE_SIZE};
pub use executor::{
    CpuPinningPolicy, Executor, ExecutorBuilder, RunError, TaskPanic, ThreadCount, WaitStrategy,
};
pub use graph::{NodeId, Schedule, TaskGraph, TaskNode};
