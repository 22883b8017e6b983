// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task graphs: nodes, precedence edges and compilation into a schedule.

use super::callable::Callable;
use crate::macros::{log_debug, log_error};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Source of the identifiers stamped into the handles of each graph.
static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(0);

/// Handle to a node of a [`TaskGraph`].
///
/// Handles are only meaningful for the graph that created them, and other
/// graphs reject them. Erasing a node invalidates its handle, even if the
/// underlying slot is later reused by another node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    graph: u32,
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Index of the slot holding this node in the graph.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{}@{})", self.index, self.generation, self.graph)
    }
}

/// A unit of work in a [`TaskGraph`], together with its precedence edges.
pub struct TaskNode<'a> {
    task: Callable<'a, ()>,
    predecessors: Vec<NodeId>,
    successors: Vec<NodeId>,
    /// Number of predecessors that haven't completed yet in the current run.
    join_counter: AtomicUsize,
}

impl<'a> TaskNode<'a> {
    fn new(task: Callable<'a, ()>) -> Self {
        Self {
            task,
            predecessors: Vec::new(),
            successors: Vec::new(),
            join_counter: AtomicUsize::new(0),
        }
    }

    /// Nodes that must complete before this one can run.
    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    /// Nodes that wait for this one to complete.
    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    /// Runs the task of this node on the current thread.
    pub fn invoke(&self) {
        self.task.call(())
    }

    /// Marks one predecessor of this node as completed, returning true if it
    /// was the last one, i.e. if this node is now ready to run.
    ///
    /// Exactly one call returns true per run, which makes the caller the
    /// unique owner of the responsibility to schedule this node.
    pub(crate) fn release_one(&self) -> bool {
        self.join_counter.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    fn join_counter(&self) -> usize {
        self.join_counter.load(Ordering::Relaxed)
    }
}

struct Slot<'a> {
    generation: u32,
    node: Option<TaskNode<'a>>,
}

/// A directed acyclic graph of tasks.
///
/// Nodes are added with [`emplace()`](Self::emplace), and ordered with
/// [`precede()`](Self::precede) and [`succeed()`](Self::succeed). The graph is
/// then handed to an [`Executor`](crate::Executor), which runs every node
/// exactly once, each node only after all of its predecessors.
///
/// No cycle detection is performed: a graph without any node free of
/// predecessors (including an empty graph) is rejected when compiled, but a
/// cycle hanging off a start node makes the run wait forever.
///
/// ```
/// # use forkgraph::TaskGraph;
/// # use std::sync::Mutex;
/// let log = Mutex::new(Vec::new());
/// let mut graph = TaskGraph::new();
/// let a = graph.emplace(|| log.lock().unwrap().push('a'));
/// let b = graph.emplace(|| log.lock().unwrap().push('b'));
/// let c = graph.emplace(|| log.lock().unwrap().push('c'));
/// graph.precede(a, [b]).succeed(c, [b]);
///
/// let schedule = graph.compile();
/// assert_eq!(schedule.start_nodes(), &[a]);
/// ```
///
/// Tasks may borrow local data, which must outlive the graph:
///
/// ```compile_fail,E0597
/// # use forkgraph::{Executor, TaskGraph};
/// let mut graph = TaskGraph::new();
/// {
///     let value = String::from("borrowed");
///     graph.emplace(|| assert_eq!(value.len(), 8));
/// }
/// std::thread::scope(|scope| {
///     let mut executor = Executor::new(scope, 1);
///     executor.run(&graph);
///     executor.wait();
/// });
/// ```
pub struct TaskGraph<'a> {
    /// Identifier stamped into the handles of this graph.
    id: u32,
    slots: Vec<Slot<'a>>,
    /// Indices of slots whose node was erased, to reuse for new nodes.
    free: Vec<u32>,
    len: usize,
    /// Whether an executor is currently running this graph.
    in_use: AtomicBool,
}

impl<'a> TaskGraph<'a> {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty graph with room for the given number of nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
            in_use: AtomicBool::new(false),
        }
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the graph has no node.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a node running the given closure, and returns its handle.
    pub fn emplace<F>(&mut self, f: F) -> NodeId
    where
        F: Fn() + Clone + Send + Sync + 'a,
    {
        self.emplace_callable(Callable::new(f))
    }

    /// Adds a node running the given callable, and returns its handle.
    pub fn emplace_callable(&mut self, task: Callable<'a, ()>) -> NodeId {
        let node = TaskNode::new(task);
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    graph: self.id,
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .unwrap_or_else(|_| panic!("a task graph cannot hold more than 2^32 nodes"));
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    graph: self.id,
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Returns true if the given handle refers to a node of this graph.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Returns the node with the given handle, or [`None`] if it was erased.
    pub fn node(&self, id: NodeId) -> Option<&TaskNode<'a>> {
        self.slot(id).and_then(|slot| slot.node.as_ref())
    }

    /// Slot designated by a handle of this graph, if its generation matches.
    fn slot(&self, id: NodeId) -> Option<&Slot<'a>> {
        if id.graph != self.id {
            return None;
        }
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot<'a>> {
        if id.graph != self.id {
            return None;
        }
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
    }

    /// Nodes that must complete before the given one can run.
    ///
    /// # Panics
    ///
    /// Panics if the handle doesn't refer to a node of this graph.
    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.live_node(id).predecessors()
    }

    /// Nodes that wait for the given one to complete.
    ///
    /// # Panics
    ///
    /// Panics if the handle doesn't refer to a node of this graph.
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.live_node(id).successors()
    }

    fn live_node(&self, id: NodeId) -> &TaskNode<'a> {
        match self.node(id) {
            Some(node) => node,
            None => {
                log_error!("Invalid task handle {id:?}");
                panic!("invalid task handle {id:?}");
            }
        }
    }

    /// Iterates over the handles of all the nodes, in slot order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.iter().map(|(id, _)| id)
    }

    fn iter(&self) -> impl Iterator<Item = (NodeId, &TaskNode<'a>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    NodeId {
                        graph: self.id,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    fn live_node_mut(&mut self, id: NodeId) -> &mut TaskNode<'a> {
        match self.slot_mut(id).and_then(|slot| slot.node.as_mut()) {
            Some(node) => node,
            None => {
                log_error!("Invalid task handle {id:?}");
                panic!("invalid task handle {id:?}");
            }
        }
    }

    /// Makes `node` a predecessor of each of the `others`: they only run once
    /// `node` has completed.
    ///
    /// Duplicate edges are ignored.
    ///
    /// # Panics
    ///
    /// Panics if a handle doesn't refer to a node of this graph, or if `node`
    /// is listed among the `others`.
    pub fn precede(&mut self, node: NodeId, others: impl IntoIterator<Item = NodeId>) -> &mut Self {
        for other in others {
            if other == node {
                log_error!("Task {node:?} cannot precede itself");
                panic!("task {node:?} cannot precede itself");
            }
            // Validate the other end before mutating anything.
            self.live_node_mut(other);

            let successors = &mut self.live_node_mut(node).successors;
            if successors.contains(&other) {
                log_debug!("Ignoring duplicate edge {node:?} -> {other:?}");
                continue;
            }
            successors.push(other);
            self.live_node_mut(other).predecessors.push(node);
        }
        self
    }

    /// Makes `node` a successor of each of the `others`: it only runs once
    /// all of them have completed.
    ///
    /// Duplicate edges are ignored.
    ///
    /// # Panics
    ///
    /// Panics if a handle doesn't refer to a node of this graph, or if `node`
    /// is listed among the `others`.
    pub fn succeed(&mut self, node: NodeId, others: impl IntoIterator<Item = NodeId>) -> &mut Self {
        for other in others {
            self.precede(other, [node]);
        }
        self
    }

    /// Removes a node and all its edges from the graph, returning its task, or
    /// [`None`] if the handle doesn't refer to a node of this graph.
    pub fn erase(&mut self, id: NodeId) -> Option<Callable<'a, ()>> {
        let slot = self.slot_mut(id)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        // The order of edges doesn't matter.
        for &predecessor in &node.predecessors {
            let successors = &mut self.live_node_mut(predecessor).successors;
            if let Some(i) = successors.iter().position(|&x| x == id) {
                successors.swap_remove(i);
            }
        }
        for &successor in &node.successors {
            let predecessors = &mut self.live_node_mut(successor).predecessors;
            if let Some(i) = predecessors.iter().position(|&x| x == id) {
                predecessors.swap_remove(i);
            }
        }

        Some(node.task)
    }

    /// Partitions the nodes into start nodes (without predecessor) and gated
    /// nodes, and arms the join counter of each node with its number of
    /// predecessors.
    ///
    /// The returned schedule lists the start nodes first. This is called by
    /// the executor at the beginning of each run.
    ///
    /// # Panics
    ///
    /// Panics if the graph has no start node, i.e. if it is empty or if every
    /// node is part of a cycle, or if an executor is currently running this
    /// graph.
    pub fn compile(&self) -> Schedule {
        if !self.try_acquire() {
            log_error!("Attempted to compile a task graph that is being run");
            panic!("cannot compile a task graph while it is being run!");
        }
        let release = ReleaseOnDrop(self);
        let schedule = self.arm();
        drop(release);
        schedule
    }

    /// Same as [`compile()`](Self::compile), for a graph already acquired by
    /// the caller.
    pub(crate) fn arm(&self) -> Schedule {
        let mut order = Vec::with_capacity(self.len);
        let mut gated = Vec::new();
        for (id, node) in self.iter() {
            let dependency_count = node.predecessors.len();
            // Relaxed is enough: the executor publishes the schedule to the worker
            // threads through the mutex of its runnable pool.
            node.join_counter.store(dependency_count, Ordering::Relaxed);
            if dependency_count == 0 {
                order.push(id);
            } else {
                gated.push(id);
            }
        }

        let start_count = order.len();
        if start_count == 0 {
            log_error!("Task graph of {} nodes has no start node", gated.len());
            panic!("task graph must have at least one start node!");
        }
        order.extend(gated);

        log_debug!(
            "Compiled task graph: {start_count} start node(s) out of {}",
            order.len()
        );
        Schedule { order, start_count }
    }

    /// Marks this graph as being run, returning false if it already was.
    pub(crate) fn try_acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks this graph as not being run anymore.
    pub(crate) fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Releases a graph when dropped, including on unwind.
pub(crate) struct ReleaseOnDrop<'a, 'g>(pub(crate) &'a TaskGraph<'g>);

impl Drop for ReleaseOnDrop<'_, '_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Default for TaskGraph<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(id, node)| (id, node.successors())))
            .finish()
    }
}

/// The result of [compiling](TaskGraph::compile) a task graph: all the nodes,
/// start nodes first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    order: Vec<NodeId>,
    start_count: usize,
}

impl Schedule {
    /// Number of start nodes, which are at the front of the schedule.
    pub fn start_count(&self) -> usize {
        self.start_count
    }

    /// Nodes that can run immediately.
    pub fn start_nodes(&self) -> &[NodeId] {
        &self.order[..self.start_count]
    }

    /// Nodes that wait for at least one predecessor.
    pub fn gated_nodes(&self) -> &[NodeId] {
        &self.order[self.start_count..]
    }

    /// All the nodes, start nodes first.
    pub fn as_slice(&self) -> &[NodeId] {
        &self.order
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if there is no node to run.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
