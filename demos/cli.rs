// Copyright 2025 The forkgraph authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of task graphs.

use clap::{Parser, ValueEnum};
use forkgraph::parallel::{for_each_with, ParallelStrategy};
use forkgraph::{CpuPinningPolicy, ExecutorBuilder, NodeId, TaskGraph, ThreadCount, WaitStrategy};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let builder = ExecutorBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
        wait_strategy: match cli.wait_strategy {
            WaitStrategyCli::Spin => WaitStrategy::Spin,
            WaitStrategyCli::Block => WaitStrategy::Block,
        },
    };

    match cli.scenario {
        Scenario::Sum => {
            let input = (0..cli.input_size).collect::<Vec<u64>>();
            let sum = AtomicU64::new(0);

            let mut graph = TaskGraph::new();
            for chunk in input.chunks(cli.chunk_size.get()) {
                let sum = &sum;
                graph.emplace(move || {
                    sum.fetch_add(black_box(chunk).iter().sum::<u64>(), Ordering::Relaxed);
                });
            }

            run_rounds(&builder, &graph, cli.rounds, || {
                let sum = sum.swap(0, Ordering::Relaxed);
                println!("sum = {sum}");
            });
        }
        Scenario::Chain => {
            let counter = AtomicU64::new(0);

            let mut graph = TaskGraph::new();
            let mut previous: Option<NodeId> = None;
            for _ in 0..cli.input_size {
                let node = graph.emplace(|| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                if let Some(previous) = previous {
                    graph.precede(previous, [node]);
                }
                previous = Some(node);
            }

            run_rounds(&builder, &graph, cli.rounds, || {
                let count = counter.swap(0, Ordering::Relaxed);
                println!("ran {count} chained tasks");
            });
        }
        Scenario::RandomDag => {
            let num_nodes = cli.input_size as usize;
            let ticket = AtomicUsize::new(0);
            let positions = (0..num_nodes)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>();

            let mut graph = TaskGraph::with_capacity(num_nodes);
            let ids = positions
                .iter()
                .map(|position| {
                    let ticket = &ticket;
                    graph.emplace(move || {
                        position.store(ticket.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    })
                })
                .collect::<Vec<_>>();

            let edges = random_edges(num_nodes, cli.density);
            for &(i, j) in &edges {
                graph.precede(ids[i], [ids[j]]);
            }
            println!("random graph with {num_nodes} nodes and {} edges", edges.len());

            run_rounds(&builder, &graph, cli.rounds, || {
                let violations = edges
                    .iter()
                    .filter(|&&(i, j)| {
                        positions[i].load(Ordering::SeqCst) > positions[j].load(Ordering::SeqCst)
                    })
                    .count();
                ticket.store(0, Ordering::SeqCst);
                println!("ordering violations = {violations}");
            });
        }
        Scenario::ForEach => {
            let input = (0..cli.input_size).collect::<Vec<u64>>();
            let mut output = vec![0; input.len()];
            let strategy = if cli.sequential {
                ParallelStrategy::Sequential
            } else {
                ParallelStrategy::Parallel
            };

            let start = Instant::now();
            let chunks = output
                .chunks_mut(cli.chunk_size.get())
                .zip(input.chunks(cli.chunk_size.get()))
                .map(|(out, input)| (Mutex::new(out), input))
                .collect::<Vec<_>>();
            for_each_with(strategy, &builder, &chunks, |(out, input)| {
                let mut out = out.lock().unwrap();
                for (out, &x) in out.iter_mut().zip(input.iter()) {
                    *out = x * x;
                }
            });
            drop(chunks);
            println!(
                "squared {} elements in {:?}",
                black_box(&output).len(),
                start.elapsed()
            );
        }
    }
}

/// Runs the graph the given number of times on a single executor, calling
/// `report` after each run.
fn run_rounds(builder: &ExecutorBuilder, graph: &TaskGraph, rounds: usize, report: impl Fn()) {
    if graph.is_empty() {
        println!("nothing to run");
        return;
    }
    std::thread::scope(|scope| {
        let mut executor = builder.build(scope);
        println!("running on {} threads", executor.num_threads());
        for round in 0..rounds {
            let start = Instant::now();
            executor.run(graph);
            if let Err(e) = executor.try_wait() {
                eprintln!("round {round} failed: {e}");
                for panic in e.panics() {
                    eprintln!("  task {:?}: {}", panic.node, panic.message);
                }
                continue;
            }
            println!("round {round} took {:?}", start.elapsed());
            report();
        }
    });
}

/// Picks random forward edges `(i, j)` with `i < j`, so that the resulting
/// graph is acyclic. Each node gets on average `density` successors. The edges
/// are fixed by a constant seed for reproducibility.
fn random_edges(num_nodes: usize, density: usize) -> Vec<(usize, usize)> {
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    let mut edges = Vec::new();
    for i in 0..num_nodes {
        let later = num_nodes - i - 1;
        if later == 0 {
            break;
        }
        let probability = (density as f64 / later as f64).min(1.0);
        for j in i + 1..num_nodes {
            if rng.random_bool(probability) {
                edges.push((i, j));
            }
        }
    }
    edges
}

/// CLI tool to run examples of task graphs.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// How the main thread waits for a run to complete.
    #[arg(long, value_enum, default_value_t = WaitStrategyCli::Spin)]
    wait_strategy: WaitStrategyCli,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input, or of nodes in the graph.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,

    /// Number of items processed by each task. Used only for the sum and
    /// for-each scenarios.
    #[arg(long, default_value = "10000")]
    chunk_size: NonZeroUsize,

    /// Average number of successors of each node. Used only for the
    /// random-dag scenario.
    #[arg(long, default_value_t = 2)]
    density: usize,

    /// Number of times to run the graph on the same executor.
    #[arg(long, default_value_t = 3)]
    rounds: usize,

    /// Whether to run the for-each scenario sequentially.
    #[arg(long, default_value_t = false)]
    sequential: bool,
}

/// How the main thread waits for a run to complete.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum WaitStrategyCli {
    /// Poll with exponential backoff.
    Spin,
    /// Sleep until the last task completes.
    Block,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a slice of numbers, with one independent task per chunk.
    Sum,
    /// Run a chain of trivial tasks, one after the other.
    Chain,
    /// Run a random acyclic graph, and check the execution order.
    RandomDag,
    /// Square a slice of numbers with the parallel for-each.
    ForEach,
}
